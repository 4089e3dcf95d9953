//! Runtime configuration
//!
//! Durations are written as human-readable strings (`"5s"`, `"250ms"`).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use avsync_core::{AvatarDataDetail, AvsyncError, AvsyncResult};
use avsync_wire::{DEFAULT_ERROR_LOG_INTERVAL, DEFAULT_RATE_INTERVAL, MIN_BULK_PACKET_SIZE};

/// Size of the sequence number in front of every avatar data packet
pub const SEQUENCE_NUMBER_SIZE: usize = 2;

/// Default payload available to one avatar data packet
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 1400;

/// Default trait and identity bandwidth cap
pub const DEFAULT_MAX_TRAIT_RATE_MBPS: f32 = 3.0;

/// Default probability of upgrading a frame to a full update
pub const DEFAULT_FULL_UPDATE_RATIO: f32 = 0.02;

mod duration_str {
    use std::time::Duration;

    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(D::Error::custom)
    }
}

/// Log output settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive used when `RUST_LOG` is unset
    pub level: String,
    /// Emit JSON lines instead of human-readable text
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: "info".into(),
            json: false,
        }
    }
}

/// Avatar sync configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Bytes available to one avatar data packet, sequence number included
    pub max_payload_size: usize,
    /// Bandwidth cap for traits and identity, in megabits per second
    pub max_trait_rate_mbps: f32,
    /// Probability that a frame is sent as a full update
    pub full_update_ratio: f32,
    /// Detail used for frames that are not full updates
    pub default_detail: AvatarDataDetail,
    /// Minimum time between corruption warnings for one avatar
    #[serde(with = "duration_str")]
    pub error_log_interval: Duration,
    /// Window of the per-field rate counters
    #[serde(with = "duration_str")]
    pub rate_window: Duration,
    pub log: LogConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            max_trait_rate_mbps: DEFAULT_MAX_TRAIT_RATE_MBPS,
            full_update_ratio: DEFAULT_FULL_UPDATE_RATIO,
            default_detail: AvatarDataDetail::CullSmallData,
            error_log_interval: DEFAULT_ERROR_LOG_INTERVAL,
            rate_window: DEFAULT_RATE_INTERVAL,
            log: LogConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Parse and validate a JSON document. Missing keys take their defaults.
    pub fn from_json(text: &str) -> AvsyncResult<Self> {
        let config: SyncConfig =
            serde_json::from_str(text).map_err(|e| AvsyncError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> AvsyncResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| AvsyncError::InvalidConfig(e.to_string()))
    }

    pub fn validate(&self) -> AvsyncResult<()> {
        let min_payload = MIN_BULK_PACKET_SIZE + SEQUENCE_NUMBER_SIZE;
        if self.max_payload_size < min_payload {
            return Err(AvsyncError::InvalidConfig(format!(
                "max_payload_size {} is below {min_payload}",
                self.max_payload_size
            )));
        }
        if !(0.0..=1.0).contains(&self.full_update_ratio) {
            return Err(AvsyncError::InvalidConfig(format!(
                "full_update_ratio {} is outside [0, 1]",
                self.full_update_ratio
            )));
        }
        if !(self.max_trait_rate_mbps > 0.0) {
            return Err(AvsyncError::InvalidConfig(format!(
                "max_trait_rate_mbps {} must be positive",
                self.max_trait_rate_mbps
            )));
        }
        if self.rate_window.is_zero() {
            return Err(AvsyncError::InvalidConfig("rate_window must be non-zero".into()));
        }
        Ok(())
    }

    /// Budget handed to the encoder for one snapshot
    pub fn max_snapshot_bytes(&self) -> usize {
        self.max_payload_size - SEQUENCE_NUMBER_SIZE
    }

    /// Trait window budget, in bytes per millisecond
    pub fn trait_bytes_per_ms(&self) -> f64 {
        self.max_trait_rate_mbps as f64 * 1_000_000.0 / 8.0 / 1000.0
    }
}
