//! Per-section data rate counters
//!
//! Observability tooling queries rates by a fixed set of section names.
//! Byte rates are reported in kilobits per second, update rates in events
//! per second.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Bytes in one kilobit
pub const BYTES_PER_KILOBIT: f32 = 1000.0 / 8.0;

/// Default averaging window
pub const DEFAULT_RATE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct RateWindow {
    start: Instant,
    accumulated: f64,
    rate: f32,
}

/// Windowed per-second counter.
///
/// Values accumulate over the current window; the reported rate is the
/// one computed when the previous window closed.
#[derive(Debug)]
pub struct RateCounter {
    interval: Duration,
    window: Mutex<RateWindow>,
}

impl RateCounter {
    pub fn new(interval: Duration) -> Self {
        RateCounter {
            interval,
            window: Mutex::new(RateWindow {
                start: Instant::now(),
                accumulated: 0.0,
                rate: 0.0,
            }),
        }
    }

    pub fn increment(&self, count: usize) {
        self.increment_at(Instant::now(), count);
    }

    pub fn increment_at(&self, now: Instant, count: usize) {
        let mut window = self.window.lock();
        self.roll(&mut window, now);
        window.accumulated += count as f64;
    }

    /// Events or bytes per second over the last closed window
    pub fn rate(&self) -> f32 {
        self.rate_at(Instant::now())
    }

    pub fn rate_at(&self, now: Instant) -> f32 {
        let mut window = self.window.lock();
        self.roll(&mut window, now);
        window.rate
    }

    fn roll(&self, window: &mut RateWindow, now: Instant) {
        let elapsed = now.saturating_duration_since(window.start);
        if elapsed >= self.interval {
            window.rate = (window.accumulated / elapsed.as_secs_f64()) as f32;
            window.accumulated = 0.0;
            window.start = now;
        }
    }
}

impl Default for RateCounter {
    fn default() -> Self {
        RateCounter::new(DEFAULT_RATE_INTERVAL)
    }
}

/// Snapshot sections tracked by [`DataRates`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RateField {
    GlobalPosition,
    LocalPosition,
    HandControllers,
    AvatarBoundingBox,
    AvatarOrientation,
    AvatarScale,
    LookAtPosition,
    AudioLoudness,
    SensorToWorld,
    AdditionalFlags,
    ParentInfo,
    FaceTracker,
    JointData,
    JointDefaultPoseFlags,
    FarGrabJoints,
}

impl RateField {
    pub const ALL: [RateField; 15] = [
        RateField::GlobalPosition,
        RateField::LocalPosition,
        RateField::HandControllers,
        RateField::AvatarBoundingBox,
        RateField::AvatarOrientation,
        RateField::AvatarScale,
        RateField::LookAtPosition,
        RateField::AudioLoudness,
        RateField::SensorToWorld,
        RateField::AdditionalFlags,
        RateField::ParentInfo,
        RateField::FaceTracker,
        RateField::JointData,
        RateField::JointDefaultPoseFlags,
        RateField::FarGrabJoints,
    ];

    /// Name used by tooling for inbound rates
    pub fn name(self) -> &'static str {
        match self {
            RateField::GlobalPosition => "globalPosition",
            RateField::LocalPosition => "localPosition",
            RateField::HandControllers => "handControllers",
            RateField::AvatarBoundingBox => "avatarBoundingBox",
            RateField::AvatarOrientation => "avatarOrientation",
            RateField::AvatarScale => "avatarScale",
            RateField::LookAtPosition => "lookAtPosition",
            RateField::AudioLoudness => "audioLoudness",
            RateField::SensorToWorld => "sensorToWorkMatrix",
            RateField::AdditionalFlags => "additionalFlags",
            RateField::ParentInfo => "parentInfo",
            RateField::FaceTracker => "faceTracker",
            RateField::JointData => "jointData",
            RateField::JointDefaultPoseFlags => "jointDefaultPoseFlagsRate",
            RateField::FarGrabJoints => "farGrabJointRate",
        }
    }

    /// Name used by tooling for outbound rates
    pub fn outbound_name(self) -> &'static str {
        match self {
            RateField::GlobalPosition => "globalPositionOutbound",
            RateField::LocalPosition => "localPositionOutbound",
            RateField::HandControllers => "handControllersOutbound",
            RateField::AvatarBoundingBox => "avatarBoundingBoxOutbound",
            RateField::AvatarOrientation => "avatarOrientationOutbound",
            RateField::AvatarScale => "avatarScaleOutbound",
            RateField::LookAtPosition => "lookAtPositionOutbound",
            RateField::AudioLoudness => "audioLoudnessOutbound",
            RateField::SensorToWorld => "sensorToWorkMatrixOutbound",
            RateField::AdditionalFlags => "additionalFlagsOutbound",
            RateField::ParentInfo => "parentInfoOutbound",
            RateField::FaceTracker => "faceTrackerOutbound",
            RateField::JointData => "jointDataOutbound",
            RateField::JointDefaultPoseFlags => "jointDefaultPoseFlagsOutbound",
            RateField::FarGrabJoints => "farGrabJointOutbound",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Which way the counted bytes travel
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateDirection {
    Inbound,
    Outbound,
}

#[derive(Debug, Default)]
struct RatePair {
    bytes: RateCounter,
    updates: RateCounter,
}

impl RatePair {
    fn with_interval(interval: Duration) -> Self {
        RatePair {
            bytes: RateCounter::new(interval),
            updates: RateCounter::new(interval),
        }
    }

    fn record(&self, now: Instant, bytes: usize) {
        self.bytes.increment_at(now, bytes);
        self.updates.increment_at(now, 1);
    }
}

/// Byte and update rates for every snapshot section plus the whole buffer
#[derive(Debug)]
pub struct DataRates {
    direction: RateDirection,
    buffer: RatePair,
    fields: Vec<RatePair>,
}

impl DataRates {
    pub fn new(direction: RateDirection) -> Self {
        Self::with_interval(direction, DEFAULT_RATE_INTERVAL)
    }

    pub fn with_interval(direction: RateDirection, interval: Duration) -> Self {
        DataRates {
            direction,
            buffer: RatePair::with_interval(interval),
            fields: RateField::ALL
                .iter()
                .map(|_| RatePair::with_interval(interval))
                .collect(),
        }
    }

    pub fn direction(&self) -> RateDirection {
        self.direction
    }

    /// Count one section write or read of `bytes` bytes
    pub fn record(&self, field: RateField, bytes: usize) {
        self.record_at(Instant::now(), field, bytes);
    }

    pub fn record_at(&self, now: Instant, field: RateField, bytes: usize) {
        self.fields[field.index()].record(now, bytes);
    }

    /// Count one whole snapshot buffer
    pub fn record_buffer(&self, bytes: usize) {
        self.record_buffer_at(Instant::now(), bytes);
    }

    pub fn record_buffer_at(&self, now: Instant, bytes: usize) {
        self.buffer.record(now, bytes);
    }

    fn lookup(&self, name: &str) -> Option<&RatePair> {
        if name.is_empty() {
            return Some(&self.buffer);
        }
        RateField::ALL
            .iter()
            .find(|field| match self.direction {
                RateDirection::Inbound => field.name() == name,
                RateDirection::Outbound => field.outbound_name() == name,
            })
            .map(|field| &self.fields[field.index()])
    }

    /// Kilobits per second for `name`; the empty name is the whole buffer.
    /// Unknown names report zero.
    pub fn data_rate(&self, name: &str) -> f32 {
        self.data_rate_at(Instant::now(), name)
    }

    pub fn data_rate_at(&self, now: Instant, name: &str) -> f32 {
        self.lookup(name)
            .map(|pair| pair.bytes.rate_at(now) / BYTES_PER_KILOBIT)
            .unwrap_or(0.0)
    }

    /// Updates per second for `name`
    pub fn update_rate(&self, name: &str) -> f32 {
        self.update_rate_at(Instant::now(), name)
    }

    pub fn update_rate_at(&self, now: Instant, name: &str) -> f32 {
        self.lookup(name)
            .map(|pair| pair.updates.rate_at(now))
            .unwrap_or(0.0)
    }
}
