//! Runtime statistics

use std::time::Duration;

/// Counters kept by the outbound session
#[derive(Clone, Debug, Default)]
pub struct SessionStats {
    pub frames: u64,
    pub avatar_packets: u64,
    pub avatar_bytes: u64,
    pub full_updates: u64,
    pub partial_frames: u64,
    pub identity_packets: u64,
    pub trait_bytes: u64,
    pub trait_windows: u64,
    pub last_frame_duration: Duration,
}

/// Counters kept by the receive dispatcher
#[derive(Clone, Debug, Default)]
pub struct DispatchStats {
    pub packets_in: u64,
    pub acks_sent: u64,
    pub trait_batches: u64,
    pub traits_applied: u64,
    pub traits_stale: u64,
    pub malformed_packets: u64,
    pub snapshots_decoded: u64,
    pub snapshots_skipped: u64,
    pub identities_applied: u64,
    pub identities_stale: u64,
    pub overrides_applied: u64,
    pub avatars_killed: u64,
}

impl DispatchStats {
    /// Trait tuples seen, applied or not
    pub fn traits_seen(&self) -> u64 {
        self.traits_applied + self.traits_stale
    }
}
