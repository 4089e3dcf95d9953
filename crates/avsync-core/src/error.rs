//! Error types for the avatar sync stack

use thiserror::Error;

use crate::{AvatarId, InstanceId};

/// Core avatar sync errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AvsyncError {
    // Wire errors
    #[error("Invalid wire format: {0}")]
    InvalidWireFormat(String),

    #[error("Buffer too short: expected {expected}, got {actual}")]
    BufferTooShort { expected: usize, actual: usize },

    #[error("Invalid numeric value in {0}")]
    InvalidNumber(&'static str),

    // Trait errors
    #[error("Unknown trait type: {0}")]
    UnknownTraitType(i8),

    #[error("Malformed trait packet: {0}")]
    MalformedTraitPacket(&'static str),

    #[error("Trait payload too large: {size} > {max}")]
    TraitTooLarge { size: usize, max: usize },

    #[error("Instance limit reached: {limit} (refused {instance})")]
    InstanceLimitReached { instance: InstanceId, limit: usize },

    // Identity errors
    #[error("Null avatar identity")]
    NullIdentity,

    #[error("Stale identity for {avatar}: seq {incoming} <= {current}")]
    StaleIdentity {
        avatar: AvatarId,
        incoming: u32,
        current: u32,
    },

    // Configuration errors
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
}

/// Result type for avatar sync operations
pub type AvsyncResult<T> = Result<T, AvsyncError>;
