//! Trait types, versions and wire sizes

use bytes::Bytes;

use avsync_core::InstanceId;

/// Kinds of trait. Simple traits hold one value per avatar; instanced
/// traits hold one value per instance id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(i8)]
pub enum TraitType {
    SkeletonModelUrl = 0,
    SkeletonData = 1,
    AvatarEntity = 2,
    Grab = 3,
}

impl TraitType {
    /// Wire value terminating one avatar's traits in a bulk packet
    pub const NULL_TRAIT: i8 = -1;

    pub const SIMPLE: [TraitType; 2] = [TraitType::SkeletonModelUrl, TraitType::SkeletonData];
    pub const INSTANCED: [TraitType; 2] = [TraitType::AvatarEntity, TraitType::Grab];

    pub fn from_wire(value: i8) -> Option<Self> {
        match value {
            0 => Some(TraitType::SkeletonModelUrl),
            1 => Some(TraitType::SkeletonData),
            2 => Some(TraitType::AvatarEntity),
            3 => Some(TraitType::Grab),
            _ => None,
        }
    }

    #[inline]
    pub fn to_wire(self) -> i8 {
        self as i8
    }

    #[inline]
    pub fn is_simple(self) -> bool {
        !self.is_instanced()
    }

    #[inline]
    pub fn is_instanced(self) -> bool {
        matches!(self, TraitType::AvatarEntity | TraitType::Grab)
    }
}

/// Per-sender trait version; one version is shared by a whole batch
pub type TraitVersion = i32;

pub const DEFAULT_TRAIT_VERSION: TraitVersion = 0;
pub const NULL_TRAIT_VERSION: TraitVersion = -1;

/// Payload size on the wire; [`DELETED_TRAIT_SIZE`] marks a deleted instance
pub type TraitWireSize = i16;

pub const DELETED_TRAIT_SIZE: TraitWireSize = -1;
pub const MAXIMUM_TRAIT_SIZE: usize = i16::MAX as usize;

/// Sequence number of a bulk trait packet, echoed back as its ack
pub type TraitMessageSequence = i64;

/// One trait tuple parsed from a bulk packet
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TraitRecord {
    pub trait_type: TraitType,
    pub version: TraitVersion,
    pub instance: Option<InstanceId>,
    /// `None` for a deleted instance
    pub payload: Option<Bytes>,
}

impl TraitRecord {
    #[inline]
    pub fn is_delete(&self) -> bool {
        self.payload.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trait_type_wire() {
        for trait_type in TraitType::SIMPLE.into_iter().chain(TraitType::INSTANCED) {
            assert_eq!(TraitType::from_wire(trait_type.to_wire()), Some(trait_type));
        }
        assert_eq!(TraitType::from_wire(TraitType::NULL_TRAIT), None);
        assert_eq!(TraitType::from_wire(4), None);
    }

    #[test]
    fn test_simple_and_instanced() {
        assert!(TraitType::SkeletonModelUrl.is_simple());
        assert!(TraitType::SkeletonData.is_simple());
        assert!(TraitType::AvatarEntity.is_instanced());
        assert!(TraitType::Grab.is_instanced());
        assert_eq!(MAXIMUM_TRAIT_SIZE, 32767);
    }
}
