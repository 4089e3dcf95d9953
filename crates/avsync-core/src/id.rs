//! Identity types
//!
//! Avatars and trait instances are named by 128-bit UUIDs, carried on the
//! wire in RFC 4122 byte order (16 bytes).

use std::fmt;

use uuid::Uuid;

/// Number of bytes in a wire UUID
pub const NUM_BYTES_UUID: usize = 16;

/// Avatar identity - the owning node's session UUID
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct AvatarId(pub Uuid);

impl AvatarId {
    pub const NULL: AvatarId = AvatarId(Uuid::nil());

    #[inline]
    pub fn new(id: Uuid) -> Self {
        AvatarId(id)
    }

    /// Fresh random identity
    pub fn random() -> Self {
        AvatarId(Uuid::new_v4())
    }

    #[inline]
    pub fn is_null(self) -> bool {
        self.0.is_nil()
    }

    #[inline]
    pub fn to_bytes(self) -> [u8; NUM_BYTES_UUID] {
        *self.0.as_bytes()
    }

    #[inline]
    pub fn from_bytes(bytes: [u8; NUM_BYTES_UUID]) -> Self {
        AvatarId(Uuid::from_bytes(bytes))
    }
}

impl fmt::Debug for AvatarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Avatar({})", self.0.simple())
    }
}

impl fmt::Display for AvatarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Trait instance identity - one per avatar entity or grab
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct InstanceId(pub Uuid);

impl InstanceId {
    pub const NULL: InstanceId = InstanceId(Uuid::nil());

    #[inline]
    pub fn new(id: Uuid) -> Self {
        InstanceId(id)
    }

    pub fn random() -> Self {
        InstanceId(Uuid::new_v4())
    }

    #[inline]
    pub fn to_bytes(self) -> [u8; NUM_BYTES_UUID] {
        *self.0.as_bytes()
    }

    #[inline]
    pub fn from_bytes(bytes: [u8; NUM_BYTES_UUID]) -> Self {
        InstanceId(Uuid::from_bytes(bytes))
    }
}

impl fmt::Debug for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Instance({})", self.0.simple())
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_avatar_id_bytes() {
        let id = AvatarId::random();
        assert_eq!(AvatarId::from_bytes(id.to_bytes()), id);
        assert!(!id.is_null());
        assert!(AvatarId::NULL.is_null());
    }

    #[test]
    fn test_rfc4122_order() {
        let uuid = Uuid::parse_str("00112233-4455-6677-8899-aabbccddeeff").unwrap();
        let bytes = InstanceId::new(uuid).to_bytes();
        assert_eq!(bytes[0], 0x00);
        assert_eq!(bytes[1], 0x11);
        assert_eq!(bytes[15], 0xff);
    }
}
