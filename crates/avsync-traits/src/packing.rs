//! Trait packing and bulk trait parsing
//!
//! Client to relay (`SetAvatarTraits`):
//! - `i32` batch version
//! - simple: `i8 type, i16 size, payload`
//! - instanced: `i8 type, 16B instance, i16 size | -1, payload`
//!
//! Relay to client (`BulkAvatarTraits`):
//! - `i64` sequence
//! - per avatar: `16B avatar id` then tuples terminated by `NULL_TRAIT`
//! - simple: `i8 type, i32 version, i16 size, payload`
//! - instanced: `i8 type, i32 version, 16B instance, i16 size | -1, payload`

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::warn;

use avsync_core::{AvatarId, AvsyncError, AvsyncResult, InstanceId, NUM_BYTES_UUID};

use crate::{
    TraitMessageSequence, TraitRecord, TraitType, TraitVersion, TraitWireSize, DEFAULT_TRAIT_VERSION,
    DELETED_TRAIT_SIZE, MAXIMUM_TRAIT_SIZE,
};

fn checked_size(trait_type: TraitType, payload: &[u8]) -> Option<TraitWireSize> {
    if payload.len() > MAXIMUM_TRAIT_SIZE {
        warn!(?trait_type, size = payload.len(), "refusing to pack oversize trait");
        None
    } else {
        Some(payload.len() as TraitWireSize)
    }
}

/// Write an unversioned simple trait. Returns bytes written, `0` when
/// the payload is refused for size.
pub fn pack_trait(buf: &mut BytesMut, trait_type: TraitType, payload: &[u8]) -> usize {
    let Some(size) = checked_size(trait_type, payload) else {
        return 0;
    };
    buf.put_i8(trait_type.to_wire());
    buf.put_i16_le(size);
    buf.put_slice(payload);
    1 + 2 + payload.len()
}

/// Write a simple trait carrying its own version
pub fn pack_versioned_trait(
    buf: &mut BytesMut,
    trait_type: TraitType,
    version: TraitVersion,
    payload: &[u8],
) -> usize {
    let Some(size) = checked_size(trait_type, payload) else {
        return 0;
    };
    buf.put_i8(trait_type.to_wire());
    buf.put_i32_le(version);
    buf.put_i16_le(size);
    buf.put_slice(payload);
    1 + 4 + 2 + payload.len()
}

/// Write one trait instance. The version is only written when it is
/// greater than [`DEFAULT_TRAIT_VERSION`].
pub fn pack_instanced_trait(
    buf: &mut BytesMut,
    trait_type: TraitType,
    instance: InstanceId,
    payload: &[u8],
    version: TraitVersion,
) -> usize {
    let Some(size) = checked_size(trait_type, payload) else {
        return 0;
    };
    let mut written = 1;
    buf.put_i8(trait_type.to_wire());
    if version > DEFAULT_TRAIT_VERSION {
        buf.put_i32_le(version);
        written += 4;
    }
    buf.put_slice(&instance.to_bytes());
    buf.put_i16_le(size);
    buf.put_slice(payload);
    written + NUM_BYTES_UUID + 2 + payload.len()
}

/// Write a deletion for one trait instance
pub fn pack_instanced_trait_delete(
    buf: &mut BytesMut,
    trait_type: TraitType,
    instance: InstanceId,
    version: TraitVersion,
) -> usize {
    let mut written = 1;
    buf.put_i8(trait_type.to_wire());
    if version > DEFAULT_TRAIT_VERSION {
        buf.put_i32_le(version);
        written += 4;
    }
    buf.put_slice(&instance.to_bytes());
    buf.put_i16_le(DELETED_TRAIT_SIZE);
    written + NUM_BYTES_UUID + 2
}

/// Acknowledgement for a bulk trait packet
pub fn encode_traits_ack(sequence: TraitMessageSequence) -> Bytes {
    Bytes::copy_from_slice(&sequence.to_le_bytes())
}

/// Bounds-checked little-endian reader over a trait packet
#[derive(Clone, Copy, Debug)]
pub struct TraitReader<'a> {
    buf: &'a [u8],
}

impl<'a> TraitReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        TraitReader { buf }
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn check(&self, size: usize) -> AvsyncResult<()> {
        if self.buf.len() < size {
            Err(AvsyncError::BufferTooShort {
                expected: size,
                actual: self.buf.len(),
            })
        } else {
            Ok(())
        }
    }

    pub fn read_i8(&mut self) -> AvsyncResult<i8> {
        self.check(1)?;
        Ok(self.buf.get_i8())
    }

    pub fn read_i16(&mut self) -> AvsyncResult<i16> {
        self.check(2)?;
        Ok(self.buf.get_i16_le())
    }

    pub fn read_i32(&mut self) -> AvsyncResult<i32> {
        self.check(4)?;
        Ok(self.buf.get_i32_le())
    }

    pub fn read_i64(&mut self) -> AvsyncResult<i64> {
        self.check(8)?;
        Ok(self.buf.get_i64_le())
    }

    pub fn read_uuid(&mut self) -> AvsyncResult<[u8; NUM_BYTES_UUID]> {
        self.check(NUM_BYTES_UUID)?;
        let mut bytes = [0u8; NUM_BYTES_UUID];
        self.buf.copy_to_slice(&mut bytes);
        Ok(bytes)
    }

    /// Borrow `len` payload bytes
    pub fn read_bytes(&mut self, len: usize) -> AvsyncResult<&'a [u8]> {
        self.check(len)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }
}

/// One avatar's tuples within a bulk trait packet
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AvatarTraitRecords {
    pub avatar_id: AvatarId,
    pub records: Vec<TraitRecord>,
}

/// A fully parsed bulk trait packet
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BulkTraits {
    pub sequence: TraitMessageSequence,
    pub avatars: Vec<AvatarTraitRecords>,
}

/// Sequence number at the head of a bulk trait packet
pub fn read_bulk_sequence(payload: &[u8]) -> AvsyncResult<TraitMessageSequence> {
    TraitReader::new(payload).read_i64()
}

fn read_size(reader: &mut TraitReader<'_>) -> AvsyncResult<TraitWireSize> {
    let size = reader.read_i16()?;
    if size < DELETED_TRAIT_SIZE {
        return Err(AvsyncError::MalformedTraitPacket("negative trait size"));
    }
    if size > 0 && size as usize > reader.remaining() {
        return Err(AvsyncError::MalformedTraitPacket("trait size exceeds packet"));
    }
    Ok(size)
}

/// Parse a whole bulk trait packet. Any framing error fails the packet
/// so nothing from a corrupt packet is applied.
pub fn parse_bulk_traits(payload: &[u8]) -> AvsyncResult<BulkTraits> {
    let mut reader = TraitReader::new(payload);
    let sequence = reader.read_i64()?;
    let mut avatars = Vec::new();

    while reader.remaining() > 0 {
        let avatar_id = AvatarId::from_bytes(reader.read_uuid()?);
        let mut records = Vec::new();

        while reader.remaining() > 0 {
            let raw_type = reader.read_i8()?;
            if raw_type == TraitType::NULL_TRAIT {
                break;
            }
            let trait_type = TraitType::from_wire(raw_type).ok_or(AvsyncError::UnknownTraitType(raw_type))?;
            let version = reader.read_i32()?;

            let instance = if trait_type.is_instanced() {
                Some(InstanceId::from_bytes(reader.read_uuid()?))
            } else {
                None
            };

            let size = read_size(&mut reader)?;
            let payload = if size == DELETED_TRAIT_SIZE {
                if instance.is_none() {
                    return Err(AvsyncError::MalformedTraitPacket("deleted simple trait"));
                }
                None
            } else {
                Some(Bytes::copy_from_slice(reader.read_bytes(size as usize)?))
            };

            records.push(TraitRecord {
                trait_type,
                version,
                instance,
                payload,
            });
        }

        avatars.push(AvatarTraitRecords { avatar_id, records });
    }

    Ok(BulkTraits { sequence, avatars })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk_header(sequence: i64, avatar: AvatarId) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_i64_le(sequence);
        buf.put_slice(&avatar.to_bytes());
        buf
    }

    #[test]
    fn test_simple_trait_layout() {
        let mut buf = BytesMut::new();
        assert_eq!(pack_trait(&mut buf, TraitType::SkeletonModelUrl, b"abc"), 6);
        assert_eq!(&buf[..], &[0, 3, 0, b'a', b'b', b'c']);

        let mut buf = BytesMut::new();
        assert_eq!(pack_versioned_trait(&mut buf, TraitType::SkeletonData, 9, b"x"), 8);
        assert_eq!(&buf[..], &[1, 9, 0, 0, 0, 1, 0, b'x']);
    }

    #[test]
    fn test_instance_version_only_when_positive() {
        let id = InstanceId::random();
        let mut unversioned = BytesMut::new();
        let n = pack_instanced_trait(&mut unversioned, TraitType::Grab, id, b"g", DEFAULT_TRAIT_VERSION);
        assert_eq!(n, 1 + 16 + 2 + 1);
        assert_eq!(&unversioned[1..17], &id.to_bytes());

        let mut versioned = BytesMut::new();
        let n = pack_instanced_trait(&mut versioned, TraitType::Grab, id, b"g", 4);
        assert_eq!(n, 1 + 4 + 16 + 2 + 1);
        assert_eq!(&versioned[1..5], &4i32.to_le_bytes());

        let mut delete = BytesMut::new();
        let n = pack_instanced_trait_delete(&mut delete, TraitType::AvatarEntity, id, 0);
        assert_eq!(n, 19);
        assert_eq!(&delete[17..], &(-1i16).to_le_bytes());
    }

    #[test]
    fn test_oversize_refused() {
        let mut buf = BytesMut::new();
        let payload = vec![0u8; MAXIMUM_TRAIT_SIZE + 1];
        assert_eq!(pack_trait(&mut buf, TraitType::SkeletonData, &payload), 0);
        assert_eq!(pack_instanced_trait(&mut buf, TraitType::AvatarEntity, InstanceId::random(), &payload, 3), 0);
        assert!(buf.is_empty());

        let payload = vec![0u8; MAXIMUM_TRAIT_SIZE];
        assert_eq!(pack_trait(&mut buf, TraitType::SkeletonData, &payload), MAXIMUM_TRAIT_SIZE + 3);
    }

    #[test]
    fn test_parse_bulk_traits() {
        let avatar = AvatarId::random();
        let entity = InstanceId::random();
        let mut buf = bulk_header(42, avatar);
        pack_versioned_trait(&mut buf, TraitType::SkeletonModelUrl, 3, b"http://a/b.fst");
        pack_instanced_trait(&mut buf, TraitType::AvatarEntity, entity, b"{}", 3);
        pack_instanced_trait_delete(&mut buf, TraitType::Grab, entity, 4);
        buf.put_i8(TraitType::NULL_TRAIT);

        let parsed = parse_bulk_traits(&buf).unwrap();
        assert_eq!(parsed.sequence, 42);
        assert_eq!(parsed.avatars.len(), 1);
        let records = &parsed.avatars[0].records;
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].trait_type, TraitType::SkeletonModelUrl);
        assert_eq!(records[0].payload.as_deref(), Some(&b"http://a/b.fst"[..]));
        assert_eq!(records[1].instance, Some(entity));
        assert_eq!(records[1].version, 3);
        assert!(records[2].is_delete());
        assert_eq!(records[2].version, 4);
    }

    #[test]
    fn test_parse_rejects_overlong_size() {
        let mut buf = bulk_header(1, AvatarId::random());
        buf.put_i8(TraitType::SkeletonData.to_wire());
        buf.put_i32_le(2);
        buf.put_i16_le(50);
        buf.put_slice(b"short");
        assert!(matches!(
            parse_bulk_traits(&buf),
            Err(AvsyncError::MalformedTraitPacket(_))
        ));
    }

    #[test]
    fn test_parse_rejects_unknown_type() {
        let mut buf = bulk_header(1, AvatarId::random());
        buf.put_i8(9);
        buf.put_i32_le(2);
        assert_eq!(parse_bulk_traits(&buf), Err(AvsyncError::UnknownTraitType(9)));
    }

    #[test]
    fn test_parse_many_avatars() {
        let first = AvatarId::random();
        let second = AvatarId::random();
        let mut buf = bulk_header(7, first);
        buf.put_i8(TraitType::NULL_TRAIT);
        buf.put_slice(&second.to_bytes());
        pack_versioned_trait(&mut buf, TraitType::SkeletonData, 1, b"");
        buf.put_i8(TraitType::NULL_TRAIT);

        let parsed = parse_bulk_traits(&buf).unwrap();
        assert_eq!(parsed.avatars.len(), 2);
        assert!(parsed.avatars[0].records.is_empty());
        assert_eq!(parsed.avatars[1].avatar_id, second);
        assert_eq!(parsed.avatars[1].records[0].payload.as_deref(), Some(&b""[..]));
    }

    #[test]
    fn test_ack_layout() {
        assert_eq!(&encode_traits_ack(0x0102)[..], &[2, 1, 0, 0, 0, 0, 0, 0]);
        assert_eq!(read_bulk_sequence(&encode_traits_ack(-5)), Ok(-5));
    }
}
