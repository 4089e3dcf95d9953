//! Avatar identity packet
//!
//! Layout (little-endian):
//! - Bytes 0-15: avatar session id
//! - Bytes 16-19: identity sequence number
//! - u16 length + UTF-8 display name
//! - u16 length + UTF-8 session display name
//! - u32 identity flags

use bytes::{Buf, BufMut, Bytes, BytesMut};

use avsync_core::{AvatarId, AvsyncError, AvsyncResult, NUM_BYTES_UUID};

/// Identity flag bits
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct IdentityFlags(pub u32);

impl IdentityFlags {
    pub const IS_REPLICATED: u32 = 1 << 0;
    pub const LOOK_AT_SNAPPING: u32 = 1 << 1;
    pub const VERIFICATION_FAILED: u32 = 1 << 2;

    #[inline]
    pub fn has(self, bit: u32) -> bool {
        self.0 & bit != 0
    }

    #[inline]
    pub fn set(&mut self, bit: u32, value: bool) {
        if value {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }
}

/// Display names and identity flags for one avatar
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AvatarIdentity {
    pub avatar_id: AvatarId,
    pub sequence: u32,
    pub display_name: String,
    pub session_display_name: String,
    pub flags: IdentityFlags,
}

const MIN_IDENTITY_SIZE: usize = NUM_BYTES_UUID + 4 + 2 + 2 + 4;

fn put_string(buf: &mut BytesMut, value: &str) {
    let mut len = value.len().min(u16::MAX as usize);
    while !value.is_char_boundary(len) {
        len -= 1;
    }
    buf.put_u16_le(len as u16);
    buf.put_slice(&value.as_bytes()[..len]);
}

fn get_string(src: &mut &[u8], field: &'static str) -> AvsyncResult<String> {
    if src.remaining() < 2 {
        return Err(AvsyncError::BufferTooShort {
            expected: 2,
            actual: src.remaining(),
        });
    }
    let len = src.get_u16_le() as usize;
    if src.remaining() < len {
        return Err(AvsyncError::BufferTooShort {
            expected: len,
            actual: src.remaining(),
        });
    }
    let value = std::str::from_utf8(&src[..len])
        .map_err(|_| AvsyncError::InvalidWireFormat(format!("{field} is not UTF-8")))?
        .to_owned();
    src.advance(len);
    Ok(value)
}

impl AvatarIdentity {
    pub fn new(avatar_id: AvatarId, sequence: u32) -> Self {
        AvatarIdentity {
            avatar_id,
            sequence,
            display_name: String::new(),
            session_display_name: String::new(),
            flags: IdentityFlags::default(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(
            MIN_IDENTITY_SIZE + self.display_name.len() + self.session_display_name.len(),
        );
        buf.put_slice(&self.avatar_id.to_bytes());
        buf.put_u32_le(self.sequence);
        put_string(&mut buf, &self.display_name);
        put_string(&mut buf, &self.session_display_name);
        buf.put_u32_le(self.flags.0);
        buf.freeze()
    }

    pub fn decode(mut src: &[u8]) -> AvsyncResult<Self> {
        if src.len() < MIN_IDENTITY_SIZE {
            return Err(AvsyncError::BufferTooShort {
                expected: MIN_IDENTITY_SIZE,
                actual: src.len(),
            });
        }
        let mut id = [0u8; NUM_BYTES_UUID];
        src.copy_to_slice(&mut id);
        let avatar_id = AvatarId::from_bytes(id);
        if avatar_id.is_null() {
            return Err(AvsyncError::NullIdentity);
        }
        let sequence = src.get_u32_le();
        let display_name = get_string(&mut src, "display name")?;
        let session_display_name = get_string(&mut src, "session display name")?;
        if src.remaining() < 4 {
            return Err(AvsyncError::BufferTooShort {
                expected: 4,
                actual: src.remaining(),
            });
        }
        let flags = IdentityFlags(src.get_u32_le());

        Ok(AvatarIdentity {
            avatar_id,
            sequence,
            display_name,
            session_display_name,
            flags,
        })
    }
}

/// Last identity sequence accepted for one avatar
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IdentitySequence(Option<u32>);

impl IdentitySequence {
    pub fn last(&self) -> Option<u32> {
        self.0
    }

    /// Accept `identity` if it is the first seen or strictly newer
    pub fn accept(&mut self, identity: &AvatarIdentity) -> AvsyncResult<()> {
        match self.0 {
            Some(current) if identity.sequence <= current => Err(AvsyncError::StaleIdentity {
                avatar: identity.avatar_id,
                incoming: identity.sequence,
                current,
            }),
            _ => {
                self.0 = Some(identity.sequence);
                Ok(())
            }
        }
    }
}
