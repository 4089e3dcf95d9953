//! Skeleton data trait
//!
//! Layout (little-endian):
//! - Header (11 bytes): `f32 max translation dimension, f32 max scale
//!   dimension, u8 joint count, u16 string table length`
//! - Per joint (22 bytes): `u16 name start, u8 name length, u8 bone type,
//!   6B translation, 6B rotation, u16 scale ratio, u16 joint index,
//!   u16 parent index`
//! - UTF-8 joint name table

use bytes::{Buf, BufMut, Bytes, BytesMut};
use glam::{Quat, Vec3};

use avsync_core::{AvsyncError, AvsyncResult};
use avsync_wire::{
    pack_fixed_vec3, pack_orientation_quat, pack_ratio_two_byte, unpack_fixed_vec3,
    unpack_orientation_quat, unpack_ratio_two_byte, TRANSLATION_COMPRESSION_RADIX,
};

pub const SKELETON_HEADER_SIZE: usize = 4 + 4 + 1 + 2;
pub const SKELETON_JOINT_SIZE: usize = 2 + 1 + 1 + 6 + 6 + 2 + 2 + 2;

const MIN_DIMENSION: f32 = 0.001;

/// Role of a joint in the avatar hierarchy
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BoneType {
    SkeletonRoot = 0,
    #[default]
    SkeletonChild = 1,
    NonSkeletonRoot = 2,
    NonSkeletonChild = 3,
}

impl BoneType {
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(BoneType::SkeletonRoot),
            1 => Some(BoneType::SkeletonChild),
            2 => Some(BoneType::NonSkeletonRoot),
            3 => Some(BoneType::NonSkeletonChild),
            _ => None,
        }
    }

    #[inline]
    pub fn is_root(self) -> bool {
        matches!(self, BoneType::SkeletonRoot | BoneType::NonSkeletonRoot)
    }
}

/// Default pose and hierarchy of one joint
#[derive(Clone, Debug, PartialEq)]
pub struct SkeletonJoint {
    pub name: String,
    pub bone_type: BoneType,
    pub joint_index: u16,
    /// `-1` for root bones
    pub parent_index: i32,
    pub default_translation: Vec3,
    pub default_rotation: Quat,
    pub default_scale: f32,
}

fn truncated_name(name: &str) -> &str {
    let mut len = name.len().min(u8::MAX as usize);
    while !name.is_char_boundary(len) {
        len -= 1;
    }
    &name[..len]
}

/// Pack a skeleton. Joint names longer than 255 bytes are truncated.
pub fn pack_skeleton_data(joints: &[SkeletonJoint]) -> AvsyncResult<Bytes> {
    if joints.len() > u8::MAX as usize {
        return Err(AvsyncError::InvalidWireFormat(format!(
            "skeleton has {} joints",
            joints.len()
        )));
    }

    let mut max_translation = MIN_DIMENSION;
    let mut max_scale = MIN_DIMENSION;
    let mut names = String::new();
    let mut spans = Vec::with_capacity(joints.len());
    for joint in joints {
        max_translation = max_translation.max(joint.default_translation.abs().max_element());
        max_scale = max_scale.max(joint.default_scale);
        let name = truncated_name(&joint.name);
        spans.push((names.len(), name.len()));
        names.push_str(name);
    }
    if names.len() > u16::MAX as usize {
        return Err(AvsyncError::InvalidWireFormat("skeleton name table too long".into()));
    }

    let mut buf =
        BytesMut::with_capacity(SKELETON_HEADER_SIZE + joints.len() * SKELETON_JOINT_SIZE + names.len());
    buf.put_f32_le(max_translation);
    buf.put_f32_le(max_scale);
    buf.put_u8(joints.len() as u8);
    buf.put_u16_le(names.len() as u16);

    for (i, (joint, (start, len))) in joints.iter().zip(spans).enumerate() {
        buf.put_u16_le(start as u16);
        buf.put_u8(len as u8);
        buf.put_u8(joint.bone_type as u8);
        pack_fixed_vec3(
            &mut buf,
            joint.default_translation / max_translation,
            TRANSLATION_COMPRESSION_RADIX,
        );
        pack_orientation_quat(&mut buf, joint.default_rotation);
        pack_ratio_two_byte(&mut buf, joint.default_scale / max_scale);
        buf.put_u16_le(i as u16);
        buf.put_u16_le(joint.parent_index as u16);
    }
    buf.put_slice(names.as_bytes());

    Ok(buf.freeze())
}

pub fn unpack_skeleton_data(mut src: &[u8]) -> AvsyncResult<Vec<SkeletonJoint>> {
    if src.len() < SKELETON_HEADER_SIZE {
        return Err(AvsyncError::BufferTooShort {
            expected: SKELETON_HEADER_SIZE,
            actual: src.len(),
        });
    }
    let max_translation = src.get_f32_le();
    let max_scale = src.get_f32_le();
    let num_joints = src.get_u8() as usize;
    let table_len = src.get_u16_le() as usize;
    if !max_translation.is_finite() || !max_scale.is_finite() {
        return Err(AvsyncError::InvalidNumber("skeleton dimensions"));
    }

    let expected = num_joints * SKELETON_JOINT_SIZE + table_len;
    if src.len() < expected {
        return Err(AvsyncError::BufferTooShort {
            expected,
            actual: src.len(),
        });
    }
    let body: &[u8] = src;
    let table = &body[num_joints * SKELETON_JOINT_SIZE..expected];

    let mut joints = Vec::with_capacity(num_joints);
    for i in 0..num_joints {
        let start = src.get_u16_le() as usize;
        let len = src.get_u8() as usize;
        let bone_type = BoneType::from_wire(src.get_u8())
            .ok_or_else(|| AvsyncError::InvalidWireFormat("unknown bone type".into()))?;
        let default_translation = unpack_fixed_vec3(&mut src, TRANSLATION_COMPRESSION_RADIX) * max_translation;
        let default_rotation = unpack_orientation_quat(&mut src);
        let default_scale = unpack_ratio_two_byte(&mut src) * max_scale;
        // Joints are stored in index order
        src.advance(2);
        let parent = src.get_u16_le();

        let name = table
            .get(start..start + len)
            .ok_or_else(|| AvsyncError::InvalidWireFormat("joint name outside string table".into()))?;
        let name = std::str::from_utf8(name)
            .map_err(|_| AvsyncError::InvalidWireFormat("joint name is not UTF-8".into()))?;

        joints.push(SkeletonJoint {
            name: name.to_owned(),
            bone_type,
            joint_index: i as u16,
            parent_index: if bone_type.is_root() { -1 } else { parent as i32 },
            default_translation,
            default_rotation,
            default_scale,
        });
    }
    Ok(joints)
}
