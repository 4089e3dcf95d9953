//! Snapshot decoder
//!
//! Every section is bounds checked before it is read. A short or corrupt
//! section abandons the rest of the buffer: the whole buffer is reported
//! as consumed, and only sections completed before it have been applied.

use std::time::Instant;

use bytes::Buf;
use glam::{Quat, Vec3};
use tracing::warn;
use uuid::Uuid;

use avsync_core::{AvatarId, AvsyncError, JointData, JointRef, NUM_BYTES_UUID};

use crate::layout::*;
use crate::{
    bit_vector_size, read_bit_vector, unpack_fixed_scalar, unpack_fixed_vec3, unpack_gain_byte,
    unpack_orientation_quat, unpack_ratio_two_byte, AdditionalFlags, AvatarFields, BoundingBox,
    FaceTracker, FarGrabJoints, HandControllers, HasFlags, ParentInfo, RateField, SensorToWorld,
    Vantage, HAND_CONTROLLER_COMPRESSION_RADIX, SENSOR_TO_WORLD_SCALE_RADIX, SIX_BYTE_QUAT_SIZE,
    SIX_BYTE_VEC3_SIZE, TRANSLATION_COMPRESSION_RADIX,
};

/// Why a buffer was abandoned
#[derive(Debug)]
struct Rejected {
    section: &'static str,
    error: AvsyncError,
}

type SectionResult<T> = Result<T, Rejected>;

fn read_check(src: &[u8], section: &'static str, size: usize) -> SectionResult<()> {
    if src.len() < size {
        Err(Rejected {
            section,
            error: AvsyncError::BufferTooShort {
                expected: size,
                actual: src.len(),
            },
        })
    } else {
        Ok(())
    }
}

fn nan_check(is_nan: bool, section: &'static str) -> SectionResult<()> {
    if is_nan {
        Err(Rejected {
            section,
            error: AvsyncError::InvalidNumber(section),
        })
    } else {
        Ok(())
    }
}

#[inline]
fn get_vec3(src: &mut &[u8]) -> Vec3 {
    let x = src.get_f32_le();
    let y = src.get_f32_le();
    let z = src.get_f32_le();
    Vec3::new(x, y, z)
}

fn get_far_grab(src: &mut &[u8]) -> Vantage {
    let position = get_vec3(src);
    let w = src.get_f32_le();
    let x = src.get_f32_le();
    let y = src.get_f32_le();
    let z = src.get_f32_le();
    Vantage::new(position, Quat::from_xyzw(x, y, z, w))
}

fn get_hand_controller(src: &mut &[u8]) -> Vantage {
    let rotation = unpack_orientation_quat(src);
    let position = unpack_fixed_vec3(src, HAND_CONTROLLER_COMPRESSION_RADIX);
    Vantage::new(position, rotation)
}

/// Parse a snapshot starting at its flags word (any id prefix already
/// stripped) and apply it to `avatar`.
///
/// Returns the number of bytes consumed, or `buffer.len()` if the
/// buffer was abandoned.
pub fn decode(avatar: &dyn AvatarFields, buffer: &[u8]) -> usize {
    let mut src = buffer;
    match decode_sections(avatar, &mut src) {
        Ok(()) => {
            let consumed = buffer.len() - src.len();
            if let Some(rates) = avatar.inbound_rates() {
                rates.record_buffer(consumed);
            }
            consumed
        }
        Err(rejected) => {
            if avatar.should_log_error(Instant::now()) {
                warn!(
                    avatar = %avatar.session_id(),
                    section = rejected.section,
                    remaining = src.len(),
                    error = %rejected.error,
                    "Avatar data packet rejected"
                );
            }
            buffer.len()
        }
    }
}

/// Decode an `[uuid][snapshot]` segment into whichever avatar
/// `resolve` returns for the id. Returns the id and the bytes consumed
/// (uuid included), or `None` if the uuid itself is truncated.
pub fn decode_identified<'a, F>(buffer: &[u8], resolve: F) -> Option<(AvatarId, usize)>
where
    F: FnOnce(AvatarId) -> &'a dyn AvatarFields,
{
    if buffer.len() < NUM_BYTES_UUID {
        return None;
    }
    let mut id = [0u8; NUM_BYTES_UUID];
    id.copy_from_slice(&buffer[..NUM_BYTES_UUID]);
    let id = AvatarId::from_bytes(id);
    let consumed = decode(resolve(id), &buffer[NUM_BYTES_UUID..]);
    Some((id, NUM_BYTES_UUID + consumed))
}

fn record(avatar: &dyn AvatarFields, field: RateField, bytes: usize) {
    if let Some(rates) = avatar.inbound_rates() {
        rates.record(field, bytes);
    }
}

fn decode_sections(avatar: &dyn AvatarFields, src: &mut &[u8]) -> SectionResult<()> {
    read_check(src, "Flags", HEADER_SIZE)?;
    let flags = HasFlags(src.get_u16_le());

    if flags.has(HasFlags::GLOBAL_POSITION) {
        read_check(src, "AvatarGlobalPosition", AVATAR_GLOBAL_POSITION_SIZE)?;
        let position = get_vec3(src);
        nan_check(position.is_nan(), "AvatarGlobalPosition")?;
        avatar.set_global_position(position);
        record(avatar, RateField::GlobalPosition, AVATAR_GLOBAL_POSITION_SIZE);
    }

    if flags.has(HasFlags::BOUNDING_BOX) {
        read_check(src, "AvatarBoundingBox", AVATAR_BOUNDING_BOX_SIZE)?;
        let dimensions = get_vec3(src);
        let offset = get_vec3(src);
        nan_check(dimensions.is_nan() || offset.is_nan(), "AvatarBoundingBox")?;
        avatar.set_bounding_box(BoundingBox { dimensions, offset });
        record(avatar, RateField::AvatarBoundingBox, AVATAR_BOUNDING_BOX_SIZE);
    }

    if flags.has(HasFlags::ORIENTATION) {
        read_check(src, "AvatarOrientation", AVATAR_ORIENTATION_SIZE)?;
        let orientation = unpack_orientation_quat(src);
        nan_check(orientation.is_nan(), "AvatarOrientation")?;
        avatar.set_orientation(orientation);
        record(avatar, RateField::AvatarOrientation, AVATAR_ORIENTATION_SIZE);
    }

    if flags.has(HasFlags::SCALE) {
        read_check(src, "AvatarScale", AVATAR_SCALE_SIZE)?;
        let scale = unpack_ratio_two_byte(src);
        nan_check(scale.is_nan(), "AvatarScale")?;
        avatar.set_scale(scale.clamp(MIN_AVATAR_SCALE, MAX_AVATAR_SCALE));
        record(avatar, RateField::AvatarScale, AVATAR_SCALE_SIZE);
    }

    if flags.has(HasFlags::LOOK_AT_POSITION) {
        read_check(src, "LookAtPosition", LOOK_AT_POSITION_SIZE)?;
        let look_at = get_vec3(src);
        nan_check(look_at.is_nan(), "LookAtPosition")?;
        avatar.set_look_at_position(look_at);
        record(avatar, RateField::LookAtPosition, LOOK_AT_POSITION_SIZE);
    }

    if flags.has(HasFlags::AUDIO_LOUDNESS) {
        read_check(src, "AudioLoudness", AUDIO_LOUDNESS_SIZE)?;
        let loudness = unpack_gain_byte(src.get_u8()) * AUDIO_LOUDNESS_SCALE;
        nan_check(loudness.is_nan(), "AudioLoudness")?;
        avatar.set_audio_loudness(loudness);
        record(avatar, RateField::AudioLoudness, AUDIO_LOUDNESS_SIZE);
    }

    if flags.has(HasFlags::SENSOR_TO_WORLD_MATRIX) {
        read_check(src, "SensorToWorldMatrix", SENSOR_TO_WORLD_SIZE)?;
        let rotation = unpack_orientation_quat(src);
        let scale = unpack_fixed_scalar(src, SENSOR_TO_WORLD_SCALE_RADIX);
        let translation = get_vec3(src);
        nan_check(translation.is_nan(), "SensorToWorldMatrix")?;
        avatar.set_sensor_to_world(SensorToWorld {
            scale,
            rotation,
            translation,
        });
        record(avatar, RateField::SensorToWorld, SENSOR_TO_WORLD_SIZE);
    }

    if flags.has(HasFlags::ADDITIONAL_FLAGS) {
        read_check(src, "AdditionalFlags", ADDITIONAL_FLAGS_SIZE)?;
        avatar.set_additional_flags(AdditionalFlags::from_wire(src.get_u16_le()));
        record(avatar, RateField::AdditionalFlags, ADDITIONAL_FLAGS_SIZE);
    }

    if flags.has(HasFlags::PARENT_INFO) {
        read_check(src, "ParentInfo", PARENT_INFO_SIZE)?;
        let mut id = [0u8; NUM_BYTES_UUID];
        src.copy_to_slice(&mut id);
        let id = Uuid::from_bytes(id);
        let joint = JointRef::from_wire(src.get_u16_le());
        avatar.set_parent((!id.is_nil()).then_some(ParentInfo { id, joint }));
        record(avatar, RateField::ParentInfo, PARENT_INFO_SIZE);
    }

    if flags.has(HasFlags::LOCAL_POSITION) {
        read_check(src, "AvatarLocalPosition", AVATAR_LOCAL_POSITION_SIZE)?;
        let position = get_vec3(src);
        nan_check(position.is_nan(), "AvatarLocalPosition")?;
        if avatar.parent().is_none() {
            warn!(avatar = %avatar.session_id(), "received local position for avatar with no parent");
        } else {
            avatar.set_local_position(position);
        }
        record(avatar, RateField::LocalPosition, AVATAR_LOCAL_POSITION_SIZE);
    }

    if flags.has(HasFlags::HAND_CONTROLLERS) {
        read_check(src, "HandControllers", HAND_CONTROLLERS_SIZE)?;
        let left = get_hand_controller(src);
        let right = get_hand_controller(src);
        avatar.set_hand_controllers(HandControllers {
            left: Some(left),
            right: Some(right),
        });
        record(avatar, RateField::HandControllers, HAND_CONTROLLERS_SIZE);
    } else {
        avatar.set_hand_controllers(HandControllers::default());
    }

    if flags.has(HasFlags::FACE_TRACKER_INFO) {
        read_check(src, "FaceTrackerInfo", FACE_TRACKER_INFO_SIZE)?;
        let left_eye_blink = src.get_f32_le();
        let right_eye_blink = src.get_f32_le();
        let average_loudness = src.get_f32_le();
        let brow_audio_lift = src.get_f32_le();
        let num_coefficients = src.get_u8() as usize;

        read_check(src, "FaceTrackerCoefficients", num_coefficients * 4)?;
        let mut blendshapes = Vec::with_capacity(num_coefficients.min(MAX_BLENDSHAPE_COEFFICIENTS));
        for i in 0..num_coefficients {
            let coefficient = src.get_f32_le();
            if i < MAX_BLENDSHAPE_COEFFICIENTS {
                blendshapes.push(coefficient);
            }
        }
        avatar.set_face_tracker(FaceTracker {
            left_eye_blink,
            right_eye_blink,
            average_loudness,
            brow_audio_lift,
            blendshapes,
        });
        record(avatar, RateField::FaceTracker, max_face_tracker_info_size(num_coefficients));
    }

    if flags.has(HasFlags::JOINT_DATA) {
        let section_start = src.len();

        read_check(src, "NumJoints", 1)?;
        let num_joints = src.get_u8() as usize;
        let validity_size = bit_vector_size(num_joints);

        read_check(src, "JointRotationValidityBits", validity_size)?;
        let mut valid_rotations = vec![false; num_joints];
        read_bit_vector(src, num_joints, |i, valid| valid_rotations[i] = valid);
        let num_rotations = valid_rotations.iter().filter(|v| **v).count();

        read_check(src, "JointRotations", num_rotations * SIX_BYTE_QUAT_SIZE)?;
        let mut rotations = Vec::with_capacity(num_rotations);
        for (i, _) in valid_rotations.iter().enumerate().filter(|(_, v)| **v) {
            rotations.push((i, unpack_orientation_quat(src)));
        }

        read_check(src, "JointTranslationValidityBits", validity_size)?;
        let mut valid_translations = vec![false; num_joints];
        read_bit_vector(src, num_joints, |i, valid| valid_translations[i] = valid);
        let num_translations = valid_translations.iter().filter(|v| **v).count();

        read_check(src, "JointMaxTranslationDimension", 4)?;
        let max_translation_dimension = src.get_f32_le();
        nan_check(max_translation_dimension.is_nan(), "JointMaxTranslationDimension")?;

        read_check(src, "JointTranslation", num_translations * SIX_BYTE_VEC3_SIZE)?;
        let mut translations = Vec::with_capacity(num_translations);
        for (i, _) in valid_translations.iter().enumerate().filter(|(_, v)| **v) {
            let normalized = unpack_fixed_vec3(src, TRANSLATION_COMPRESSION_RADIX);
            translations.push((i, normalized * max_translation_dimension));
        }

        avatar.update_joints(&mut |joints| {
            joints.resize(num_joints, JointData::default());
            for (i, rotation) in &rotations {
                joints[*i].rotation = *rotation;
                joints[*i].rotation_is_default_pose = false;
            }
            for (i, translation) in &translations {
                joints[*i].translation = *translation;
                joints[*i].translation_is_default_pose = false;
            }
        });
        record(avatar, RateField::JointData, section_start - src.len());

        if flags.has(HasFlags::GRAB_JOINTS) {
            read_check(src, "FarGrabJoints", FAR_GRAB_JOINTS_SIZE)?;
            let left = get_far_grab(src);
            let right = get_far_grab(src);
            let mouse = get_far_grab(src);
            nan_check(
                [left, right, mouse]
                    .iter()
                    .any(|v| v.position.is_nan() || v.rotation.is_nan()),
                "FarGrabJoints",
            )?;
            avatar.set_far_grab_joints(FarGrabJoints {
                left: Some(left),
                right: Some(right),
                mouse: Some(mouse),
            });
            record(avatar, RateField::FarGrabJoints, FAR_GRAB_JOINTS_SIZE);
        }
    }

    if flags.has(HasFlags::JOINT_DEFAULT_POSE_FLAGS) {
        read_check(src, "JointDefaultPoseFlagsNumJoints", 1)?;
        let num_joints = src.get_u8() as usize;
        let validity_size = bit_vector_size(num_joints);

        read_check(src, "JointDefaultPoseFlags", 2 * validity_size)?;
        let mut rotation_defaults = vec![false; num_joints];
        let mut translation_defaults = vec![false; num_joints];
        read_bit_vector(src, num_joints, |i, value| rotation_defaults[i] = value);
        read_bit_vector(src, num_joints, |i, value| translation_defaults[i] = value);

        avatar.update_joints(&mut |joints| {
            joints.resize(num_joints, JointData::default());
            for (i, joint) in joints.iter_mut().enumerate() {
                joint.rotation_is_default_pose = rotation_defaults[i];
                joint.translation_is_default_pose = translation_defaults[i];
            }
        });
        record(
            avatar,
            RateField::JointDefaultPoseFlags,
            max_joint_default_pose_flags_size(num_joints),
        );
    }

    Ok(())
}
