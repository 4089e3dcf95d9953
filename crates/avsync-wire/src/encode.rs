//! Snapshot encoder
//!
//! Produces `[uuid?][flags][sections...]` under a byte budget. Sections
//! that do not fit stay in the returned [`SendStatus`] so the next call
//! resumes where this one stopped; joint data resumes per joint.

use std::time::Instant;

use bytes::{BufMut, Bytes, BytesMut};
use glam::{Quat, Vec3};
use tracing::trace;
use uuid::Uuid;

use avsync_core::{AvatarDataDetail, JointData, JointRef, NUM_BYTES_UUID};

use crate::layout::*;
use crate::{
    bit_vector_size, pack_fixed_scalar, pack_fixed_vec3, pack_gain_byte, pack_orientation_quat,
    pack_ratio_two_byte, write_bit_vector, AdditionalFlags, AvatarFields, DataRates, HasFlags,
    RateField, SendStatus, Vantage, HAND_CONTROLLER_COMPRESSION_RADIX, SENSOR_TO_WORLD_SCALE_RADIX,
    SIX_BYTE_QUAT_SIZE, SIX_BYTE_VEC3_SIZE, TRANSLATION_COMPRESSION_RADIX,
};

/// Smallest translation scale written to the joint section
const MIN_TRANSLATION_DIMENSION: f32 = 0.001;

/// Inputs to one [`encode`] call
#[derive(Clone, Copy, Debug)]
pub struct EncodeParams<'a> {
    pub detail: AvatarDataDetail,
    /// Sections wanted by a fresh send; ignored while continuing
    pub flags_init: HasFlags,
    /// Joints as this recipient last received them
    pub last_sent_joints: &'a [JointData],
    /// Scale cull thresholds by viewer distance
    pub distance_adjust: bool,
    pub viewer_position: Vec3,
    /// Byte budget for the whole snapshot; `0` means unbounded
    pub max_data_size: usize,
    pub outbound_rates: Option<&'a DataRates>,
}

impl<'a> EncodeParams<'a> {
    pub fn new(detail: AvatarDataDetail, flags_init: HasFlags, last_sent_joints: &'a [JointData]) -> Self {
        EncodeParams {
            detail,
            flags_init,
            last_sent_joints,
            distance_adjust: false,
            viewer_position: Vec3::ZERO,
            max_data_size: 0,
            outbound_rates: None,
        }
    }

    pub fn with_max_data_size(mut self, max_data_size: usize) -> Self {
        self.max_data_size = max_data_size;
        self
    }

    pub fn with_viewer(mut self, viewer_position: Vec3) -> Self {
        self.distance_adjust = true;
        self.viewer_position = viewer_position;
        self
    }

    pub fn with_outbound_rates(mut self, rates: &'a DataRates) -> Self {
        self.outbound_rates = Some(rates);
        self
    }
}

/// Result of one [`encode`] call
#[derive(Clone, Debug)]
pub struct EncodedSnapshot {
    pub bytes: Bytes,
    /// Sections the encoder tried to write
    pub wanted: HasFlags,
    /// Sections actually written (the flags word on the wire)
    pub included: HasFlags,
    /// Recipient's view of the joints after this snapshot
    pub sent_joints: Vec<JointData>,
}

/// Flags for a fresh send, from per-section change times.
///
/// `last_sent_time` of `None` treats every section as changed.
pub fn wanted_flags(
    avatar: &dyn AvatarFields,
    detail: AvatarDataDetail,
    last_sent_time: Option<Instant>,
    drop_face_tracking: bool,
) -> HasFlags {
    let mut flags = HasFlags::NONE.with(HasFlags::GLOBAL_POSITION);

    if detail == AvatarDataDetail::PalMinimum {
        return flags.with(HasFlags::AUDIO_LOUDNESS);
    }

    let send_all = detail.sends_all();
    let changed = avatar.changed_since(last_sent_time);
    let wanted = |bit: u16| send_all || changed.has(bit);

    for bit in [
        HasFlags::ORIENTATION,
        HasFlags::BOUNDING_BOX,
        HasFlags::SCALE,
        HasFlags::LOOK_AT_POSITION,
        HasFlags::AUDIO_LOUDNESS,
        HasFlags::SENSOR_TO_WORLD_MATRIX,
        HasFlags::ADDITIONAL_FLAGS,
        HasFlags::PARENT_INFO,
    ] {
        flags.set(bit, wanted(bit));
    }

    let parented = avatar.parent().is_some();
    flags.set(
        HasFlags::LOCAL_POSITION,
        parented && (wanted(HasFlags::LOCAL_POSITION) || changed.has(HasFlags::PARENT_INFO)),
    );
    flags.set(HasFlags::HAND_CONTROLLERS, avatar.hand_controllers().any_valid());
    flags.set(
        HasFlags::FACE_TRACKER_INFO,
        !drop_face_tracking && avatar.has_blendshape_input() && wanted(HasFlags::FACE_TRACKER_INFO),
    );

    let has_joint_data = detail != AvatarDataDetail::MinimumData;
    flags.set(HasFlags::JOINT_DATA, has_joint_data);
    flags.set(
        HasFlags::GRAB_JOINTS,
        has_joint_data && avatar.far_grab_joints().any_valid(),
    );
    flags
}

/// Worst-case snapshot size for the given shape
pub fn max_snapshot_size(num_blendshapes: usize, num_joints: usize) -> usize {
    MAX_CONSTANT_HEADER_SIZE
        + NUM_BYTES_UUID
        + max_face_tracker_info_size(num_blendshapes)
        + max_joint_data_size(num_joints)
        + max_joint_default_pose_flags_size(num_joints)
        + FAR_GRAB_JOINTS_SIZE
}

struct SectionWriter<'a> {
    buf: BytesMut,
    end: usize,
    wanted: HasFlags,
    included: HasFlags,
    rates: Option<&'a DataRates>,
}

impl SectionWriter<'_> {
    #[inline]
    fn remaining(&self) -> usize {
        self.end.saturating_sub(self.buf.len())
    }

    /// Claim a section if it is wanted and `size` bytes remain
    fn begin(&mut self, bit: u16, size: usize) -> bool {
        if self.wanted.has(bit) && self.remaining() >= size {
            self.included.set(bit, true);
            true
        } else {
            false
        }
    }

    fn record(&self, field: RateField, start: usize) {
        if let Some(rates) = self.rates {
            rates.record(field, self.buf.len() - start);
        }
    }
}

#[inline]
fn put_vec3(buf: &mut BytesMut, v: Vec3) {
    buf.put_f32_le(v.x);
    buf.put_f32_le(v.y);
    buf.put_f32_le(v.z);
}

fn put_far_grab(buf: &mut BytesMut, vantage: Option<Vantage>) {
    let vantage = vantage.unwrap_or_default();
    put_vec3(buf, vantage.position);
    let rotation: Quat = vantage.rotation;
    buf.put_f32_le(rotation.w);
    buf.put_f32_le(rotation.x);
    buf.put_f32_le(rotation.y);
    buf.put_f32_le(rotation.z);
}

fn put_hand_controller(buf: &mut BytesMut, vantage: Option<Vantage>) {
    let vantage = vantage.unwrap_or_default();
    pack_orientation_quat(buf, vantage.rotation);
    pack_fixed_vec3(buf, vantage.position, HAND_CONTROLLER_COMPRESSION_RADIX);
}

/// Encode one snapshot of `avatar`, advancing `status`.
///
/// A fresh status (no pending flags) starts from `params.flags_init` and
/// resets the joint cursors. A continuing status reuses its pending
/// flags verbatim, forcing joint data on when grab joints are pending.
pub fn encode(avatar: &dyn AvatarFields, params: &EncodeParams<'_>, status: &mut SendStatus) -> EncodedSnapshot {
    debug_assert!(params.max_data_size == 0 || params.max_data_size >= MIN_BULK_PACKET_SIZE);

    if params.detail == AvatarDataDetail::NoData {
        status.item_flags = HasFlags::NONE;
        let mut buf = BytesMut::with_capacity(MIN_BULK_PACKET_SIZE);
        if status.send_uuid {
            buf.put_slice(&avatar.session_id().to_bytes());
        }
        buf.put_u16_le(HasFlags::NONE.bits());
        return EncodedSnapshot {
            bytes: buf.freeze(),
            wanted: HasFlags::NONE,
            included: HasFlags::NONE,
            sent_joints: params.last_sent_joints.to_vec(),
        };
    }

    let cull_small_changes = params.detail.culls_small_changes();
    let send_all = params.detail.sends_all();

    let wanted = if status.is_continuing() {
        let mut wanted = status.item_flags;
        if wanted.has(HasFlags::GRAB_JOINTS) {
            wanted.set(HasFlags::JOINT_DATA, true);
        }
        wanted
    } else {
        status.item_flags = params.flags_init;
        status.rotations_sent = 0;
        status.translations_sent = 0;
        params.flags_init
    };

    let joints = if wanted.has(HasFlags::JOINT_DATA) || wanted.has(HasFlags::JOINT_DEFAULT_POSE_FLAGS) {
        let mut joints = avatar.joint_data();
        joints.truncate(MAX_JOINT_COUNT);
        joints
    } else {
        Vec::new()
    };
    let num_joints = joints.len();

    let face = if wanted.has(HasFlags::FACE_TRACKER_INFO) {
        let mut face = avatar.face_tracker();
        face.blendshapes.truncate(u8::MAX as usize);
        Some(face)
    } else {
        None
    };
    let num_blendshapes = face.as_ref().map_or(0, |f| f.blendshapes.len());

    let capacity = max_snapshot_size(num_blendshapes, num_joints);
    let end = if params.max_data_size == 0 {
        capacity
    } else {
        params.max_data_size.min(capacity)
    };

    let mut w = SectionWriter {
        buf: BytesMut::with_capacity(capacity),
        end,
        wanted,
        included: HasFlags::NONE,
        rates: params.outbound_rates,
    };
    let mut extra = HasFlags::NONE;

    if status.send_uuid {
        w.buf.put_slice(&avatar.session_id().to_bytes());
    }

    let flags_at = w.buf.len();
    w.buf.put_u16_le(0);

    if w.begin(HasFlags::GLOBAL_POSITION, AVATAR_GLOBAL_POSITION_SIZE) {
        let start = w.buf.len();
        put_vec3(&mut w.buf, avatar.global_position());
        w.record(RateField::GlobalPosition, start);
    }

    if w.begin(HasFlags::BOUNDING_BOX, AVATAR_BOUNDING_BOX_SIZE) {
        let start = w.buf.len();
        let bounds = avatar.bounding_box();
        put_vec3(&mut w.buf, bounds.dimensions);
        put_vec3(&mut w.buf, bounds.offset);
        w.record(RateField::AvatarBoundingBox, start);
    }

    if w.begin(HasFlags::ORIENTATION, AVATAR_ORIENTATION_SIZE) {
        let start = w.buf.len();
        pack_orientation_quat(&mut w.buf, avatar.orientation());
        w.record(RateField::AvatarOrientation, start);
    }

    if w.begin(HasFlags::SCALE, AVATAR_SCALE_SIZE) {
        let start = w.buf.len();
        let scale = avatar.scale().clamp(MIN_AVATAR_SCALE, MAX_AVATAR_SCALE);
        pack_ratio_two_byte(&mut w.buf, scale);
        w.record(RateField::AvatarScale, start);
    }

    if w.begin(HasFlags::LOOK_AT_POSITION, LOOK_AT_POSITION_SIZE) {
        let start = w.buf.len();
        put_vec3(&mut w.buf, avatar.look_at_position());
        w.record(RateField::LookAtPosition, start);
    }

    if w.begin(HasFlags::AUDIO_LOUDNESS, AUDIO_LOUDNESS_SIZE) {
        let start = w.buf.len();
        let loudness = avatar.audio_loudness().min(MAX_AUDIO_LOUDNESS);
        w.buf.put_u8(pack_gain_byte(loudness / AUDIO_LOUDNESS_SCALE));
        w.record(RateField::AudioLoudness, start);
    }

    if w.begin(HasFlags::SENSOR_TO_WORLD_MATRIX, SENSOR_TO_WORLD_SIZE) {
        let start = w.buf.len();
        let transform = avatar.sensor_to_world();
        pack_orientation_quat(&mut w.buf, transform.rotation);
        pack_fixed_scalar(&mut w.buf, transform.scale, SENSOR_TO_WORLD_SCALE_RADIX);
        put_vec3(&mut w.buf, transform.translation);
        w.record(RateField::SensorToWorld, start);
    }

    let parent = if wanted.has(HasFlags::ADDITIONAL_FLAGS) || wanted.has(HasFlags::PARENT_INFO) {
        avatar.parent()
    } else {
        None
    };

    if w.begin(HasFlags::ADDITIONAL_FLAGS, ADDITIONAL_FLAGS_SIZE) {
        let start = w.buf.len();
        let mut flags = avatar.additional_flags();
        flags.set(AdditionalFlags::HAS_REFERENTIAL, parent.is_some());
        w.buf.put_u16_le(flags.0 & AdditionalFlags::KNOWN_BITS);
        w.record(RateField::AdditionalFlags, start);
    }

    if w.begin(HasFlags::PARENT_INFO, PARENT_INFO_SIZE) {
        let start = w.buf.len();
        let (id, joint) = parent.map_or((Uuid::nil(), JointRef::NoJoint), |p| (p.id, p.joint));
        w.buf.put_slice(id.as_bytes());
        w.buf.put_u16_le(joint.to_wire());
        w.record(RateField::ParentInfo, start);
    }

    if w.begin(HasFlags::LOCAL_POSITION, AVATAR_LOCAL_POSITION_SIZE) {
        let start = w.buf.len();
        put_vec3(&mut w.buf, avatar.local_position());
        w.record(RateField::LocalPosition, start);
    }

    if w.begin(HasFlags::HAND_CONTROLLERS, HAND_CONTROLLERS_SIZE) {
        let start = w.buf.len();
        let controllers = avatar.hand_controllers();
        put_hand_controller(&mut w.buf, controllers.left);
        put_hand_controller(&mut w.buf, controllers.right);
        w.record(RateField::HandControllers, start);
    }

    if let Some(face) = face {
        if w.begin(HasFlags::FACE_TRACKER_INFO, max_face_tracker_info_size(num_blendshapes)) {
            let start = w.buf.len();
            w.buf.put_f32_le(face.left_eye_blink);
            w.buf.put_f32_le(face.right_eye_blink);
            w.buf.put_f32_le(face.average_loudness);
            w.buf.put_f32_le(face.brow_audio_lift);
            w.buf.put_u8(num_blendshapes as u8);
            for coefficient in &face.blendshapes {
                w.buf.put_f32_le(*coefficient);
            }
            w.record(RateField::FaceTracker, start);
        }
    }

    let mut sent_joints = params.last_sent_joints.to_vec();
    sent_joints.resize(num_joints, JointData::default());
    let last_sent = |i: usize| params.last_sent_joints.get(i).copied().unwrap_or_default();

    let validity_size = bit_vector_size(num_joints);

    if w.begin(HasFlags::JOINT_DATA, min_joint_data_size(num_joints)) {
        let start = w.buf.len();
        // One rotation plus the translation bit vector and scale that follow
        let min_size_for_joint = SIX_BYTE_QUAT_SIZE + validity_size + 4;

        let (min_rotation_dot, min_translation) = if params.distance_adjust && cull_small_changes {
            let distance = params.viewer_position.distance(avatar.global_position());
            (
                distance_based_min_rotation_dot(distance),
                distance_based_min_translation(distance),
            )
        } else {
            (AVATAR_MIN_ROTATION_DOT, AVATAR_MIN_TRANSLATION)
        };

        let first_translation = status.translations_sent.min(num_joints);
        let max_translation_dimension = joints[first_translation..]
            .iter()
            .filter(|joint| !joint.translation_is_default_pose)
            .fold(MIN_TRANSLATION_DIMENSION, |max, joint| {
                max.max(joint.translation.abs().max_element())
            });

        // Rotations
        let mut remaining = w.remaining() - 1 - validity_size;
        let mut send_rotation = vec![false; num_joints];
        let mut i = status.rotations_sent.min(num_joints);
        while i < num_joints && remaining >= min_size_for_joint {
            let data = &joints[i];
            let last = last_sent(i);
            if !data.rotation_is_default_pose
                && (send_all
                    || last.rotation_is_default_pose
                    || (!cull_small_changes && last.rotation != data.rotation)
                    || (cull_small_changes && last.rotation.dot(data.rotation).abs() < min_rotation_dot))
            {
                send_rotation[i] = true;
                remaining -= SIX_BYTE_QUAT_SIZE;
                sent_joints[i].rotation = data.rotation;
            }
            sent_joints[i].rotation_is_default_pose = data.rotation_is_default_pose;
            i += 1;
        }
        status.rotations_sent = i;

        w.buf.put_u8(num_joints as u8);
        write_bit_vector(&mut w.buf, num_joints, |i| send_rotation[i]);
        for (joint, _) in joints.iter().zip(&send_rotation).filter(|(_, send)| **send) {
            pack_orientation_quat(&mut w.buf, joint.rotation);
        }

        // Translations
        let mut remaining = w.remaining().saturating_sub(validity_size + 4);
        let mut send_translation = vec![false; num_joints];
        let mut i = first_translation;
        while i < num_joints && remaining >= min_size_for_joint {
            let data = &joints[i];
            let last = last_sent(i);
            if !data.translation_is_default_pose
                && (send_all
                    || last.translation_is_default_pose
                    || (!cull_small_changes && last.translation != data.translation)
                    || (cull_small_changes && data.translation.distance(last.translation) > min_translation))
            {
                send_translation[i] = true;
                remaining -= SIX_BYTE_VEC3_SIZE;
                sent_joints[i].translation = data.translation;
            }
            sent_joints[i].translation_is_default_pose = data.translation_is_default_pose;
            i += 1;
        }
        status.translations_sent = i;

        write_bit_vector(&mut w.buf, num_joints, |i| send_translation[i]);
        w.buf.put_f32_le(max_translation_dimension);
        for (joint, _) in joints.iter().zip(&send_translation).filter(|(_, send)| **send) {
            pack_fixed_vec3(
                &mut w.buf,
                joint.translation / max_translation_dimension,
                TRANSLATION_COMPRESSION_RADIX,
            );
        }

        if w.begin(HasFlags::GRAB_JOINTS, FAR_GRAB_JOINTS_SIZE) {
            let grab_start = w.buf.len();
            let grabs = avatar.far_grab_joints();
            put_far_grab(&mut w.buf, grabs.left);
            put_far_grab(&mut w.buf, grabs.right);
            put_far_grab(&mut w.buf, grabs.mouse);
            w.record(RateField::FarGrabJoints, grab_start);
        }

        if !status.joints_complete(num_joints) {
            extra.set(HasFlags::JOINT_DATA, true);
        }
        w.record(RateField::JointData, start);
    }

    if w.begin(HasFlags::JOINT_DEFAULT_POSE_FLAGS, max_joint_default_pose_flags_size(num_joints)) {
        let start = w.buf.len();
        w.buf.put_u8(num_joints as u8);
        write_bit_vector(&mut w.buf, num_joints, |i| joints[i].rotation_is_default_pose);
        write_bit_vector(&mut w.buf, num_joints, |i| joints[i].translation_is_default_pose);
        w.record(RateField::JointDefaultPoseFlags, start);
    }

    let included = w.included;
    w.buf[flags_at..flags_at + 2].copy_from_slice(&included.bits().to_le_bytes());
    status.item_flags = wanted.without(included).union(extra);

    debug_assert!(w.buf.len() <= capacity, "snapshot overflowed its worst-case size");
    trace!(
        avatar = %avatar.session_id(),
        size = w.buf.len(),
        wanted = wanted.bits(),
        included = included.bits(),
        pending = status.item_flags.bits(),
        "encoded snapshot"
    );

    if let Some(rates) = w.rates {
        rates.record_buffer(w.buf.len());
    }

    EncodedSnapshot {
        bytes: w.buf.freeze(),
        wanted,
        included,
        sent_joints,
    }
}

/// Thresholds used when reconciling last-sent joints after a send
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ReconcileThresholds {
    pub min_rotation_dot: f32,
    pub min_translation: f32,
}

impl Default for ReconcileThresholds {
    fn default() -> Self {
        ReconcileThresholds {
            min_rotation_dot: AVATAR_MIN_ROTATION_DOT,
            min_translation: AVATAR_MIN_TRANSLATION,
        }
    }
}

impl ReconcileThresholds {
    /// Thresholds matching a distance-adjusted encode for a viewer at `distance`
    pub fn for_distance(distance: f32) -> Self {
        ReconcileThresholds {
            min_rotation_dot: distance_based_min_rotation_dot(distance),
            min_translation: distance_based_min_translation(distance),
        }
    }
}

/// Fold what was just sent into the owner's last-sent joints.
///
/// Only joints below the status cursors are considered. With culling,
/// a joint whose delta is still under the threshold keeps its old
/// last-sent value, so small drifts accumulate until they are sent.
pub fn done_encoding(
    avatar: &dyn AvatarFields,
    cull_small_changes: bool,
    status: &SendStatus,
    thresholds: ReconcileThresholds,
) {
    avatar.update_last_sent_joints(&mut |current, last_sent| {
        if current.len() > last_sent.len() {
            last_sent.resize(current.len(), JointData::default());
        }

        for (data, last) in current.iter().zip(last_sent.iter_mut()).take(status.rotations_sent) {
            if data.rotation_is_default_pose {
                last.rotation_is_default_pose = true;
            } else if last.rotation_is_default_pose
                || (last.rotation != data.rotation
                    && (!cull_small_changes
                        || data.rotation.dot(last.rotation).abs() <= thresholds.min_rotation_dot))
            {
                last.rotation = data.rotation;
                last.rotation_is_default_pose = false;
            }
        }

        for (data, last) in current.iter().zip(last_sent.iter_mut()).take(status.translations_sent) {
            if data.translation_is_default_pose {
                last.translation_is_default_pose = true;
            } else if last.translation_is_default_pose
                || (last.translation != data.translation
                    && (!cull_small_changes
                        || data.translation.distance(last.translation) > thresholds.min_translation))
            {
                last.translation = data.translation;
                last.translation_is_default_pose = false;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{decode, AvatarState, FarGrabJoints, HandControllers, ParentInfo};
    use avsync_core::AvatarId;
    use proptest::prelude::*;

    fn avatar_with_joints(num_joints: usize) -> AvatarState {
        let avatar = AvatarState::new(AvatarId::random());
        avatar.set_joint_data(
            (0..num_joints)
                .map(|i| JointData::posed(Quat::from_rotation_y(0.02 * i as f32 + 0.1), Vec3::new(0.01 * i as f32, 0.5, 0.0)))
                .collect(),
        );
        avatar
    }

    /// Indices carried by the rotation and translation bit vectors of a
    /// joint-only snapshot
    fn sent_indices(bytes: &[u8]) -> (Vec<usize>, Vec<usize>) {
        let flags = u16::from_le_bytes([bytes[0], bytes[1]]);
        assert_eq!(flags & !(HasFlags::JOINT_DATA), 0);
        if flags == 0 {
            return (Vec::new(), Vec::new());
        }
        let num_joints = bytes[2] as usize;
        let size = bit_vector_size(num_joints);
        let bits = |at: usize| -> Vec<usize> {
            (0..num_joints)
                .filter(|i| bytes[at + i / 8] & (1 << (i % 8)) != 0)
                .collect()
        };
        let rotations = bits(3);
        let translations = bits(3 + size + rotations.len() * SIX_BYTE_QUAT_SIZE);
        (rotations, translations)
    }

    #[test]
    fn test_no_data_is_flags_only() {
        let avatar = avatar_with_joints(3);
        let mut status = SendStatus::default();
        status.item_flags = HasFlags(HasFlags::JOINT_DATA);
        let params = EncodeParams::new(AvatarDataDetail::NoData, HasFlags::ALL, &[]);
        let encoded = encode(&avatar, &params, &mut status);
        assert_eq!(&encoded.bytes[..], &[0, 0]);
        assert!(!status.is_continuing());

        let mut status = SendStatus::with_uuid();
        let encoded = encode(&avatar, &params, &mut status);
        assert_eq!(encoded.bytes.len(), MIN_BULK_PACKET_SIZE);
        assert_eq!(&encoded.bytes[..16], &avatar.session_id().to_bytes());
    }

    #[test]
    fn test_sixty_joints_split_across_packets() {
        let avatar = avatar_with_joints(60);
        let flags = HasFlags::NONE.with(HasFlags::JOINT_DATA);
        let mut status = SendStatus::default();
        let mut rotation_counts = vec![0; 60];
        let mut translation_counts = vec![0; 60];

        let params = EncodeParams::new(AvatarDataDetail::CullSmallData, flags, &[]).with_max_data_size(200);
        let first = encode(&avatar, &params, &mut status);
        assert!(first.bytes.len() <= 200);
        assert!(status.rotations_sent < 60);
        assert!(status.item_flags.has(HasFlags::JOINT_DATA));

        let (rotations, translations) = sent_indices(&first.bytes);
        rotations.iter().for_each(|i| rotation_counts[*i] += 1);
        translations.iter().for_each(|i| translation_counts[*i] += 1);

        let mut packets = 1;
        while status.is_continuing() {
            let encoded = encode(&avatar, &params, &mut status);
            assert!(encoded.bytes.len() <= 200);
            let (rotations, translations) = sent_indices(&encoded.bytes);
            rotations.iter().for_each(|i| rotation_counts[*i] += 1);
            translations.iter().for_each(|i| translation_counts[*i] += 1);
            packets += 1;
            assert!(packets < 20, "continuation made no progress");
        }

        assert!(packets >= 2);
        assert!(status.joints_complete(60));
        assert!(rotation_counts.iter().all(|c| *c == 1));
        assert!(translation_counts.iter().all(|c| *c == 1));
    }

    #[test]
    fn test_partial_sends_rebuild_the_pose() {
        let source = avatar_with_joints(40);
        let target = AvatarState::new(source.session_id());
        let flags = HasFlags::NONE.with(HasFlags::JOINT_DATA);
        let params = EncodeParams::new(AvatarDataDetail::SendAllData, flags, &[]).with_max_data_size(120);
        let mut status = SendStatus::default();
        loop {
            let encoded = encode(&source, &params, &mut status);
            assert_eq!(decode(&target, &encoded.bytes), encoded.bytes.len());
            if !status.is_continuing() {
                break;
            }
        }
        for (a, b) in source.joint_data().iter().zip(target.joint_data().iter()) {
            assert!(a.rotation.dot(b.rotation).abs() > 0.9999);
            assert!((a.translation - b.translation).abs().max_element() < 1e-3);
        }
    }

    #[test]
    fn test_unsent_sections_carry_over() {
        let avatar = avatar_with_joints(0);
        let flags = HasFlags::NONE
            .with(HasFlags::GLOBAL_POSITION)
            .with(HasFlags::BOUNDING_BOX)
            .with(HasFlags::ORIENTATION);
        let params = EncodeParams::new(AvatarDataDetail::IncludeSmallData, flags, &[]).with_max_data_size(30);
        let mut status = SendStatus::default();

        let first = encode(&avatar, &params, &mut status);
        assert_eq!(first.included.bits(), HasFlags::GLOBAL_POSITION | HasFlags::ORIENTATION);
        assert_eq!(status.item_flags.bits(), HasFlags::BOUNDING_BOX);

        let params = params.with_max_data_size(100);
        let second = encode(&avatar, &params, &mut status);
        assert_eq!(second.wanted.bits(), HasFlags::BOUNDING_BOX);
        assert_eq!(second.included.bits(), HasFlags::BOUNDING_BOX);
        assert!(!status.is_continuing());
    }

    #[test]
    fn test_pending_grab_forces_joint_data() {
        let avatar = avatar_with_joints(2);
        let mut status = SendStatus::default();
        status.item_flags = HasFlags(HasFlags::GRAB_JOINTS);
        let params = EncodeParams::new(AvatarDataDetail::SendAllData, HasFlags::NONE, &[]);
        let encoded = encode(&avatar, &params, &mut status);
        assert!(encoded.included.has(HasFlags::JOINT_DATA));
        assert!(encoded.included.has(HasFlags::GRAB_JOINTS));
        assert!(!status.is_continuing());
    }

    #[test]
    fn test_small_changes_culled() {
        let avatar = avatar_with_joints(1);
        let current = avatar.joint_data()[0];
        let mut last = current;
        last.rotation = (current.rotation * Quat::from_rotation_x(0.0001)).normalize();
        last.translation = current.translation + Vec3::new(0.00001, 0.0, 0.0);
        let last_sent = [last];
        let flags = HasFlags::NONE.with(HasFlags::JOINT_DATA);

        let mut status = SendStatus::default();
        let params = EncodeParams::new(AvatarDataDetail::CullSmallData, flags, &last_sent);
        let culled = encode(&avatar, &params, &mut status);
        assert_eq!(sent_indices(&culled.bytes), (vec![], vec![]));

        let mut status = SendStatus::default();
        let params = EncodeParams::new(AvatarDataDetail::IncludeSmallData, flags, &last_sent);
        let included = encode(&avatar, &params, &mut status);
        assert_eq!(sent_indices(&included.bytes), (vec![0], vec![0]));
        assert_eq!(included.sent_joints[0].rotation, current.rotation);
    }

    #[test]
    fn test_default_pose_joints_never_sent() {
        let avatar = AvatarState::new(AvatarId::random());
        avatar.set_joint_data(vec![JointData::default(); 5]);
        let flags = HasFlags::NONE.with(HasFlags::JOINT_DATA);
        let mut status = SendStatus::default();
        let params = EncodeParams::new(AvatarDataDetail::SendAllData, flags, &[]);
        let encoded = encode(&avatar, &params, &mut status);
        assert_eq!(sent_indices(&encoded.bytes), (vec![], vec![]));
        assert_eq!(encoded.bytes.len(), 2 + min_joint_data_size(5));
    }

    #[test]
    fn test_distance_adjusted_cull() {
        let avatar = avatar_with_joints(1);
        let current = avatar.joint_data()[0];
        let mut last = current;
        last.rotation = (current.rotation * Quat::from_rotation_x(10f32.to_radians())).normalize();
        let last_sent = [last];
        let flags = HasFlags::NONE.with(HasFlags::JOINT_DATA);

        let near = EncodeParams::new(AvatarDataDetail::CullSmallData, flags, &last_sent).with_viewer(Vec3::new(1.0, 0.0, 0.0));
        let encoded = encode(&avatar, &near, &mut SendStatus::default());
        assert_eq!(sent_indices(&encoded.bytes).0, vec![0]);

        let far = EncodeParams::new(AvatarDataDetail::CullSmallData, flags, &last_sent).with_viewer(Vec3::new(300.0, 0.0, 0.0));
        let encoded = encode(&avatar, &far, &mut SendStatus::default());
        assert!(sent_indices(&encoded.bytes).0.is_empty());
    }

    #[test]
    fn test_done_encoding_updates_last_sent() {
        let avatar = avatar_with_joints(3);
        let status = SendStatus::complete(3);
        done_encoding(&avatar, true, &status, ReconcileThresholds::default());
        assert_eq!(avatar.last_sent_joint_data(), avatar.joint_data());

        // A drift under the threshold is not folded in
        let mut joint = avatar.joint_data()[1];
        let before = joint.translation;
        joint.translation += Vec3::new(0.00001, 0.0, 0.0);
        avatar.set_joint(1, joint);
        done_encoding(&avatar, true, &status, ReconcileThresholds::default());
        assert_eq!(avatar.last_sent_joint_data()[1].translation, before);

        // Without culling every change is recorded
        done_encoding(&avatar, false, &status, ReconcileThresholds::default());
        assert_eq!(avatar.last_sent_joint_data()[1].translation, joint.translation);
    }

    #[test]
    fn test_done_encoding_respects_cursor() {
        let avatar = avatar_with_joints(4);
        let status = SendStatus {
            rotations_sent: 2,
            translations_sent: 1,
            ..SendStatus::default()
        };
        done_encoding(&avatar, false, &status, ReconcileThresholds::default());
        let last = avatar.last_sent_joint_data();
        assert_eq!(last.len(), 4);
        assert!(!last[1].rotation_is_default_pose);
        assert!(last[2].rotation_is_default_pose);
        assert!(!last[0].translation_is_default_pose);
        assert!(last[1].translation_is_default_pose);
    }

    #[test]
    fn test_wanted_flags_derivation() {
        let avatar = avatar_with_joints(2);
        let since = Some(Instant::now());

        let pal = wanted_flags(&avatar, AvatarDataDetail::PalMinimum, None, false);
        assert_eq!(pal.bits(), HasFlags::GLOBAL_POSITION | HasFlags::AUDIO_LOUDNESS);

        let idle = wanted_flags(&avatar, AvatarDataDetail::CullSmallData, since, false);
        assert_eq!(idle.bits(), HasFlags::GLOBAL_POSITION | HasFlags::JOINT_DATA);

        let minimum = wanted_flags(&avatar, AvatarDataDetail::MinimumData, None, false);
        assert!(!minimum.has(HasFlags::JOINT_DATA));
        assert!(minimum.has(HasFlags::ORIENTATION));
        assert!(!minimum.has(HasFlags::LOCAL_POSITION));

        avatar.set_parent(Some(ParentInfo {
            id: Uuid::new_v4(),
            joint: JointRef::NoJoint,
        }));
        avatar.set_hand_controllers(HandControllers {
            left: Some(Vantage::default()),
            right: None,
        });
        avatar.set_far_grab_joints(FarGrabJoints {
            mouse: Some(Vantage::default()),
            ..FarGrabJoints::default()
        });
        avatar.set_has_blendshape_input(true);

        let all = wanted_flags(&avatar, AvatarDataDetail::SendAllData, since, false);
        assert!(all.has(HasFlags::LOCAL_POSITION));
        assert!(all.has(HasFlags::HAND_CONTROLLERS));
        assert!(all.has(HasFlags::FACE_TRACKER_INFO));
        assert!(all.has(HasFlags::GRAB_JOINTS));
        assert!(!all.has(HasFlags::JOINT_DEFAULT_POSE_FLAGS));

        let dropped = wanted_flags(&avatar, AvatarDataDetail::SendAllData, since, true);
        assert!(!dropped.has(HasFlags::FACE_TRACKER_INFO));
    }

    #[test]
    fn test_outbound_rates_recorded() {
        let avatar = avatar_with_joints(4);
        let rates = DataRates::new(crate::RateDirection::Outbound);
        let params = EncodeParams::new(AvatarDataDetail::SendAllData, HasFlags::ALL, &[]).with_outbound_rates(&rates);
        encode(&avatar, &params, &mut SendStatus::default());
        let later = Instant::now() + std::time::Duration::from_secs(2);
        assert!(rates.data_rate_at(later, "jointDataOutbound") > 0.0);
        assert!(rates.update_rate_at(later, "") > 0.0);
    }

    proptest! {
        #[test]
        fn prop_budget_respected(max_data_size in MIN_BULK_PACKET_SIZE..1200usize, num_joints in 0usize..120, send_uuid: bool) {
            let avatar = avatar_with_joints(num_joints);
            avatar.set_has_blendshape_input(true);
            let mut status = SendStatus { send_uuid, ..SendStatus::default() };
            let params = EncodeParams::new(AvatarDataDetail::SendAllData, HasFlags::ALL, &[])
                .with_max_data_size(max_data_size);

            for _ in 0..4 {
                let encoded = encode(&avatar, &params, &mut status);
                prop_assert!(encoded.bytes.len() <= max_data_size);
                prop_assert!(encoded.included.is_subset_of(encoded.wanted));
                if !status.is_continuing() {
                    break;
                }
            }
        }
    }
}
