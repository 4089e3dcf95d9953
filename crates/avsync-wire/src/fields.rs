//! Avatar field capability interface
//!
//! The snapshot codec never sees a concrete avatar type. It reads and
//! writes through [`AvatarFields`], which every avatar variant (owned,
//! remote, relay-side) implements over its own storage and locking.

use std::time::Instant;

use glam::{Quat, Vec3};
use uuid::Uuid;

use avsync_core::{AvatarId, JointData, JointRef};

use crate::{AdditionalFlags, DataRates, HasFlags};

/// Axis-aligned bounds of the avatar in world space
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct BoundingBox {
    pub dimensions: Vec3,
    pub offset: Vec3,
}

/// Sensor (play area) to world transform
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SensorToWorld {
    pub scale: f32,
    pub rotation: Quat,
    pub translation: Vec3,
}

impl Default for SensorToWorld {
    fn default() -> Self {
        SensorToWorld {
            scale: 1.0,
            rotation: Quat::IDENTITY,
            translation: Vec3::ZERO,
        }
    }
}

/// What the avatar is attached to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParentInfo {
    /// Avatar or entity identity
    pub id: Uuid,
    pub joint: JointRef,
}

/// Position and rotation of a tracked or derived pose
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Vantage {
    pub position: Vec3,
    pub rotation: Quat,
}

impl Default for Vantage {
    fn default() -> Self {
        Vantage {
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
        }
    }
}

impl Vantage {
    pub fn new(position: Vec3, rotation: Quat) -> Self {
        Vantage { position, rotation }
    }
}

/// Hand controller poses in avatar space; `None` when not tracked
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct HandControllers {
    pub left: Option<Vantage>,
    pub right: Option<Vantage>,
}

impl HandControllers {
    pub fn any_valid(&self) -> bool {
        self.left.is_some() || self.right.is_some()
    }
}

/// Far-grab poses; `None` when the grab is inactive
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FarGrabJoints {
    pub left: Option<Vantage>,
    pub right: Option<Vantage>,
    pub mouse: Option<Vantage>,
}

impl FarGrabJoints {
    pub fn any_valid(&self) -> bool {
        self.left.is_some() || self.right.is_some() || self.mouse.is_some()
    }
}

/// Face tracker summary and blendshape coefficients
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FaceTracker {
    pub left_eye_blink: f32,
    pub right_eye_blink: f32,
    pub average_loudness: f32,
    pub brow_audio_lift: f32,
    pub blendshapes: Vec<f32>,
}

/// Read/write access to one avatar's snapshot fields.
///
/// Setters take `&self`: implementors own their synchronization, so the
/// network thread can decode while the simulation thread reads.
pub trait AvatarFields: Send + Sync {
    fn session_id(&self) -> AvatarId;

    fn global_position(&self) -> Vec3;
    fn set_global_position(&self, position: Vec3);

    fn bounding_box(&self) -> BoundingBox;
    fn set_bounding_box(&self, bounds: BoundingBox);

    fn orientation(&self) -> Quat;
    fn set_orientation(&self, orientation: Quat);

    fn scale(&self) -> f32;
    fn set_scale(&self, scale: f32);

    fn look_at_position(&self) -> Vec3;
    fn set_look_at_position(&self, position: Vec3);

    fn audio_loudness(&self) -> f32;
    fn set_audio_loudness(&self, loudness: f32);

    fn sensor_to_world(&self) -> SensorToWorld;
    fn set_sensor_to_world(&self, transform: SensorToWorld);

    fn additional_flags(&self) -> AdditionalFlags;
    fn set_additional_flags(&self, flags: AdditionalFlags);

    fn parent(&self) -> Option<ParentInfo>;
    fn set_parent(&self, parent: Option<ParentInfo>);

    fn local_position(&self) -> Vec3;
    fn set_local_position(&self, position: Vec3);

    fn hand_controllers(&self) -> HandControllers;
    fn set_hand_controllers(&self, controllers: HandControllers);

    fn face_tracker(&self) -> FaceTracker;
    fn set_face_tracker(&self, face: FaceTracker);

    /// Scripted or input-driven blendshapes are active
    fn has_blendshape_input(&self) -> bool;

    fn far_grab_joints(&self) -> FarGrabJoints;
    fn set_far_grab_joints(&self, joints: FarGrabJoints);

    /// Copy of the current joints, taken under the joint read lock
    fn joint_data(&self) -> Vec<JointData>;

    /// Mutate the joints under the joint write lock
    fn update_joints(&self, update: &mut dyn FnMut(&mut Vec<JointData>));

    /// Copy of the joints as last sent to the relay
    fn last_sent_joint_data(&self) -> Vec<JointData>;

    /// Reconcile the last-sent joints against the current ones under a
    /// single joint lock
    fn update_last_sent_joints(&self, update: &mut dyn FnMut(&[JointData], &mut Vec<JointData>));

    /// Sections whose value changed after `since` (every section when `None`)
    fn changed_since(&self, since: Option<Instant>) -> HasFlags;

    /// Inbound per-section rate counters, if tracked
    fn inbound_rates(&self) -> Option<&DataRates> {
        None
    }

    /// Corruption diagnostics gate; implementors rate limit per avatar
    fn should_log_error(&self, _now: Instant) -> bool {
        true
    }
}
