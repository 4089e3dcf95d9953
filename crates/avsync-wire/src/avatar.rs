//! Lock-guarded avatar state
//!
//! [`AvatarState`] is the stock [`AvatarFields`] implementation used for
//! both the local avatar and remote avatars. Scalar fields share one
//! lock; joints (current and last sent) share another so encode and
//! render readers proceed concurrently while decode writes.

use std::time::{Duration, Instant};

use glam::{Quat, Vec3};
use parking_lot::{Mutex, RwLock};

use avsync_core::{AvatarId, JointData};

use crate::{
    AdditionalFlags, AvatarFields, BoundingBox, DataRates, FaceTracker, FarGrabJoints,
    HandControllers, HasFlags, ParentInfo, RateDirection, SensorToWorld, MAX_AVATAR_SCALE,
    MIN_AVATAR_SCALE,
};

/// Minimum time between two corruption warnings for one avatar
pub const DEFAULT_ERROR_LOG_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
struct Fields {
    global_position: Vec3,
    bounding_box: BoundingBox,
    orientation: Quat,
    scale: f32,
    look_at_position: Vec3,
    audio_loudness: f32,
    sensor_to_world: SensorToWorld,
    additional_flags: AdditionalFlags,
    parent: Option<ParentInfo>,
    local_position: Vec3,
    hand_controllers: HandControllers,
    face_tracker: FaceTracker,
    has_blendshape_input: bool,
    far_grab_joints: FarGrabJoints,
}

impl Default for Fields {
    fn default() -> Self {
        Fields {
            global_position: Vec3::ZERO,
            bounding_box: BoundingBox::default(),
            orientation: Quat::IDENTITY,
            scale: 1.0,
            look_at_position: Vec3::ZERO,
            audio_loudness: 0.0,
            sensor_to_world: SensorToWorld::default(),
            additional_flags: AdditionalFlags::default(),
            parent: None,
            local_position: Vec3::ZERO,
            hand_controllers: HandControllers::default(),
            face_tracker: FaceTracker::default(),
            has_blendshape_input: false,
            far_grab_joints: FarGrabJoints::default(),
        }
    }
}

#[derive(Clone, Debug, Default)]
struct Joints {
    current: Vec<JointData>,
    last_sent: Vec<JointData>,
}

/// Last change instant per section bit
#[derive(Debug, Default)]
struct ChangeTimes([Option<Instant>; 16]);

impl ChangeTimes {
    fn touch(&mut self, bit: u16, now: Instant) {
        self.0[bit.trailing_zeros() as usize] = Some(now);
    }

    fn since(&self, since: Instant) -> HasFlags {
        let mut flags = HasFlags::NONE;
        for (i, changed) in self.0.iter().enumerate() {
            if matches!(changed, Some(at) if *at > since) {
                flags.set(1 << i, true);
            }
        }
        flags
    }
}

/// Avatar state shared between the simulation and network threads
#[derive(Debug)]
pub struct AvatarState {
    session_id: RwLock<AvatarId>,
    fields: RwLock<Fields>,
    joints: RwLock<Joints>,
    changes: Mutex<ChangeTimes>,
    inbound_rates: DataRates,
    last_error_log: Mutex<Option<Instant>>,
    error_log_interval: Duration,
}

impl AvatarState {
    pub fn new(session_id: AvatarId) -> Self {
        AvatarState {
            session_id: RwLock::new(session_id),
            fields: RwLock::new(Fields::default()),
            joints: RwLock::new(Joints::default()),
            changes: Mutex::new(ChangeTimes::default()),
            inbound_rates: DataRates::new(RateDirection::Inbound),
            last_error_log: Mutex::new(None),
            error_log_interval: DEFAULT_ERROR_LOG_INTERVAL,
        }
    }

    pub fn with_error_log_interval(mut self, interval: Duration) -> Self {
        self.error_log_interval = interval;
        self
    }

    pub fn set_session_id(&self, id: AvatarId) {
        *self.session_id.write() = id;
    }

    pub fn set_has_blendshape_input(&self, value: bool) {
        self.fields.write().has_blendshape_input = value;
    }

    /// Replace every joint
    pub fn set_joint_data(&self, joints: Vec<JointData>) {
        self.joints.write().current = joints;
    }

    pub fn set_joint(&self, index: usize, joint: JointData) {
        let mut joints = self.joints.write();
        if index >= joints.current.len() {
            joints.current.resize(index + 1, JointData::default());
        }
        joints.current[index] = joint;
    }

    pub fn joint_count(&self) -> usize {
        self.joints.read().current.len()
    }

    /// Reset every joint to its default pose
    pub fn clear_joint_data(&self) {
        for joint in self.joints.write().current.iter_mut() {
            *joint = JointData::default();
        }
    }

    /// Record a change now, for sections without a setter of their own
    pub fn mark_changed(&self, bit: u16) {
        self.changes.lock().touch(bit, Instant::now());
    }

    fn update<T: PartialEq>(&self, bit: u16, value: T, field: impl FnOnce(&mut Fields) -> &mut T) {
        let changed = {
            let mut fields = self.fields.write();
            let slot = field(&mut fields);
            if *slot != value {
                *slot = value;
                true
            } else {
                false
            }
        };
        if changed {
            self.mark_changed(bit);
        }
    }
}

impl AvatarFields for AvatarState {
    fn session_id(&self) -> AvatarId {
        *self.session_id.read()
    }

    fn global_position(&self) -> Vec3 {
        self.fields.read().global_position
    }

    fn set_global_position(&self, position: Vec3) {
        self.update(HasFlags::GLOBAL_POSITION, position, |f| &mut f.global_position);
    }

    fn bounding_box(&self) -> BoundingBox {
        self.fields.read().bounding_box
    }

    fn set_bounding_box(&self, bounds: BoundingBox) {
        self.update(HasFlags::BOUNDING_BOX, bounds, |f| &mut f.bounding_box);
    }

    fn orientation(&self) -> Quat {
        self.fields.read().orientation
    }

    fn set_orientation(&self, orientation: Quat) {
        self.update(HasFlags::ORIENTATION, orientation, |f| &mut f.orientation);
    }

    fn scale(&self) -> f32 {
        self.fields.read().scale
    }

    fn set_scale(&self, scale: f32) {
        let scale = scale.clamp(MIN_AVATAR_SCALE, MAX_AVATAR_SCALE);
        self.update(HasFlags::SCALE, scale, |f| &mut f.scale);
    }

    fn look_at_position(&self) -> Vec3 {
        self.fields.read().look_at_position
    }

    fn set_look_at_position(&self, position: Vec3) {
        self.update(HasFlags::LOOK_AT_POSITION, position, |f| &mut f.look_at_position);
    }

    fn audio_loudness(&self) -> f32 {
        self.fields.read().audio_loudness
    }

    fn set_audio_loudness(&self, loudness: f32) {
        self.update(HasFlags::AUDIO_LOUDNESS, loudness, |f| &mut f.audio_loudness);
    }

    fn sensor_to_world(&self) -> SensorToWorld {
        self.fields.read().sensor_to_world
    }

    fn set_sensor_to_world(&self, transform: SensorToWorld) {
        self.update(HasFlags::SENSOR_TO_WORLD_MATRIX, transform, |f| &mut f.sensor_to_world);
    }

    fn additional_flags(&self) -> AdditionalFlags {
        self.fields.read().additional_flags
    }

    fn set_additional_flags(&self, flags: AdditionalFlags) {
        self.update(HasFlags::ADDITIONAL_FLAGS, flags, |f| &mut f.additional_flags);
    }

    fn parent(&self) -> Option<ParentInfo> {
        self.fields.read().parent
    }

    fn set_parent(&self, parent: Option<ParentInfo>) {
        self.update(HasFlags::PARENT_INFO, parent, |f| &mut f.parent);
    }

    fn local_position(&self) -> Vec3 {
        self.fields.read().local_position
    }

    fn set_local_position(&self, position: Vec3) {
        self.update(HasFlags::LOCAL_POSITION, position, |f| &mut f.local_position);
    }

    fn hand_controllers(&self) -> HandControllers {
        self.fields.read().hand_controllers
    }

    fn set_hand_controllers(&self, controllers: HandControllers) {
        self.update(HasFlags::HAND_CONTROLLERS, controllers, |f| &mut f.hand_controllers);
    }

    fn face_tracker(&self) -> FaceTracker {
        self.fields.read().face_tracker.clone()
    }

    fn set_face_tracker(&self, face: FaceTracker) {
        self.update(HasFlags::FACE_TRACKER_INFO, face, |f| &mut f.face_tracker);
    }

    fn has_blendshape_input(&self) -> bool {
        self.fields.read().has_blendshape_input
    }

    fn far_grab_joints(&self) -> FarGrabJoints {
        self.fields.read().far_grab_joints
    }

    fn set_far_grab_joints(&self, joints: FarGrabJoints) {
        self.update(HasFlags::GRAB_JOINTS, joints, |f| &mut f.far_grab_joints);
    }

    fn joint_data(&self) -> Vec<JointData> {
        self.joints.read().current.clone()
    }

    fn update_joints(&self, update: &mut dyn FnMut(&mut Vec<JointData>)) {
        update(&mut self.joints.write().current);
    }

    fn last_sent_joint_data(&self) -> Vec<JointData> {
        self.joints.read().last_sent.clone()
    }

    fn update_last_sent_joints(&self, update: &mut dyn FnMut(&[JointData], &mut Vec<JointData>)) {
        let mut joints = self.joints.write();
        let Joints { current, last_sent } = &mut *joints;
        update(current, last_sent);
    }

    fn changed_since(&self, since: Option<Instant>) -> HasFlags {
        match since {
            Some(since) => self.changes.lock().since(since),
            None => HasFlags::ALL,
        }
    }

    fn inbound_rates(&self) -> Option<&DataRates> {
        Some(&self.inbound_rates)
    }

    fn should_log_error(&self, now: Instant) -> bool {
        let mut last = self.last_error_log.lock();
        match *last {
            Some(at) if now.saturating_duration_since(at) < self.error_log_interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_changed_since_tracks_real_changes() {
        let avatar = AvatarState::new(AvatarId::random());
        let before = Instant::now();
        std::thread::sleep(Duration::from_millis(2));

        avatar.set_orientation(Quat::IDENTITY);
        assert!(avatar.changed_since(Some(before)).is_empty());

        avatar.set_orientation(Quat::from_rotation_y(0.5));
        avatar.set_look_at_position(Vec3::X);
        let changed = avatar.changed_since(Some(before));
        assert!(changed.has(HasFlags::ORIENTATION));
        assert!(changed.has(HasFlags::LOOK_AT_POSITION));
        assert!(!changed.has(HasFlags::SCALE));

        assert_eq!(avatar.changed_since(None), HasFlags::ALL);
    }

    #[test]
    fn test_scale_is_clamped() {
        let avatar = AvatarState::new(AvatarId::random());
        avatar.set_scale(5000.0);
        assert_eq!(avatar.scale(), MAX_AVATAR_SCALE);
        avatar.set_scale(0.0);
        assert_eq!(avatar.scale(), MIN_AVATAR_SCALE);
    }

    #[test]
    fn test_error_log_rate_limit() {
        let avatar = AvatarState::new(AvatarId::random()).with_error_log_interval(Duration::from_secs(5));
        let now = Instant::now();
        assert!(avatar.should_log_error(now));
        assert!(!avatar.should_log_error(now + Duration::from_secs(1)));
        assert!(avatar.should_log_error(now + Duration::from_secs(6)));
    }

    #[test]
    fn test_set_joint_grows() {
        let avatar = AvatarState::new(AvatarId::random());
        avatar.set_joint(3, JointData::posed(Quat::from_rotation_x(1.0), Vec3::Y));
        assert_eq!(avatar.joint_count(), 4);
        assert!(avatar.joint_data()[0].rotation_is_default_pose);
        assert!(!avatar.joint_data()[3].rotation_is_default_pose);

        avatar.clear_joint_data();
        assert!(avatar.joint_data()[3].rotation_is_default_pose);
    }
}
