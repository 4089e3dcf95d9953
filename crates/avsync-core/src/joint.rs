//! Joint data and joint references
//!
//! Real skeleton joints are addressed by a 16-bit index. The top of the
//! index space is reserved for pseudo joints (sensor frame, controllers,
//! far-grab targets) that only exist as numbers at the wire boundary;
//! in memory they are a tagged [`JointRef`].

use glam::{Quat, Vec3};

/// Per-joint pose with default-pose tagging
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct JointData {
    pub rotation: Quat,
    pub translation: Vec3,
    /// Rotation equals the skeleton's authored rest value
    pub rotation_is_default_pose: bool,
    /// Translation equals the skeleton's authored rest value
    pub translation_is_default_pose: bool,
}

impl Default for JointData {
    fn default() -> Self {
        JointData {
            rotation: Quat::IDENTITY,
            translation: Vec3::ZERO,
            rotation_is_default_pose: true,
            translation_is_default_pose: true,
        }
    }
}

impl JointData {
    /// Joint with a non-default rotation and translation
    pub fn posed(rotation: Quat, translation: Vec3) -> Self {
        JointData {
            rotation,
            translation,
            rotation_is_default_pose: false,
            translation_is_default_pose: false,
        }
    }
}

// Legacy wire indices for pseudo joints
pub const NO_JOINT_INDEX: u16 = 65535;
pub const SENSOR_TO_WORLD_MATRIX_INDEX: u16 = 65534;
pub const CONTROLLER_RIGHTHAND_INDEX: u16 = 65533;
pub const CONTROLLER_LEFTHAND_INDEX: u16 = 65532;
pub const CAMERA_RELATIVE_CONTROLLER_RIGHTHAND_INDEX: u16 = 65531;
pub const CAMERA_RELATIVE_CONTROLLER_LEFTHAND_INDEX: u16 = 65530;
pub const CAMERA_MATRIX_INDEX: u16 = 65529;
pub const FARGRAB_RIGHTHAND_INDEX: u16 = 65528;
pub const FARGRAB_LEFTHAND_INDEX: u16 = 65527;
pub const FARGRAB_MOUSE_INDEX: u16 = 65526;

/// Lowest index reserved for pseudo joints
pub const LOWEST_PSEUDO_JOINT_INDEX: u16 = FARGRAB_MOUSE_INDEX;

/// Reference to a real or pseudo joint
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum JointRef {
    /// Skeleton joint; index is below [`LOWEST_PSEUDO_JOINT_INDEX`]
    Real(u16),
    #[default]
    NoJoint,
    SensorToWorld,
    ControllerRightHand,
    ControllerLeftHand,
    CameraRelativeControllerRightHand,
    CameraRelativeControllerLeftHand,
    Camera,
    FarGrabRightHand,
    FarGrabLeftHand,
    FarGrabMouse,
}

impl JointRef {
    /// Decode a wire joint index
    pub fn from_wire(index: u16) -> Self {
        match index {
            NO_JOINT_INDEX => JointRef::NoJoint,
            SENSOR_TO_WORLD_MATRIX_INDEX => JointRef::SensorToWorld,
            CONTROLLER_RIGHTHAND_INDEX => JointRef::ControllerRightHand,
            CONTROLLER_LEFTHAND_INDEX => JointRef::ControllerLeftHand,
            CAMERA_RELATIVE_CONTROLLER_RIGHTHAND_INDEX => JointRef::CameraRelativeControllerRightHand,
            CAMERA_RELATIVE_CONTROLLER_LEFTHAND_INDEX => JointRef::CameraRelativeControllerLeftHand,
            CAMERA_MATRIX_INDEX => JointRef::Camera,
            FARGRAB_RIGHTHAND_INDEX => JointRef::FarGrabRightHand,
            FARGRAB_LEFTHAND_INDEX => JointRef::FarGrabLeftHand,
            FARGRAB_MOUSE_INDEX => JointRef::FarGrabMouse,
            real => JointRef::Real(real),
        }
    }

    /// Encode as a wire joint index
    pub fn to_wire(self) -> u16 {
        match self {
            JointRef::Real(index) => index.min(LOWEST_PSEUDO_JOINT_INDEX - 1),
            JointRef::NoJoint => NO_JOINT_INDEX,
            JointRef::SensorToWorld => SENSOR_TO_WORLD_MATRIX_INDEX,
            JointRef::ControllerRightHand => CONTROLLER_RIGHTHAND_INDEX,
            JointRef::ControllerLeftHand => CONTROLLER_LEFTHAND_INDEX,
            JointRef::CameraRelativeControllerRightHand => CAMERA_RELATIVE_CONTROLLER_RIGHTHAND_INDEX,
            JointRef::CameraRelativeControllerLeftHand => CAMERA_RELATIVE_CONTROLLER_LEFTHAND_INDEX,
            JointRef::Camera => CAMERA_MATRIX_INDEX,
            JointRef::FarGrabRightHand => FARGRAB_RIGHTHAND_INDEX,
            JointRef::FarGrabLeftHand => FARGRAB_LEFTHAND_INDEX,
            JointRef::FarGrabMouse => FARGRAB_MOUSE_INDEX,
        }
    }

    #[inline]
    pub fn is_pseudo(self) -> bool {
        !matches!(self, JointRef::Real(_) | JointRef::NoJoint)
    }

    /// Scripting name of a pseudo joint
    pub fn pseudo_name(self) -> Option<&'static str> {
        match self {
            JointRef::SensorToWorld => Some("_SENSOR_TO_WORLD_MATRIX"),
            JointRef::ControllerRightHand => Some("_CONTROLLER_RIGHTHAND"),
            JointRef::ControllerLeftHand => Some("_CONTROLLER_LEFTHAND"),
            JointRef::CameraRelativeControllerRightHand => Some("_CAMERA_RELATIVE_CONTROLLER_RIGHTHAND"),
            JointRef::CameraRelativeControllerLeftHand => Some("_CAMERA_RELATIVE_CONTROLLER_LEFTHAND"),
            JointRef::Camera => Some("_CAMERA_MATRIX"),
            JointRef::FarGrabRightHand => Some("_FARGRAB_RIGHTHAND"),
            JointRef::FarGrabLeftHand => Some("_FARGRAB_LEFTHAND"),
            JointRef::FarGrabMouse => Some("_FARGRAB_MOUSE"),
            JointRef::Real(_) | JointRef::NoJoint => None,
        }
    }

    /// Resolve a pseudo joint from its scripting name
    pub fn from_pseudo_name(name: &str) -> Option<Self> {
        const ALL: [JointRef; 9] = [
            JointRef::SensorToWorld,
            JointRef::ControllerRightHand,
            JointRef::ControllerLeftHand,
            JointRef::CameraRelativeControllerRightHand,
            JointRef::CameraRelativeControllerLeftHand,
            JointRef::Camera,
            JointRef::FarGrabRightHand,
            JointRef::FarGrabLeftHand,
            JointRef::FarGrabMouse,
        ];
        ALL.into_iter().find(|joint| joint.pseudo_name() == Some(name))
    }
}
