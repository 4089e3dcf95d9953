//! Snapshot section layout
//!
//! Sizes are part of the wire contract and never change. Sections appear
//! in [`HasFlags`](crate::HasFlags) bit order:
//!
//! | Section               | Bytes | Layout                                   |
//! |-----------------------|-------|------------------------------------------|
//! | flags                 | 2     | u16                                      |
//! | global position       | 12    | 3 x f32                                  |
//! | bounding box          | 24    | dimensions 3 x f32, offset 3 x f32       |
//! | orientation           | 6     | six-byte quat                            |
//! | scale                 | 2     | ratio                                    |
//! | look-at position      | 12    | 3 x f32                                  |
//! | audio loudness        | 1     | gain byte of loudness / 1024             |
//! | sensor-to-world       | 20    | quat, i16 scale (radix 10), 3 x f32      |
//! | additional flags      | 2     | u16                                      |
//! | parent info           | 18    | 16B uuid, u16 joint index                |
//! | local position        | 12    | 3 x f32                                  |
//! | hand controllers      | 24    | (quat, fixed vec3 radix 12) x 2          |
//! | face tracker          | 17+4n | 4 x f32, u8 n, n x f32                   |
//! | joint data            | var   | see `encode`                             |
//! | far-grab joints       | 84    | (3 x f32, 4 x f32 wxyz) x 3, in joints   |
//! | default pose flags    | var   | u8 n, two bit vectors                    |

use avsync_core::NUM_BYTES_UUID;

use crate::bit_vector_size;

pub const HEADER_SIZE: usize = 2;
pub const AVATAR_GLOBAL_POSITION_SIZE: usize = 12;
pub const AVATAR_BOUNDING_BOX_SIZE: usize = 24;
pub const AVATAR_ORIENTATION_SIZE: usize = 6;
pub const AVATAR_SCALE_SIZE: usize = 2;
pub const LOOK_AT_POSITION_SIZE: usize = 12;
pub const AUDIO_LOUDNESS_SIZE: usize = 1;
pub const SENSOR_TO_WORLD_SIZE: usize = 20;
pub const ADDITIONAL_FLAGS_SIZE: usize = 2;
pub const PARENT_INFO_SIZE: usize = 18;
pub const AVATAR_LOCAL_POSITION_SIZE: usize = 12;
pub const HAND_CONTROLLERS_SIZE: usize = 24;
pub const FACE_TRACKER_INFO_SIZE: usize = 17;
pub const FAR_GRAB_JOINTS_SIZE: usize = 84;

/// Every fixed-size section plus the flags word
pub const MAX_CONSTANT_HEADER_SIZE: usize = HEADER_SIZE
    + AVATAR_GLOBAL_POSITION_SIZE
    + AVATAR_BOUNDING_BOX_SIZE
    + AVATAR_ORIENTATION_SIZE
    + AVATAR_SCALE_SIZE
    + LOOK_AT_POSITION_SIZE
    + AUDIO_LOUDNESS_SIZE
    + SENSOR_TO_WORLD_SIZE
    + ADDITIONAL_FLAGS_SIZE
    + PARENT_INFO_SIZE
    + AVATAR_LOCAL_POSITION_SIZE
    + HAND_CONTROLLERS_SIZE;

/// Smallest budget that fits an identified flags-only snapshot
pub const MIN_BULK_PACKET_SIZE: usize = NUM_BYTES_UUID + HEADER_SIZE;

/// The joint count travels in a single byte
pub const MAX_JOINT_COUNT: usize = u8::MAX as usize;

/// Loudness is divided by this before gain packing
pub const AUDIO_LOUDNESS_SCALE: f32 = 1024.0;

/// Semantic ceiling for audio loudness
pub const MAX_AUDIO_LOUDNESS: f32 = 1000.0;

/// Domain limits applied to the uniform avatar scale
pub const MIN_AVATAR_SCALE: f32 = 0.005;
pub const MAX_AVATAR_SCALE: f32 = 1000.0;

/// Blendshape coefficients a receiver keeps
pub const MAX_BLENDSHAPE_COEFFICIENTS: usize = 52;

/// Worst-case face tracker section for `num_coefficients` blendshapes
pub fn max_face_tracker_info_size(num_coefficients: usize) -> usize {
    FACE_TRACKER_INFO_SIZE + num_coefficients * 4
}

/// Worst-case joint section: count, two bit vectors, scale, every joint
pub fn max_joint_data_size(num_joints: usize) -> usize {
    let validity = bit_vector_size(num_joints);
    1 + validity + num_joints * 6 + validity + 4 + num_joints * 6
}

/// Joint section with no rotations and no translations
pub fn min_joint_data_size(num_joints: usize) -> usize {
    let validity = bit_vector_size(num_joints);
    1 + validity + validity + 4
}

pub fn max_joint_default_pose_flags_size(num_joints: usize) -> usize {
    1 + 2 * bit_vector_size(num_joints)
}

// ----------------------------------------------------------------------------
// Cull thresholds
// ----------------------------------------------------------------------------

/// Rotations closer than this dot product are considered unchanged
pub const AVATAR_MIN_ROTATION_DOT: f32 = 0.999_999_9;

/// Translations closer than this distance (meters) are considered unchanged
pub const AVATAR_MIN_TRANSLATION: f32 = 0.0001;

/// cos(angle / 2) for the coarser rotation steps
pub const ROTATION_CHANGE_2D: f32 = 0.999_847_7;
pub const ROTATION_CHANGE_4D: f32 = 0.999_390_83;
pub const ROTATION_CHANGE_6D: f32 = 0.998_629_53;
pub const ROTATION_CHANGE_15D: f32 = 0.991_444_86;
pub const ROTATION_CHANGE_179D: f32 = 0.008_726_53;

/// Viewer distance steps (meters)
pub const AVATAR_DISTANCE_LEVEL_1: f32 = 12.5;
pub const AVATAR_DISTANCE_LEVEL_2: f32 = 16.6;
pub const AVATAR_DISTANCE_LEVEL_3: f32 = 25.0;
pub const AVATAR_DISTANCE_LEVEL_4: f32 = 50.0;
pub const AVATAR_DISTANCE_LEVEL_5: f32 = 200.0;

/// Rotation dot threshold for a viewer at `distance` meters
pub fn distance_based_min_rotation_dot(distance: f32) -> f32 {
    if distance < AVATAR_DISTANCE_LEVEL_1 {
        AVATAR_MIN_ROTATION_DOT
    } else if distance < AVATAR_DISTANCE_LEVEL_2 {
        ROTATION_CHANGE_2D
    } else if distance < AVATAR_DISTANCE_LEVEL_3 {
        ROTATION_CHANGE_4D
    } else if distance < AVATAR_DISTANCE_LEVEL_4 {
        ROTATION_CHANGE_6D
    } else if distance < AVATAR_DISTANCE_LEVEL_5 {
        ROTATION_CHANGE_15D
    } else {
        ROTATION_CHANGE_179D
    }
}

/// Translation threshold for a viewer at `distance` meters.
/// Not distance sensitive yet.
pub fn distance_based_min_translation(_distance: f32) -> f32 {
    AVATAR_MIN_TRANSLATION
}
