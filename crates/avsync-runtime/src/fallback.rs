//! Relay-side encode with size fallback
//!
//! The relay encodes each avatar unbudgeted for a listener and checks the
//! result against the space left in the bulk packet. Oversized snapshots
//! are retried without face tracking, then at [`AvatarDataDetail::MinimumData`];
//! if that still does not fit the avatar is skipped for this listener.

use std::time::Instant;

use glam::Vec3;
use tracing::warn;

use avsync_core::{AvatarDataDetail, JointData};
use avsync_wire::{encode, wanted_flags, AvatarFields, EncodeParams, EncodedSnapshot, SendStatus};

/// What the relay knows about one (avatar, listener) pair
#[derive(Clone, Copy, Debug)]
pub struct ListenerView<'a> {
    pub detail: AvatarDataDetail,
    /// When this listener was last sent the avatar; `None` sends everything
    pub last_sent_time: Option<Instant>,
    pub last_sent_joints: &'a [JointData],
    /// Listener position, for distance-scaled culling
    pub viewer_position: Option<Vec3>,
}

/// A snapshot that fit, with the detail actually used
#[derive(Clone, Debug)]
pub struct FittedSnapshot {
    pub snapshot: EncodedSnapshot,
    pub detail: AvatarDataDetail,
    pub dropped_face_tracking: bool,
}

fn attempt(
    avatar: &dyn AvatarFields,
    view: &ListenerView<'_>,
    detail: AvatarDataDetail,
    drop_face_tracking: bool,
    status: &SendStatus,
) -> (EncodedSnapshot, SendStatus) {
    let mut status = *status;
    status.reset();
    let flags = wanted_flags(avatar, detail, view.last_sent_time, drop_face_tracking);
    let mut params = EncodeParams::new(detail, flags, view.last_sent_joints);
    if let Some(viewer) = view.viewer_position {
        params = params.with_viewer(viewer);
    }
    let snapshot = encode(avatar, &params, &mut status);
    (snapshot, status)
}

/// Encode `avatar` for one listener within `max_bytes`.
///
/// `status` is only advanced when a snapshot fits.
pub fn encode_with_fallback(
    avatar: &dyn AvatarFields,
    view: &ListenerView<'_>,
    max_bytes: usize,
    status: &mut SendStatus,
) -> Option<FittedSnapshot> {
    let attempts = [
        (view.detail, false),
        (view.detail, true),
        (AvatarDataDetail::MinimumData, true),
    ];

    let mut last_size = 0;
    for (detail, drop_face_tracking) in attempts {
        let (snapshot, next_status) = attempt(avatar, view, detail, drop_face_tracking, status);
        if snapshot.bytes.len() <= max_bytes {
            *status = next_status;
            return Some(FittedSnapshot {
                snapshot,
                detail,
                dropped_face_tracking: drop_face_tracking,
            });
        }
        last_size = snapshot.bytes.len();
    }

    warn!(
        avatar = %avatar.session_id(),
        size = last_size,
        max_bytes,
        "minimum avatar data still too large, skipping avatar"
    );
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use avsync_core::AvatarId;
    use avsync_wire::{AvatarState, FaceTracker, HasFlags, MAX_BLENDSHAPE_COEFFICIENTS};
    use glam::Quat;

    fn heavy_avatar() -> AvatarState {
        let avatar = AvatarState::new(AvatarId::random());
        avatar.set_joint_data(
            (0..60)
                .map(|i| JointData::posed(Quat::from_rotation_x(0.01 * i as f32 + 0.2), Vec3::new(0.02, 0.01 * i as f32, 0.0)))
                .collect(),
        );
        avatar.set_has_blendshape_input(true);
        avatar.set_face_tracker(FaceTracker {
            left_eye_blink: 0.5,
            blendshapes: vec![0.25; MAX_BLENDSHAPE_COEFFICIENTS],
            ..FaceTracker::default()
        });
        avatar
    }

    fn view(last_sent: &[JointData]) -> ListenerView<'_> {
        ListenerView {
            detail: AvatarDataDetail::SendAllData,
            last_sent_time: None,
            last_sent_joints: last_sent,
            viewer_position: None,
        }
    }

    fn sizes(avatar: &AvatarState) -> (usize, usize, usize) {
        let view = view(&[]);
        let status = SendStatus::with_uuid();
        let full = attempt(avatar, &view, view.detail, false, &status).0.bytes.len();
        let no_face = attempt(avatar, &view, view.detail, true, &status).0.bytes.len();
        let minimum = attempt(avatar, &view, AvatarDataDetail::MinimumData, true, &status)
            .0
            .bytes
            .len();
        (full, no_face, minimum)
    }

    #[test]
    fn test_fits_first_time() {
        let avatar = heavy_avatar();
        let (full, _, _) = sizes(&avatar);
        let mut status = SendStatus::with_uuid();
        let fitted = encode_with_fallback(&avatar, &view(&[]), full, &mut status).unwrap();
        assert_eq!(fitted.detail, AvatarDataDetail::SendAllData);
        assert!(!fitted.dropped_face_tracking);
        assert!(fitted.snapshot.included.has(HasFlags::FACE_TRACKER_INFO));
    }

    #[test]
    fn test_drops_face_tracking_then_joints() {
        let avatar = heavy_avatar();
        let (full, no_face, minimum) = sizes(&avatar);
        assert!(full > no_face && no_face > minimum);

        let mut status = SendStatus::with_uuid();
        let fitted = encode_with_fallback(&avatar, &view(&[]), full - 1, &mut status).unwrap();
        assert!(fitted.dropped_face_tracking);
        assert_eq!(fitted.detail, AvatarDataDetail::SendAllData);
        assert!(!fitted.snapshot.included.has(HasFlags::FACE_TRACKER_INFO));
        assert!(fitted.snapshot.included.has(HasFlags::JOINT_DATA));

        let fitted = encode_with_fallback(&avatar, &view(&[]), no_face - 1, &mut status).unwrap();
        assert_eq!(fitted.detail, AvatarDataDetail::MinimumData);
        assert!(!fitted.snapshot.included.has(HasFlags::JOINT_DATA));
        assert_eq!(fitted.snapshot.bytes.len(), minimum);
    }

    #[test]
    fn test_skips_when_nothing_fits() {
        let avatar = heavy_avatar();
        let (_, _, minimum) = sizes(&avatar);
        let mut status = SendStatus::with_uuid();
        status.rotations_sent = 7;
        assert!(encode_with_fallback(&avatar, &view(&[]), minimum - 1, &mut status).is_none());
        // Status untouched on skip
        assert_eq!(status.rotations_sent, 7);
        assert!(status.send_uuid);
    }
}
