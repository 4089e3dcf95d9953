//! Continuation cursor for partially sent snapshots

use crate::HasFlags;

/// Per-(avatar, recipient) send state.
///
/// An all-zero status is a fresh send: the encoder derives wanted flags
/// from the caller. A non-zero `item_flags` means a previous encode ran
/// out of space and the next encode must resume with exactly those flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SendStatus {
    /// Sections still owed to the recipient
    pub item_flags: HasFlags,
    /// Prefix the snapshot with the avatar's session id
    pub send_uuid: bool,
    /// Next joint whose rotation has not been considered
    pub rotations_sent: usize,
    /// Next joint whose translation has not been considered
    pub translations_sent: usize,
}

impl SendStatus {
    /// Status for a relay stream, where every snapshot carries its id
    pub fn with_uuid() -> Self {
        SendStatus {
            send_uuid: true,
            ..SendStatus::default()
        }
    }

    /// A previous encode left sections unsent
    #[inline]
    pub fn is_continuing(&self) -> bool {
        !self.item_flags.is_empty()
    }

    /// Every joint of a `num_joints` skeleton has been considered
    #[inline]
    pub fn joints_complete(&self, num_joints: usize) -> bool {
        self.rotations_sent >= num_joints && self.translations_sent >= num_joints
    }

    /// Status used to reconcile after a complete, unbudgeted send
    pub fn complete(num_joints: usize) -> Self {
        SendStatus {
            item_flags: HasFlags::NONE,
            send_uuid: false,
            rotations_sent: num_joints,
            translations_sent: num_joints,
        }
    }

    /// Forget any partial send; the next encode starts fresh
    pub fn reset(&mut self) {
        self.item_flags = HasFlags::NONE;
        self.rotations_sent = 0;
        self.translations_sent = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_status() {
        let status = SendStatus::default();
        assert!(!status.is_continuing());
        assert!(!status.send_uuid);
        assert!(status.joints_complete(0));
        assert!(!status.joints_complete(1));
    }

    #[test]
    fn test_reset_keeps_uuid_choice() {
        let mut status = SendStatus::with_uuid();
        status.item_flags = HasFlags(HasFlags::JOINT_DATA);
        status.rotations_sent = 10;
        assert!(status.is_continuing());
        status.reset();
        assert!(!status.is_continuing());
        assert!(status.send_uuid);
        assert_eq!(status.rotations_sent, 0);
    }
}
