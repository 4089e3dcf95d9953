//! Snapshot detail levels

use serde::{Deserialize, Serialize};

/// How much of an avatar's state a snapshot should carry
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AvatarDataDetail {
    /// Flags-only keep-alive
    NoData,
    /// Position and audio loudness, for the people list
    PalMinimum,
    /// Everything but joint data
    MinimumData,
    /// Changed fields, joints culled by a distance threshold
    #[default]
    CullSmallData,
    /// Changed fields, every changed joint
    IncludeSmallData,
    /// Every field, every non-default joint
    SendAllData,
}

impl AvatarDataDetail {
    #[inline]
    pub fn culls_small_changes(self) -> bool {
        self == AvatarDataDetail::CullSmallData
    }

    #[inline]
    pub fn sends_all(self) -> bool {
        self == AvatarDataDetail::SendAllData
    }
}
