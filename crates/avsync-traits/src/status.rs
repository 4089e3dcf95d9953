//! Trait dirty statuses

use crate::TraitTable;

/// Dirty state of one trait or trait instance
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum TraitStatus {
    #[default]
    Unchanged,
    Updated,
    Deleted,
}

/// Statuses keyed by trait type and instance
pub type TraitStatusTable = TraitTable<TraitStatus>;

impl TraitStatusTable {
    pub fn unchanged() -> Self {
        TraitTable::new(TraitStatus::Unchanged)
    }

    /// Hand the current statuses to the caller and start a clean table
    pub fn take(&mut self) -> Self {
        std::mem::replace(self, TraitStatusTable::unchanged())
    }
}
