//! A small state machine tracking the two-phase joint-consensus protocol used to change cluster
//! membership, independent of the leader loop's own bookkeeping in [`crate::core::admin`].
//!
//! The protocol moves through:
//!
//! ```text
//! Idle --(begin)--> Phase1Waiting --(joint entry committed)--> Phase2Waiting --(final entry committed)--> Idle
//! ```
//!
//! A leadership change at any point during phase 1 or phase 2 rolls the tracker back to `Idle`;
//! the caller is responsible for re-appending whatever compensating entries the storage layer
//! requires, this tracker only records where in the protocol the cluster was.

use std::collections::BTreeSet;

use crate::NodeId;

/// Where a configuration change currently stands.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncState {
    /// No configuration change is underway.
    Idle,

    /// The joint-consensus entry has been appended (and adopted locally, even though uncommitted)
    /// and we are waiting for it to commit.
    Phase1Waiting { members_old: BTreeSet<NodeId>, members_new: BTreeSet<NodeId> },

    /// The joint-consensus entry has committed, the final (uniform) entry has been appended and
    /// adopted, and we are waiting for it to commit.
    Phase2Waiting { members_new: BTreeSet<NodeId> },
}

/// Errors produced while driving a configuration change.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConfigSyncError {
    #[error("a configuration change is already in progress")]
    ChangeInProgress,

    #[error("the requested membership is empty")]
    EmptyMembers,

    #[error("no change is required: requested membership matches the current one")]
    Noop,

    #[error("received an unexpected commit while in state {0:?}")]
    UnexpectedCommit(SyncState),

    /// The in-flight change was explicitly rolled back, e.g. because leadership was lost before
    /// either phase committed.
    #[error("configuration change rolled back: {0}")]
    RolledBack(String),
}

/// Drives one membership change through the joint-consensus protocol.
#[derive(Clone, Debug)]
pub struct ConfigSynchronizer {
    state: SyncState,
}

impl Default for ConfigSynchronizer {
    fn default() -> Self {
        Self { state: SyncState::Idle }
    }
}

impl ConfigSynchronizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &SyncState {
        &self.state
    }

    pub fn change_in_progress(&self) -> bool {
        !matches!(self.state, SyncState::Idle)
    }

    /// Validate and begin a change to `members_new`, given the currently active `members_old`.
    /// Returns the joint membership set the caller should append as a log entry.
    pub fn begin(
        &mut self,
        members_old: BTreeSet<NodeId>,
        members_new: BTreeSet<NodeId>,
    ) -> Result<BTreeSet<NodeId>, ConfigSyncError> {
        if self.change_in_progress() {
            return Err(ConfigSyncError::ChangeInProgress);
        }
        if members_new.is_empty() {
            return Err(ConfigSyncError::EmptyMembers);
        }
        if members_new == members_old {
            return Err(ConfigSyncError::Noop);
        }

        let joint: BTreeSet<NodeId> = members_old.union(&members_new).copied().collect();
        self.state = SyncState::Phase1Waiting { members_old, members_new };
        Ok(joint)
    }

    /// Notify the tracker that the joint-consensus entry has committed. Returns the uniform
    /// membership set the caller should now append as the final log entry.
    pub fn joint_committed(&mut self) -> Result<BTreeSet<NodeId>, ConfigSyncError> {
        match std::mem::replace(&mut self.state, SyncState::Idle) {
            SyncState::Phase1Waiting { members_new, .. } => {
                self.state = SyncState::Phase2Waiting { members_new: members_new.clone() };
                Ok(members_new)
            }
            other => {
                self.state = other.clone();
                Err(ConfigSyncError::UnexpectedCommit(other))
            }
        }
    }

    /// Notify the tracker that the final (uniform) entry has committed, completing the protocol.
    pub fn final_committed(&mut self) -> Result<(), ConfigSyncError> {
        match std::mem::replace(&mut self.state, SyncState::Idle) {
            SyncState::Phase2Waiting { .. } => Ok(()),
            other => {
                self.state = other.clone();
                Err(ConfigSyncError::UnexpectedCommit(other))
            }
        }
    }

    /// Roll back to `Idle` without completing the protocol, e.g. because this node lost
    /// leadership before the change could commit.
    pub fn cancel(&mut self) {
        self.state = SyncState::Idle;
    }

    /// Like [`Self::cancel`], but returns a [`ConfigSyncError::RolledBack`] carrying `reason` for
    /// the caller to propagate to whatever proposed the change.
    pub fn rollback(&mut self, reason: impl Into<String>) -> ConfigSyncError {
        self.state = SyncState::Idle;
        ConfigSyncError::RolledBack(reason.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ids: &[NodeId]) -> BTreeSet<NodeId> {
        ids.iter().copied().collect()
    }

    #[test]
    fn full_happy_path() {
        let mut sync = ConfigSynchronizer::new();
        let joint = sync.begin(set(&[1, 2, 3]), set(&[1, 2, 3, 4])).unwrap();
        assert_eq!(joint, set(&[1, 2, 3, 4]));
        assert!(sync.change_in_progress());

        let uniform = sync.joint_committed().unwrap();
        assert_eq!(uniform, set(&[1, 2, 3, 4]));
        assert!(matches!(sync.state(), SyncState::Phase2Waiting { .. }));

        sync.final_committed().unwrap();
        assert!(!sync.change_in_progress());
    }

    #[test]
    fn rejects_concurrent_change() {
        let mut sync = ConfigSynchronizer::new();
        sync.begin(set(&[1, 2, 3]), set(&[1, 2, 3, 4])).unwrap();
        let err = sync.begin(set(&[1, 2, 3]), set(&[1, 2])).unwrap_err();
        assert_eq!(err, ConfigSyncError::ChangeInProgress);
    }

    #[test]
    fn rejects_noop_and_empty() {
        let mut sync = ConfigSynchronizer::new();
        assert_eq!(sync.begin(set(&[1, 2, 3]), set(&[])).unwrap_err(), ConfigSyncError::EmptyMembers);
        assert_eq!(sync.begin(set(&[1, 2, 3]), set(&[1, 2, 3])).unwrap_err(), ConfigSyncError::Noop);
    }

    #[test]
    fn cancel_resets_to_idle_from_either_phase() {
        let mut sync = ConfigSynchronizer::new();
        sync.begin(set(&[1, 2, 3]), set(&[1, 2, 3, 4])).unwrap();
        sync.cancel();
        assert_eq!(*sync.state(), SyncState::Idle);

        sync.begin(set(&[1, 2, 3]), set(&[1, 2, 3, 4])).unwrap();
        sync.joint_committed().unwrap();
        sync.cancel();
        assert_eq!(*sync.state(), SyncState::Idle);
    }

    #[test]
    fn rollback_carries_reason_and_resets_to_idle() {
        let mut sync = ConfigSynchronizer::new();
        sync.begin(set(&[1, 2, 3]), set(&[1, 2, 3, 4])).unwrap();
        let err = sync.rollback("leadership lost");
        assert_eq!(err, ConfigSyncError::RolledBack("leadership lost".to_string()));
        assert_eq!(*sync.state(), SyncState::Idle);
    }
}
