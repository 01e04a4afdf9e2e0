//! The error types returned by the various interfaces of this crate.

use crate::raft_types::SnapshotSegmentId;
use crate::NodeId;

/// Convenience alias for a result whose error type is [`RaftError`].
pub type RaftResult<T> = std::result::Result<T, RaftError>;

/// Error variants which can arise while interacting with the Raft core via one of its internal
/// channels. These describe failures internal to the consensus protocol itself, as opposed to
/// failures specific to a client read, client write, or config change request.
#[derive(Debug, thiserror::Error)]
pub enum RaftError {
    /// An error which has come up from the storage layer.
    #[error("{0}")]
    RaftStorage(anyhow::Error),

    /// An error which has come up from the network layer.
    #[error("{0}")]
    RaftNetwork(anyhow::Error),

    /// An internal Raft error indicating that Raft is shutting down.
    #[error("Raft is shutting down")]
    ShuttingDown,

    /// The leader was sent an `InstallSnapshot` segment which does not match what was expected.
    #[error("expected snapshot chunk {expect}, got {got}")]
    SnapshotMismatch {
        expect: SnapshotSegmentId,
        got: SnapshotSegmentId,
    },

    /// A fatal error which has rendered this Raft node unusable; further interaction with it
    /// should not be attempted.
    #[error("fatal raft error: {0}")]
    Fatal(#[from] Fatal),
}

impl From<std::io::Error> for RaftError {
    fn from(err: std::io::Error) -> Self {
        RaftError::RaftStorage(err.into())
    }
}

/// A fatal error, typically arising from a storage subsystem failure, which is unrecoverable
/// from the perspective of the running node.
#[derive(Debug, thiserror::Error)]
pub enum Fatal {
    #[error("{0}")]
    StorageError(anyhow::Error),
}

/// Error variants which may come from the `client_write` API of a Raft node.
#[derive(Debug, thiserror::Error)]
pub enum ClientWriteError<D> {
    /// This node is not the cluster leader, and was unable to proxy the request to the leader.
    #[error("this node is not the Raft leader")]
    ForwardToLeader(D, Option<NodeId>),

    #[error(transparent)]
    RaftError(#[from] RaftError),
}

/// Error variants which may come from the `client_read` API of a Raft node.
#[derive(Debug, thiserror::Error)]
pub enum ClientReadError {
    /// This node is not the cluster leader, and was unable to proxy the request to the leader.
    #[error("this node is not the Raft leader")]
    ForwardToLeader(Option<NodeId>),

    #[error(transparent)]
    RaftError(#[from] RaftError),
}

/// Error variants related to configuration changes.
#[derive(Debug, thiserror::Error)]
pub enum ChangeConfigError {
    /// This node is not the cluster leader.
    #[error("this node is not the Raft leader")]
    NodeNotLeader(Option<NodeId>),

    /// The requested configuration change is a no-op.
    #[error("no change is required for the given membership change")]
    Noop,

    /// Every node in the cluster has been marked as a learner/non-voter, making the cluster
    /// unable to elect a leader.
    #[error("configuration would leave the cluster in an inoperable state")]
    InoperableConfig,

    /// A configuration change is already in progress.
    #[error("a configuration change is already in progress")]
    ConfigChangeInProgress,

    #[error(transparent)]
    RaftError(#[from] RaftError),
}

/// Error variants related to the initialization of a pristine Raft node.
#[derive(Debug, thiserror::Error)]
pub enum InitializeError {
    /// The node is not in a state which allows for initialization.
    #[error("this node has already been initialized, or is not a fresh node")]
    NotAllowed,

    #[error(transparent)]
    RaftError(#[from] RaftError),
}

/// A general error which wraps any of the above errors, used for calls which may fail for more
/// than one underlying reason (e.g. `add_non_voter` / `change_membership`, which may fail due to
/// either a `RaftError` or a `ChangeConfigError`).
#[derive(Debug, thiserror::Error)]
pub enum ResponseError {
    #[error(transparent)]
    RaftError(#[from] RaftError),

    #[error(transparent)]
    ChangeConfigError(#[from] ChangeConfigError),
}
