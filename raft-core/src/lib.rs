//! An implementation of the [Raft distributed consensus protocol](https://raft.github.io/),
//! generic over application data, storage, and network transport.

mod commit_waiter;
mod config;
mod config_sync;
mod core;
mod error;
mod error_handler;
mod future_collector;
mod metrics;
mod network;
mod quorum;
pub mod raft;
mod raft_types;
mod replication;
mod storage;

use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::Serialize;

pub use async_trait;
pub use commit_waiter::CommitWaitError;
pub use commit_waiter::CommitWaiter;
pub use config::Config;
pub use config::ConfigBuilder;
pub use config::ConfigError;
pub use config::SnapshotPolicy;
pub use config_sync::ConfigSyncError;
pub use config_sync::ConfigSynchronizer;
pub use config_sync::SyncState;
pub use core::State;
pub use future_collector::collect as collect_futures;
pub use future_collector::CollectError;
pub use future_collector::CollectOutcome;
pub use future_collector::CollectStrategy;
pub use error::ChangeConfigError;
pub use error::ClientReadError;
pub use error::ClientWriteError;
pub use error::Fatal;
pub use error::InitializeError;
pub use error::RaftError;
pub use error::RaftResult;
pub use error::ResponseError;
pub use error_handler::PartitionDetector;
pub use error_handler::RetryPolicy;
pub use error_handler::TransportErrorKind;
pub use metrics::LeaderMetrics;
pub use metrics::RaftMetrics;
pub use metrics::ReplicationMetrics;
pub use metrics::Wait;
pub use metrics::WaitError;
pub use network::RaftNetwork;
pub use raft::Raft;
pub use raft_types::LogId;
pub use raft_types::SnapshotId;
pub use raft_types::SnapshotSegmentId;
pub use storage::HardState;
pub use storage::InitialState;
pub use storage::RaftStorage;
pub use storage::RaftStorageDebug;
pub use storage::Snapshot;
pub use storage::SnapshotMeta;

/// A Raft node's ID within a cluster.
pub type NodeId = u64;

/// A trait defining application specific data which may be stored in the Raft log and applied
/// to an application's state machine.
///
/// This is the payload type of a single client write, e.g. a command in a replicated state
/// machine. There are no constraints placed on this type other than those required in order for
/// it to be passed around the Raft protocol's async boundaries and wire format.
pub trait AppData: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// A trait defining application specific response data, returned by the application's state
/// machine after applying an [`AppData`] payload.
pub trait AppDataResponse: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// A trait for producing a human readable one-line summary of a Raft protocol message, used for
/// low-cardinality tracing output.
pub trait MessageSummary {
    /// Return a condensed summary of `self`.
    fn summary(&self) -> String;
}

/// An update which may be applied to some piece of state, or explicitly left unchanged.
///
/// Used where `None` would be ambiguous between "no update" and "update to the empty/default
/// value".
#[derive(Debug)]
pub enum Update<T> {
    Update(T),
    Ignore,
}
