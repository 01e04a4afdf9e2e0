//! Core identifier types shared across the log, storage and replication layers.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// The identity of a single entry in the replicated log.
///
/// A `LogId` is unique within a cluster's history: no two entries with distinct content will
/// ever share the same `(term, index)` pair, since `index` is monotonic per term and a new
/// leader's term is always higher than any term it has seen.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogId {
    pub term: u64,
    pub index: u64,
}

impl LogId {
    pub fn new(term: u64, index: u64) -> Self {
        Self { term, index }
    }
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}-{}]", self.term, self.index)
    }
}

impl PartialOrd for LogId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LogId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.term, self.index).cmp(&(other.term, other.index))
    }
}

/// The identity of a snapshot, assigned by the node which generated it.
///
/// Snapshot ids are opaque strings from the perspective of the core: storage implementations
/// are free to use whatever scheme makes sense (UUIDs, monotonic counters, content hashes) as
/// long as a fresh id is generated every time a new snapshot is built.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SnapshotId(pub String);

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SnapshotId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SnapshotId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A precise location within a snapshot transmission, used to detect a leader restarting a
/// transfer mid-stream and to report exactly where an `InstallSnapshot` RPC stream diverged.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotSegmentId {
    pub id: SnapshotId,
    pub offset: u64,
}

impl fmt::Display for SnapshotSegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.offset)
    }
}
