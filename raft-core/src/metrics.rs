//! Metrics and the `wait` API used to observe a running Raft node's progress.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tokio::time::timeout;
use tokio::time::Instant;

use crate::core::State;
use crate::raft::MembershipConfig;
use crate::raft_types::LogId;
use crate::NodeId;

/// A snapshot of the state of a single Raft node, published any time the node's state changes
/// in a way an observer may care about.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RaftMetrics {
    pub id: NodeId,
    pub state: State,
    pub current_term: u64,
    pub last_log_index: u64,
    pub last_applied: u64,
    pub current_leader: Option<NodeId>,
    pub membership_config: MembershipConfig,
    pub snapshot: LogId,
    /// Replication metrics for this node's followers, present only while this node is the
    /// cluster leader.
    pub leader_metrics: Option<LeaderMetrics>,
}

impl RaftMetrics {
    pub fn new_initial(id: NodeId) -> Self {
        Self {
            id,
            state: State::Follower,
            current_term: 0,
            last_log_index: 0,
            last_applied: 0,
            current_leader: None,
            membership_config: MembershipConfig::new_initial(id),
            snapshot: LogId::default(),
            leader_metrics: None,
        }
    }
}

/// Replication metrics reported for the followers of a cluster leader.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct LeaderMetrics {
    pub replication: HashMap<NodeId, ReplicationMetrics>,
    /// A heuristic signal (§4.7) indicating that a majority of peers have produced consecutive
    /// retryable network-class failures, suggesting this leader may be partitioned from the rest
    /// of the cluster. No state transition follows from this; it is surfaced for observability
    /// only.
    pub partition_suspected: bool,
}

/// A handle for blocking on some condition over a node's published [`RaftMetrics`].
///
/// Obtained via [`crate::Raft::wait`]. Each method polls the metrics channel for up to the
/// configured timeout, returning as soon as the given predicate is satisfied.
pub struct Wait {
    pub timeout: Duration,
    pub rx: tokio::sync::watch::Receiver<RaftMetrics>,
}

/// Error returned when a [`Wait`] condition does not become true before its timeout elapses.
#[derive(Clone, Debug, thiserror::Error)]
#[error("timeout ({timeout:?}) while waiting for {msg}")]
pub struct WaitError {
    pub timeout: Duration,
    pub msg: String,
}

impl Wait {
    /// Wait for a condition to be true, as evaluated against every metrics update.
    pub async fn metrics<T>(&self, func: T, msg: impl AsRef<str>) -> Result<RaftMetrics, WaitError>
    where T: Fn(&RaftMetrics) -> bool {
        let timeout_at = Instant::now() + self.timeout;
        let mut rx = self.rx.clone();

        loop {
            let latest = rx.borrow().clone();
            if func(&latest) {
                return Ok(latest);
            }

            let remaining = timeout_at.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(WaitError {
                    timeout: self.timeout,
                    msg: msg.as_ref().to_string(),
                });
            }

            match timeout(remaining, rx.changed()).await {
                Ok(Ok(_)) => continue,
                Ok(Err(_)) => {
                    return Err(WaitError {
                        timeout: self.timeout,
                        msg: format!("{} (metrics channel closed)", msg.as_ref()),
                    })
                }
                Err(_) => {
                    return Err(WaitError {
                        timeout: self.timeout,
                        msg: msg.as_ref().to_string(),
                    })
                }
            }
        }
    }

    /// Wait for the node's `last_log_index` to reach at least `want_log`.
    pub async fn log(&self, want_log: u64, msg: impl AsRef<str>) -> Result<RaftMetrics, WaitError> {
        self.metrics(|m| m.last_log_index == want_log, msg).await
    }

    /// Wait for the node to enter the given state.
    pub async fn state(&self, want_state: State, msg: impl AsRef<str>) -> Result<RaftMetrics, WaitError> {
        self.metrics(|m| m.state == want_state, msg).await
    }

    /// Wait for the node's current leader to become `id`.
    pub async fn current_leader(&self, id: NodeId, msg: impl AsRef<str>) -> Result<RaftMetrics, WaitError> {
        self.metrics(|m| m.current_leader == Some(id), msg).await
    }

    /// Wait for the node's last compacted log to reach `want`.
    pub async fn snapshot(&self, want: LogId, msg: impl AsRef<str>) -> Result<RaftMetrics, WaitError> {
        self.metrics(|m| m.snapshot == want, msg).await
    }
}

/// Replication progress as observed by a cluster leader for a single follower.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplicationMetrics {
    pub matched: LogId,
}
