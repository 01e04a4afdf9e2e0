//! Runtime configuration for a Raft node.

use rand::thread_rng;
use rand::Rng;
use serde::Deserialize;
use serde::Serialize;

/// The policy used to decide when a leader should trigger the construction of a new snapshot
/// and compact its log.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum SnapshotPolicy {
    /// Compact the log once `n` entries have accumulated since the last snapshot.
    LogsSinceLast(u64),

    /// Never automatically compact the log. Only useful for tests and for storage backends
    /// which implement their own compaction policy out-of-band.
    Never,
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        SnapshotPolicy::LogsSinceLast(5000)
    }
}

/// Runtime configuration for a Raft node.
///
/// The values held here govern election timing, heartbeat cadence, log replication batching and
/// the node's snapshot policy. Instances should be built via [`Config::build`], which applies the
/// crate's defaults and validates the result.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// A name for this cluster, used as a sanity check when nodes connect to each other. Nodes
    /// with different `cluster_name`s will refuse to participate in each other's elections.
    pub cluster_name: String,

    /// The minimum election timeout, in milliseconds.
    pub election_timeout_min: u64,

    /// The maximum election timeout, in milliseconds.
    pub election_timeout_max: u64,

    /// The interval, in milliseconds, at which leaders will send heartbeats to followers.
    pub heartbeat_interval: u64,

    /// The timeout, in milliseconds, used for each individual `InstallSnapshot` RPC sent while
    /// streaming a snapshot to a follower.
    pub install_snapshot_timeout: u64,

    /// The maximum number of entries to send in a single `AppendEntries` RPC.
    pub max_payload_entries: u64,

    /// The distance, in log entries, a follower's `matched` index may fall behind the leader's
    /// `last_log_index` while still being considered to be replicating "at line rate". Once a
    /// follower falls behind this threshold, replication to it switches to the lagging state.
    pub replication_lag_threshold: u64,

    /// The policy used to decide when to compact the log into a new snapshot.
    pub snapshot_policy: SnapshotPolicy,

    /// The maximum number of bytes to send in a single chunk of a snapshot stream.
    pub snapshot_max_chunk_size: u64,
}

impl Config {
    /// Start building a new config for a cluster with the given name, using this crate's
    /// defaults for everything else.
    pub fn build(cluster_name: String) -> ConfigBuilder {
        ConfigBuilder {
            cluster_name,
            election_timeout_min: 150,
            election_timeout_max: 300,
            heartbeat_interval: 50,
            install_snapshot_timeout: 200,
            max_payload_entries: 300,
            replication_lag_threshold: 1000,
            snapshot_policy: SnapshotPolicy::default(),
            snapshot_max_chunk_size: 3 * 1024 * 1024,
        }
    }

    /// Generate a new random election timeout within the configured bounds.
    pub fn new_rand_election_timeout(&self) -> u64 {
        thread_rng().gen_range(self.election_timeout_min..self.election_timeout_max)
    }
}

/// A builder for a [`Config`], allowing individual fields to be overridden from the defaults
/// before the config is finalized via [`ConfigBuilder::validate`].
pub struct ConfigBuilder {
    pub cluster_name: String,
    pub election_timeout_min: u64,
    pub election_timeout_max: u64,
    pub heartbeat_interval: u64,
    pub install_snapshot_timeout: u64,
    pub max_payload_entries: u64,
    pub replication_lag_threshold: u64,
    pub snapshot_policy: SnapshotPolicy,
    pub snapshot_max_chunk_size: u64,
}

impl ConfigBuilder {
    pub fn election_timeout_min(mut self, val: u64) -> Self {
        self.election_timeout_min = val;
        self
    }

    pub fn election_timeout_max(mut self, val: u64) -> Self {
        self.election_timeout_max = val;
        self
    }

    pub fn heartbeat_interval(mut self, val: u64) -> Self {
        self.heartbeat_interval = val;
        self
    }

    pub fn install_snapshot_timeout(mut self, val: u64) -> Self {
        self.install_snapshot_timeout = val;
        self
    }

    pub fn max_payload_entries(mut self, val: u64) -> Self {
        self.max_payload_entries = val;
        self
    }

    pub fn replication_lag_threshold(mut self, val: u64) -> Self {
        self.replication_lag_threshold = val;
        self
    }

    pub fn snapshot_policy(mut self, val: SnapshotPolicy) -> Self {
        self.snapshot_policy = val;
        self
    }

    pub fn snapshot_max_chunk_size(mut self, val: u64) -> Self {
        self.snapshot_max_chunk_size = val;
        self
    }

    /// Validate the accumulated settings and produce a finalized [`Config`].
    pub fn validate(self) -> Result<Config, ConfigError> {
        if self.election_timeout_min >= self.election_timeout_max {
            return Err(ConfigError::InvalidElectionTimeoutRange {
                min: self.election_timeout_min,
                max: self.election_timeout_max,
            });
        }
        if self.election_timeout_min <= self.heartbeat_interval {
            return Err(ConfigError::ElectionTimeoutTooShort {
                election_timeout_min: self.election_timeout_min,
                heartbeat_interval: self.heartbeat_interval,
            });
        }
        if self.max_payload_entries == 0 {
            return Err(ConfigError::MaxPayloadEntriesTooSmall);
        }

        Ok(Config {
            cluster_name: self.cluster_name,
            election_timeout_min: self.election_timeout_min,
            election_timeout_max: self.election_timeout_max,
            heartbeat_interval: self.heartbeat_interval,
            install_snapshot_timeout: self.install_snapshot_timeout,
            max_payload_entries: self.max_payload_entries,
            replication_lag_threshold: self.replication_lag_threshold,
            snapshot_policy: self.snapshot_policy,
            snapshot_max_chunk_size: self.snapshot_max_chunk_size,
        })
    }
}

/// Error variants returned while validating a [`ConfigBuilder`].
#[derive(Clone, Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("election_timeout_min ({min}) must be less than election_timeout_max ({max})")]
    InvalidElectionTimeoutRange { min: u64, max: u64 },

    #[error(
        "election_timeout_min ({election_timeout_min}) must be greater than heartbeat_interval \
         ({heartbeat_interval}), else heartbeats may spuriously trigger an election"
    )]
    ElectionTimeoutTooShort {
        election_timeout_min: u64,
        heartbeat_interval: u64,
    },

    #[error("max_payload_entries must be greater than 0")]
    MaxPayloadEntriesTooSmall,
}
