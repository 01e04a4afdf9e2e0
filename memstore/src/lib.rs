//! An in-memory implementation of the `raft-core::RaftStorage` trait, used for testing and as a
//! reference for building real storage backends.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::io::Cursor;
use std::ops::RangeBounds;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use anyhow::anyhow;
use anyhow::Result;
use async_trait::async_trait;
use raft_core::raft::Entry;
use raft_core::raft::EntryPayload;
use raft_core::raft::MembershipConfig;
use raft_core::AppData;
use raft_core::AppDataResponse;
use raft_core::HardState;
use raft_core::InitialState;
use raft_core::LogId;
use raft_core::NodeId;
use raft_core::RaftStorage;
use raft_core::RaftStorageDebug;
use raft_core::Snapshot;
use raft_core::SnapshotMeta;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::RwLock;

/// The application data request type which the `MemStore` works with.
///
/// Conceptually, this represents an update to some key-ish value in the storage engine, made by
/// a specific client. The `client`/`serial` pair is used to detect and deduplicate retried
/// requests (§8 of the Raft paper): a client assigns a unique, increasing serial number to each
/// command it issues, and the state machine only ever applies the first copy of a given
/// `(client, serial)` pair it sees.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientRequest {
    /// The ID of the client which sent this request.
    pub client: String,
    /// The serial number which the client has assigned to this request.
    pub serial: u64,
    /// The new status value the client wants recorded for itself.
    pub status: String,
}

impl AppData for ClientRequest {}

/// The application data response type which the `MemStore` produces.
///
/// Holds the previous status value recorded for the issuing client, if this was not the first
/// request from that client.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientResponse(pub Option<String>);

impl AppDataResponse for ClientResponse {}

/// Per-client bookkeeping used to deduplicate retried client requests.
///
/// Keyed by client ID; records the most recent serial number this client has had applied, along
/// with the response produced for it, so that a retried request with the same serial number can
/// be answered without being re-applied to the state machine.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ClientSession {
    pub serial: u64,
    pub response: Option<String>,
}

/// The application state machine driven by `MemStore`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MemStoreStateMachine {
    /// The last log entry which has been applied to this state machine.
    pub last_applied_log: LogId,

    /// A map from client ID to the most recent serial/response pair seen for that client, used
    /// to detect and answer duplicate requests without re-executing them.
    pub client_sessions: HashMap<String, ClientSession>,

    /// The actual key-ish data held by this state machine: each client's most recently recorded
    /// status value.
    pub data: BTreeMap<String, String>,
}

/// A serializable snapshot of `MemStoreStateMachine`, as written to / read from a
/// `MemStore::SnapshotData` handle.
#[derive(Debug, Serialize, Deserialize)]
struct MemStoreSnapshot {
    meta: SnapshotMeta,
    state_machine: MemStoreStateMachine,
}

/// Error conditions which cause a `MemStore` to report that Raft should shut down.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ShutdownError {
    #[error("unsafe storage error: {msg}")]
    UnsafeStorageError { msg: String },
}

/// An in-memory storage system implementing the `raft-core::RaftStorage` trait.
///
/// This is built for testing, and is not suited for production use, as none of the data this
/// store works with is ever actually persisted anywhere outside of memory.
pub struct MemStore {
    id: NodeId,
    log: RwLock<BTreeMap<u64, Entry<ClientRequest>>>,
    sm: RwLock<MemStoreStateMachine>,
    hs: RwLock<Option<HardState>>,
    current_snapshot: RwLock<Option<MemStoreSnapshot>>,
    snapshot_idx: AtomicU64,
}

impl MemStore {
    /// Create a new, pristine `MemStore` instance for the given node ID.
    pub fn new(id: NodeId) -> Self {
        let log = RwLock::new(BTreeMap::new());
        let sm = RwLock::new(MemStoreStateMachine::default());
        let hs = RwLock::new(None);
        let current_snapshot = RwLock::new(None);
        Self {
            id,
            log,
            sm,
            hs,
            current_snapshot,
            snapshot_idx: AtomicU64::new(0),
        }
    }

    /// Get a handle to the log for testing purposes.
    pub async fn get_log(&self) -> BTreeMap<u64, Entry<ClientRequest>> {
        self.log.read().await.clone()
    }
}

#[async_trait]
impl RaftStorageDebug<MemStoreStateMachine> for MemStore {
    async fn get_state_machine(&self) -> MemStoreStateMachine {
        self.sm.read().await.clone()
    }

    async fn read_hard_state(&self) -> Option<HardState> {
        self.hs.read().await.clone()
    }
}

#[async_trait]
impl RaftStorage<ClientRequest, ClientResponse> for MemStore {
    type SnapshotData = Cursor<Vec<u8>>;
    type ShutdownError = ShutdownError;

    async fn get_membership_config(&self) -> Result<MembershipConfig> {
        let log = self.log.read().await;
        let cfg_opt = log.values().rev().find_map(|entry| match &entry.payload {
            EntryPayload::ConfigChange(cfg) => Some(cfg.membership.clone()),
            _ => None,
        });
        Ok(match cfg_opt {
            Some(cfg) => cfg,
            None => MembershipConfig::new_initial(self.id),
        })
    }

    async fn get_initial_state(&self) -> Result<InitialState> {
        let membership = self.get_membership_config().await?;
        let mut hs = self.hs.write().await;
        match &*hs {
            Some(inner) => {
                let log = self.log.read().await;
                let last_log_id = match log.values().rev().next() {
                    Some(entry) => entry.log_id,
                    None => LogId::new(0, 0),
                };
                let sm = self.sm.read().await;
                Ok(InitialState {
                    last_log_id,
                    last_applied_log: sm.last_applied_log,
                    hard_state: inner.clone(),
                    membership,
                })
            }
            None => {
                let new = InitialState::new_initial(self.id);
                *hs = Some(new.hard_state.clone());
                Ok(new)
            }
        }
    }

    async fn save_hard_state(&self, hs: &HardState) -> Result<()> {
        *self.hs.write().await = Some(hs.clone());
        Ok(())
    }

    async fn get_log_entries<RNG: RangeBounds<u64> + Clone + std::fmt::Debug + Send + Sync>(
        &self,
        range: RNG,
    ) -> Result<Vec<Entry<ClientRequest>>> {
        let log = self.log.read().await;
        Ok(log.range(range).map(|(_, entry)| entry.clone()).collect())
    }

    async fn try_get_log_entry(&self, log_index: u64) -> Result<Option<Entry<ClientRequest>>> {
        let log = self.log.read().await;
        Ok(log.get(&log_index).cloned())
    }

    async fn get_last_log_id(&self) -> Result<LogId> {
        let log = self.log.read().await;
        let sm = self.sm.read().await;
        let last_in_log = log.values().rev().next().map(|entry| entry.log_id);
        Ok(match last_in_log {
            Some(log_id) if log_id >= sm.last_applied_log => log_id,
            _ => sm.last_applied_log,
        })
    }

    async fn delete_logs_from<RNG: RangeBounds<u64> + Clone + std::fmt::Debug + Send + Sync>(
        &self,
        range: RNG,
    ) -> Result<()> {
        let mut log = self.log.write().await;
        let keys: Vec<u64> = log.range(range).map(|(k, _)| *k).collect();
        for key in keys {
            log.remove(&key);
        }
        Ok(())
    }

    async fn append_to_log(&self, entries: &[&Entry<ClientRequest>]) -> Result<()> {
        let mut log = self.log.write().await;
        for entry in entries {
            log.insert(entry.log_id.index, (*entry).clone());
        }
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self, entries))]
    async fn apply_to_state_machine(&self, entries: &[&Entry<ClientRequest>]) -> Result<Vec<ClientResponse>> {
        let mut sm = self.sm.write().await;
        let mut results = Vec::with_capacity(entries.len());
        for entry in entries {
            sm.last_applied_log = entry.log_id;

            match &entry.payload {
                EntryPayload::Blank => results.push(ClientResponse(None)),
                EntryPayload::ConfigChange(_) => {
                    results.push(ClientResponse(None));
                }
                EntryPayload::PurgedMarker => results.push(ClientResponse(None)),
                EntryPayload::Normal(norm) => {
                    let req = &norm.data;

                    if let Some(session) = sm.client_sessions.get(&req.client) {
                        if session.serial == req.serial {
                            // Duplicate of an already-applied request: answer from the cache
                            // without touching `data` again.
                            results.push(ClientResponse(session.response.clone()));
                            continue;
                        }
                        if req.serial < session.serial {
                            // A retry of a request older than the highest serial we've already
                            // applied for this client; the cache for it is gone, so there is
                            // nothing useful to replay. Answer with the stale response rather
                            // than regressing `data` with an out-of-order write.
                            results.push(ClientResponse(session.response.clone()));
                            continue;
                        }
                    }

                    let previous = sm.data.insert(req.client.clone(), req.status.clone());
                    sm.client_sessions.insert(
                        req.client.clone(),
                        ClientSession {
                            serial: req.serial,
                            response: previous.clone(),
                        },
                    );
                    results.push(ClientResponse(previous));
                }
            }
        }
        Ok(results)
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn do_log_compaction(&self) -> Result<Snapshot<Self::SnapshotData>> {
        let (data, last_applied_log);
        {
            let sm = self.sm.read().await;
            data = serde_json::to_vec(&*sm)?;
            last_applied_log = sm.last_applied_log;
        }

        let membership = self.get_membership_config().await?;

        let snapshot_idx = self.snapshot_idx.fetch_add(1, Ordering::SeqCst) + 1;
        let snapshot_id = format!("{}-{}-{}", last_applied_log.term, last_applied_log.index, snapshot_idx);

        let meta = SnapshotMeta {
            last_log_id: last_applied_log,
            membership,
            snapshot_id: snapshot_id.into(),
        };

        let snapshot = MemStoreSnapshot {
            meta: SnapshotMeta {
                last_log_id: meta.last_log_id,
                membership: meta.membership.clone(),
                snapshot_id: meta.snapshot_id.clone(),
            },
            state_machine: self.sm.read().await.clone(),
        };

        {
            let mut log = self.log.write().await;
            let keep_from = last_applied_log.index + 1;
            let purge_keys: Vec<u64> = log.range(..keep_from).map(|(k, _)| *k).collect();
            for key in purge_keys {
                log.remove(&key);
            }
            log.insert(last_applied_log.index, Entry::new_purged_marker(last_applied_log));
        }

        *self.current_snapshot.write().await = Some(snapshot);

        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        })
    }

    async fn begin_receiving_snapshot(&self) -> Result<Box<Self::SnapshotData>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn finalize_snapshot_installation(
        &self,
        meta: &SnapshotMeta,
        snapshot: Box<Self::SnapshotData>,
    ) -> Result<()> {
        let new_snapshot: MemStoreStateMachine = serde_json::from_slice(snapshot.get_ref().as_slice())
            .map_err(|err| anyhow!("error deserializing installed snapshot: {}", err))?;

        {
            let mut log = self.log.write().await;
            let purge_keys: Vec<u64> = log.range(..=meta.last_log_id.index).map(|(k, _)| *k).collect();
            for key in purge_keys {
                log.remove(&key);
            }
            log.insert(meta.last_log_id.index, Entry::new_purged_marker(meta.last_log_id));
        }

        {
            let mut sm = self.sm.write().await;
            *sm = new_snapshot;
        }

        *self.current_snapshot.write().await = Some(MemStoreSnapshot {
            meta: meta.clone(),
            state_machine: self.sm.read().await.clone(),
        });

        Ok(())
    }

    async fn get_current_snapshot(&self) -> Result<Option<Snapshot<Self::SnapshotData>>> {
        match &*self.current_snapshot.read().await {
            Some(snapshot) => {
                let data = serde_json::to_vec(&snapshot.state_machine)?;
                Ok(Some(Snapshot {
                    meta: snapshot.meta.clone(),
                    snapshot: Box::new(Cursor::new(data)),
                }))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use raft_core::raft::EntryNormal;

    use super::*;

    fn normal_entry(index: u64, req: ClientRequest) -> Entry<ClientRequest> {
        Entry {
            log_id: LogId::new(1, index),
            payload: EntryPayload::Normal(EntryNormal { data: req }),
        }
    }

    #[tokio::test]
    async fn apply_is_idempotent_for_retried_serial() {
        let store = MemStore::new(1);
        let req = ClientRequest {
            client: "c1".into(),
            serial: 1,
            status: "first".into(),
        };
        let entry = normal_entry(1, req.clone());

        let first = store.apply_to_state_machine(&[&entry]).await.unwrap();
        let retried = store.apply_to_state_machine(&[&entry]).await.unwrap();

        assert!(first[0].0.is_none());
        assert_eq!(first[0].0, retried[0].0, "retried request must return the cached response");

        let sm = store.get_state_machine().await;
        assert_eq!(sm.data.get("c1"), Some(&"first".to_string()));
    }

    #[tokio::test]
    async fn new_serial_overwrites_previous_status() {
        let store = MemStore::new(1);
        let first = normal_entry(
            1,
            ClientRequest {
                client: "c1".into(),
                serial: 1,
                status: "a".into(),
            },
        );
        let second = normal_entry(
            2,
            ClientRequest {
                client: "c1".into(),
                serial: 2,
                status: "b".into(),
            },
        );

        store.apply_to_state_machine(&[&first]).await.unwrap();
        let res = store.apply_to_state_machine(&[&second]).await.unwrap();

        assert_eq!(res[0].0, Some("a".to_string()));
        let sm = store.get_state_machine().await;
        assert_eq!(sm.data.get("c1"), Some(&"b".to_string()));
    }

    #[tokio::test]
    async fn log_compaction_purges_applied_entries_and_keeps_snapshot() {
        let store = MemStore::new(1);
        let entry = normal_entry(
            1,
            ClientRequest {
                client: "c1".into(),
                serial: 1,
                status: "a".into(),
            },
        );
        store.append_to_log(&[&entry]).await.unwrap();
        store.apply_to_state_machine(&[&entry]).await.unwrap();

        let snapshot = store.do_log_compaction().await.unwrap();
        assert_eq!(snapshot.meta.last_log_id, LogId::new(1, 1));

        let log = store.get_log().await;
        assert_eq!(log.len(), 1, "log should only retain the purge marker");

        let current = store.get_current_snapshot().await.unwrap();
        assert!(current.is_some());
    }

    #[tokio::test]
    async fn initial_state_is_pristine_for_new_store() {
        let store = MemStore::new(7);
        let initial = store.get_initial_state().await.unwrap();
        assert_eq!(initial.last_log_id, LogId::new(0, 0));
        assert_eq!(initial.hard_state.current_term, 0);
        assert!(initial.membership.members.contains(&7));
    }
}
