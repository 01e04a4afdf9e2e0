use crate::core::RaftCore;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftResult;
use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::ConflictOpt;
use crate::raft::Entry;
use crate::raft::EntryPayload;
use crate::raft_types::LogId;
use crate::AppData;
use crate::AppDataResponse;
use crate::RaftNetwork;
use crate::RaftStorage;

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> RaftCore<D, R, N, S> {
    /// Handle an incoming `AppendEntries` RPC, the mechanism by which the leader both replicates
    /// its log and sends heartbeats (§5.2, §5.3).
    #[tracing::instrument(level = "trace", skip(self, req))]
    pub(super) async fn handle_append_entries_request(
        &mut self,
        req: AppendEntriesRequest<D>,
    ) -> RaftResult<AppendEntriesResponse> {
        if req.term < self.current_term {
            return Ok(AppendEntriesResponse {
                term: self.current_term,
                success: false,
                conflict_opt: None,
            });
        }

        if req.term > self.current_term {
            self.update_current_term(req.term, None);
            self.save_hard_state().await?;
        }
        self.update_current_leader(UpdateCurrentLeader::OtherNode(req.leader_id));
        self.set_target_state(State::Follower);
        self.update_next_election_timeout(true);

        // If this is a heartbeat for an empty log and the leader has no history either, there is
        // nothing further to check.
        if req.prev_log_id.index != 0 {
            let prev_matches = if req.prev_log_id.index == self.last_log_id.index {
                req.prev_log_id.term == self.last_log_id.term
            } else if req.prev_log_id.index < self.last_log_id.index {
                match self.storage.try_get_log_entry(req.prev_log_id.index).await.map_err(|err| self.map_fatal_storage_error(err))? {
                    Some(entry) => entry.log_id.term == req.prev_log_id.term,
                    None => false,
                }
            } else {
                false
            };

            if !prev_matches {
                let conflict_opt = self.find_conflict_opt(req.prev_log_id).await?;
                return Ok(AppendEntriesResponse {
                    term: self.current_term,
                    success: false,
                    conflict_opt: Some(conflict_opt),
                });
            }
        }

        if !req.entries.is_empty() {
            self.append_entries(&req.entries).await?;
        }

        if req.leader_commit > self.commit_index {
            let last_index = req.entries.last().map(|e| e.log_id.index).unwrap_or(self.last_log_id.index);
            self.commit_index = std::cmp::min(req.leader_commit, last_index);
            self.replicate_to_state_machine_if_needed().await;
        }

        self.report_metrics(crate::Update::Ignore);

        Ok(AppendEntriesResponse {
            term: self.current_term,
            success: true,
            conflict_opt: None,
        })
    }

    /// Reconcile the local log against a batch of entries sent from the leader: any existing
    /// entries which conflict with the new batch are truncated, and the new entries are appended.
    async fn append_entries(&mut self, entries: &[Entry<D>]) -> RaftResult<()> {
        let mut to_append_from = None;
        for (idx, entry) in entries.iter().enumerate() {
            if entry.log_id.index <= self.last_log_id.index {
                let existing = self
                    .storage
                    .try_get_log_entry(entry.log_id.index)
                    .await
                    .map_err(|err| self.map_fatal_storage_error(err))?;
                let conflicts = match existing {
                    Some(existing) => existing.log_id.term != entry.log_id.term,
                    None => true,
                };
                if conflicts {
                    self.storage
                        .delete_logs_from(entry.log_id.index..)
                        .await
                        .map_err(|err| self.map_fatal_storage_error(err))?;
                    to_append_from = Some(idx);
                    break;
                }
                // Entry already present and matching; nothing to do.
                continue;
            }
            to_append_from = Some(idx);
            break;
        }

        let to_append_from = match to_append_from {
            Some(idx) => idx,
            None => return Ok(()),
        };

        let new_entries: Vec<&Entry<D>> = entries[to_append_from..].iter().collect();
        if new_entries.is_empty() {
            return Ok(());
        }
        self.storage.append_to_log(&new_entries).await.map_err(|err| self.map_fatal_storage_error(err))?;
        self.last_log_id = new_entries.last().expect("checked non-empty above").log_id;

        for entry in new_entries {
            if let EntryPayload::ConfigChange(ref change) = entry.payload {
                self.update_membership(change.membership.clone())?;
            }
        }

        Ok(())
    }

    /// Find the most recent log entry which does not conflict with the given (non-matching)
    /// `prev_log_id`, for use in the `AppendEntries` conflict optimization (§5.3).
    async fn find_conflict_opt(&mut self, prev_log_id: LogId) -> RaftResult<ConflictOpt> {
        if prev_log_id.index > self.last_log_id.index {
            return Ok(ConflictOpt {
                log_id: self.last_log_id,
            });
        }

        let conflict_term = match self.storage.try_get_log_entry(prev_log_id.index).await.map_err(|err| self.map_fatal_storage_error(err))? {
            Some(entry) => entry.log_id.term,
            None => {
                return Ok(ConflictOpt {
                    log_id: LogId::new(0, 0),
                })
            }
        };

        // Walk backwards to the first entry sharing this conflicting term.
        let mut scan_index = prev_log_id.index;
        let mut earliest = LogId::new(conflict_term, prev_log_id.index);
        while scan_index > 0 {
            scan_index -= 1;
            if scan_index == 0 {
                earliest = LogId::new(0, 0);
                break;
            }
            match self.storage.try_get_log_entry(scan_index).await.map_err(|err| self.map_fatal_storage_error(err))? {
                Some(entry) if entry.log_id.term == conflict_term => {
                    earliest = entry.log_id;
                }
                _ => break,
            }
        }

        Ok(ConflictOpt { log_id: earliest })
    }

    /// Apply any newly committed entries to the local state machine in the background, without
    /// blocking further `AppendEntries` processing.
    async fn replicate_to_state_machine_if_needed(&mut self) {
        let start = self.last_applied.index + 1;
        let stop = self.commit_index;
        if start > stop {
            return;
        }

        let storage = self.storage.clone();
        let handle = tokio::spawn(async move {
            let entries = storage.get_log_entries(start..=stop).await?;
            if entries.is_empty() {
                return Ok(None);
            }
            let data_entries: Vec<&Entry<D>> = entries.iter().collect();
            storage.apply_to_state_machine(&data_entries).await?;
            Ok(entries.last().map(|e| e.log_id))
        });
        self.replicate_to_sm_handle.push(handle);
    }
}
