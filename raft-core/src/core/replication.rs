use crate::core::ConsensusState;
use crate::core::LeaderState;
use crate::core::ReplicationState;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::quorum;
use crate::replication::ReplicaEvent;
use crate::replication::ReplicationStream;
use crate::storage::RaftStorage;
use crate::AppData;
use crate::AppDataResponse;
use crate::NodeId;
use crate::RaftNetwork;

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> LeaderState<'a, D, R, N, S> {
    /// Spawn a new replication stream, returning a handle the leader uses to track it.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) fn spawn_replication_stream(&mut self, target: NodeId) -> ReplicationState<D> {
        let replstream = ReplicationStream::new(
            self.core.id,
            target,
            self.core.current_term,
            self.core.config.clone(),
            self.core.last_log_id,
            self.core.commit_index,
            self.core.network.clone(),
            self.core.storage.clone(),
            self.replication_tx.clone(),
        );
        ReplicationState {
            matched: crate::raft_types::LogId::default(),
            remove_after_commit: None,
            replstream,
        }
    }

    /// Handle a single event coming in from one of this leader's replication streams.
    #[tracing::instrument(level = "trace", skip(self, event))]
    pub(super) async fn handle_replica_event(&mut self, event: ReplicaEvent<S::SnapshotData>) {
        match event {
            ReplicaEvent::RateUpdate { target, is_line_rate } => {
                self.handle_rate_update(target, is_line_rate).await;
            }
            ReplicaEvent::UpdateMatchIndex { target, matched } => {
                self.update_match_index(target, matched).await;
            }
            ReplicaEvent::RevertToFollower { target, term } => {
                if term > self.core.current_term {
                    self.core.update_current_term(term, None);
                    self.core.update_current_leader(UpdateCurrentLeader::OtherNode(target));
                    self.core.set_target_state(State::Follower);
                }
            }
            ReplicaEvent::NeedsSnapshot { target: _, tx } => {
                let snapshot = self.core.storage.get_current_snapshot().await;
                match snapshot {
                    Ok(Some(snapshot)) => {
                        let _ = tx.send(snapshot);
                    }
                    Ok(None) => {
                        tracing::error!("replication stream requested a snapshot, but none is available");
                    }
                    Err(err) => {
                        let _ = self.core.map_fatal_storage_error(err);
                    }
                }
            }
            ReplicaEvent::TransportError { target, kind } => {
                self.partition_detector.record(target, Some(kind));
                self.leader_metrics.partition_suspected = self.partition_detector.partition_suspected();
                self.leader_report_metrics();
            }
            ReplicaEvent::TransportOk { target } => {
                self.partition_detector.record(target, None);
                self.leader_metrics.partition_suspected = self.partition_detector.partition_suspected();
                self.leader_report_metrics();
            }
            ReplicaEvent::Shutdown => {
                self.core.set_target_state(State::Shutdown);
            }
        }
    }

    /// React to a replication stream reporting that its target has caught up to (or fallen
    /// behind) line rate. A non-voter reaching line rate is the signal that it is ready to be
    /// admitted into a pending joint consensus config change.
    async fn handle_rate_update(&mut self, target: NodeId, is_line_rate: bool) {
        if !is_line_rate {
            return;
        }
        if let Some(node) = self.non_voters.get_mut(&target) {
            node.is_ready_to_join = true;
        } else {
            return;
        }

        let (awaiting, members, tx) = match std::mem::replace(&mut self.consensus_state, ConsensusState::Uniform) {
            ConsensusState::NonVoterSync {
                mut awaiting,
                members,
                tx,
            } => {
                awaiting.remove(&target);
                (awaiting, members, tx)
            }
            other => {
                self.consensus_state = other;
                return;
            }
        };

        if awaiting.is_empty() {
            // All non-voters this change was waiting on have caught up to line rate; re-enter
            // `change_membership` so it can proceed straight into joint consensus.
            self.change_membership(members, tx).await;
        } else {
            self.consensus_state = ConsensusState::NonVoterSync { awaiting, members, tx };
        }
    }

    /// Handle a `matched` index update from a replication stream, advancing the cluster's commit
    /// index if a new majority-replicated log entry is now available and draining any client
    /// requests which have become committed as a result.
    async fn update_match_index(&mut self, target: NodeId, matched: crate::raft_types::LogId) {
        if let Some(state) = self.nodes.get_mut(&target) {
            state.matched = matched;
            self.leader_metrics.replication.insert(target, crate::metrics::ReplicationMetrics { matched });
        } else if let Some(state) = self.non_voters.get_mut(&target) {
            state.state.matched = matched;
        } else {
            return;
        }

        let new_commit_index = self.calculate_commit_index().await;
        if new_commit_index > self.core.commit_index {
            self.core.commit_index = new_commit_index;
            self.leader_report_metrics();
            self.drain_awaiting_committed().await;
        }

        self.handle_nodes_pending_removal();
    }

    /// Compute the highest log index that a majority of the current (and, if applicable,
    /// joint-consensus) voting membership has acknowledged, then gate the result on the Figure-8
    /// safety rule: a leader may only commit by counting replicas for an entry from its own term.
    async fn calculate_commit_index(&self) -> u64 {
        let c0_index = self.commit_index_for(&self.core.membership.members);
        let candidate = match &self.core.membership.members_after_consensus {
            Some(members) => {
                let c1_index = self.commit_index_for(members);
                std::cmp::min(c0_index, c1_index)
            }
            None => c0_index,
        };
        self.safe_commit_index(candidate).await
    }

    fn commit_index_for(&self, members: &std::collections::BTreeSet<NodeId>) -> u64 {
        let indexes: Vec<u64> = members
            .iter()
            .map(|id| {
                if *id == self.core.id {
                    self.core.last_log_id.index
                } else {
                    self.nodes.get(id).map(|n| n.matched.index).unwrap_or(0)
                }
            })
            .collect();
        quorum::majority_of_match_index(&indexes).unwrap_or(0)
    }

    /// A majority-replicated index is only safe to commit if the entry living at that index was
    /// written in the leader's own current term. Under batched catch-up a majority can reach an
    /// index that still holds a previous leader's entry before this leader's own no-op has
    /// replicated; committing that index directly is the classic Figure-8 violation, since a
    /// future leader that lacks it could still win an election and overwrite it. Reject such a
    /// candidate and keep the commit index where it is — it advances on the next match-index
    /// update once the no-op (or any later current-term entry) has reached a majority.
    async fn safe_commit_index(&self, candidate: u64) -> u64 {
        if candidate <= self.core.commit_index {
            return self.core.commit_index;
        }
        let term = if candidate == self.core.last_log_id.index {
            self.core.last_log_id.term
        } else {
            match self.core.storage.try_get_log_entry(candidate).await {
                Ok(Some(entry)) => entry.log_id.term,
                Ok(None) => return self.core.commit_index,
                Err(err) => {
                    tracing::error!(error=%err, index=candidate, "error reading log entry while checking commit safety");
                    return self.core.commit_index;
                }
            }
        };
        if term == self.core.current_term {
            candidate
        } else {
            self.core.commit_index
        }
    }

    /// Apply any client requests which are now covered by the current commit index.
    async fn drain_awaiting_committed(&mut self) {
        let commit_index = self.core.commit_index;
        let mut i = 0;
        while i < self.awaiting_committed.len() {
            if self.awaiting_committed[i].entry.log_id.index <= commit_index {
                let req = self.awaiting_committed.remove(i);
                self.client_request_post_commit(req).await;
            } else {
                i += 1;
            }
        }
    }

    /// Check for nodes which have been marked for removal once their removal entry commits, and
    /// terminate their replication streams once that point has been reached.
    fn handle_nodes_pending_removal(&mut self) {
        let commit_index = self.core.commit_index;
        let to_remove: Vec<NodeId> = self
            .nodes
            .iter()
            .filter_map(|(id, state)| match state.remove_after_commit {
                Some(threshold) if commit_index >= threshold => Some(*id),
                _ => None,
            })
            .collect();
        for id in to_remove {
            if let Some(state) = self.nodes.remove(&id) {
                let _ = state
                    .replstream
                    .repl_tx
                    .send((crate::replication::RaftEvent::Terminate, tracing::debug_span!("CH")));
            }
        }
    }
}
