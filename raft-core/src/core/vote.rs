use tokio::sync::mpsc;
use tracing::Instrument;

use crate::core::CandidateState;
use crate::core::RaftCore;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftResult;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::AppData;
use crate::AppDataResponse;
use crate::NodeId;
use crate::RaftNetwork;
use crate::RaftStorage;

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> RaftCore<D, R, N, S> {
    /// Handle an incoming `Vote` RPC, deciding whether to grant this node's vote to the
    /// candidate (§5.2, §5.4).
    #[tracing::instrument(level = "trace", skip(self, req))]
    pub(super) async fn handle_vote_request(&mut self, req: VoteRequest) -> RaftResult<VoteResponse> {
        // If candidate's current term is less than this nodes current term, reject.
        if req.term < self.current_term {
            tracing::trace!(%self.current_term, req.term, "req.term is less than current_term");
            return Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
            });
        }

        // Do not respond to the request if we've received a heartbeat within the election timeout minimum.
        if let Some(last_heartbeat) = self.last_heartbeat {
            let now = tokio::time::Instant::now();
            let election_timeout_min = std::time::Duration::from_millis(self.config.election_timeout_min);
            if now.saturating_duration_since(last_heartbeat) < election_timeout_min {
                tracing::trace!("rejecting vote request received within election timeout minimum");
                return Ok(VoteResponse {
                    term: self.current_term,
                    vote_granted: false,
                });
            }
        }

        // Per §5.4.2: only grant votes to a candidate which is a member of the current cluster
        // config, as non-member candidates can never be elected.
        if !self.membership.contains(&req.candidate_id) {
            tracing::trace!(
                candidate_id = req.candidate_id,
                "rejecting vote request from node not in current membership"
            );
            return Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
            });
        }

        if req.term > self.current_term {
            self.update_current_term(req.term, None);
            self.update_current_leader(UpdateCurrentLeader::Unknown);
            self.set_target_state(State::Follower);
            self.save_hard_state().await?;
        }

        // If we've already voted in this term for someone else, reject.
        if let Some(candidate_id) = self.voted_for {
            if candidate_id != req.candidate_id {
                tracing::trace!("already voted for another candidate this term, rejecting");
                return Ok(VoteResponse {
                    term: self.current_term,
                    vote_granted: false,
                });
            }
        }

        // Candidate's log must be at least as up-to-date as this node's log (§5.4.1).
        let client_is_up_to_date = req.last_log_term > self.last_log_id.term
            || (req.last_log_term == self.last_log_id.term && req.last_log_index >= self.last_log_id.index);
        if !client_is_up_to_date {
            tracing::trace!("rejecting vote request as candidate's log is not up-to-date");
            return Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
            });
        }

        self.voted_for = Some(req.candidate_id);
        self.set_target_state(State::Follower);
        self.update_next_election_timeout(false);
        self.save_hard_state().await?;

        tracing::trace!("voted for candidate {}", req.candidate_id);

        Ok(VoteResponse {
            term: self.current_term,
            vote_granted: true,
        })
    }
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> CandidateState<'a, D, R, N, S> {
    /// Send `Vote` RPCs to every other voting member of the cluster in parallel, returning a
    /// channel on which responses (paired with the responding node's ID) will arrive as they come
    /// in.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) fn spawn_parallel_vote_requests(&self) -> mpsc::UnboundedReceiver<(VoteResponse, NodeId)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let targets: Vec<NodeId> =
            self.core.membership.all_nodes().into_iter().filter(|id| id != &self.core.id).collect();

        for target in targets {
            let rpc = VoteRequest::new(
                self.core.current_term,
                self.core.id,
                self.core.last_log_id.index,
                self.core.last_log_id.term,
            );
            let network = self.core.network.clone();
            let tx_inner = tx.clone();
            let _ = tokio::spawn(
                async move {
                    match network.send_vote(target, rpc).await {
                        Ok(res) => {
                            let _ = tx_inner.send((res, target));
                        }
                        Err(err) => {
                            tracing::warn!(error=%err, target, "error sending Vote RPC to target");
                        }
                    }
                }
                .instrument(tracing::debug_span!("spawn")),
            );
        }

        rx
    }

    /// Handle a response to an outgoing `Vote` RPC, tallying votes and transitioning to leader
    /// once a majority has been reached for both the old and (if applicable) new config groups.
    #[tracing::instrument(level = "trace", skip(self, res))]
    pub(super) async fn handle_vote_response(&mut self, res: VoteResponse, target: NodeId) -> RaftResult<()> {
        if res.term > self.core.current_term {
            self.core.update_current_term(res.term, None);
            self.core.update_current_leader(crate::core::UpdateCurrentLeader::Unknown);
            self.core.set_target_state(State::Follower);
            self.core.save_hard_state().await?;
            return Ok(());
        }

        if !res.vote_granted {
            return Ok(());
        }

        if self.core.membership.members.contains(&target) {
            self.votes_granted_old += 1;
        }
        if let Some(nodes) = &self.core.membership.members_after_consensus {
            if nodes.contains(&target) {
                self.votes_granted_new += 1;
            }
        }

        let won_old = self.votes_granted_old >= self.votes_needed_old;
        let won_new = self.core.membership.members_after_consensus.is_none() || self.votes_granted_new >= self.votes_needed_new;

        if won_old && won_new {
            tracing::trace!("election won, transitioning to leader");
            self.core.set_target_state(State::Leader);
        }

        Ok(())
    }
}
