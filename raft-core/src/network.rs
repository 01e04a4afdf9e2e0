//! The network interface a Raft node uses to communicate with its peers.

use async_trait::async_trait;

use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::InstallSnapshotRequest;
use crate::raft::InstallSnapshotResponse;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::AppData;
use crate::NodeId;

/// A trait defining the interface a Raft node uses to send RPCs to its peers.
///
/// An implementation is responsible for routing a request to the given `target` node and
/// returning the peer's response, or an error if the request could not be delivered. This
/// crate is transport agnostic: implementations are free to use gRPC, raw TCP framing, an
/// in-process channel for testing, or anything else that can move these request/response pairs
/// across the wire.
#[async_trait]
pub trait RaftNetwork<D: AppData>: Send + Sync + 'static {
    /// Send an `AppendEntries` RPC to the target node.
    async fn send_append_entries(
        &self,
        target: NodeId,
        rpc: AppendEntriesRequest<D>,
    ) -> anyhow::Result<AppendEntriesResponse>;

    /// Send a `Vote` RPC to the target node.
    async fn send_vote(&self, target: NodeId, rpc: VoteRequest) -> anyhow::Result<VoteResponse>;

    /// Send an `InstallSnapshot` RPC to the target node.
    async fn send_install_snapshot(
        &self,
        target: NodeId,
        rpc: InstallSnapshotRequest,
    ) -> anyhow::Result<InstallSnapshotResponse>;
}
