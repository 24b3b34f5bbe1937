use crate::grpc::grpc_raft_client::GrpcRaftClient;
use crate::replica::{
    AppendEntriesInput, AppendEntriesReplyFromPeerError, InstallSnapshotInput, InstallSnapshotReplyFromPeerError,
    ReplicaId, ReplicaMetadata, RequestVoteInput, RequestVoteResult,
};
use crate::transport::{proto, PeerClient, RaftTransport, TransportError};
use std::sync::Arc;
use tonic::transport::{Channel, Endpoint};

/// Talks to peers over gRPC. Connections are established lazily on first use and re-established
/// by tonic when they break, so creating a client never blocks on the peer being up.
pub(crate) struct GrpcTransport;

impl RaftTransport for GrpcTransport {
    fn peer_client(&self, _from: &ReplicaId, to: &ReplicaMetadata) -> Result<Arc<dyn PeerClient>, TransportError> {
        let url = format!("http://{}", to.socket_addr());
        let channel = Endpoint::from_shared(url.clone())
            .map_err(|e| TransportError::InvalidAddress(format!("{}: {}", url, e)))?
            .connect_lazy()
            .map_err(|e| TransportError::InvalidAddress(format!("{}: {}", url, e)))?;

        Ok(Arc::new(GrpcPeerClient {
            inner: GrpcRaftClient::new(channel),
        }))
    }
}

struct GrpcPeerClient {
    // Cheap to clone, clones share the underlying channel.
    inner: GrpcRaftClient<Channel>,
}

#[async_trait::async_trait]
impl PeerClient for GrpcPeerClient {
    async fn request_vote(&self, input: RequestVoteInput) -> RequestVoteResult {
        let rpc_request = proto::request_vote_req_to_proto(input);
        let rpc_reply = self.inner.clone().request_vote(rpc_request).await;

        proto::request_vote_result_from_proto(rpc_reply.map(|r| r.into_inner()))
    }

    async fn append_entries(&self, input: AppendEntriesInput) -> Result<(), AppendEntriesReplyFromPeerError> {
        let rpc_request = proto::append_entries_req_to_proto(input);
        let rpc_reply = self.inner.clone().append_entries(rpc_request).await;

        proto::append_entries_result_from_proto(rpc_reply.map(|r| r.into_inner()))
    }

    async fn install_snapshot(&self, input: InstallSnapshotInput) -> Result<(), InstallSnapshotReplyFromPeerError> {
        let rpc_request = proto::install_snapshot_req_to_proto(input);
        let rpc_reply = self.inner.clone().install_snapshot(rpc_request).await;

        proto::install_snapshot_result_from_proto(rpc_reply.map(|r| r.into_inner()))
    }
}
