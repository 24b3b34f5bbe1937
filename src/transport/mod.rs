mod grpc;
mod local;
mod proto;

pub(crate) use grpc::GrpcTransport;
pub use local::LocalNetwork;
pub(crate) use proto::append_entries_req_from_proto;
pub(crate) use proto::append_entries_result_to_proto;
pub(crate) use proto::install_snapshot_req_from_proto;
pub(crate) use proto::install_snapshot_result_to_proto;
pub(crate) use proto::request_vote_req_from_proto;
pub(crate) use proto::request_vote_result_to_proto;

use crate::replica::{
    AppendEntriesError, AppendEntriesInput, AppendEntriesOutput, AppendEntriesReplyFromPeerError,
    InstallSnapshotError, InstallSnapshotInput, InstallSnapshotOutput, InstallSnapshotReplyFromPeerError, ReplicaId,
    ReplicaMetadata, RequestVoteError, RequestVoteInput, RequestVoteOutput, RequestVoteResult,
};
use std::sync::Arc;

/// How replicas of a cluster reach each other.
#[derive(Clone)]
pub enum RaftNetwork {
    /// Each replica serves gRPC on its member address.
    Grpc,
    /// Every replica lives in this process, on the given network.
    Local(LocalNetwork),
}

/// PeerClient is the caller's side of the three Raft RPCs, as seen by the leader or candidate.
/// Implementations never fail outright: anything that goes wrong on the way is a retryable
/// failure.
#[async_trait::async_trait]
pub(crate) trait PeerClient: Send + Sync {
    async fn request_vote(&self, input: RequestVoteInput) -> RequestVoteResult;

    async fn append_entries(&self, input: AppendEntriesInput) -> Result<(), AppendEntriesReplyFromPeerError>;

    async fn install_snapshot(&self, input: InstallSnapshotInput) -> Result<(), InstallSnapshotReplyFromPeerError>;
}

/// Creates clients for peers as they join the cluster.
pub(crate) trait RaftTransport: Send + Sync {
    fn peer_client(&self, from: &ReplicaId, to: &ReplicaMetadata) -> Result<Arc<dyn PeerClient>, TransportError>;
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum TransportError {
    #[error("Invalid peer address {0}")]
    InvalidAddress(String),
}

// The functions below are what a peer's reply means to the caller. The gRPC transport gets the
// same answers by way of the proto conversions.

pub(crate) fn request_vote_reply(result: Result<RequestVoteOutput, RequestVoteError>) -> RequestVoteResult {
    match result {
        Ok(RequestVoteOutput { vote_granted: true }) => RequestVoteResult::VoteGranted,
        Ok(RequestVoteOutput { vote_granted: false }) | Err(RequestVoteError::CandidateNotInCluster) => {
            RequestVoteResult::VoteNotGranted
        }
        Err(RequestVoteError::RequestTermOutOfDate(info)) => RequestVoteResult::StaleTerm {
            new_term: info.current_term,
        },
        Err(e) => RequestVoteResult::RetryableFailure(e.to_string()),
    }
}

pub(crate) fn append_entries_reply(
    result: Result<AppendEntriesOutput, AppendEntriesError>,
) -> Result<(), AppendEntriesReplyFromPeerError> {
    match result {
        Ok(_) => Ok(()),
        Err(AppendEntriesError::ClientTermOutOfDate(info)) => Err(AppendEntriesReplyFromPeerError::StaleTerm {
            new_term: info.current_term,
        }),
        Err(AppendEntriesError::ServerMissingPreviousLogEntry(hint)) => {
            Err(AppendEntriesReplyFromPeerError::PeerMissingPreviousLogEntry(hint))
        }
        Err(e) => Err(AppendEntriesReplyFromPeerError::RetryableFailure(e.to_string())),
    }
}

pub(crate) fn install_snapshot_reply(
    result: Result<InstallSnapshotOutput, InstallSnapshotError>,
) -> Result<(), InstallSnapshotReplyFromPeerError> {
    match result {
        Ok(_) => Ok(()),
        Err(InstallSnapshotError::ClientTermOutOfDate(info)) => Err(InstallSnapshotReplyFromPeerError::StaleTerm {
            new_term: info.current_term,
        }),
        Err(InstallSnapshotError::OffsetMismatch { expected_offset }) => {
            Err(InstallSnapshotReplyFromPeerError::OffsetMismatch { expected_offset })
        }
        Err(e) => Err(InstallSnapshotReplyFromPeerError::RetryableFailure(e.to_string())),
    }
}
