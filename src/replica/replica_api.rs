use crate::commitlog::Index;
use crate::replica::cluster::{ClusterConfiguration, ReplicaId, ReplicaInfoBlob, ReplicaMetadata};
use crate::replica::election::ElectionStateSnapshot;
use crate::replica::local_state::Term;
use crate::replica::snapshot::SnapshotMetadata;
use crate::replica::WriteAheadLogEntry;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::io;
use std::net::Ipv4Addr;

// ------- Client requests --------

#[derive(Debug)]
pub(crate) struct SubmitInput {
    pub(crate) client_id: String,
    pub(crate) call_id: u64,
    pub(crate) data: Bytes,
}

#[derive(Debug)]
pub(crate) struct SubmitOutput {
    pub(crate) applied_index: Index,
    pub(crate) result: Bytes,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum SubmitError {
    #[error("I'm not leader")]
    LeaderRedirect(LeaderRedirectInfo),

    // Can be retried with exponential backoff with recommended initial delay of 200ms. Likely an
    // election is in progress.
    #[error("Cluster is in a tough shape. No one is leader.")]
    NoLeader,

    #[error("Lost leadership before the request was applied")]
    LeadershipLost,

    #[error("Too many requests in flight")]
    RetryCacheFull,

    #[error("Replica halted: {0}")]
    Halted(String),

    #[error("Replica actor is dead RIP")]
    ActorExited,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LeaderRedirectInfo {
    pub(crate) replica_id: ReplicaId,
    pub(crate) ip_addr: Ipv4Addr,
    pub(crate) port: u16,
    pub(crate) replica_blob: ReplicaInfoBlob,
}

impl From<&ReplicaMetadata> for LeaderRedirectInfo {
    fn from(metadata: &ReplicaMetadata) -> Self {
        LeaderRedirectInfo {
            replica_id: metadata.replica_id().clone(),
            ip_addr: metadata.ip_addr(),
            port: metadata.port(),
            replica_blob: metadata.info_blob(),
        }
    }
}

#[derive(Debug)]
pub(crate) struct TakeSnapshotOutput {
    pub(crate) last_included_index: Index,
    pub(crate) last_included_term: Term,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum TakeSnapshotError {
    #[error("Nothing has been applied yet")]
    NothingApplied,
    #[error("A snapshot is already being taken")]
    InProgress,
    #[error("State machine failed to take snapshot: {0}")]
    StateMachine(String),
    #[error("Failed to persist snapshot: {0:?}")]
    LocalIoError(io::Error),
    #[error("Replica halted: {0}")]
    Halted(String),
    #[error("Replica actor is dead RIP")]
    ActorExited,
}

#[derive(Debug)]
pub(crate) struct ChangeMembershipInput {
    pub(crate) new_members: Vec<ReplicaMetadata>,
}

#[derive(Debug)]
pub(crate) struct ChangeMembershipOutput {
    pub(crate) committed_index: Index,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum ChangeMembershipError {
    #[error("I'm not leader")]
    LeaderRedirect(LeaderRedirectInfo),
    #[error("Cluster is in a tough shape. No one is leader.")]
    NoLeader,
    #[error("Another membership change is in progress")]
    InProgress,
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("Lost leadership before the change was committed")]
    LeadershipLost,
    #[error("Replica halted: {0}")]
    Halted(String),
    #[error("Replica actor is dead RIP")]
    ActorExited,
}

#[derive(Debug, Clone)]
pub(crate) struct ReplicaStatus {
    pub(crate) replica_id: ReplicaId,
    pub(crate) term: Term,
    pub(crate) election_state: ElectionStateSnapshot,
    pub(crate) commit_index: Option<Index>,
    pub(crate) last_applied_index: Option<Index>,
    pub(crate) latest_entry: Option<(Term, Index)>,
    pub(crate) first_log_index: Index,
    pub(crate) snapshot_index: Option<Index>,
    pub(crate) configuration: ClusterConfiguration,
    /// Only populated on the leader.
    pub(crate) peers: Vec<PeerStatus>,
}

#[derive(Debug, Clone)]
pub(crate) struct PeerStatus {
    pub(crate) peer_id: ReplicaId,
    pub(crate) next_index: Index,
    pub(crate) match_index: Option<Index>,
    pub(crate) in_flight: usize,
    pub(crate) healthy: bool,
    pub(crate) staging: bool,
    pub(crate) installing_snapshot: bool,
    pub(crate) consecutive_failures: u32,
    pub(crate) last_ack: Option<DateTime<Utc>>,
}

// ------- RequestVote --------

#[derive(Debug, Clone)]
pub(crate) struct RequestVoteInput {
    pub(crate) candidate_term: Term,
    pub(crate) candidate_id: ReplicaId,
    pub(crate) candidate_last_log_entry: Option<(Term, Index)>,
    /// A pre-vote asks "would you vote for me" without anyone changing their term.
    pub(crate) pre_vote: bool,
}

#[derive(Debug)]
pub(crate) struct RequestVoteOutput {
    pub(crate) vote_granted: bool,
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum RequestVoteError {
    #[error("Requesting candidate is not in the cluster")]
    CandidateNotInCluster,
    #[error("Requesting candidate's term is out of date")]
    RequestTermOutOfDate(TermOutOfDateInfo),
    #[error("We (server) had an IO failure: {0:?}")]
    ServerIoError(io::Error),
    #[error("We (server) have halted")]
    Halted,
    #[error("We (server) are unavailable because actor is dead RIP")]
    ActorExited,
}

// ------- AppendEntries --------

#[derive(Debug, Clone)]
pub(crate) struct AppendEntriesInput {
    pub(crate) leader_term: Term,
    pub(crate) leader_id: ReplicaId,
    // "Previous log entry" is the log entry immediately preceding the new ones in AppendEntriesInput.
    pub(crate) leader_previous_log_entry: Option<(Term, Index)>,
    pub(crate) leader_commit_index: Option<Index>,
    pub(crate) new_entries: Vec<WriteAheadLogEntry>,
}

#[derive(Debug)]
pub(crate) struct AppendEntriesOutput {
    // Nothing
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum AppendEntriesError {
    #[error("Client is not in cluster")]
    ClientNotInCluster,
    #[error("Client's term is out of date")]
    ClientTermOutOfDate(TermOutOfDateInfo),
    /// Carries the last (term, index) we might still share with the leader.
    #[error("We (server) are missing previous log entry")]
    ServerMissingPreviousLogEntry(Option<(Term, Index)>),
    #[error("We (server) had an IO failure: {0:?}")]
    ServerIoError(io::Error),
    #[error("We (server) have halted")]
    Halted,
    #[error("We (server) are unavailable because actor is dead RIP")]
    ActorExited,
}

// ------- InstallSnapshot --------

#[derive(Debug, Clone)]
pub(crate) struct InstallSnapshotInput {
    pub(crate) leader_term: Term,
    pub(crate) leader_id: ReplicaId,
    pub(crate) metadata: SnapshotMetadata,
    pub(crate) offset: u64,
    pub(crate) data: Bytes,
    pub(crate) done: bool,
}

#[derive(Debug)]
pub(crate) struct InstallSnapshotOutput {
    // Nothing
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum InstallSnapshotError {
    #[error("Client is not in cluster")]
    ClientNotInCluster,
    #[error("Client's term is out of date")]
    ClientTermOutOfDate(TermOutOfDateInfo),
    #[error("Expected chunk at offset {expected_offset}")]
    OffsetMismatch { expected_offset: u64 },
    #[error("We (server) had an IO failure: {0:?}")]
    ServerIoError(io::Error),
    #[error("We (server) have halted")]
    Halted,
    #[error("We (server) are unavailable because actor is dead RIP")]
    ActorExited,
}

#[derive(Debug)]
pub(crate) struct TermOutOfDateInfo {
    pub(crate) current_term: Term,
}

// ------- Replies from peers, as seen by the caller --------

#[derive(Debug)]
pub(crate) struct RequestVoteReplyFromPeer {
    pub(crate) peer_id: ReplicaId,
    pub(crate) term: Term,
    pub(crate) pre_vote: bool,
    pub(crate) result: RequestVoteResult,
}

#[derive(Debug, PartialEq)]
pub(crate) enum RequestVoteResult {
    VoteGranted,
    VoteNotGranted,
    StaleTerm { new_term: Term },
    RetryableFailure(String),
}

#[derive(Debug)]
pub(crate) struct AppendEntriesReplyFromPeer {
    pub(crate) descriptor: AppendEntriesReplyFromPeerDescriptor,
    pub(crate) result: Result<(), AppendEntriesReplyFromPeerError>,
}

// This is basically info about the original request
#[derive(Debug)]
pub(crate) struct AppendEntriesReplyFromPeerDescriptor {
    pub(crate) peer_id: ReplicaId,
    pub(crate) term: Term,
    pub(crate) seq_no: u64,
    pub(crate) previous_log_entry_index: Option<Index>,
    pub(crate) num_log_entries: usize,
}

#[derive(Debug, PartialEq)]
pub(crate) enum AppendEntriesReplyFromPeerError {
    PeerMissingPreviousLogEntry(Option<(Term, Index)>),
    RetryableFailure(String),
    StaleTerm { new_term: Term },
}

#[derive(Debug)]
pub(crate) struct InstallSnapshotReplyFromPeer {
    pub(crate) peer_id: ReplicaId,
    pub(crate) term: Term,
    pub(crate) seq_no: u64,
    pub(crate) last_included_index: Index,
    /// Offset just past the chunk that was sent.
    pub(crate) end_offset: u64,
    pub(crate) done: bool,
    pub(crate) result: Result<(), InstallSnapshotReplyFromPeerError>,
}

#[derive(Debug, PartialEq)]
pub(crate) enum InstallSnapshotReplyFromPeerError {
    OffsetMismatch { expected_offset: u64 },
    RetryableFailure(String),
    StaleTerm { new_term: Term },
}

/// LeaderTimerTick contains info for a single tick of a leader's per-peer timer.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct LeaderTimerTick {
    pub(crate) peer_id: ReplicaId,
    pub(crate) term: Term,
}

/// ElectionTimeoutTick names the election timer that fired, and how many times it had been reset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct ElectionTimeoutTick {
    pub(crate) generation: u64,
    pub(crate) epoch: u64,
}
