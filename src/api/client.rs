use crate::actor::ActorClient;
use crate::api::event_bus::RaftEventListener;
use crate::api::replicated_log::ReplicatedLog;
use crate::api::types::{RaftLeaderInfo, RaftMemberInfo, RaftStatus};
use crate::replica;
use crate::replica::ReplicaMetadata;

/// RaftClient is everything the application gets to drive its local replica. Dropping every clone
/// of it (and of its `ReplicatedLog`) stops the replica.
#[derive(Clone)]
pub struct RaftClient {
    pub(super) actor_client: ActorClient,
    pub(super) replicated_log: ReplicatedLog,
    pub(super) event_listener: RaftEventListener,
}

impl RaftClient {
    pub fn replicated_log(&self) -> ReplicatedLog {
        self.replicated_log.clone()
    }

    pub fn event_listener(&self) -> RaftEventListener {
        self.event_listener.clone()
    }

    pub async fn status(&self) -> Result<RaftStatus, ReplicaExited> {
        self.actor_client
            .status()
            .await
            .map(RaftStatus::from)
            .map_err(|_| ReplicaExited)
    }

    /// Snapshots the state machine at the last entry handed to it and compacts the log below.
    pub async fn take_snapshot(&self) -> Result<SnapshotInfo, TakeSnapshotError> {
        self.actor_client
            .take_snapshot()
            .await
            .map(|output| SnapshotInfo {
                last_included_index: output.last_included_index.as_u64(),
                last_included_term: output.last_included_term.as_u64(),
            })
            .map_err(TakeSnapshotError::from)
    }

    /// Replaces the voting members with `new_members`. Only the leader accepts this. New members
    /// first catch up without voting, then the cluster moves through a joint configuration of
    /// old and new members. Returns once the new configuration is committed.
    pub async fn change_membership(&self, new_members: Vec<RaftMemberInfo>) -> Result<u64, ChangeMembershipError> {
        let input = replica::ChangeMembershipInput {
            new_members: new_members.into_iter().map(ReplicaMetadata::from).collect(),
        };

        self.actor_client
            .change_membership(input)
            .await
            .map(|output| output.committed_index.as_u64())
            .map_err(ChangeMembershipError::from)
    }

    /// Stops the replica: timers, peer replication, the RPC server and the state machine task.
    /// Pending requests fail with `SubmitError::ReplicaExited`.
    pub async fn shutdown(&self) {
        self.actor_client.shutdown().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub last_included_index: u64,
    pub last_included_term: u64,
}

#[derive(Debug, thiserror::Error)]
#[error("Replica task has exited")]
pub struct ReplicaExited;

#[derive(Debug, thiserror::Error)]
pub enum TakeSnapshotError {
    #[error("Nothing has been applied yet")]
    NothingApplied,
    #[error("A snapshot is already being taken")]
    InProgress,
    #[error("State machine failed to take snapshot: {0}")]
    StateMachine(String),
    #[error("Failed to persist snapshot: {0}")]
    LocalIoError(std::io::Error),
    #[error("Replica halted: {0}")]
    Halted(String),
    #[error("Replica task has exited")]
    ReplicaExited,
}

#[derive(Debug, thiserror::Error)]
pub enum ChangeMembershipError {
    #[error("I'm not leader")]
    NotLeader(Option<RaftLeaderInfo>),
    #[error("Cluster is in a tough shape. No one is leader.")]
    NoLeader,
    #[error("Another membership change is in progress")]
    InProgress,
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("Leader lost leadership before the change was committed")]
    LeadershipLost,
    #[error("Replica halted: {0}")]
    Halted(String),
    #[error("Replica task has exited")]
    ReplicaExited,
}

// ------- Conversions --------

impl From<replica::TakeSnapshotError> for TakeSnapshotError {
    fn from(internal_error: replica::TakeSnapshotError) -> Self {
        match internal_error {
            replica::TakeSnapshotError::NothingApplied => TakeSnapshotError::NothingApplied,
            replica::TakeSnapshotError::InProgress => TakeSnapshotError::InProgress,
            replica::TakeSnapshotError::StateMachine(e) => TakeSnapshotError::StateMachine(e),
            replica::TakeSnapshotError::LocalIoError(e) => TakeSnapshotError::LocalIoError(e),
            replica::TakeSnapshotError::Halted(reason) => TakeSnapshotError::Halted(reason),
            replica::TakeSnapshotError::ActorExited => TakeSnapshotError::ReplicaExited,
        }
    }
}

impl From<replica::ChangeMembershipError> for ChangeMembershipError {
    fn from(internal_error: replica::ChangeMembershipError) -> Self {
        match internal_error {
            replica::ChangeMembershipError::LeaderRedirect(leader_info) => {
                ChangeMembershipError::NotLeader(Some(RaftLeaderInfo::from(leader_info)))
            }
            replica::ChangeMembershipError::NoLeader => ChangeMembershipError::NoLeader,
            replica::ChangeMembershipError::InProgress => ChangeMembershipError::InProgress,
            replica::ChangeMembershipError::InvalidConfiguration(e) => ChangeMembershipError::InvalidConfiguration(e),
            replica::ChangeMembershipError::LeadershipLost => ChangeMembershipError::LeadershipLost,
            replica::ChangeMembershipError::Halted(reason) => ChangeMembershipError::Halted(reason),
            replica::ChangeMembershipError::ActorExited => ChangeMembershipError::ReplicaExited,
        }
    }
}
