use crate::commitlog::index_as_u64;
use crate::replica;
use crate::replica::{ElectionStateSnapshot, ReplicaInfoBlob};
use chrono::{DateTime, Utc};
use std::net::Ipv4Addr;

#[derive(Clone, Debug)]
pub struct RaftMemberInfo {
    pub replica_id: String,
    pub ip_addr: Ipv4Addr,
    pub raft_internal_rpc_port: u16,
    pub peer_redirect_info_blob: RaftMemberInfoBlob,
}

impl From<RaftMemberInfo> for replica::ReplicaMetadata {
    fn from(member_info: RaftMemberInfo) -> Self {
        Self::new(
            replica::ReplicaId::new(member_info.replica_id),
            member_info.ip_addr,
            member_info.raft_internal_rpc_port,
            replica::ReplicaInfoBlob::from(member_info.peer_redirect_info_blob),
        )
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RaftLeaderInfo {
    pub replica_id: String,
    pub ip: Ipv4Addr,
    pub port: u16,
    pub info_blob: RaftMemberInfoBlob,
}

impl From<replica::LeaderRedirectInfo> for RaftLeaderInfo {
    fn from(internal_leader: replica::LeaderRedirectInfo) -> Self {
        Self {
            replica_id: internal_leader.replica_id.into_inner(),
            ip: internal_leader.ip_addr,
            port: internal_leader.port,
            info_blob: RaftMemberInfoBlob::from(internal_leader.replica_blob),
        }
    }
}

/// We allow application layer to provide an arbitrary blob of info about each member
/// that will be returned back to the application layer if we leader-redirect the
/// application to that member.
#[derive(Copy, Clone, Debug, Eq, PartialOrd, PartialEq)]
pub struct RaftMemberInfoBlob(u128);

impl RaftMemberInfoBlob {
    pub fn new(blob: u128) -> Self {
        RaftMemberInfoBlob(blob)
    }
}

impl From<RaftMemberInfoBlob> for replica::ReplicaInfoBlob {
    fn from(external_info_blob: RaftMemberInfoBlob) -> Self {
        Self::new(external_info_blob.0)
    }
}

impl From<replica::ReplicaInfoBlob> for RaftMemberInfoBlob {
    fn from(internal_info_blob: ReplicaInfoBlob) -> Self {
        Self::new(internal_info_blob.into_inner())
    }
}

// ------- Status --------

/// Point-in-time view of the local replica, for operational tooling. Index 0 means "none".
#[derive(Clone, Debug)]
pub struct RaftStatus {
    pub replica_id: String,
    pub term: u64,
    pub role: RaftRole,
    pub leader: Option<RaftLeaderInfo>,
    pub commit_index: u64,
    pub last_applied_index: u64,
    pub latest_log_index: u64,
    pub first_log_index: u64,
    pub snapshot_index: u64,
    pub members: Vec<String>,
    /// Only set while a membership change is between its two steps.
    pub old_members: Option<Vec<String>>,
    /// Replication progress per peer. Only reported by the leader.
    pub peers: Vec<RaftPeerStatus>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RaftRole {
    Leader,
    Candidate,
    PreCandidate,
    Follower,
    /// The replica hit an unrecoverable error and no longer takes part in the cluster.
    Halted(String),
}

#[derive(Clone, Debug)]
pub struct RaftPeerStatus {
    pub replica_id: String,
    pub next_index: u64,
    pub match_index: u64,
    pub in_flight_requests: usize,
    /// False if the peer hasn't answered within the slowness timeout.
    pub healthy: bool,
    /// Being added to the cluster. Receives the log but doesn't vote yet.
    pub staging: bool,
    pub installing_snapshot: bool,
    /// Requests that failed in a row since the peer last answered.
    pub consecutive_failures: u32,
    pub last_ack: Option<DateTime<Utc>>,
}

impl From<replica::ReplicaStatus> for RaftStatus {
    fn from(status: replica::ReplicaStatus) -> Self {
        let (role, leader) = match status.election_state {
            ElectionStateSnapshot::Leader => (RaftRole::Leader, None),
            ElectionStateSnapshot::Candidate => (RaftRole::Candidate, None),
            ElectionStateSnapshot::PreCandidate => (RaftRole::PreCandidate, None),
            ElectionStateSnapshot::Follower(ref leader) => (RaftRole::Follower, Some(RaftLeaderInfo::from(leader.clone()))),
            ElectionStateSnapshot::FollowerNoLeader => (RaftRole::Follower, None),
            ElectionStateSnapshot::Halted(ref reason) => (RaftRole::Halted(reason.clone()), None),
        };
        let member_ids = |members: &[replica::ReplicaMetadata]| {
            members
                .iter()
                .map(|m| m.replica_id().as_str().to_string())
                .collect::<Vec<_>>()
        };

        // A leader reports itself as the leader.
        let leader = match role {
            RaftRole::Leader => own_leader_info(&status),
            _ => leader,
        };

        RaftStatus {
            leader,
            replica_id: status.replica_id.into_inner(),
            term: status.term.as_u64(),
            role,
            commit_index: index_as_u64(status.commit_index),
            last_applied_index: index_as_u64(status.last_applied_index),
            latest_log_index: index_as_u64(status.latest_entry.map(|(_, index)| index)),
            first_log_index: status.first_log_index.as_u64(),
            snapshot_index: index_as_u64(status.snapshot_index),
            members: member_ids(status.configuration.members()),
            old_members: status.configuration.old_members().map(member_ids),
            peers: status.peers.into_iter().map(RaftPeerStatus::from).collect(),
        }
    }
}

fn own_leader_info(status: &replica::ReplicaStatus) -> Option<RaftLeaderInfo> {
    status
        .configuration
        .voters()
        .find(|m| m.replica_id() == &status.replica_id)
        .map(|m| RaftLeaderInfo::from(replica::LeaderRedirectInfo::from(m)))
}

impl From<replica::PeerStatus> for RaftPeerStatus {
    fn from(peer: replica::PeerStatus) -> Self {
        RaftPeerStatus {
            replica_id: peer.peer_id.into_inner(),
            next_index: peer.next_index.as_u64(),
            match_index: index_as_u64(peer.match_index),
            in_flight_requests: peer.in_flight,
            healthy: peer.healthy,
            staging: peer.staging,
            installing_snapshot: peer.installing_snapshot,
            consecutive_failures: peer.consecutive_failures,
            last_ack: peer.last_ack,
        }
    }
}
