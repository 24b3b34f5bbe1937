use crate::commitlog::Index;
use crate::transport::{PeerClient, RaftTransport};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

/// ReplicaId...or maybe it should be NodeId or ServerId. Idk.
#[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub(crate) struct ReplicaId(String);

impl ReplicaId {
    pub(crate) fn new(id: impl Into<String>) -> Self {
        ReplicaId(id.into())
    }

    pub(crate) fn as_str(&self) -> &str {
        &self.0
    }

    pub(crate) fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Debug for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque application blob handed back on leader redirects.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct ReplicaInfoBlob(u128);

impl ReplicaInfoBlob {
    pub(crate) fn new(blob: u128) -> Self {
        ReplicaInfoBlob(blob)
    }

    pub(crate) fn into_inner(self) -> u128 {
        self.0
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct ReplicaMetadata {
    replica_id: ReplicaId,
    ip_addr: Ipv4Addr,
    port: u16,
    info_blob: ReplicaInfoBlob,
}

impl ReplicaMetadata {
    pub(crate) fn new(replica_id: ReplicaId, ip_addr: Ipv4Addr, port: u16, info_blob: ReplicaInfoBlob) -> Self {
        ReplicaMetadata {
            replica_id,
            ip_addr,
            port,
            info_blob,
        }
    }

    pub(crate) fn replica_id(&self) -> &ReplicaId {
        &self.replica_id
    }

    pub(crate) fn ip_addr(&self) -> Ipv4Addr {
        self.ip_addr
    }

    pub(crate) fn port(&self) -> u16 {
        self.port
    }

    pub(crate) fn info_blob(&self) -> ReplicaInfoBlob {
        self.info_blob
    }

    pub(crate) fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip_addr, self.port))
    }
}

/// The set of voting members. During a membership change the configuration is joint: both the old
/// and the new member sets must agree (separately) for an election or a commit.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct ClusterConfiguration {
    members: Vec<ReplicaMetadata>,
    old_members: Option<Vec<ReplicaMetadata>>,
}

impl ClusterConfiguration {
    pub(crate) fn stable(members: Vec<ReplicaMetadata>) -> Self {
        ClusterConfiguration {
            members,
            old_members: None,
        }
    }

    pub(crate) fn joint(old_members: Vec<ReplicaMetadata>, members: Vec<ReplicaMetadata>) -> Self {
        ClusterConfiguration {
            members,
            old_members: Some(old_members),
        }
    }

    pub(crate) fn is_joint(&self) -> bool {
        self.old_members.is_some()
    }

    pub(crate) fn members(&self) -> &[ReplicaMetadata] {
        &self.members
    }

    pub(crate) fn old_members(&self) -> Option<&[ReplicaMetadata]> {
        self.old_members.as_deref()
    }

    /// Every voter of the new and (if joint) old member sets.
    pub(crate) fn voters(&self) -> impl Iterator<Item = &ReplicaMetadata> {
        let old = self.old_members.iter().flatten();
        let members = &self.members;
        self.members
            .iter()
            .chain(old.filter(move |o| !members.iter().any(|m| m.replica_id == o.replica_id)))
    }

    pub(crate) fn voter_ids(&self) -> HashSet<ReplicaId> {
        self.voters().map(|m| m.replica_id.clone()).collect()
    }

    pub(crate) fn is_voter(&self, replica_id: &ReplicaId) -> bool {
        self.voters().any(|m| &m.replica_id == replica_id)
    }

    fn member_sets(&self) -> impl Iterator<Item = &[ReplicaMetadata]> {
        std::iter::once(self.members.as_slice()).chain(self.old_members.as_deref())
    }

    /// True if `granted` holds a majority of every member set.
    pub(crate) fn has_quorum(&self, granted: &HashSet<ReplicaId>) -> bool {
        self.member_sets().all(|set| {
            let num_granted = set.iter().filter(|m| granted.contains(&m.replica_id)).count();
            num_granted >= majority(set.len())
        })
    }

    /// Highest index replicated to a majority of every member set.
    pub(crate) fn quorum_match_index<F>(&self, matched: F) -> Option<Index>
    where
        F: Fn(&ReplicaId) -> Option<Index>,
    {
        self.member_sets()
            .map(|set| majority_match_index(set.iter().map(|m| matched(&m.replica_id)).collect()))
            .min()
            .flatten()
    }

    /// The configuration a membership change moves to: `new` alongside the current voters.
    pub(crate) fn to_joint(&self, new_members: Vec<ReplicaMetadata>) -> Self {
        ClusterConfiguration::joint(self.members.clone(), new_members)
    }

    /// The second step of a membership change: only the new member set.
    pub(crate) fn to_stable(&self) -> Self {
        ClusterConfiguration::stable(self.members.clone())
    }
}

fn majority(num_voters: usize) -> usize {
    (num_voters / 2) + 1
}

/// Highest index known to be replicated on a majority of `matched`, where `matched` holds one
/// entry per voter. An empty voter set has nothing to agree on.
pub(super) fn majority_match_index(mut matched: Vec<Option<Index>>) -> Option<Index> {
    if matched.is_empty() {
        return None;
    }

    matched.sort();
    // Sorted ascending, every value at or right of this position is held by a majority.
    let quorum_idx = (matched.len() - 1) / 2;
    matched[quorum_idx]
}

#[derive(Clone)]
struct ConfigurationEntry {
    // Log index of the entry that carried this configuration, or None for the bootstrap one.
    index: Option<Index>,
    configuration: ClusterConfiguration,
}

/// ClusterTracker knows which replicas make up the cluster as of each point in the log, and holds
/// RPC clients for the replicas we talk to.
///
/// A configuration takes effect as soon as it is appended to the log (committed or not), so the
/// tracker keeps the history of configurations that are still above the commit index in case a
/// conflicting leader truncates them.
pub(crate) struct ClusterTracker {
    my_replica_id: ReplicaId,
    history: Vec<ConfigurationEntry>,
    known_replicas: HashMap<ReplicaId, ReplicaMetadata>,
    transport: Arc<dyn RaftTransport>,
    peer_clients: HashMap<ReplicaId, Arc<dyn PeerClient>>,
}

#[derive(Clone)]
pub(crate) struct Peer {
    pub(crate) metadata: ReplicaMetadata,
    pub(crate) client: Arc<dyn PeerClient>,
}

impl ClusterTracker {
    pub(crate) fn new(
        my_replica_id: ReplicaId,
        initial_configuration: ClusterConfiguration,
        transport: Arc<dyn RaftTransport>,
    ) -> Self {
        let mut tracker = ClusterTracker {
            my_replica_id,
            history: Vec::new(),
            known_replicas: HashMap::new(),
            transport,
            peer_clients: HashMap::new(),
        };
        tracker.reset(None, initial_configuration);

        tracker
    }

    pub(crate) fn my_replica_id(&self) -> &ReplicaId {
        &self.my_replica_id
    }

    fn latest(&self) -> &ConfigurationEntry {
        // History is never empty.
        &self.history[self.history.len() - 1]
    }

    /// The configuration in effect: the latest one in the log.
    pub(crate) fn current(&self) -> &ClusterConfiguration {
        &self.latest().configuration
    }

    /// Log index of the entry that carried the current configuration.
    pub(crate) fn current_index(&self) -> Option<Index> {
        self.latest().index
    }

    /// The configuration in effect right after the entry at `index` was appended.
    pub(crate) fn configuration_at(&self, index: Index) -> &ClusterConfiguration {
        self.history
            .iter()
            .rev()
            .find(|entry| entry.index.map(|i| i <= index).unwrap_or(true))
            .map(|entry| &entry.configuration)
            .unwrap_or(&self.history[0].configuration)
    }

    pub(crate) fn on_configuration_appended(&mut self, index: Index, configuration: ClusterConfiguration) {
        self.remember(&configuration);
        self.history.push(ConfigurationEntry {
            index: Some(index),
            configuration,
        });
    }

    /// Forgets configurations carried by entries at `index` or later. Returns true if the current
    /// configuration changed.
    pub(crate) fn truncate_from(&mut self, index: Index) -> bool {
        let before = self.history.len();
        while self.history.len() > 1 && matches!(self.latest().index, Some(i) if i >= index) {
            self.history.pop();
        }
        self.history.len() != before
    }

    /// Replaces all history with a single configuration, e.g. the one inside an installed snapshot.
    pub(crate) fn reset(&mut self, index: Option<Index>, configuration: ClusterConfiguration) {
        self.remember(&configuration);
        self.history.clear();
        self.history.push(ConfigurationEntry { index, configuration });
    }

    /// Drops history no longer reachable by truncation, i.e. everything before the configuration
    /// in effect at `committed`.
    pub(crate) fn compact(&mut self, committed: Index) {
        let keep_from = self
            .history
            .iter()
            .rposition(|entry| entry.index.map(|i| i <= committed).unwrap_or(true))
            .unwrap_or(0);
        self.history.drain(..keep_from);
    }

    fn remember(&mut self, configuration: &ClusterConfiguration) {
        for member in configuration.voters() {
            self.known_replicas
                .insert(member.replica_id.clone(), member.clone());
        }
    }

    pub(crate) fn add_known_replica(&mut self, metadata: ReplicaMetadata) {
        self.known_replicas.insert(metadata.replica_id.clone(), metadata);
    }

    pub(crate) fn metadata(&self, replica_id: &ReplicaId) -> Option<&ReplicaMetadata> {
        self.known_replicas.get(replica_id)
    }

    /// True for any replica that has ever been part of a configuration we know of.
    pub(crate) fn contains_member(&self, replica_id: &ReplicaId) -> bool {
        self.known_replicas.contains_key(replica_id)
    }

    /// Voters of the current configuration, excluding me.
    pub(crate) fn peer_ids(&self) -> HashSet<ReplicaId> {
        let mut ids = self.current().voter_ids();
        ids.remove(&self.my_replica_id);
        ids
    }

    pub(crate) fn am_voter(&self) -> bool {
        self.current().is_voter(&self.my_replica_id)
    }

    pub(crate) fn peer(&mut self, replica_id: &ReplicaId) -> Option<Peer> {
        let metadata = self.known_replicas.get(replica_id)?.clone();
        let client = match self.peer_clients.get(replica_id) {
            Some(client) => client.clone(),
            None => {
                let client = self.transport.peer_client(&self.my_replica_id, &metadata).ok()?;
                self.peer_clients.insert(replica_id.clone(), client.clone());
                client
            }
        };

        Some(Peer { metadata, client })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opt_index(v: u64) -> Option<Index> {
        Index::from_u64(v)
    }

    fn member(id: &str) -> ReplicaMetadata {
        ReplicaMetadata::new(ReplicaId::new(id), Ipv4Addr::LOCALHOST, 4000, ReplicaInfoBlob::new(0))
    }

    fn ids(ids: &[&str]) -> HashSet<ReplicaId> {
        ids.iter().map(|id| ReplicaId::new(*id)).collect()
    }

    #[test]
    fn test_commit_checker_logic() {
        fn run(expected: u64, matches: Vec<u64>) {
            let matches = matches.into_iter().map(opt_index).collect();
            assert_eq!(opt_index(expected), majority_match_index(matches));
        }

        // 3-cluster
        run(0, vec![0, 0, 9]);
        run(9, vec![0, 9, 9]);
        run(9, vec![8, 9, 9]);

        // 4-cluster
        run(0, vec![0, 0, 0, 9]);
        run(0, vec![0, 0, 9, 9]);
        run(8, vec![0, 8, 9, 9]);
        run(8, vec![7, 8, 9, 9]);

        // 5-cluster
        run(0, vec![0, 0, 0, 0, 9]);
        run(0, vec![0, 0, 0, 9, 9]);
        run(8, vec![0, 0, 8, 9, 9]);
        run(8, vec![0, 7, 8, 9, 9]);
        run(8, vec![6, 7, 8, 9, 9]);

        // Leader's own durable index needn't be the highest.
        run(7, vec![9, 8, 0, 0, 7]);
        run(8, vec![7, 9, 8]);
        run(0, vec![]);
    }

    #[test]
    fn joint_quorum_needs_both_majorities() {
        let joint = ClusterConfiguration::joint(
            vec![member("a"), member("b"), member("c")],
            vec![member("c"), member("d"), member("e")],
        );

        assert!(!joint.has_quorum(&ids(&["a", "b"])));
        assert!(!joint.has_quorum(&ids(&["d", "e"])));
        assert!(joint.has_quorum(&ids(&["a", "c", "d"])));
        assert_eq!(joint.voter_ids(), ids(&["a", "b", "c", "d", "e"]));

        let matched: HashMap<&str, u64> = vec![("a", 10), ("b", 10), ("c", 3), ("d", 7), ("e", 5)]
            .into_iter()
            .collect();
        let index = joint.quorum_match_index(|id| opt_index(matched[id.as_str()]));
        // Old set agrees on 10, new set only on 5.
        assert_eq!(index, opt_index(5));
    }

    #[test]
    fn history_follows_truncation_and_compaction() {
        let base = ClusterConfiguration::stable(vec![member("a"), member("b"), member("c")]);
        let mut tracker = ClusterTracker::new(
            ReplicaId::new("a"),
            base.clone(),
            Arc::new(crate::transport::LocalNetwork::new()),
        );

        let joint = base.to_joint(vec![member("a"), member("b"), member("d")]);
        tracker.on_configuration_appended(Index::new(5), joint.clone());
        tracker.on_configuration_appended(Index::new(8), joint.to_stable());

        assert_eq!(tracker.configuration_at(Index::new(4)), &base);
        assert_eq!(tracker.configuration_at(Index::new(6)), &joint);
        assert_eq!(tracker.peer_ids(), ids(&["b", "d"]));

        assert!(tracker.truncate_from(Index::new(8)));
        assert_eq!(tracker.current(), &joint);
        assert!(!tracker.truncate_from(Index::new(9)));

        tracker.compact(Index::new(6));
        assert!(!tracker.truncate_from(Index::new(5)));
        assert_eq!(tracker.current(), &joint);
        assert!(tracker.contains_member(&ReplicaId::new("d")));
    }
}
