use crate::actor::WeakActorClient;
use crate::replica::{
    AppendEntriesInput, AppendEntriesReplyFromPeerError, InstallSnapshotInput, InstallSnapshotReplyFromPeerError,
    ReplicaId, ReplicaMetadata, RequestVoteInput, RequestVoteResult,
};
use crate::transport::{self, PeerClient, RaftTransport, TransportError};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

/// LocalNetwork connects replicas living in the same process, without sockets. Links between
/// replicas can be cut and restored at runtime to simulate network partitions.
///
/// Calls over a cut link (or to a replica that isn't running) fail right away, like a refused
/// connection.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    replicas: HashMap<ReplicaId, WeakActorClient>,
    // Directed links that drop every message.
    cut: HashSet<(ReplicaId, ReplicaId)>,
    isolated: HashSet<ReplicaId>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cuts every link to and from `replica_id`.
    pub fn isolate(&self, replica_id: &str) {
        self.lock().isolated.insert(ReplicaId::new(replica_id));
    }

    /// Cuts every link between the two groups. Links within a group are untouched.
    pub fn partition(&self, group_a: &[&str], group_b: &[&str]) {
        let mut inner = self.lock();
        for a in group_a {
            for b in group_b {
                inner.cut.insert((ReplicaId::new(*a), ReplicaId::new(*b)));
                inner.cut.insert((ReplicaId::new(*b), ReplicaId::new(*a)));
            }
        }
    }

    /// Cuts the link from `from` to `to` only. Calls still go the other way, but the replies to
    /// them are lost.
    pub fn cut(&self, from: &str, to: &str) {
        self.lock().cut.insert((ReplicaId::new(from), ReplicaId::new(to)));
    }

    /// Restores every link.
    pub fn heal(&self) {
        let mut inner = self.lock();
        inner.cut.clear();
        inner.isolated.clear();
    }

    pub(crate) fn register(&self, replica_id: ReplicaId, actor_client: WeakActorClient) {
        self.lock().replicas.insert(replica_id, actor_client);
    }

    fn route(&self, from: &ReplicaId, to: &ReplicaId) -> Result<WeakActorClient, String> {
        let inner = self.lock();
        if inner.isolated.contains(from)
            || inner.isolated.contains(to)
            || inner.cut.contains(&(from.clone(), to.clone()))
        {
            return Err(format!("Link {:?} -> {:?} is cut", from, to));
        }

        inner
            .replicas
            .get(to)
            .cloned()
            .ok_or_else(|| format!("Replica {:?} is not on the network", to))
    }

    // Critical sections never panic midway, so a poisoned lock still holds consistent state.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl RaftTransport for LocalNetwork {
    fn peer_client(&self, from: &ReplicaId, to: &ReplicaMetadata) -> Result<Arc<dyn PeerClient>, TransportError> {
        Ok(Arc::new(LocalPeerClient {
            network: self.clone(),
            from: from.clone(),
            to: to.replica_id().clone(),
        }))
    }
}

struct LocalPeerClient {
    network: LocalNetwork,
    from: ReplicaId,
    to: ReplicaId,
}

#[async_trait::async_trait]
impl PeerClient for LocalPeerClient {
    async fn request_vote(&self, input: RequestVoteInput) -> RequestVoteResult {
        match self.network.route(&self.from, &self.to) {
            Ok(peer) => transport::request_vote_reply(peer.request_vote(input).await),
            Err(e) => RequestVoteResult::RetryableFailure(e),
        }
    }

    async fn append_entries(&self, input: AppendEntriesInput) -> Result<(), AppendEntriesReplyFromPeerError> {
        let peer = self
            .network
            .route(&self.from, &self.to)
            .map_err(AppendEntriesReplyFromPeerError::RetryableFailure)?;
        let result = peer.append_entries(input).await;

        // The reply travels back over the reverse link.
        self.network
            .route(&self.to, &self.from)
            .map_err(AppendEntriesReplyFromPeerError::RetryableFailure)?;
        transport::append_entries_reply(result)
    }

    async fn install_snapshot(&self, input: InstallSnapshotInput) -> Result<(), InstallSnapshotReplyFromPeerError> {
        let peer = self
            .network
            .route(&self.from, &self.to)
            .map_err(InstallSnapshotReplyFromPeerError::RetryableFailure)?;
        let result = peer.install_snapshot(input).await;

        self.network
            .route(&self.to, &self.from)
            .map_err(InstallSnapshotReplyFromPeerError::RetryableFailure)?;
        transport::install_snapshot_reply(result)
    }
}
