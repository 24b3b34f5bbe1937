use crate::actor::WeakActorClient;
use crate::commitlog::Index;
use crate::replica::cluster::Peer;
use crate::replica::election::timers::LeaderTimerHandle;
use crate::replica::peer_sender::PeerSender;
use crate::replica::snapshot::Snapshot;
use crate::replica::{
    AppendEntriesInput, AppendEntriesReplyFromPeerDescriptor, InstallSnapshotInput, PeerStatus, ReplicaId, Term,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::cmp;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::time::{Duration, Instant};

/// Everything needed to start talking to a new peer while leader of `term`.
pub(super) struct PeerSpawnContext {
    pub(super) logger: slog::Logger,
    pub(super) term: Term,
    pub(super) heartbeat_duration: Duration,
    pub(super) rpc_timeout: Duration,
    pub(super) outstanding_appends_max: usize,
    pub(super) actor_client: WeakActorClient,
}

pub(crate) struct LeaderStateTracker {
    peer_state: HashMap<ReplicaId, PeerState>,
    spawn_context: PeerSpawnContext,
    became_leader_at: Instant,
}

impl LeaderStateTracker {
    pub(super) fn new(spawn_context: PeerSpawnContext) -> Self {
        LeaderStateTracker {
            peer_state: HashMap::new(),
            spawn_context,
            became_leader_at: Instant::now(),
        }
    }

    /// Starts replicating to `peer` from `next_index`. Staging peers receive the log but don't
    /// count towards quorum. No-op if already tracked.
    pub(crate) fn add_peer(&mut self, peer: Peer, next_index: Index, staging: bool) {
        let peer_id = peer.metadata.replica_id().clone();
        if self.peer_state.contains_key(&peer_id) {
            return;
        }

        let ctx = &self.spawn_context;
        let logger = ctx.logger.new(slog::o!("Peer" => peer_id.as_str().to_string()));
        let sender = PeerSender::spawn(
            logger,
            peer_id.clone(),
            peer.client,
            ctx.rpc_timeout,
            ctx.outstanding_appends_max,
            ctx.actor_client.clone(),
        );
        // Timer fires right away, which makes us announce ourselves to the peer ASAP.
        let timer = LeaderTimerHandle::spawn_timer_task(
            ctx.heartbeat_duration,
            ctx.actor_client.clone(),
            peer_id.clone(),
            ctx.term,
        );

        let state = PeerState::new(peer_id.clone(), ctx.term, timer, sender, next_index, staging);
        self.peer_state.insert(peer_id, state);
    }

    /// Stops replicating to a peer. Its sender and timer tasks exit on drop.
    pub(crate) fn remove_peer(&mut self, peer_id: &ReplicaId) -> bool {
        self.peer_state.remove(peer_id).is_some()
    }

    pub(crate) fn peer_state(&self, peer_id: &ReplicaId) -> Option<&PeerState> {
        self.peer_state.get(peer_id)
    }

    pub(crate) fn peer_state_mut(&mut self, peer_id: &ReplicaId) -> Option<&mut PeerState> {
        self.peer_state.get_mut(peer_id)
    }

    pub(crate) fn peer_ids(&self) -> HashSet<ReplicaId> {
        self.peer_state.keys().cloned().collect()
    }

    pub(crate) fn peers_iter(&self) -> impl Iterator<Item = &PeerState> {
        self.peer_state.values()
    }

    pub(crate) fn peers_iter_mut(&mut self) -> impl Iterator<Item = &mut PeerState> {
        self.peer_state.values_mut()
    }

    pub(crate) fn became_leader_at(&self) -> Instant {
        self.became_leader_at
    }

    /// Peers we've heard from at or after `cutoff`.
    pub(crate) fn peers_acked_since(&self, cutoff: Instant) -> HashSet<ReplicaId> {
        self.peer_state
            .values()
            .filter(|ps| ps.last_ack.map(|t| t >= cutoff).unwrap_or(false))
            .map(|ps| ps.peer_id.clone())
            .collect()
    }
}

/// A request that has been handed to the peer's sender and not answered yet.
#[derive(Debug)]
struct InFlight {
    seq_no: u64,
}

/// Progress of sending our latest snapshot to a peer whose next entry has been purged.
pub(crate) struct SnapshotTransfer {
    snapshot: Arc<Snapshot>,
    offset: u64,
    in_flight_seq_no: Option<u64>,
}

pub(crate) struct PeerState {
    peer_id: ReplicaId,
    term: Term,
    // Held to send heartbeats for this peer
    leader_timer_handle: LeaderTimerHandle,
    sender: PeerSender,

    // > index of the next log entry to send to that server
    // > (initialized to leader last log index + 1)
    // We advance it optimistically when sending, so several requests can be in flight.
    next: Index,
    // > index of highest log entry known to be replicated on server
    // > (initialized to 0, increases monotonically)
    matched: Option<Index>,

    // SeqNo is a form of a logical clock that tracks a term leader's interactions with a peer.
    // Each request gets the next SeqNo. Replies whose SeqNo is no longer in the window are
    // stale and get discarded.
    last_sent_seq_no: u64,
    in_flight: VecDeque<InFlight>,

    staging: bool,
    created_at: Instant,
    last_sent: Option<Instant>,
    last_ack: Option<Instant>,
    last_ack_wall: Option<DateTime<Utc>>,
    consecutive_failures: u32,
    snapshot_transfer: Option<SnapshotTransfer>,
}

impl PeerState {
    fn new(
        peer_id: ReplicaId,
        term: Term,
        leader_timer_handle: LeaderTimerHandle,
        sender: PeerSender,
        next: Index,
        staging: bool,
    ) -> Self {
        PeerState {
            peer_id,
            term,
            leader_timer_handle,
            sender,
            next,
            matched: None,
            last_sent_seq_no: 0,
            in_flight: VecDeque::new(),
            staging,
            created_at: Instant::now(),
            last_sent: None,
            last_ack: None,
            last_ack_wall: None,
            consecutive_failures: 0,
            snapshot_transfer: None,
        }
    }

    pub(crate) fn peer_id(&self) -> &ReplicaId {
        &self.peer_id
    }

    pub(crate) fn next_index(&self) -> Index {
        self.next
    }

    pub(crate) fn matched(&self) -> Option<Index> {
        self.matched
    }

    pub(crate) fn is_staging(&self) -> bool {
        self.staging
    }

    pub(crate) fn promote(&mut self) {
        self.staging = false;
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub(crate) fn installing_snapshot(&self) -> bool {
        self.snapshot_transfer.is_some()
    }

    pub(crate) fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Healthy peers have answered within `slowness_timeout`. A brand new peer gets the benefit
    /// of the doubt for the same duration.
    pub(crate) fn is_healthy(&self, now: Instant, slowness_timeout: Duration) -> bool {
        let last_heard = self.last_ack.unwrap_or(self.created_at);
        now.saturating_duration_since(last_heard) <= slowness_timeout
    }

    /// Caught up enough to be made a voter.
    pub(crate) fn is_caught_up(&self, commit_index: Option<Index>, catchup_gap: u64) -> bool {
        let committed = commit_index.map(|i| i.as_u64()).unwrap_or(0);
        let matched = self.matched.map(|i| i.as_u64()).unwrap_or(0);
        committed.saturating_sub(matched) <= catchup_gap
    }

    pub(crate) fn can_send_append_entries(&self, max_outstanding: usize) -> bool {
        self.snapshot_transfer.is_none() && self.in_flight.len() < max_outstanding
    }

    /// Queues an AppendEntries for the peer. `input` must start right after `next - 1`.
    pub(crate) fn send_append_entries(&mut self, input: AppendEntriesInput, now: Instant) {
        let previous_log_entry_index = input.leader_previous_log_entry.map(|(_, i)| i);
        let num_log_entries = input.new_entries.len();
        let seq_no = self.next_seq_no();

        let descriptor = AppendEntriesReplyFromPeerDescriptor {
            peer_id: self.peer_id.clone(),
            term: self.term,
            seq_no,
            previous_log_entry_index,
            num_log_entries,
        };

        if num_log_entries > 0 {
            let sent_up_to = match previous_log_entry_index {
                Some(prev) => prev.plus(num_log_entries as u64),
                None => Index::new_usize(num_log_entries),
            };
            self.next = cmp::max(self.next, sent_up_to.plus(1));
        }

        self.in_flight.push_back(InFlight { seq_no });
        self.last_sent = Some(now);
        self.sender.send_append_entries(input, descriptor);
        self.leader_timer_handle.reset_heartbeat_timer();
    }

    pub(crate) fn handle_append_entries_result(
        &mut self,
        logger: &slog::Logger,
        received_seq_no: u64,
        update: PeerStateUpdate,
        now: Instant,
    ) -> bool {
        if !self.take_in_flight(received_seq_no) {
            slog::debug!(
                logger,
                "Dropping out of date seq-no({:?}): {:?}",
                received_seq_no,
                update
            );
            return false;
        }

        match update {
            PeerStateUpdate::Success {
                previous_log_entry,
                num_entries_replicated,
            } => {
                self.record_ack(now);
                let replicated_up_to = match (previous_log_entry, num_entries_replicated) {
                    (prev, 0) => prev,
                    (None, n) => Some(Index::new_usize(n)),
                    (Some(prev), n) => Some(prev.plus(n as u64)),
                };
                if let Some(new_matched) = replicated_up_to {
                    self.ratchet_fwd_matched(new_matched);
                }
            }
            PeerStateUpdate::PeerLogBehind { new_next } => {
                self.record_ack(now);
                // Whatever else is in flight was built on the wrong next index.
                self.abandon_in_flight();
                self.next = self.clamp_to_matched(new_next);
            }
            PeerStateUpdate::OtherError { previous_log_entry } => {
                self.consecutive_failures += 1;
                self.abandon_in_flight();
                let retry_from = previous_log_entry
                    .map(|i| i.plus(1))
                    .unwrap_or_else(Index::start_index);
                self.next = self.clamp_to_matched(cmp::min(self.next, retry_from));
            }
        }

        true
    }

    fn clamp_to_matched(&self, next: Index) -> Index {
        match self.matched {
            Some(matched) => cmp::max(next, matched.plus(1)),
            None => next,
        }
    }

    fn ratchet_fwd_matched(&mut self, new_matched: Index) {
        if self.matched.map(|m| new_matched > m).unwrap_or(true) {
            self.matched = Some(new_matched);
        }
        self.next = cmp::max(self.next, new_matched.plus(1));
    }

    fn record_ack(&mut self, now: Instant) {
        self.last_ack = Some(now);
        self.last_ack_wall = Some(Utc::now());
        self.consecutive_failures = 0;
    }

    /// Removes `seq_no` (and anything sent before it) from the window. False if it wasn't there.
    fn take_in_flight(&mut self, seq_no: u64) -> bool {
        if !self.in_flight.iter().any(|f| f.seq_no == seq_no) {
            return false;
        }
        while let Some(front) = self.in_flight.pop_front() {
            if front.seq_no == seq_no {
                break;
            }
        }
        true
    }

    fn abandon_in_flight(&mut self) {
        self.in_flight.clear();
        self.sender.discard_queued();
    }

    fn next_seq_no(&mut self) -> u64 {
        self.last_sent_seq_no += 1;
        self.last_sent_seq_no
    }

    // ------- Snapshot transfer --------

    /// Switches the peer over to receiving `snapshot`. Anything in flight is abandoned.
    pub(crate) fn start_snapshot_transfer(&mut self, snapshot: Arc<Snapshot>) {
        self.abandon_in_flight();
        self.snapshot_transfer = Some(SnapshotTransfer {
            snapshot,
            offset: 0,
            in_flight_seq_no: None,
        });
    }

    pub(crate) fn snapshot_transfer_index(&self) -> Option<Index> {
        self.snapshot_transfer
            .as_ref()
            .map(|t| t.snapshot.metadata.last_included_index)
    }

    /// Sends the next chunk, unless one is already in flight. Returns true if a chunk was sent.
    pub(crate) fn send_next_snapshot_chunk(
        &mut self,
        leader_id: &ReplicaId,
        chunk_size_max: usize,
        now: Instant,
    ) -> bool {
        let seq_no = self.last_sent_seq_no + 1;
        let (input, transfer_seq) = match self.snapshot_transfer.as_mut() {
            Some(transfer) if transfer.in_flight_seq_no.is_none() => {
                let size = transfer.snapshot.data.len();
                let start = cmp::min(transfer.offset as usize, size);
                let end = cmp::min(start + chunk_size_max.max(1), size);
                let input = InstallSnapshotInput {
                    leader_term: self.term,
                    leader_id: leader_id.clone(),
                    metadata: transfer.snapshot.metadata.clone(),
                    offset: start as u64,
                    data: Bytes::copy_from_slice(&transfer.snapshot.data[start..end]),
                    done: end == size,
                };
                transfer.in_flight_seq_no = Some(seq_no);
                (input, seq_no)
            }
            _ => return false,
        };

        self.last_sent_seq_no = transfer_seq;
        self.last_sent = Some(now);
        self.sender.send_install_snapshot(input, transfer_seq);
        self.leader_timer_handle.reset_heartbeat_timer();
        true
    }

    /// Returns true if the reply was for the chunk in flight.
    pub(crate) fn handle_install_snapshot_result(
        &mut self,
        logger: &slog::Logger,
        received_seq_no: u64,
        update: SnapshotChunkUpdate,
        now: Instant,
    ) -> bool {
        let transfer = match self.snapshot_transfer.as_mut() {
            Some(t) if t.in_flight_seq_no == Some(received_seq_no) => t,
            _ => {
                slog::debug!(logger, "Dropping out of date snapshot reply seq-no({:?})", received_seq_no);
                return false;
            }
        };
        transfer.in_flight_seq_no = None;

        match update {
            SnapshotChunkUpdate::Accepted { end_offset, done: false } => {
                transfer.offset = end_offset;
                self.record_ack(now);
            }
            SnapshotChunkUpdate::Accepted { done: true, .. } => {
                let installed = transfer.snapshot.metadata.last_included_index;
                self.snapshot_transfer = None;
                self.record_ack(now);
                self.ratchet_fwd_matched(installed);
                self.next = installed.plus(1);
                slog::info!(logger, "Peer installed snapshot up to {:?}", installed);
            }
            SnapshotChunkUpdate::Restart => {
                transfer.offset = 0;
                self.record_ack(now);
            }
            SnapshotChunkUpdate::Failed => {
                transfer.offset = 0;
                self.consecutive_failures += 1;
            }
        }

        true
    }

    /// Gives up on an ongoing transfer, e.g. because a newer snapshot replaced it. A reply to a
    /// chunk still in flight is dropped as out of date.
    pub(crate) fn cancel_snapshot_transfer(&mut self) {
        self.snapshot_transfer = None;
    }

    pub(crate) fn status(&self, now: Instant, slowness_timeout: Duration) -> PeerStatus {
        PeerStatus {
            peer_id: self.peer_id.clone(),
            next_index: self.next,
            match_index: self.matched,
            in_flight: self.in_flight.len(),
            healthy: self.is_healthy(now, slowness_timeout),
            staging: self.staging,
            installing_snapshot: self.snapshot_transfer.is_some(),
            consecutive_failures: self.consecutive_failures,
            last_ack: self.last_ack_wall,
        }
    }
}

#[derive(Debug)]
pub(crate) enum PeerStateUpdate {
    Success {
        previous_log_entry: Option<Index>,
        num_entries_replicated: usize,
    },
    /// Peer rejected our previous entry. `new_next` is where the leader wants to retry from.
    PeerLogBehind { new_next: Index },
    OtherError { previous_log_entry: Option<Index> },
}

#[derive(Debug)]
pub(crate) enum SnapshotChunkUpdate {
    Accepted { end_offset: u64, done: bool },
    /// Peer lost track of the transfer. Start over.
    Restart,
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::ActorClient;
    use crate::replica::cluster::{ReplicaInfoBlob, ReplicaMetadata};
    use crate::replica::{ClusterConfiguration, EntryPayload, WriteAheadLogEntry};
    use crate::transport::LocalNetwork;
    use crate::transport::RaftTransport;
    use std::net::Ipv4Addr;

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn tracker(actor_client: &ActorClient) -> LeaderStateTracker {
        LeaderStateTracker::new(PeerSpawnContext {
            logger: test_logger(),
            term: Term::new(3),
            heartbeat_duration: Duration::from_secs(60),
            rpc_timeout: Duration::from_millis(100),
            outstanding_appends_max: 8,
            actor_client: actor_client.weak(),
        })
    }

    fn peer(id: &str) -> Peer {
        let metadata = ReplicaMetadata::new(ReplicaId::new(id), Ipv4Addr::LOCALHOST, 0, ReplicaInfoBlob::new(0));
        // Nobody is registered on this network, so every call fails fast.
        let client = LocalNetwork::new()
            .peer_client(&ReplicaId::new("leader"), &metadata)
            .unwrap();
        Peer { metadata, client }
    }

    fn append(prev: Option<u64>, num_entries: usize) -> AppendEntriesInput {
        AppendEntriesInput {
            leader_term: Term::new(3),
            leader_id: ReplicaId::new("leader"),
            leader_previous_log_entry: prev.map(|i| (Term::new(3), Index::new(i))),
            leader_commit_index: None,
            new_entries: (0..num_entries)
                .map(|_| WriteAheadLogEntry {
                    term: Term::new(3),
                    payload: EntryPayload::NoOp,
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn window_advances_optimistically_and_ratchets_matched() {
        let (actor_client, _rx) = ActorClient::new(100);
        let mut tracker = tracker(&actor_client);
        let peer_id = ReplicaId::new("p1");
        tracker.add_peer(peer("p1"), Index::new(5), false);
        let logger = test_logger();
        let now = Instant::now();

        let ps = tracker.peer_state_mut(&peer_id).unwrap();
        ps.send_append_entries(append(Some(4), 3), now);
        ps.send_append_entries(append(Some(7), 2), now);
        assert_eq!(ps.next_index(), Index::new(10));
        assert_eq!(ps.in_flight(), 2);
        assert!(!ps.can_send_append_entries(2));

        // Second reply acks everything before it too.
        assert!(ps.handle_append_entries_result(
            &logger,
            2,
            PeerStateUpdate::Success {
                previous_log_entry: Some(Index::new(7)),
                num_entries_replicated: 2,
            },
            now,
        ));
        assert_eq!(ps.matched(), Some(Index::new(9)));
        assert_eq!(ps.in_flight(), 0);

        // Reply to seq 1 is now stale.
        assert!(!ps.handle_append_entries_result(
            &logger,
            1,
            PeerStateUpdate::Success {
                previous_log_entry: Some(Index::new(4)),
                num_entries_replicated: 3,
            },
            now,
        ));
        assert_eq!(ps.matched(), Some(Index::new(9)));
    }

    #[tokio::test]
    async fn rejection_rewinds_but_never_below_matched() {
        let (actor_client, _rx) = ActorClient::new(100);
        let mut tracker = tracker(&actor_client);
        let peer_id = ReplicaId::new("p1");
        tracker.add_peer(peer("p1"), Index::new(10), false);
        let logger = test_logger();
        let now = Instant::now();

        let ps = tracker.peer_state_mut(&peer_id).unwrap();
        ps.send_append_entries(append(Some(9), 0), now);
        ps.handle_append_entries_result(&logger, 1, PeerStateUpdate::PeerLogBehind { new_next: Index::new(4) }, now);
        assert_eq!(ps.next_index(), Index::new(4));
        assert_eq!(ps.matched(), None);

        ps.send_append_entries(append(Some(3), 2), now);
        ps.send_append_entries(append(Some(5), 2), now);
        ps.handle_append_entries_result(
            &logger,
            2,
            PeerStateUpdate::Success {
                previous_log_entry: Some(Index::new(3)),
                num_entries_replicated: 2,
            },
            now,
        );
        assert_eq!(ps.matched(), Some(Index::new(5)));

        ps.handle_append_entries_result(
            &logger,
            3,
            PeerStateUpdate::PeerLogBehind { new_next: Index::new(2) },
            now,
        );
        assert_eq!(ps.next_index(), Index::new(6));
        assert_eq!(ps.in_flight(), 0);
    }

    #[tokio::test]
    async fn failure_resends_from_failed_request() {
        let (actor_client, _rx) = ActorClient::new(100);
        let mut tracker = tracker(&actor_client);
        let peer_id = ReplicaId::new("p1");
        tracker.add_peer(peer("p1"), Index::start_index(), false);
        let logger = test_logger();
        let now = Instant::now();

        let ps = tracker.peer_state_mut(&peer_id).unwrap();
        ps.send_append_entries(append(None, 4), now);
        ps.send_append_entries(append(Some(4), 4), now);
        assert_eq!(ps.next_index(), Index::new(9));

        ps.handle_append_entries_result(&logger, 1, PeerStateUpdate::OtherError { previous_log_entry: None }, now);
        assert_eq!(ps.next_index(), Index::start_index());
        assert_eq!(ps.consecutive_failures(), 1);
        assert_eq!(ps.in_flight(), 0);
    }

    #[tokio::test]
    async fn snapshot_transfer_in_chunks() {
        let (actor_client, _rx) = ActorClient::new(100);
        let mut tracker = tracker(&actor_client);
        let peer_id = ReplicaId::new("p1");
        tracker.add_peer(peer("p1"), Index::start_index(), false);
        let logger = test_logger();
        let leader_id = ReplicaId::new("leader");
        let now = Instant::now();

        let snapshot = Arc::new(Snapshot::new(
            Index::new(20),
            Term::new(2),
            ClusterConfiguration::stable(Vec::new()),
            Bytes::from_static(b"0123456789"),
        ));

        let ps = tracker.peer_state_mut(&peer_id).unwrap();
        ps.start_snapshot_transfer(snapshot);
        assert!(!ps.can_send_append_entries(10));

        assert!(ps.send_next_snapshot_chunk(&leader_id, 4, now));
        // One chunk at a time.
        assert!(!ps.send_next_snapshot_chunk(&leader_id, 4, now));

        let accepted = SnapshotChunkUpdate::Accepted { end_offset: 4, done: false };
        ps.handle_install_snapshot_result(&logger, 1, accepted, now);
        assert!(ps.send_next_snapshot_chunk(&leader_id, 4, now));
        ps.handle_install_snapshot_result(&logger, 2, SnapshotChunkUpdate::Restart, now);
        assert!(ps.send_next_snapshot_chunk(&leader_id, 4, now));

        // Stale reply.
        assert!(!ps.handle_install_snapshot_result(
            &logger,
            2,
            SnapshotChunkUpdate::Accepted { end_offset: 8, done: false },
            now
        ));

        let accepted = SnapshotChunkUpdate::Accepted { end_offset: 10, done: true };
        ps.handle_install_snapshot_result(&logger, 3, accepted, now);
        assert!(!ps.installing_snapshot());
        assert_eq!(ps.matched(), Some(Index::new(20)));
        assert_eq!(ps.next_index(), Index::new(21));
    }

    #[tokio::test]
    async fn failed_snapshot_transfer_restarts_and_can_be_replaced() {
        let (actor_client, _rx) = ActorClient::new(100);
        let mut tracker = tracker(&actor_client);
        let peer_id = ReplicaId::new("p1");
        tracker.add_peer(peer("p1"), Index::start_index(), false);
        let logger = test_logger();
        let leader_id = ReplicaId::new("leader");
        let now = Instant::now();
        let snapshot_at = |index: u64| {
            Arc::new(Snapshot::new(
                Index::new(index),
                Term::new(2),
                ClusterConfiguration::stable(Vec::new()),
                Bytes::from_static(b"0123456789"),
            ))
        };

        let ps = tracker.peer_state_mut(&peer_id).unwrap();
        ps.start_snapshot_transfer(snapshot_at(20));
        assert_eq!(ps.snapshot_transfer_index(), Some(Index::new(20)));

        assert!(ps.send_next_snapshot_chunk(&leader_id, 4, now));
        let accepted = SnapshotChunkUpdate::Accepted { end_offset: 4, done: false };
        ps.handle_install_snapshot_result(&logger, 1, accepted, now);
        assert_eq!(ps.consecutive_failures(), 0);

        for seq_no in 2..4 {
            assert!(ps.send_next_snapshot_chunk(&leader_id, 4, now));
            assert!(ps.handle_install_snapshot_result(&logger, seq_no, SnapshotChunkUpdate::Failed, now));
        }
        assert_eq!(ps.consecutive_failures(), 2);
        assert!(ps.status(now, Duration::from_secs(1)).installing_snapshot);

        // A newer snapshot replaces the transfer. The reply to the chunk in flight is ignored.
        assert!(ps.send_next_snapshot_chunk(&leader_id, 4, now));
        ps.cancel_snapshot_transfer();
        assert_eq!(ps.snapshot_transfer_index(), None);
        ps.start_snapshot_transfer(snapshot_at(30));
        let late = SnapshotChunkUpdate::Accepted { end_offset: 4, done: false };
        assert!(!ps.handle_install_snapshot_result(&logger, 4, late, now));

        assert!(ps.send_next_snapshot_chunk(&leader_id, 100, now));
        let accepted = SnapshotChunkUpdate::Accepted { end_offset: 10, done: true };
        assert!(ps.handle_install_snapshot_result(&logger, 5, accepted, now));
        assert_eq!(ps.matched(), Some(Index::new(30)));
        assert_eq!(ps.consecutive_failures(), 0);
        assert_eq!(ps.status(now, Duration::from_secs(1)).consecutive_failures, 0);
    }

    #[tokio::test]
    async fn health_and_catch_up() {
        let (actor_client, _rx) = ActorClient::new(100);
        let mut tracker = tracker(&actor_client);
        let peer_id = ReplicaId::new("p1");
        tracker.add_peer(peer("p1"), Index::start_index(), true);
        let logger = test_logger();
        let now = Instant::now();
        let slowness = Duration::from_secs(1);

        let ps = tracker.peer_state_mut(&peer_id).unwrap();
        assert!(ps.is_staging());
        assert!(ps.is_healthy(now, slowness));
        assert!(!ps.is_healthy(now + Duration::from_secs(2), slowness));
        assert!(!ps.is_caught_up(Some(Index::new(100)), 10));

        ps.send_append_entries(append(None, 95), now);
        ps.handle_append_entries_result(
            &logger,
            1,
            PeerStateUpdate::Success {
                previous_log_entry: None,
                num_entries_replicated: 95,
            },
            now,
        );
        assert!(ps.is_caught_up(Some(Index::new(100)), 10));
        ps.promote();
        assert!(!ps.is_staging());

        assert_eq!(tracker.peers_acked_since(now).len(), 1);
        assert!(tracker.peers_acked_since(now + Duration::from_millis(1)).is_empty());
    }
}
