mod applying;
mod follower;
mod membership;
mod replication;

use crate::actor::{Callback, WeakActorClient};
use crate::commitlog::Index;
use crate::replica::applier::ApplierHandle;
use crate::replica::cluster::ClusterTracker;
use crate::replica::election::ElectionState;
use crate::replica::local_state::{PersistentLocalState, Term};
use crate::replica::replica_api::{
    ReplicaStatus, RequestVoteError, RequestVoteInput, RequestVoteOutput, RequestVoteReplyFromPeer,
    RequestVoteResult, SubmitError, SubmitInput, SubmitOutput, TakeSnapshotError, TakeSnapshotOutput,
    TermOutOfDateInfo,
};
use crate::replica::retry_cache::{Lookup, RetryCache, RetryKey};
use crate::replica::snapshot::{IncomingSnapshot, SnapshotStore};
use crate::replica::write_ahead_log::WriteAheadLog;
use crate::replica::{
    ChangeMembershipError, ChangeMembershipOutput, ElectionTimeoutTick, EntryPayload, LeaderRedirectInfo,
    ReplicaId, WriteAheadLogEntry,
};
use crate::server::RpcServerShutdownHandle;
use std::io;
use tokio::time::{Duration, Instant};

/// Tunables the replica logic needs at runtime. Validated by the API layer.
#[derive(Clone, Debug)]
pub(crate) struct ReplicaOptions {
    pub(crate) leader_heartbeat_duration: Duration,
    pub(crate) follower_min_timeout: Duration,
    pub(crate) follower_max_timeout: Duration,
    pub(crate) rpc_timeout: Duration,
    pub(crate) rpc_slowness_timeout: Duration,
    pub(crate) pre_vote: bool,
    pub(crate) append_entries_batch_byte_limit: usize,
    pub(crate) append_entries_batch_entry_limit: usize,
    pub(crate) leader_outstanding_appends_max: usize,
    pub(crate) staging_catchup_gap: u64,
    pub(crate) snapshot_chunk_size_max: usize,
    /// None disables automatic snapshots.
    pub(crate) snapshot_auto_trigger_threshold: Option<u64>,
    /// Entries kept in the log below a fresh snapshot, for slightly lagging followers.
    pub(crate) snapshot_retention_entries: u64,
}

pub(crate) struct ReplicaConfig {
    pub(crate) logger: slog::Logger,
    pub(crate) cluster_tracker: ClusterTracker,
    pub(crate) local_state: Box<dyn PersistentLocalState>,
    pub(crate) election_state: ElectionState,
    pub(crate) write_ahead_log: WriteAheadLog,
    pub(crate) retry_cache: RetryCache<Callback<SubmitOutput, SubmitError>>,
    pub(crate) applier: ApplierHandle,
    pub(crate) snapshot_store: SnapshotStore,
    pub(crate) actor_client: WeakActorClient,
    pub(crate) server_shutdown_handle: Option<RpcServerShutdownHandle>,
    pub(crate) options: ReplicaOptions,
}

type SubmitCallback = Callback<SubmitOutput, SubmitError>;
type TakeSnapshotCallback = Callback<TakeSnapshotOutput, TakeSnapshotError>;
type ChangeMembershipCallback = Callback<ChangeMembershipOutput, ChangeMembershipError>;

/// Replica is the raft state of this server. Every method runs on the actor's task, one event at a
/// time, and must not block on the network.
pub(crate) struct Replica {
    logger: slog::Logger,
    my_replica_id: ReplicaId,
    cluster_tracker: ClusterTracker,
    local_state: Box<dyn PersistentLocalState>,
    election_state: ElectionState,
    write_ahead_log: WriteAheadLog,
    retry_cache: RetryCache<SubmitCallback>,
    applier: ApplierHandle,
    snapshot_store: SnapshotStore,
    // Snapshot being received from the leader.
    incoming_snapshot: Option<IncomingSnapshot>,
    actor_client: WeakActorClient,
    options: ReplicaOptions,

    // Last time a current leader talked to us. Pre-votes are refused while the leader is alive.
    last_leader_contact: Option<Instant>,
    // Highest index handed to the applier, and highest index it reported back as applied.
    last_dispatched: Option<Index>,
    last_applied: Option<Index>,

    snapshot_request: Option<SnapshotRequest>,
    membership_change: Option<membership::MembershipChange>,

    // Dropped on shutdown, which stops the RPC server.
    server_shutdown_handle: Option<RpcServerShutdownHandle>,
}

struct SnapshotRequest {
    // None for automatic snapshots.
    callback: Option<TakeSnapshotCallback>,
}

impl Replica {
    pub(crate) fn new(config: ReplicaConfig) -> Self {
        let my_replica_id = config.cluster_tracker.my_replica_id().clone();
        // Everything up to the snapshot is in the state machine once the applier installs it.
        let snapshot_index = config.snapshot_store.latest_index();

        Replica {
            logger: config.logger,
            my_replica_id,
            cluster_tracker: config.cluster_tracker,
            local_state: config.local_state,
            election_state: config.election_state,
            write_ahead_log: config.write_ahead_log,
            retry_cache: config.retry_cache,
            applier: config.applier,
            snapshot_store: config.snapshot_store,
            incoming_snapshot: None,
            actor_client: config.actor_client,
            options: config.options,
            last_leader_contact: None,
            last_dispatched: snapshot_index,
            last_applied: None,
            snapshot_request: None,
            membership_change: None,
            server_shutdown_handle: config.server_shutdown_handle,
        }
    }

    // ------- Client requests --------

    pub(crate) fn handle_submit(&mut self, input: SubmitInput, callback: SubmitCallback) {
        if let Err(e) = self.check_leader() {
            callback.send(Err(e));
            return;
        }

        let key = RetryKey::new(input.client_id.clone(), input.call_id);
        let now = Instant::now();
        match self.retry_cache.get_or_create(key.clone(), now) {
            Err(_) => {
                slog::warn!(self.logger, "Retry cache is full. Rejecting {:?}", key);
                callback.send(Err(SubmitError::RetryCacheFull));
                return;
            }
            Ok(Lookup::Applied { index, result }) => {
                slog::debug!(self.logger, "{:?} was already applied at {:?}", key, index);
                callback.send(Ok(SubmitOutput {
                    applied_index: index,
                    result,
                }));
                return;
            }
            Ok(Lookup::InProgress) => {
                slog::debug!(self.logger, "{:?} is already in progress, waiting on it", key);
                if let Err(callback) = self.retry_cache.add_waiter(&key, callback) {
                    callback.send(Err(SubmitError::LeadershipLost));
                }
                return;
            }
            Ok(Lookup::Created) => {}
        }

        if let Err(callback) = self.retry_cache.add_waiter(&key, callback) {
            callback.send(Err(SubmitError::LeadershipLost));
            return;
        }

        // > If command received from client: append entry to local log,
        // > respond after entry applied to state machine (§5.3)
        let term = self.local_state.current_term();
        let entry = WriteAheadLogEntry {
            term,
            payload: EntryPayload::Command {
                client_id: input.client_id,
                call_id: input.call_id,
                data: input.data,
            },
        };
        match self.write_ahead_log.append(vec![entry]) {
            Ok(index) => {
                self.retry_cache.mark_submitted(key, index, now);
                self.replicate_to_all_peers(false);
                // Single voter clusters commit right away.
                self.advance_leader_commit_index();
            }
            Err(e) => self.halt(format!("Failed to append to log: {:?}", e)),
        }
    }

    /// Ok if we're leader, otherwise the error telling the client where to go.
    fn check_leader(&self) -> Result<(), SubmitError> {
        if let Some(reason) = self.election_state.halted_reason() {
            return Err(SubmitError::Halted(reason.to_string()));
        }
        if self.election_state.is_leader() {
            return Ok(());
        }

        match self.election_state.known_leader() {
            Some(leader) => Err(SubmitError::LeaderRedirect(leader.clone())),
            None => Err(SubmitError::NoLeader),
        }
    }

    pub(crate) fn status(&self) -> ReplicaStatus {
        let now = Instant::now();
        let peers = match self.election_state.leader_state() {
            Some(leader_state) => {
                let mut peers: Vec<_> = leader_state
                    .peers_iter()
                    .map(|ps| ps.status(now, self.options.rpc_slowness_timeout))
                    .collect();
                peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
                peers
            }
            None => Vec::new(),
        };

        ReplicaStatus {
            replica_id: self.my_replica_id.clone(),
            term: self.local_state.current_term(),
            election_state: self.election_state.current_state(),
            commit_index: self.write_ahead_log.commit_index(),
            last_applied_index: self.last_applied,
            latest_entry: self.write_ahead_log.latest_entry(),
            first_log_index: self.write_ahead_log.first_index(),
            snapshot_index: self.snapshot_store.latest_index(),
            configuration: self.cluster_tracker.current().clone(),
            peers,
        }
    }

    pub(crate) fn shutdown(&mut self) {
        slog::info!(self.logger, "Shutting down replica");
        self.server_shutdown_handle.take();

        for waiter in self.retry_cache.drain_waiters() {
            waiter.send(Err(SubmitError::ActorExited));
        }
        if let Some(change) = self.membership_change.take() {
            change.callback.send(Err(ChangeMembershipError::ActorExited));
        }
        if let Some(SnapshotRequest { callback: Some(callback) }) = self.snapshot_request.take() {
            callback.send(Err(TakeSnapshotError::ActorExited));
        }

        if let Err(e) = self.write_ahead_log.flush() {
            slog::error!(self.logger, "Failed to flush log on shutdown: {:?}", e);
        }
        self.election_state.transition_to_halted("Shut down".to_string());
    }

    // ------- Lifecycle helpers --------

    /// Stops taking part in the cluster for good. Used when local state can no longer be trusted:
    /// a failed disk write, or a state machine that failed to apply a committed entry.
    fn halt(&mut self, reason: String) {
        if self.election_state.is_halted() {
            return;
        }
        slog::crit!(self.logger, "Halting replica: {}", reason);

        self.election_state.transition_to_halted(reason.clone());
        for waiter in self.retry_cache.drain_waiters() {
            waiter.send(Err(SubmitError::Halted(reason.clone())));
        }
        if let Some(change) = self.membership_change.take() {
            change.callback.send(Err(ChangeMembershipError::Halted(reason.clone())));
        }
        if let Some(SnapshotRequest { callback: Some(callback) }) = self.snapshot_request.take() {
            callback.send(Err(TakeSnapshotError::Halted(reason)));
        }
    }

    /// Becomes follower, failing everything that was waiting on us as leader.
    fn become_follower(&mut self, leader: Option<LeaderRedirectInfo>) {
        let was_leader = self.election_state.is_leader();
        self.election_state.transition_to_follower(leader);

        if was_leader {
            slog::info!(self.logger, "Lost leadership");
            for waiter in self.retry_cache.drain_waiters() {
                waiter.send(Err(SubmitError::LeadershipLost));
            }
            if let Some(change) = self.membership_change.take() {
                change.callback.send(Err(ChangeMembershipError::LeadershipLost));
            }
        }
    }

    /// > If RPC request or response contains term T > currentTerm:
    /// > set currentTerm = T, convert to follower (§5.1)
    ///
    /// Returns whether the term increased. Err means the new term couldn't be persisted, and we've
    /// halted.
    fn observe_term(&mut self, term: Term, leader: Option<LeaderRedirectInfo>) -> Result<bool, io::Error> {
        match self.local_state.store_term_if_increased(term) {
            Ok(true) => {
                self.become_follower(leader);
                slog::info!(
                    self.logger,
                    "Observed term {:?}. Transitioned to follower. Election state: {:?}",
                    term,
                    self.election_state
                );
                Ok(true)
            }
            Ok(false) => Ok(false),
            Err(e) => {
                self.halt(format!("Failed to persist term {:?}: {:?}", term, e));
                Err(e)
            }
        }
    }

    fn leader_info(&self, replica_id: &ReplicaId) -> Option<LeaderRedirectInfo> {
        self.cluster_tracker.metadata(replica_id).map(LeaderRedirectInfo::from)
    }

    fn current_term(&self) -> Term {
        self.local_state.current_term()
    }

    // ------- Elections --------

    pub(crate) fn server_handle_request_vote(
        &mut self,
        input: RequestVoteInput,
    ) -> Result<RequestVoteOutput, RequestVoteError> {
        if self.election_state.is_halted() {
            return Err(RequestVoteError::Halted);
        }

        // Ensure candidate is known member.
        if !self.cluster_tracker.contains_member(&input.candidate_id) {
            return Err(RequestVoteError::CandidateNotInCluster);
        }

        let current_term = self.local_state.current_term();

        // 1. Reply false if term < currentTerm (§5.1)
        if input.candidate_term < current_term {
            slog::info!(self.logger, "Not granting vote. Client term is out of date.");
            return Err(RequestVoteError::RequestTermOutOfDate(TermOutOfDateInfo {
                current_term,
            }));
        }

        if input.pre_vote {
            return Ok(RequestVoteOutput {
                vote_granted: self.would_grant_pre_vote(&input),
            });
        }

        self.observe_term(input.candidate_term, None)
            .map_err(RequestVoteError::ServerIoError)?;
        let (current_term, opt_voted_for) = self.local_state.voted_for_current_term();

        // 2. If votedFor is null or candidateId, and candidate’s log is at
        // least as up-to-date as receiver’s log, grant vote (§5.2, §5.4).

        // If votedFor is null or candidateId, and...
        if let Some(voted_for) = opt_voted_for {
            let vote_granted = *voted_for == input.candidate_id;
            if !vote_granted {
                slog::info!(self.logger, "Not granting vote. We already voted for {:?}.", voted_for);
            }
            return Ok(RequestVoteOutput { vote_granted });
        }

        // ...and candidate’s log is at least as up-to-date as receiver’s log...
        if !self.is_candidate_log_gte_mine(input.candidate_last_log_entry) {
            slog::info!(self.logger, "Not granting vote. Candidate log is out of date.");
            return Ok(RequestVoteOutput { vote_granted: false });
        }

        // ...grant vote
        let stored = match self
            .local_state
            .store_vote_for_term_if_unvoted(current_term, input.candidate_id.clone())
        {
            Ok(stored) => stored,
            Err(e) => {
                self.halt(format!("Failed to persist vote: {:?}", e));
                return Err(RequestVoteError::ServerIoError(e));
            }
        };

        if stored {
            slog::info!(self.logger, "Voted for {:?} in term {:?}.", input.candidate_id, current_term);
            // Granting a vote counts as hearing from a (future) leader.
            self.election_state.reset_timeout_if_follower();
        }
        Ok(RequestVoteOutput { vote_granted: stored })
    }

    fn would_grant_pre_vote(&self, input: &RequestVoteInput) -> bool {
        if self.election_state.is_leader() {
            return false;
        }

        let leader_alive = self
            .last_leader_contact
            .map(|t| t.elapsed() < self.options.follower_min_timeout)
            .unwrap_or(false);
        if leader_alive {
            slog::debug!(self.logger, "Not granting pre-vote to {:?}. Leader is alive.", input.candidate_id);
            return false;
        }

        self.is_candidate_log_gte_mine(input.candidate_last_log_entry)
    }

    fn is_candidate_log_gte_mine(&self, candidate_last_entry: Option<(Term, Index)>) -> bool {
        // > Raft determines which of two logs is more up-to-date
        // > by comparing the index and term of the last entries in the
        // > logs. If the logs have last entries with different terms, then
        // > the log with the later term is more up-to-date. If the logs
        // > end with the same term, then whichever log is longer is
        // > more up-to-date.
        match (self.write_ahead_log.latest_entry(), candidate_last_entry) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some((my_term, my_index)), Some((candidate_term, candidate_index))) => {
                (candidate_term, candidate_index) >= (my_term, my_index)
            }
        }
    }

    pub(crate) fn handle_follower_timeout(&mut self, tick: ElectionTimeoutTick) {
        if self.election_state.is_halted() || self.election_state.is_leader() {
            return;
        }
        if !self.election_state.is_current_timeout(tick) {
            slog::debug!(self.logger, "Dropping stale election timeout {:?}", tick);
            return;
        }

        if !self.cluster_tracker.am_voter() {
            // Removed (or never added): we keep following, but never campaign.
            self.election_state.reset_timeout_if_follower();
            return;
        }

        if self.options.pre_vote {
            self.start_pre_vote();
        } else {
            self.start_election();
        }
    }

    fn start_pre_vote(&mut self) {
        self.election_state.transition_to_pre_candidate_and_vote_for_self();
        let term = self.current_term();
        slog::info!(self.logger, "Timed out as follower. Starting pre-vote for term {:?}.", term.next());

        if self.has_vote_quorum(true) {
            self.start_election();
            return;
        }
        // Replies are matched against the term we're on now.
        self.request_votes(term, term.next(), true);
    }

    fn start_election(&mut self) {
        // Write-ahead log style: Vote for self on local state before transitioning to candidate.
        let new_term = match self.local_state.increment_term_and_vote_for_self() {
            Ok(term) => term,
            Err(e) => {
                self.halt(format!("Failed to persist vote for self: {:?}", e));
                return;
            }
        };
        self.election_state.transition_to_candidate_and_vote_for_self();
        slog::info!(
            self.logger,
            "Started election for term {:?}. Election state: {:?}",
            new_term,
            self.election_state,
        );

        if self.has_vote_quorum(false) {
            self.become_leader();
            return;
        }
        self.request_votes(new_term, new_term, false);
    }

    fn has_vote_quorum(&mut self, pre_vote: bool) -> bool {
        let my_id = self.my_replica_id.clone();
        let configuration = self.cluster_tracker.current().clone();
        match self.election_state.add_vote_if_candidate(pre_vote, my_id) {
            Some(votes) => configuration.has_quorum(votes),
            None => false,
        }
    }

    fn request_votes(&mut self, reply_term: Term, candidate_term: Term, pre_vote: bool) {
        let input = RequestVoteInput {
            candidate_term,
            candidate_id: self.my_replica_id.clone(),
            candidate_last_log_entry: self.write_ahead_log.latest_entry(),
            pre_vote,
        };

        for peer_id in self.cluster_tracker.peer_ids() {
            let peer = match self.cluster_tracker.peer(&peer_id) {
                Some(peer) => peer,
                None => {
                    slog::warn!(self.logger, "No client for peer {:?}. Skipping vote request.", peer_id);
                    continue;
                }
            };

            // Failed calls are not retried. The next election timeout starts a new round.
            tokio::task::spawn(Self::call_peer_request_vote(
                self.logger.clone(),
                peer,
                input.clone(),
                self.options.rpc_timeout,
                self.actor_client.clone(),
                reply_term,
            ));
        }
    }

    async fn call_peer_request_vote(
        logger: slog::Logger,
        peer: crate::replica::cluster::Peer,
        input: RequestVoteInput,
        rpc_timeout: Duration,
        callback: WeakActorClient,
        term: Term,
    ) {
        let peer_id = peer.metadata.replica_id().clone();
        let pre_vote = input.pre_vote;

        slog::debug!(logger, "ClientWire - {:?} RequestVote {:?}", peer_id, input);
        let result = match tokio::time::timeout(rpc_timeout, peer.client.request_vote(input)).await {
            Ok(result) => result,
            Err(_) => RequestVoteResult::RetryableFailure("Timed out calling RequestVote".into()),
        };
        slog::debug!(logger, "ClientWire - {:?} RequestVote {:?}", peer_id, result);

        let callback_input = RequestVoteReplyFromPeer {
            peer_id,
            term,
            pre_vote,
            result,
        };
        let _ = callback.notify_request_vote_reply_from_peer(callback_input).await;
    }

    pub(crate) fn handle_request_vote_reply_from_peer(&mut self, reply: RequestVoteReplyFromPeer) {
        let current_term = self.current_term();
        if current_term != reply.term {
            slog::info!(
                self.logger,
                "Received vote for outdated term {:?}, current term: {:?}.",
                reply.term,
                current_term,
            );
            return;
        }

        match reply.result {
            RequestVoteResult::VoteGranted => {
                let configuration = self.cluster_tracker.current().clone();
                let won = match self.election_state.add_vote_if_candidate(reply.pre_vote, reply.peer_id.clone()) {
                    Some(votes) => {
                        slog::info!(
                            self.logger,
                            "Received {} {} for term {:?}",
                            votes.len(),
                            if reply.pre_vote { "pre-votes" } else { "votes" },
                            reply.term,
                        );
                        configuration.has_quorum(votes)
                    }
                    None => {
                        slog::debug!(
                            self.logger,
                            "Received vote from {:?} after moving on. Election state: {:?}",
                            reply.peer_id,
                            self.election_state,
                        );
                        return;
                    }
                };

                if won && reply.pre_vote {
                    self.start_election();
                } else if won {
                    self.become_leader();
                }
            }
            RequestVoteResult::VoteNotGranted => {
                slog::info!(
                    self.logger,
                    "Vote not granted from {:?} for term {:?}",
                    reply.peer_id,
                    reply.term,
                );
            }
            RequestVoteResult::StaleTerm { new_term } => {
                let _ = self.observe_term(new_term, None);
            }
            RequestVoteResult::RetryableFailure(message) => {
                slog::info!(self.logger, "RequestVote to {:?} failed: {}", reply.peer_id, message);
            }
        }
    }

    fn become_leader(&mut self) {
        let term = self.current_term();
        let peers = self
            .cluster_tracker
            .peer_ids()
            .into_iter()
            .filter_map(|peer_id| self.cluster_tracker.peer(&peer_id))
            .collect();
        self.election_state
            .transition_to_leader(term, peers, self.write_ahead_log.latest_index());
        slog::info!(self.logger, "Became leader of term {:?}", term);

        // Whatever is uncommitted in our log may be a client's request that is retried against us.
        if let Err(e) = self.track_uncommitted_commands() {
            self.halt(format!("Failed to read log: {:?}", e));
            return;
        }

        // > Raft handles this by having each leader commit a blank no-op entry into the log at the
        // > start of its term.
        let no_op = WriteAheadLogEntry {
            term,
            payload: EntryPayload::NoOp,
        };
        if let Err(e) = self.write_ahead_log.append(vec![no_op]) {
            self.halt(format!("Failed to append to log: {:?}", e));
            return;
        }

        self.advance_membership_change();
        self.advance_leader_commit_index();
    }

    fn track_uncommitted_commands(&mut self) -> Result<(), io::Error> {
        let latest = match self.write_ahead_log.latest_index() {
            Some(latest) => latest,
            None => return Ok(()),
        };
        let mut index = self
            .write_ahead_log
            .commit_index()
            .map(|ci| ci.plus(1))
            .unwrap_or_else(Index::start_index);

        let now = Instant::now();
        while index <= latest {
            if let Some(WriteAheadLogEntry {
                payload: EntryPayload::Command { client_id, call_id, .. },
                ..
            }) = self.write_ahead_log.read(index)?
            {
                self.retry_cache.mark_submitted(RetryKey::new(client_id, call_id), index, now);
            }
            index = index.plus(1);
        }

        Ok(())
    }

    // ------- Snapshots --------

    pub(crate) fn handle_take_snapshot(&mut self, callback: TakeSnapshotCallback) {
        if let Some(reason) = self.election_state.halted_reason() {
            callback.send(Err(TakeSnapshotError::Halted(reason.to_string())));
            return;
        }
        if self.snapshot_request.is_some() {
            callback.send(Err(TakeSnapshotError::InProgress));
            return;
        }

        let index = match self.last_dispatched {
            Some(index) => index,
            None => {
                callback.send(Err(TakeSnapshotError::NothingApplied));
                return;
            }
        };

        if matches!(self.snapshot_store.latest_index(), Some(latest) if latest >= index) {
            callback.send(self.latest_snapshot_output());
            return;
        }

        self.request_snapshot(index, Some(callback));
    }
}
