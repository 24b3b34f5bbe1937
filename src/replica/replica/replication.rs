//! Leader side of log replication: feeding each peer's pipeline, reacting to its replies, and
//! advancing the commit index.

use crate::commitlog::Index;
use crate::replica::election::{PeerStateUpdate, SnapshotChunkUpdate};
use crate::replica::local_state::Term;
use crate::replica::replica::{ReplicaOptions, Replica};
use crate::replica::write_ahead_log::WriteAheadLog;
use crate::replica::{
    AppendEntriesInput, AppendEntriesReplyFromPeer, AppendEntriesReplyFromPeerError, InstallSnapshotReplyFromPeer,
    InstallSnapshotReplyFromPeerError, LeaderTimerTick, ReplicaId,
};
use std::io;
use tokio::time::Instant;

impl Replica {
    pub(crate) fn handle_leader_timer(&mut self, tick: LeaderTimerTick) {
        let current_term = self.current_term();
        if current_term != tick.term {
            slog::debug!(
                self.logger,
                "Received leader heartbeat for outdated term {:?}, current term: {:?}",
                tick.term,
                current_term
            );
            return;
        }
        if !self.election_state.is_leader() {
            slog::debug!(self.logger, "Received leader timer event but no longer leader.");
            return;
        }

        if !self.check_quorum() {
            return;
        }
        self.retry_cache.expire(Instant::now());
        self.advance_membership_change();
        self.replicate_to_peer(&tick.peer_id, true);
    }

    /// A leader that can't reach a majority within an election timeout steps down, so clients on
    /// its side of a partition get redirected instead of waiting forever. Returns false if we
    /// stepped down.
    fn check_quorum(&mut self) -> bool {
        let now = Instant::now();
        let window = self.options.follower_max_timeout;
        let mut acked = match self.election_state.leader_state() {
            Some(leader_state) => {
                // Give peers a full timeout to answer the new leader.
                if now.saturating_duration_since(leader_state.became_leader_at()) < window {
                    return true;
                }
                leader_state.peers_acked_since(now - window)
            }
            None => return false,
        };
        acked.insert(self.my_replica_id.clone());

        if self.cluster_tracker.current().has_quorum(&acked) {
            return true;
        }

        slog::warn!(
            self.logger,
            "Haven't heard from a majority in {:?} (only {:?}). Stepping down.",
            window,
            acked
        );
        self.become_follower(None);
        false
    }

    pub(super) fn replicate_to_all_peers(&mut self, heartbeat: bool) {
        let peer_ids = match self.election_state.leader_state() {
            Some(leader_state) => leader_state.peer_ids(),
            None => return,
        };
        for peer_id in peer_ids {
            self.replicate_to_peer(&peer_id, heartbeat);
        }
    }

    /// Sends the peer whatever it's missing, as far as its window allows. With `heartbeat`, an
    /// idle peer that is already up to date gets an empty AppendEntries.
    pub(super) fn replicate_to_peer(&mut self, peer_id: &ReplicaId, heartbeat: bool) {
        let now = Instant::now();
        let term = self.current_term();
        let peer_state = match self
            .election_state
            .leader_state_mut()
            .and_then(|leader_state| leader_state.peer_state_mut(peer_id))
        {
            Some(peer_state) => peer_state,
            None => return,
        };

        if peer_state.installing_snapshot() {
            let newer_snapshot = match (self.snapshot_store.latest_index(), peer_state.snapshot_transfer_index()) {
                (Some(latest), Some(sending)) => latest > sending,
                _ => false,
            };
            if !newer_snapshot {
                peer_state.send_next_snapshot_chunk(&self.my_replica_id, self.options.snapshot_chunk_size_max, now);
                return;
            }
            // Starting over with the newer snapshot saves the peer from replaying what it covers.
            slog::info!(
                self.logger,
                "Abandoning snapshot transfer at {:?} to {:?}. A newer snapshot replaced it.",
                peer_state.snapshot_transfer_index(),
                peer_id
            );
            peer_state.cancel_snapshot_transfer();
        }

        let mut read_failure = None;
        let mut sent_any = false;
        while peer_state.can_send_append_entries(self.options.leader_outstanding_appends_max) {
            let next = peer_state.next_index();
            let has_new_entries = matches!(self.write_ahead_log.latest_index(), Some(latest) if latest >= next);
            if !has_new_entries && (sent_any || !heartbeat || peer_state.in_flight() > 0) {
                break;
            }

            match new_append_entries_request(
                &self.write_ahead_log,
                &self.options,
                term,
                &self.my_replica_id,
                next,
            ) {
                Ok(Some(input)) => {
                    let is_heartbeat = input.new_entries.is_empty();
                    peer_state.send_append_entries(input, now);
                    sent_any = true;
                    if is_heartbeat {
                        break;
                    }
                }
                Ok(None) => {
                    // > the leader must occasionally send snapshots to followers that lag behind
                    match self.snapshot_store.latest() {
                        Some(snapshot) => {
                            slog::info!(
                                self.logger,
                                "Peer {:?} needs entry {:?}, which is purged. Sending snapshot at {:?}.",
                                peer_id,
                                next,
                                snapshot.metadata.last_included_index
                            );
                            peer_state.start_snapshot_transfer(snapshot);
                            peer_state.send_next_snapshot_chunk(
                                &self.my_replica_id,
                                self.options.snapshot_chunk_size_max,
                                now,
                            );
                        }
                        None => slog::error!(
                            self.logger,
                            "Peer {:?} needs entry {:?}, which is missing, and there is no snapshot.",
                            peer_id,
                            next
                        ),
                    }
                    break;
                }
                Err(e) => {
                    read_failure = Some((next, e));
                    break;
                }
            }
        }

        if let Some((index, e)) = read_failure {
            self.halt(format!("Failed to read log at {:?}: {:?}", index, e));
        }
    }

    pub(crate) fn handle_append_entries_reply_from_peer(&mut self, reply: AppendEntriesReplyFromPeer) {
        let logger = self
            .logger
            .new(slog::o!("Peer" => format!("{:?}", reply.descriptor.peer_id), "SeqNo" => reply.descriptor.seq_no));
        slog::debug!(logger, "AE reply from peer result: {:?}", reply.result);

        let current_term = self.current_term();
        if current_term != reply.descriptor.term {
            slog::debug!(
                logger,
                "Received AE reply for outdated term {:?}, but we're on term {:?}",
                reply.descriptor.term,
                current_term
            );
            return;
        }
        if !self.election_state.is_leader() {
            slog::debug!(logger, "No longer leader");
            return;
        }

        // 1. Check for stale term rejection
        let update = match reply.result {
            Err(AppendEntriesReplyFromPeerError::StaleTerm { new_term }) => {
                slog::warn!(logger, "Rejected by peer because my term is stale.");
                match self.observe_term(new_term, None) {
                    Ok(true) | Err(_) => return,
                    Ok(false) => {
                        slog::warn!(logger, "Peer returned StaleTerm without a newer term. Treating as failure.");
                        PeerStateUpdate::OtherError {
                            previous_log_entry: reply.descriptor.previous_log_entry_index,
                        }
                    }
                }
            }
            Err(AppendEntriesReplyFromPeerError::PeerMissingPreviousLogEntry(hint)) => {
                let new_next = match self.next_index_from_conflict_hint(hint) {
                    Ok(new_next) => new_next,
                    Err(e) => {
                        self.halt(format!("Failed to read log: {:?}", e));
                        return;
                    }
                };
                slog::info!(
                    logger,
                    "Peer is missing previous log entry. Hint {:?}, retrying from {:?}",
                    hint,
                    new_next
                );
                PeerStateUpdate::PeerLogBehind { new_next }
            }
            Err(AppendEntriesReplyFromPeerError::RetryableFailure(err_msg)) => {
                slog::warn!(logger, "AE failure: {}", err_msg);
                PeerStateUpdate::OtherError {
                    previous_log_entry: reply.descriptor.previous_log_entry_index,
                }
            }
            Ok(_) => PeerStateUpdate::Success {
                previous_log_entry: reply.descriptor.previous_log_entry_index,
                num_entries_replicated: reply.descriptor.num_log_entries,
            },
        };
        let retry_now = matches!(update, PeerStateUpdate::PeerLogBehind { .. });
        let success = matches!(update, PeerStateUpdate::Success { .. });

        // 2. Update peer log tracker
        let peer_id = reply.descriptor.peer_id;
        let accepted = match self
            .election_state
            .leader_state_mut()
            .and_then(|leader_state| leader_state.peer_state_mut(&peer_id))
        {
            Some(peer_state) => {
                peer_state.handle_append_entries_result(&logger, reply.descriptor.seq_no, update, Instant::now())
            }
            None => {
                slog::debug!(logger, "Peer is no longer tracked");
                return;
            }
        };
        if !accepted {
            return;
        }

        // 3. Check for majority replication and apply new commits.
        if success {
            self.advance_leader_commit_index();
            self.advance_membership_change();
        }

        // 4. Keep the pipeline going.
        // > If last log index ≥ nextIndex for a follower: send
        // > AppendEntries RPC with log entries starting at nextIndex
        // Failures wait for the next heartbeat.
        if success || retry_now {
            self.replicate_to_peer(&peer_id, retry_now);
        }
    }

    /// The follower's hint is its last entry that may still agree with us. We retry right after
    /// our own last entry at or below the hint with a term no greater than the hint's.
    fn next_index_from_conflict_hint(&self, hint: Option<(Term, Index)>) -> Result<Index, io::Error> {
        let (hint_term, hint_index) = match hint {
            Some(hint) => hint,
            None => return Ok(Index::start_index()),
        };

        Ok(self
            .write_ahead_log
            .last_entry_with_term_at_most(hint_term, hint_index)?
            .map(|(_, index)| index.plus(1))
            .unwrap_or_else(Index::start_index))
    }

    pub(crate) fn handle_install_snapshot_reply_from_peer(&mut self, reply: InstallSnapshotReplyFromPeer) {
        let logger = self
            .logger
            .new(slog::o!("Peer" => format!("{:?}", reply.peer_id), "SeqNo" => reply.seq_no));
        slog::debug!(logger, "InstallSnapshot reply from peer: {:?}", reply.result);

        if self.current_term() != reply.term || !self.election_state.is_leader() {
            slog::debug!(logger, "Dropping InstallSnapshot reply for term {:?}", reply.term);
            return;
        }

        let update = match reply.result {
            Ok(()) => SnapshotChunkUpdate::Accepted {
                end_offset: reply.end_offset,
                done: reply.done,
            },
            Err(InstallSnapshotReplyFromPeerError::StaleTerm { new_term }) => match self.observe_term(new_term, None) {
                Ok(true) | Err(_) => return,
                Ok(false) => SnapshotChunkUpdate::Failed,
            },
            Err(InstallSnapshotReplyFromPeerError::OffsetMismatch { expected_offset }) => {
                slog::info!(
                    logger,
                    "Peer expected offset {} for snapshot {:?}. Restarting transfer.",
                    expected_offset,
                    reply.last_included_index
                );
                SnapshotChunkUpdate::Restart
            }
            Err(InstallSnapshotReplyFromPeerError::RetryableFailure(ref err_msg)) => {
                slog::warn!(logger, "InstallSnapshot failure: {}", err_msg);
                SnapshotChunkUpdate::Failed
            }
        };
        let failed = matches!(update, SnapshotChunkUpdate::Failed);

        let accepted = match self
            .election_state
            .leader_state_mut()
            .and_then(|leader_state| leader_state.peer_state_mut(&reply.peer_id))
        {
            Some(peer_state) => {
                peer_state.handle_install_snapshot_result(&logger, reply.seq_no, update, Instant::now())
            }
            None => return,
        };
        if !accepted {
            return;
        }
        if failed {
            // The chunk is resent from the start of the snapshot on the next heartbeat.
            if let Some(peer_state) = self
                .election_state
                .leader_state()
                .and_then(|leader_state| leader_state.peer_state(&reply.peer_id))
            {
                slog::warn!(
                    logger,
                    "Snapshot transfer failed {} time(s) in a row",
                    peer_state.consecutive_failures()
                );
            }
            return;
        }

        if reply.done {
            self.advance_leader_commit_index();
            self.advance_membership_change();
        }
        self.replicate_to_peer(&reply.peer_id, true);
    }

    /// > If there exists an N such that N > commitIndex, a majority
    /// > of matchIndex[i] ≥ N, and log[N].term == currentTerm:
    /// > set commitIndex = N (§5.3, §5.4).
    ///
    /// Our own match is what's durable in our log, so we flush if we're behind.
    pub(super) fn advance_leader_commit_index(&mut self) {
        if self.write_ahead_log.flushed_index() < self.write_ahead_log.latest_index() {
            if let Err(e) = self.write_ahead_log.flush() {
                self.halt(format!("Failed to flush log: {:?}", e));
                return;
            }
        }

        let tentative = {
            let leader_state = match self.election_state.leader_state() {
                Some(leader_state) => leader_state,
                None => return,
            };
            let my_id = &self.my_replica_id;
            let my_flushed = self.write_ahead_log.flushed_index();
            self.cluster_tracker.current().quorum_match_index(|replica_id| {
                if replica_id == my_id {
                    return my_flushed;
                }
                leader_state
                    .peer_state(replica_id)
                    .filter(|peer_state| !peer_state.is_staging())
                    .and_then(|peer_state| peer_state.matched())
            })
        };

        let tentative = match tentative {
            Some(index) => index,
            None => return,
        };

        let current_term = self.current_term();
        match self
            .write_ahead_log
            .ratchet_fwd_commit_index_if_valid(tentative, current_term)
        {
            Ok(true) => {
                slog::debug!(self.logger, "Commit index advanced to {:?}", tentative);
                self.dispatch_committed_entries();
            }
            Ok(false) => {}
            Err(e) => self.halt(format!(
                "IO failure while confirming new commit index {:?}: {:?}",
                tentative, e
            )),
        }
    }
}

/// Builds the AppendEntries starting at `next`. None if the entries (or the one before them) are
/// only in the snapshot now.
fn new_append_entries_request(
    write_ahead_log: &WriteAheadLog,
    options: &ReplicaOptions,
    term: Term,
    my_id: &ReplicaId,
    next: Index,
) -> Result<Option<AppendEntriesInput>, io::Error> {
    let previous_log_entry = match next.checked_minus(1) {
        None => None,
        Some(previous_index) => match write_ahead_log.term_at(previous_index)? {
            Some(previous_term) => Some((previous_term, previous_index)),
            None => return Ok(None),
        },
    };

    let new_entries = match write_ahead_log.latest_index() {
        Some(latest) if latest >= next => {
            if next < write_ahead_log.first_index() {
                return Ok(None);
            }
            let entries = write_ahead_log.read_batch(
                next,
                latest,
                options.append_entries_batch_byte_limit,
                options.append_entries_batch_entry_limit,
            )?;
            if entries.is_empty() {
                return Ok(None);
            }
            entries
        }
        _ => Vec::new(),
    };

    Ok(Some(AppendEntriesInput {
        leader_term: term,
        leader_id: my_id.clone(),
        leader_previous_log_entry: previous_log_entry,
        leader_commit_index: write_ahead_log.commit_index(),
        new_entries,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitlog::InMemoryLog;
    use crate::replica::{EntryPayload, WriteAheadLogEntry};
    use bytes::Bytes;
    use tokio::time::Duration;

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn options(entry_limit: usize) -> ReplicaOptions {
        ReplicaOptions {
            leader_heartbeat_duration: Duration::from_millis(100),
            follower_min_timeout: Duration::from_millis(500),
            follower_max_timeout: Duration::from_millis(1500),
            rpc_timeout: Duration::from_millis(300),
            rpc_slowness_timeout: Duration::from_secs(60),
            pre_vote: true,
            append_entries_batch_byte_limit: 1024 * 1024,
            append_entries_batch_entry_limit: entry_limit,
            leader_outstanding_appends_max: 8,
            staging_catchup_gap: 10,
            snapshot_chunk_size_max: 1024,
            snapshot_auto_trigger_threshold: None,
            snapshot_retention_entries: 0,
        }
    }

    fn wal_with_terms(terms: &[u64]) -> WriteAheadLog {
        let mut wal = WriteAheadLog::new(test_logger(), Box::new(InMemoryLog::create()), None).unwrap();
        for term in terms {
            wal.append(vec![WriteAheadLogEntry {
                term: Term::new(*term),
                payload: EntryPayload::Command {
                    client_id: "c".into(),
                    call_id: *term,
                    data: Bytes::from_static(b"x"),
                },
            }])
            .unwrap();
        }
        wal
    }

    #[test]
    fn request_starts_at_next_and_respects_batch_limit() {
        let wal = wal_with_terms(&[1, 1, 2, 2, 2]);
        let me = ReplicaId::new("me");

        let input = new_append_entries_request(&wal, &options(2), Term::new(2), &me, Index::new(3))
            .unwrap()
            .unwrap();
        assert_eq!(input.leader_previous_log_entry, Some((Term::new(1), Index::new(2))));
        assert_eq!(input.new_entries.len(), 2);
        assert_eq!(input.leader_term, Term::new(2));

        // Caught up peer gets a heartbeat.
        let input = new_append_entries_request(&wal, &options(2), Term::new(2), &me, Index::new(6))
            .unwrap()
            .unwrap();
        assert_eq!(input.leader_previous_log_entry, Some((Term::new(2), Index::new(5))));
        assert!(input.new_entries.is_empty());

        // Brand new follower.
        let input = new_append_entries_request(&wal, &options(10), Term::new(2), &me, Index::new(1))
            .unwrap()
            .unwrap();
        assert_eq!(input.leader_previous_log_entry, None);
        assert_eq!(input.new_entries.len(), 5);
    }

    #[test]
    fn purged_entries_need_a_snapshot() {
        let mut wal = wal_with_terms(&[1, 1, 1, 2, 2, 2]);
        wal.ratchet_fwd_commit_index_if_valid(Index::new(6), Term::new(2)).unwrap();
        wal.set_snapshot_floor(Term::new(2), Index::new(4));
        wal.purge(Index::new(4)).unwrap();
        let me = ReplicaId::new("me");

        assert!(new_append_entries_request(&wal, &options(10), Term::new(2), &me, Index::new(2))
            .unwrap()
            .is_none());
        // Right after the floor still works: the floor's term is known.
        let input = new_append_entries_request(&wal, &options(10), Term::new(2), &me, Index::new(5))
            .unwrap()
            .unwrap();
        assert_eq!(input.leader_previous_log_entry, Some((Term::new(2), Index::new(4))));
        assert_eq!(input.new_entries.len(), 2);
    }
}
