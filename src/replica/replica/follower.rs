//! Receiving side of AppendEntries and InstallSnapshot.

use super::Replica;
use crate::commitlog::Index;
use crate::replica::applier::ApplierInput;
use crate::replica::local_state::Term;
use crate::replica::snapshot::{IncomingSnapshot, IncomingSnapshotError, Snapshot};
use crate::replica::{
    AppendEntriesError, AppendEntriesInput, AppendEntriesOutput, ElectionStateSnapshot, EntryPayload,
    InstallSnapshotError, InstallSnapshotInput, InstallSnapshotOutput, LeaderRedirectInfo, ReplicaId, SubmitError,
    TermOutOfDateInfo,
};
use std::cmp;
use std::io;
use tokio::time::Instant;

/// Why a request from a leader was turned down before looking at its payload.
enum LeaderCheckError {
    NotInCluster,
    TermOutOfDate(Term),
    Io(io::Error),
}

impl Replica {
    /// Common part of every request coming from a leader: term check, following the leader and
    /// resetting our election timer.
    fn accept_leader(&mut self, leader_id: &ReplicaId, leader_term: Term) -> Result<(), LeaderCheckError> {
        // Ensure leader is known member.
        let leader_info = match self.leader_info(leader_id) {
            Some(leader_info) => leader_info,
            None => return Err(LeaderCheckError::NotInCluster),
        };

        // 1. Reply false if term < currentTerm (§5.1)
        let current_term = self.current_term();
        if leader_term < current_term {
            return Err(LeaderCheckError::TermOutOfDate(current_term));
        }

        let increased = self
            .observe_term(leader_term, Some(leader_info.clone()))
            .map_err(LeaderCheckError::Io)?;
        if !increased {
            self.follow(leader_info);
        }

        self.election_state.reset_timeout_if_follower();
        self.last_leader_contact = Some(Instant::now());
        Ok(())
    }

    /// Same term, a leader talked to us. Candidates give up, followers learn who the leader is.
    fn follow(&mut self, leader_info: LeaderRedirectInfo) {
        match self.election_state.current_state() {
            ElectionStateSnapshot::Follower(_) | ElectionStateSnapshot::FollowerNoLeader => {
                self.election_state.set_leader_if_unknown(&leader_info);
            }
            ElectionStateSnapshot::Leader => {
                // Two leaders in one term would break election safety.
                slog::crit!(
                    self.logger,
                    "{:?} claims to lead our term. Stepping down.",
                    leader_info.replica_id
                );
                self.become_follower(Some(leader_info));
            }
            ElectionStateSnapshot::Candidate | ElectionStateSnapshot::PreCandidate => {
                self.become_follower(Some(leader_info));
            }
            ElectionStateSnapshot::Halted(_) => {}
        }
    }

    pub(crate) fn server_handle_append_entries(
        &mut self,
        input: AppendEntriesInput,
    ) -> Result<AppendEntriesOutput, AppendEntriesError> {
        if self.election_state.is_halted() {
            return Err(AppendEntriesError::Halted);
        }

        match self.accept_leader(&input.leader_id, input.leader_term) {
            Ok(()) => {}
            Err(LeaderCheckError::NotInCluster) => return Err(AppendEntriesError::ClientNotInCluster),
            Err(LeaderCheckError::TermOutOfDate(current_term)) => {
                return Err(AppendEntriesError::ClientTermOutOfDate(TermOutOfDateInfo {
                    current_term,
                }))
            }
            Err(LeaderCheckError::Io(e)) => return Err(AppendEntriesError::ServerIoError(e)),
        }

        match self.append_from_leader(input) {
            Ok(result) => result,
            Err(e) => {
                self.halt(format!("Failed to write log: {:?}", e));
                Err(AppendEntriesError::ServerIoError(e))
            }
        }
    }

    // Outer error is a local IO failure, inner error is the reply for the leader.
    #[allow(clippy::type_complexity)]
    fn append_from_leader(
        &mut self,
        input: AppendEntriesInput,
    ) -> Result<Result<AppendEntriesOutput, AppendEntriesError>, io::Error> {
        let floor_index = self.write_ahead_log.snapshot_floor().map(|(_, index)| index);

        // 2. Reply false if [my] log doesn't contain an entry at [leader's]
        // prevLogIndex whose term matches [leader's] prevLogTerm (§5.3)
        if let Some((leader_prev_term, leader_prev_index)) = input.leader_previous_log_entry {
            // Entries covered by our snapshot are committed, so they match any leader's.
            let covered_by_snapshot = matches!(floor_index, Some(floor) if leader_prev_index <= floor);
            if !covered_by_snapshot && self.write_ahead_log.term_at(leader_prev_index)? != Some(leader_prev_term) {
                let hint = self
                    .write_ahead_log
                    .conflict_hint(leader_prev_term, leader_prev_index)?;
                slog::debug!(
                    self.logger,
                    "Missing ({:?}, {:?}) from leader. Hinting {:?}",
                    leader_prev_term,
                    leader_prev_index,
                    hint
                );
                return Ok(Err(AppendEntriesError::ServerMissingPreviousLogEntry(hint)));
            }
        }

        // 3. If [my] existing entry conflicts with [leader's new entries]
        // (same index but different terms), delete [my] existing entry and
        // all that follow it (§5.3)
        // 4. Append any new entries not already in the log
        let first_new_index = match input.leader_previous_log_entry {
            None => Index::start_index(),
            Some((_, leader_prev_index)) => leader_prev_index.plus(1),
        };
        let index_of_last_new_entry = first_new_index
            .plus(input.new_entries.len() as u64)
            .checked_minus(1);

        let mut to_append = Vec::new();
        let mut append_at = first_new_index;
        for (offset, new_entry) in input.new_entries.into_iter().enumerate() {
            let index = first_new_index.plus(offset as u64);
            if !to_append.is_empty() {
                to_append.push(new_entry);
                continue;
            }
            if matches!(floor_index, Some(floor) if index <= floor) {
                continue;
            }

            match self.write_ahead_log.term_at(index)? {
                // 4. (no-op)
                Some(existing_term) if existing_term == new_entry.term => continue,
                // 3. (delete)
                Some(_) => self.truncate_log(index)?,
                None => {}
            }
            append_at = index;
            to_append.push(new_entry);
        }

        if !to_append.is_empty() {
            let expected_last = append_at.plus(to_append.len() as u64 - 1);
            let configurations: Vec<_> = to_append
                .iter()
                .enumerate()
                .filter_map(|(offset, entry)| match &entry.payload {
                    EntryPayload::Configuration(configuration) => {
                        Some((append_at.plus(offset as u64), configuration.clone()))
                    }
                    _ => None,
                })
                .collect();

            // 4. (append)
            let appended_last = self.write_ahead_log.append(to_append)?;
            if appended_last != expected_last {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    format!(
                        "Appended log entries up to {:?}, expected {:?}",
                        appended_last, expected_last
                    ),
                ));
            }

            // A configuration takes effect as soon as it's in the log.
            for (index, configuration) in configurations {
                slog::info!(self.logger, "Adopting configuration at {:?}: {:?}", index, configuration);
                self.cluster_tracker.on_configuration_appended(index, configuration);
            }
        }

        // Success means durable.
        self.write_ahead_log.flush()?;

        // 5. If leaderCommit > commitIndex, set commitIndex = min(leaderCommit, index of last new entry)
        if let (Some(leader_commit), Some(last_new)) = (input.leader_commit_index, index_of_last_new_entry) {
            if self
                .write_ahead_log
                .ratchet_fwd_commit_index_if_changed(cmp::min(leader_commit, last_new))
            {
                // > If commitIndex > lastApplied: increment lastApplied, apply
                // > log[lastApplied] to state machine (§5.3)
                self.dispatch_committed_entries();
            }
        }

        Ok(Ok(AppendEntriesOutput {}))
    }

    /// Removes our conflicting tail starting at `index`, along with anything we derived from it.
    fn truncate_log(&mut self, index: Index) -> Result<(), io::Error> {
        slog::info!(self.logger, "Log conflicts with leader at {:?}. Truncating.", index);
        self.write_ahead_log.truncate(index)?;

        if self.cluster_tracker.truncate_from(index) {
            slog::info!(
                self.logger,
                "Reverted to configuration {:?}",
                self.cluster_tracker.current()
            );
        }
        for waiter in self.retry_cache.remove_uncommitted_from(index) {
            waiter.send(Err(SubmitError::LeadershipLost));
        }

        Ok(())
    }

    pub(crate) fn server_handle_install_snapshot(
        &mut self,
        input: InstallSnapshotInput,
    ) -> Result<InstallSnapshotOutput, InstallSnapshotError> {
        if self.election_state.is_halted() {
            return Err(InstallSnapshotError::Halted);
        }

        match self.accept_leader(&input.leader_id, input.leader_term) {
            Ok(()) => {}
            Err(LeaderCheckError::NotInCluster) => return Err(InstallSnapshotError::ClientNotInCluster),
            Err(LeaderCheckError::TermOutOfDate(current_term)) => {
                return Err(InstallSnapshotError::ClientTermOutOfDate(TermOutOfDateInfo {
                    current_term,
                }))
            }
            Err(LeaderCheckError::Io(e)) => return Err(InstallSnapshotError::ServerIoError(e)),
        }

        // A chunk at offset 0 always starts a transfer over.
        if input.offset == 0 {
            self.incoming_snapshot = Some(IncomingSnapshot::new(input.leader_term, input.metadata.clone()));
        }
        let incoming = match self.incoming_snapshot.as_mut() {
            Some(incoming) if incoming.is_same_transfer(input.leader_term, &input.metadata) => incoming,
            _ => {
                self.incoming_snapshot = None;
                return Err(InstallSnapshotError::OffsetMismatch { expected_offset: 0 });
            }
        };

        match incoming.accept_chunk(input.offset, &input.data) {
            Ok(()) => {}
            Err(IncomingSnapshotError::OffsetMismatch { expected_offset }) => {
                return Err(InstallSnapshotError::OffsetMismatch { expected_offset });
            }
            Err(IncomingSnapshotError::Corrupt) => {
                slog::warn!(self.logger, "Snapshot chunk overflows the snapshot. Restarting transfer.");
                self.incoming_snapshot = None;
                return Err(InstallSnapshotError::OffsetMismatch { expected_offset: 0 });
            }
        }

        if !input.done {
            return Ok(InstallSnapshotOutput {});
        }

        let snapshot = match self.incoming_snapshot.take().map(IncomingSnapshot::finish) {
            Some(Ok(snapshot)) => snapshot,
            Some(Err(e)) => {
                slog::warn!(self.logger, "Received snapshot is invalid: {}. Restarting transfer.", e);
                return Err(InstallSnapshotError::OffsetMismatch { expected_offset: 0 });
            }
            None => return Err(InstallSnapshotError::OffsetMismatch { expected_offset: 0 }),
        };

        match self.install_snapshot_from_leader(snapshot) {
            Ok(()) => Ok(InstallSnapshotOutput {}),
            Err(e) => {
                self.halt(format!("Failed to install snapshot: {:?}", e));
                Err(InstallSnapshotError::ServerIoError(e))
            }
        }
    }

    fn install_snapshot_from_leader(&mut self, snapshot: Snapshot) -> Result<(), io::Error> {
        let index = snapshot.metadata.last_included_index;
        let term = snapshot.metadata.last_included_term;

        if matches!(self.last_dispatched, Some(dispatched) if dispatched >= index) {
            slog::info!(
                self.logger,
                "Already applied up to {:?}. Ignoring snapshot at {:?}.",
                self.last_dispatched,
                index
            );
            return Ok(());
        }

        slog::info!(
            self.logger,
            "Installing snapshot from leader at index {:?} term {:?} ({} bytes)",
            index,
            term,
            snapshot.metadata.size
        );
        let configuration = snapshot.metadata.configuration.clone();
        let snapshot = self.snapshot_store.save(snapshot)?;
        self.write_ahead_log.install_snapshot(term, index)?;

        // Configurations after the snapshot may have survived in our log.
        self.cluster_tracker.reset(Some(index), configuration);
        self.replay_configurations(index.plus(1))?;

        self.last_dispatched = Some(index);
        if self.applier.send(ApplierInput::InstallSnapshot(snapshot)).is_err() {
            return Err(io::Error::new(io::ErrorKind::Other, "Applier has exited"));
        }

        Ok(())
    }

    /// Re-adopts every configuration in the log from `start` on.
    fn replay_configurations(&mut self, start: Index) -> Result<(), io::Error> {
        for (index, configuration) in self.write_ahead_log.configurations_from(start)? {
            self.cluster_tracker.on_configuration_appended(index, configuration);
        }
        Ok(())
    }
}
