//! Moving committed entries into the state machine, and everything that comes back from it.

use super::{Replica, SnapshotRequest, TakeSnapshotCallback};
use crate::commitlog::Index;
use crate::replica::applier::{AppliedEntry, ApplierInput, ApplierOutput, ApplyItem};
use crate::replica::retry_cache::{Dispatch, RetryKey};
use crate::replica::snapshot::{SaveSnapshotError, Snapshot};
use crate::replica::{EntryPayload, SubmitOutput, TakeSnapshotError, TakeSnapshotOutput};
use std::io;
use tokio::time::Instant;

const APPLY_BATCH_SIZE: usize = 512;

impl Replica {
    /// Hands everything between what the applier has been given and the commit index to the
    /// applier, in order.
    pub(super) fn dispatch_committed_entries(&mut self) {
        if let Err(e) = self.dispatch_committed_entries_impl() {
            self.halt(format!("Failed to dispatch committed entries: {:?}", e));
            return;
        }

        if let Some(dispatched) = self.last_dispatched {
            self.cluster_tracker.compact(dispatched);
        }
        self.advance_membership_change();
    }

    fn dispatch_committed_entries_impl(&mut self) -> Result<(), io::Error> {
        let commit_index = match self.write_ahead_log.commit_index() {
            Some(commit_index) => commit_index,
            None => return Ok(()),
        };

        let now = Instant::now();
        let mut batch = Vec::new();
        let mut index = self
            .last_dispatched
            .map(|i| i.plus(1))
            .unwrap_or_else(Index::start_index);

        while index <= commit_index {
            let entry = match self.write_ahead_log.read(index)? {
                Some(entry) => entry,
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("Committed entry {:?} is missing from the log", index),
                    ))
                }
            };

            let command = match entry.payload {
                EntryPayload::Command {
                    client_id,
                    call_id,
                    data,
                } => {
                    let key = RetryKey::new(client_id, call_id);
                    match self.retry_cache.mark_dispatched(key.clone(), index, now) {
                        Dispatch::Apply => Some((key, data)),
                        Dispatch::Duplicate { original_index } => {
                            slog::info!(
                                self.logger,
                                "{:?} at {:?} duplicates {:?}. Not applying it again.",
                                key,
                                index,
                                original_index
                            );
                            None
                        }
                    }
                }
                EntryPayload::NoOp | EntryPayload::Configuration(_) => None,
            };

            batch.push(ApplyItem { index, command });
            self.last_dispatched = Some(index);
            index = index.plus(1);

            if batch.len() >= APPLY_BATCH_SIZE {
                self.send_to_applier(ApplierInput::Apply(std::mem::take(&mut batch)))?;
            }
        }

        if !batch.is_empty() {
            self.send_to_applier(ApplierInput::Apply(batch))?;
        }
        Ok(())
    }

    fn send_to_applier(&self, input: ApplierInput) -> Result<(), io::Error> {
        self.applier
            .send(input)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }

    pub(crate) fn handle_applier_output(&mut self, output: ApplierOutput) {
        match output {
            ApplierOutput::EntriesApplied(entries) => self.on_entries_applied(entries),
            ApplierOutput::ApplyFailed { index, reason } => {
                self.halt(format!("State machine failed to apply {:?}: {}", index, reason));
            }
            ApplierOutput::SnapshotTaken(result) => self.on_snapshot_taken(result),
            ApplierOutput::SnapshotInstalled { index, result } => match result {
                Ok(()) => {
                    slog::info!(self.logger, "State machine restored from snapshot at {:?}", index);
                    self.last_applied = Some(index);
                }
                Err(e) => self.halt(format!("State machine failed to install snapshot {:?}: {}", index, e)),
            },
        }
    }

    fn on_entries_applied(&mut self, entries: Vec<AppliedEntry>) {
        let now = Instant::now();
        for entry in entries {
            self.last_applied = Some(entry.index);

            if let Some(key) = entry.key {
                let waiters = self.retry_cache.complete(&key, entry.index, entry.result.clone(), now);
                for waiter in waiters {
                    waiter.send(Ok(SubmitOutput {
                        applied_index: entry.index,
                        result: entry.result.clone(),
                    }));
                }
            }
        }

        self.maybe_trigger_auto_snapshot();
    }

    fn maybe_trigger_auto_snapshot(&mut self) {
        let threshold = match self.options.snapshot_auto_trigger_threshold {
            Some(threshold) => threshold,
            None => return,
        };
        if self.snapshot_request.is_some() || self.election_state.is_halted() {
            return;
        }
        let last_applied = match self.last_applied {
            Some(last_applied) => last_applied,
            None => return,
        };

        let snapshot_index = self.snapshot_store.latest_index().map(|i| i.as_u64()).unwrap_or(0);
        let applied_since = last_applied.as_u64().saturating_sub(snapshot_index);
        if applied_since > 0 && applied_since >= threshold {
            slog::info!(
                self.logger,
                "{} entries applied since last snapshot. Taking a snapshot at {:?}.",
                applied_since,
                last_applied
            );
            // The applier snapshots after everything it was given, which is up to last_dispatched.
            if let Some(dispatched) = self.last_dispatched {
                self.request_snapshot(dispatched, None);
            }
        }
    }

    /// Asks the applier for a snapshot at `index`, which must be the last index dispatched to it.
    pub(super) fn request_snapshot(&mut self, index: Index, callback: Option<TakeSnapshotCallback>) {
        let term = match self.write_ahead_log.term_at(index) {
            Ok(Some(term)) => term,
            Ok(None) => {
                // Only reachable if the log was purged past what we dispatched.
                let reason = format!("No term known for applied index {:?}", index);
                if let Some(callback) = callback {
                    callback.send(Err(TakeSnapshotError::StateMachine(reason.clone())));
                }
                slog::error!(self.logger, "{}", reason);
                return;
            }
            Err(e) => {
                if let Some(callback) = callback {
                    callback.send(Err(TakeSnapshotError::LocalIoError(e)));
                }
                return;
            }
        };
        let configuration = self.cluster_tracker.configuration_at(index).clone();

        if self
            .applier
            .send(ApplierInput::TakeSnapshot {
                index,
                term,
                configuration,
            })
            .is_err()
        {
            self.halt("Applier has exited".to_string());
            if let Some(callback) = callback {
                callback.send(Err(TakeSnapshotError::Halted("Applier has exited".to_string())));
            }
            return;
        }

        self.snapshot_request = Some(SnapshotRequest { callback });
    }

    fn on_snapshot_taken(&mut self, result: Result<Snapshot, String>) {
        let callback = self.snapshot_request.take().and_then(|request| request.callback);

        let snapshot = match result {
            Ok(snapshot) => snapshot,
            Err(e) => {
                // The state machine is still consistent. We just don't get a snapshot.
                slog::error!(self.logger, "State machine failed to take snapshot: {}", e);
                if let Some(callback) = callback {
                    callback.send(Err(TakeSnapshotError::StateMachine(e)));
                }
                return;
            }
        };

        let index = snapshot.metadata.last_included_index;
        let term = snapshot.metadata.last_included_term;
        let size = snapshot.metadata.size;
        match self.snapshot_store.save(snapshot) {
            Ok(_) => {}
            Err(SaveSnapshotError::NotNewer { latest, .. }) => {
                // A snapshot from the leader was installed while the state machine was busy with
                // this one. It already covers everything this one does.
                slog::info!(
                    self.logger,
                    "Discarding snapshot at {:?}. Already have one at {:?}.",
                    index,
                    latest
                );
                if let Some(callback) = callback {
                    callback.send(self.latest_snapshot_output());
                }
                return;
            }
            Err(SaveSnapshotError::Io(e)) => {
                self.halt(format!("Failed to persist snapshot at {:?}: {:?}", index, e));
                if let Some(callback) = callback {
                    callback.send(Err(TakeSnapshotError::LocalIoError(e)));
                }
                return;
            }
        }
        slog::info!(self.logger, "Took snapshot at {:?} ({} bytes)", index, size);

        self.write_ahead_log.set_snapshot_floor(term, index);
        if let Some(purge_up_to) = index.checked_minus(self.options.snapshot_retention_entries) {
            if purge_up_to >= self.write_ahead_log.first_index() {
                if let Err(e) = self.write_ahead_log.purge(purge_up_to) {
                    self.halt(format!("Failed to purge log up to {:?}: {:?}", purge_up_to, e));
                }
            }
        }

        if let Some(callback) = callback {
            callback.send(Ok(TakeSnapshotOutput {
                last_included_index: index,
                last_included_term: term,
            }));
        }
    }

    pub(super) fn latest_snapshot_output(&self) -> Result<TakeSnapshotOutput, TakeSnapshotError> {
        match self.snapshot_store.latest_metadata() {
            Some(metadata) => Ok(TakeSnapshotOutput {
                last_included_index: metadata.last_included_index,
                last_included_term: metadata.last_included_term,
            }),
            None => Err(TakeSnapshotError::NothingApplied),
        }
    }
}
