use crate::commitlog::{Index, Log};
use crate::replica::local_state::Term;
use crate::replica::{ClusterConfiguration, EntryPayload, WriteAheadLogEntry};
use std::io;

/// WriteAheadLog is the raft-specific log facade.
///
/// Note: A log entry has 3 states (not modeled directly in code):
/// 1. Persisted - written to disk, not yet replicated to majority
/// 2. Committed - written to disk, replicated to majority
/// 3. Applied - a committed entry that has also been applied to the state machine
///
/// A log entry's state has no global truth. Each replica will have their own local view of what
/// state the log entry is in. Applied is tracked by the replica, not here.
///
/// Entries at or below the snapshot floor may have been purged. Only the floor entry's term is
/// still known, which is all that's needed to check log consistency against it.
pub(crate) struct WriteAheadLog {
    // Application's info/debug log.
    logger: slog::Logger,

    // This is the log that we're replicating.
    log: Box<dyn Log<WriteAheadLogEntry>>,
    // Metadata about the highest log entry that we've locally written. It must be updated atomically.
    latest_entry_metadata: Option<(Term, Index)>,
    // Last entry covered by the latest snapshot.
    snapshot_floor: Option<(Term, Index)>,

    // Index of highest log entry known to be committed. None if nothing is committed.
    commit_index: Option<Index>,
}

impl WriteAheadLog {
    /// Wraps a (possibly non-empty) log. `snapshot_floor` is the last entry covered by the latest
    /// snapshot, which is also known to be committed.
    pub(crate) fn new(
        logger: slog::Logger,
        log: Box<dyn Log<WriteAheadLogEntry>>,
        snapshot_floor: Option<(Term, Index)>,
    ) -> Result<Self, io::Error> {
        let mut wal = WriteAheadLog {
            logger,
            log,
            latest_entry_metadata: None,
            snapshot_floor,
            commit_index: snapshot_floor.map(|(_, index)| index),
        };

        if let Some((_, floor_index)) = snapshot_floor {
            let first = wal.log.first_index();
            let next = wal.log.next_index();
            // Log must continue right after the snapshot, else it's useless.
            if first > floor_index.plus(1) || next <= floor_index {
                slog::warn!(
                    wal.logger,
                    "Log [{:?}, {:?}) doesn't connect to snapshot at {:?}. Discarding log.",
                    first,
                    next,
                    floor_index
                );
                wal.log.reset(floor_index.plus(1))?;
            }
        }

        wal.latest_entry_metadata = match wal.log.next_index().checked_minus(1) {
            Some(last) if last >= wal.log.first_index() => wal.read(last)?.map(|entry| (entry.term, last)),
            _ => None,
        }
        .or(snapshot_floor);

        slog::info!(
            wal.logger,
            "Loaded log: first index {:?}, latest entry {:?}, snapshot floor {:?}",
            wal.log.first_index(),
            wal.latest_entry_metadata,
            wal.snapshot_floor
        );

        Ok(wal)
    }

    pub(crate) fn latest_entry(&self) -> Option<(Term, Index)> {
        self.latest_entry_metadata
    }

    pub(crate) fn latest_index(&self) -> Option<Index> {
        self.latest_entry_metadata.map(|(_, index)| index)
    }

    pub(crate) fn snapshot_floor(&self) -> Option<(Term, Index)> {
        self.snapshot_floor
    }

    /// First index whose entry can still be read. Earlier entries only exist in the snapshot.
    pub(crate) fn first_index(&self) -> Index {
        self.log.first_index()
    }

    pub(crate) fn read(&self, index: Index) -> Result<Option<WriteAheadLogEntry>, io::Error> {
        self.log.read(index)
    }

    /// Reads entries starting at `start`, up to and including `last`, stopping once `max_bytes`
    /// or `max_entries` is reached. Always returns at least one entry if `start` exists, so a
    /// single oversized entry still makes progress.
    pub(crate) fn read_batch(
        &self,
        start: Index,
        last: Index,
        max_bytes: usize,
        max_entries: usize,
    ) -> Result<Vec<WriteAheadLogEntry>, io::Error> {
        let mut entries = Vec::new();
        let mut total_bytes = 0;
        let mut index = start;

        while index <= last && entries.len() < max_entries {
            let entry = match self.read(index)? {
                Some(entry) => entry,
                None => break,
            };

            total_bytes += entry.approx_size();
            if !entries.is_empty() && total_bytes > max_bytes {
                break;
            }
            entries.push(entry);
            index = index.plus(1);
        }

        Ok(entries)
    }

    /// Term of the entry at `index`, if still known.
    pub(crate) fn term_at(&self, index: Index) -> Result<Option<Term>, io::Error> {
        if let Some((floor_term, floor_index)) = self.snapshot_floor {
            if index == floor_index {
                return Ok(Some(floor_term));
            }
            if index < floor_index && index < self.log.first_index() {
                return Ok(None);
            }
        }

        Ok(self.read(index)?.map(|entry| entry.term))
    }

    /// Remove anything starting at `index` and later. Committed entries can never be removed.
    pub(crate) fn truncate(&mut self, index: Index) -> Result<(), io::Error> {
        if matches!(self.commit_index, Some(ci) if index <= ci) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "Refusing to truncate at {:?}, entries up to {:?} are committed",
                    index, self.commit_index
                ),
            ));
        }

        let new_latest_entry_metadata = match index.checked_minus(1) {
            Some(new_latest_index) => self.term_at(new_latest_index)?.map(|term| (term, new_latest_index)),
            None => None,
        };

        // Only update state after log action completes.
        self.log.truncate(index)?;
        self.latest_entry_metadata = new_latest_entry_metadata;

        slog::info!(self.logger, "Truncated log starting at {:?}", index);
        Ok(())
    }

    pub(crate) fn append(&mut self, entries: Vec<WriteAheadLogEntry>) -> Result<Index, io::Error> {
        let appended_term = match entries.last() {
            Some(entry) => entry.term,
            None => return Err(io::Error::new(io::ErrorKind::InvalidInput, "Nothing to append")),
        };
        let appended_index = self.log.append(entries)?;
        // Only update state after log action completes.
        self.latest_entry_metadata = Some((appended_term, appended_index));

        Ok(appended_index)
    }

    pub(crate) fn flush(&mut self) -> Result<(), io::Error> {
        self.log.flush()
    }

    /// Highest index that is durable locally. This is what a leader counts towards its own match.
    pub(crate) fn flushed_index(&self) -> Option<Index> {
        match self.log.flushed_index() {
            Some(flushed) => std::cmp::min(Some(flushed), self.latest_index()),
            // Nothing written since the snapshot; it's durable on its own.
            None => self.snapshot_floor.map(|(_, index)| index),
        }
    }

    pub(crate) fn commit_index(&self) -> Option<Index> {
        self.commit_index
    }

    /// Leader-side commit: the majority-replicated `tentative_new_commit_index` only becomes the
    /// commit index if its entry is from the current term.
    pub(crate) fn ratchet_fwd_commit_index_if_valid(
        &mut self,
        tentative_new_commit_index: Index,
        current_term: Term,
    ) -> Result<bool, io::Error> {
        if matches!(self.commit_index, Some(ci) if tentative_new_commit_index <= ci) {
            return Ok(false);
        }

        // > If there exists an N such that N > commitIndex, a majority
        // > of matchIndex[i] ≥ N, and log[N].term == currentTerm:
        // > set commitIndex = N (§5.3, §5.4).
        if self.term_at(tentative_new_commit_index)? != Some(current_term) {
            return Ok(false);
        }

        self.commit_index.replace(tentative_new_commit_index);
        Ok(true)
    }

    /// Follower-side commit: never moves backwards, never past our own log.
    pub(crate) fn ratchet_fwd_commit_index_if_changed(&mut self, new_commit_index: Index) -> bool {
        let new_commit_index = match self.latest_index() {
            Some(latest) => std::cmp::min(latest, new_commit_index),
            None => return false,
        };

        if matches!(self.commit_index, Some(ci) if new_commit_index <= ci) {
            return false;
        }

        self.commit_index.replace(new_commit_index);
        true
    }

    /// Drops entries covered by a local snapshot. `up_to` must not exceed the snapshot floor.
    pub(crate) fn purge(&mut self, up_to: Index) -> Result<(), io::Error> {
        self.log.purge(up_to)
    }

    /// Local snapshot was taken at `(term, index)`. Entries are purged separately.
    pub(crate) fn set_snapshot_floor(&mut self, term: Term, index: Index) {
        if self.snapshot_floor.map(|(_, i)| i < index).unwrap_or(true) {
            self.snapshot_floor = Some((term, index));
        }
    }

    /// Makes the log continue from a snapshot received from the leader. If we already have the
    /// snapshot's last entry, the entries after it are kept; otherwise the whole log is replaced.
    pub(crate) fn install_snapshot(&mut self, term: Term, index: Index) -> Result<(), io::Error> {
        if self.term_at(index)? == Some(term) {
            self.log.purge(index)?;
        } else {
            self.log.reset(index.plus(1))?;
            self.latest_entry_metadata = Some((term, index));
        }

        self.snapshot_floor = Some((term, index));
        if self.commit_index.map(|ci| ci < index).unwrap_or(true) {
            self.commit_index = Some(index);
        }

        Ok(())
    }

    /// Follower side of fast log backtracking. The leader's entry at `leader_prev_index` has
    /// `leader_prev_term`, which we don't match. Returns our last entry (at or below that index)
    /// with a term no greater than the leader's, which is where our logs could still agree.
    pub(crate) fn conflict_hint(
        &self,
        leader_prev_term: Term,
        leader_prev_index: Index,
    ) -> Result<Option<(Term, Index)>, io::Error> {
        let start = match self.latest_index() {
            Some(latest) => std::cmp::min(latest, leader_prev_index),
            None => return Ok(None),
        };

        self.last_entry_with_term_at_most(leader_prev_term, start)
    }

    /// Walks down from `start` to the last entry whose term is `<= max_term`.
    pub(crate) fn last_entry_with_term_at_most(
        &self,
        max_term: Term,
        start: Index,
    ) -> Result<Option<(Term, Index)>, io::Error> {
        let mut index = match self.latest_index() {
            Some(latest) => std::cmp::min(latest, start),
            None => return Ok(None),
        };

        loop {
            match self.term_at(index)? {
                Some(term) if term <= max_term => return Ok(Some((term, index))),
                Some(_) => {}
                None => return Ok(None),
            }

            index = match index.checked_minus(1) {
                Some(i) => i,
                None => return Ok(None),
            };
        }
    }

    /// Every configuration entry in the log from `start` on, in log order.
    pub(crate) fn configurations_from(&self, start: Index) -> Result<Vec<(Index, ClusterConfiguration)>, io::Error> {
        let latest = match self.latest_index() {
            Some(latest) => latest,
            None => return Ok(Vec::new()),
        };

        let mut configurations = Vec::new();
        let mut index = std::cmp::max(start, self.log.first_index());
        while index <= latest {
            if let Some(WriteAheadLogEntry {
                payload: EntryPayload::Configuration(configuration),
                ..
            }) = self.read(index)?
            {
                configurations.push((index, configuration));
            }
            index = index.plus(1);
        }

        Ok(configurations)
    }
}
