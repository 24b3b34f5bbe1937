//! Durable log backed by size-bounded segment files.
//!
//! Directory layout:
//!
//! ```text
//! log_1-1000            closed segment, entries [1, 1000]
//! log_1001-1873         closed segment
//! log_inprogress_1874   open segment, appended to
//! ```
//!
//! All file mutations go through a single writer thread, so the on-disk order always matches the
//! order of calls. In-memory state is only updated once the writer has acknowledged an operation.

mod cache;
mod record;
mod segment;
mod writer;

use crate::commitlog::segmented::cache::{SegmentCache, SegmentRecords};
use crate::commitlog::segmented::segment::{ClosedSegment, OpenSegment};
use crate::commitlog::segmented::writer::{LogWriter, Reopen, WriteOp};
use crate::commitlog::{Entry, Index, Log};
use std::convert::TryFrom;
use std::fs;
use std::io;
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum LogSyncPolicy {
    /// fsync as part of every append.
    EveryAppend,
    /// fsync once this many entries are unsynced. `Log::flush()` syncs the rest.
    EveryNEntries(u64),
}

#[derive(Clone, Debug)]
pub struct SegmentedLogOptions {
    pub segment_size_max: u64,
    pub segment_cache_num_max: usize,
    pub sync_policy: LogSyncPolicy,
    pub queue_size: usize,
}

pub struct SegmentedDiskLog<E: Entry> {
    logger: slog::Logger,
    directory: PathBuf,
    options: SegmentedLogOptions,

    closed: Vec<ClosedSegment>,
    open: OpenSegment,
    cache: Mutex<SegmentCache>,
    writer: LogWriter,

    unflushed_entries: u64,
    // Entries below this index are durable.
    flushed_next: u64,

    _pd: PhantomData<E>,
}

impl<E: Entry> SegmentedDiskLog<E> {
    /// Opens (or creates) the log in `directory`, recovering from an interrupted write if needed.
    pub fn open(logger: slog::Logger, directory: PathBuf, options: SegmentedLogOptions) -> io::Result<Self> {
        fs::create_dir_all(&directory)?;
        let listing = segment::list_segments(&directory)?;

        if listing.open.len() > 1 {
            return Err(segment::invalid_data(format!(
                "Found {} open segments in {:?}",
                listing.open.len(),
                directory
            )));
        }

        let expected_open_first = listing.closed.last().map(|s| s.last + 1).unwrap_or(1);
        let (open, open_path) = match listing.open.into_iter().next() {
            Some((first, path)) => {
                if !listing.closed.is_empty() && first != expected_open_first {
                    return Err(segment::invalid_data(format!(
                        "Open segment {:?} doesn't follow the last closed segment",
                        path
                    )));
                }
                (segment::recover_open(&logger, first, &path)?, path)
            }
            None => (
                OpenSegment::empty(expected_open_first),
                segment::open_segment_path(&directory, expected_open_first),
            ),
        };

        let writer = LogWriter::spawn(logger.clone(), open_path, options.queue_size)?;
        let flushed_next = open.next();

        slog::info!(
            logger,
            "Opened segmented log at {:?}: {} closed segments, next index {}",
            directory,
            listing.closed.len(),
            flushed_next
        );

        Ok(SegmentedDiskLog {
            logger,
            directory,
            cache: Mutex::new(SegmentCache::new(options.segment_cache_num_max)),
            options,
            closed: listing.closed,
            open,
            writer,
            unflushed_entries: 0,
            flushed_next,
            _pd: PhantomData::default(),
        })
    }

    fn next_u64(&self) -> u64 {
        self.open.next()
    }

    fn first_u64(&self) -> u64 {
        self.closed.first().map(|s| s.first).unwrap_or(self.open.first)
    }

    fn open_path(&self) -> PathBuf {
        segment::open_segment_path(&self.directory, self.open.first)
    }

    fn should_sync(&self) -> bool {
        match self.options.sync_policy {
            LogSyncPolicy::EveryAppend => true,
            LogSyncPolicy::EveryNEntries(n) => self.unflushed_entries >= n,
        }
    }

    fn mark_flushed(&mut self) {
        self.unflushed_entries = 0;
        self.flushed_next = self.next_u64();
    }

    fn write_to_open_segment(&mut self, payloads: Vec<Vec<u8>>, records: Vec<Vec<u8>>, sync: bool) -> io::Result<()> {
        if records.is_empty() && !sync {
            return Ok(());
        }

        self.writer.submit(WriteOp::Append { records, sync })?;
        for payload in payloads {
            self.open.push(payload);
        }

        Ok(())
    }

    fn roll_segment(&mut self) -> io::Result<()> {
        let first = self.open.first;
        let last = self.next_u64() - 1;
        let closed_path = segment::closed_segment_path(&self.directory, first, last);
        let new_open_path = segment::open_segment_path(&self.directory, last + 1);

        self.writer.submit(WriteOp::Roll {
            closed_path: closed_path.clone(),
            new_open_path,
        })?;

        let rolled = std::mem::replace(&mut self.open, OpenSegment::empty(last + 1));
        self.closed.push(ClosedSegment {
            first,
            last,
            path: closed_path,
        });
        // The rolled segment was just written, so it's likely to be read soon by replication.
        self.lock_cache()?.insert(first, Arc::new(rolled.payloads));
        // Roll syncs the rolled segment.
        self.flushed_next = std::cmp::max(self.flushed_next, last + 1);

        Ok(())
    }

    fn lock_cache(&self) -> io::Result<std::sync::MutexGuard<'_, SegmentCache>> {
        self.cache
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "Segment cache lock poisoned"))
    }

    fn closed_segment_position(&self, index: u64) -> Option<usize> {
        let pos = self.closed.partition_point(|s| s.last < index);
        match self.closed.get(pos) {
            Some(segment) if segment.first <= index => Some(pos),
            _ => None,
        }
    }

    fn closed_segment_records(&self, segment: &ClosedSegment) -> io::Result<SegmentRecords> {
        if let Some(records) = self.lock_cache()?.get(segment.first) {
            return Ok(records);
        }

        slog::debug!(self.logger, "Segment cache miss, loading {:?}", segment.path);
        let records = Arc::new(segment::load_closed(segment)?);
        self.lock_cache()?.insert(segment.first, records.clone());

        Ok(records)
    }

    fn read_payload(&self, index: u64) -> io::Result<Option<Vec<u8>>> {
        if index >= self.next_u64() || index < self.first_u64() {
            return Ok(None);
        }

        if index >= self.open.first {
            let position = (index - self.open.first) as usize;
            return Ok(self.open.payloads.get(position).cloned());
        }

        match self.closed_segment_position(index) {
            Some(pos) => {
                let segment = &self.closed[pos];
                let records = self.closed_segment_records(segment)?;
                Ok(records.get((index - segment.first) as usize).cloned())
            }
            None => Ok(None),
        }
    }

    fn truncate_within_closed(&mut self, index: u64, pos: usize) -> io::Result<()> {
        let segment = self.closed[pos].clone();
        let records = self.closed_segment_records(&segment)?;
        let keep = (index - segment.first) as usize;

        let mut delete: Vec<PathBuf> = self.closed[pos + 1..].iter().map(|s| s.path.clone()).collect();
        delete.push(self.open_path());

        let (reopen, new_open) = if keep == 0 {
            delete.push(segment.path.clone());
            let path = segment::open_segment_path(&self.directory, index);
            (
                Reopen {
                    from: path.clone(),
                    to: path,
                    len: 0,
                },
                OpenSegment::empty(index),
            )
        } else {
            let new_open = OpenSegment::from_payloads(segment.first, records[..keep].to_vec());
            (
                Reopen {
                    from: segment.path.clone(),
                    to: segment::open_segment_path(&self.directory, segment.first),
                    len: new_open.byte_len,
                },
                new_open,
            )
        };

        self.writer.submit(WriteOp::ReplaceOpen { delete, reopen })?;

        {
            let mut cache = self.lock_cache()?;
            for removed in self.closed[pos..].iter() {
                cache.remove(removed.first);
            }
        }
        self.closed.truncate(pos);
        self.open = new_open;

        Ok(())
    }
}

impl<E: Entry> Log<E> for SegmentedDiskLog<E> {
    fn append(&mut self, entries: Vec<E>) -> Result<Index, io::Error> {
        if entries.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "Can't append zero entries"));
        }

        let num_entries = entries.len() as u64;
        let mut payloads = Vec::with_capacity(entries.len());
        let mut records = Vec::with_capacity(entries.len());
        let mut pending_bytes = 0u64;

        for entry in entries {
            let payload: Vec<u8> = entry.into();
            let record = record::encode_record(&payload);

            let segment_len = self.open.byte_len + pending_bytes;
            if segment_len > 0 && segment_len + record.len() as u64 > self.options.segment_size_max {
                let full_payloads = std::mem::take(&mut payloads);
                let full_records = std::mem::take(&mut records);
                self.write_to_open_segment(full_payloads, full_records, false)?;
                self.roll_segment()?;
                pending_bytes = 0;
            }

            pending_bytes += record.len() as u64;
            payloads.push(payload);
            records.push(record);
        }

        self.unflushed_entries += num_entries;
        let sync = self.should_sync();
        self.write_to_open_segment(payloads, records, sync)?;
        if sync {
            self.mark_flushed();
        }

        Ok(Index::new(self.next_u64() - 1))
    }

    fn read(&self, index: Index) -> Result<Option<E>, io::Error> {
        match self.read_payload(index.as_u64())? {
            Some(payload) => E::try_from(payload).map(Some),
            None => Ok(None),
        }
    }

    fn truncate(&mut self, index: Index) -> Result<(), io::Error> {
        let index = index.as_u64();
        if index >= self.next_u64() {
            return Ok(());
        }
        if index <= self.first_u64() {
            return self.reset(Index::new(index));
        }

        if index >= self.open.first {
            let keep = (index - self.open.first) as usize;
            let len = self.open.offsets[keep];
            let path = self.open_path();
            self.writer.submit(WriteOp::ReplaceOpen {
                delete: Vec::new(),
                reopen: Reopen {
                    from: path.clone(),
                    to: path,
                    len,
                },
            })?;
            self.open.truncate(keep);
        } else if let Some(pos) = self.closed_segment_position(index) {
            self.truncate_within_closed(index, pos)?;
        }

        slog::info!(self.logger, "Truncated log from index {}", index);
        self.flushed_next = std::cmp::min(self.flushed_next, self.next_u64());
        Ok(())
    }

    fn purge(&mut self, up_to: Index) -> Result<(), io::Error> {
        let up_to = up_to.as_u64();
        let num_purgeable = self.closed.iter().take_while(|s| s.last <= up_to).count();
        if num_purgeable == 0 {
            return Ok(());
        }

        let paths = self.closed[..num_purgeable].iter().map(|s| s.path.clone()).collect();
        self.writer.submit(WriteOp::Delete { paths })?;

        {
            let mut cache = self
                .cache
                .lock()
                .map_err(|_| io::Error::new(io::ErrorKind::Other, "Segment cache lock poisoned"))?;
            for purged in self.closed.drain(..num_purgeable) {
                cache.remove(purged.first);
            }
        }

        slog::info!(
            self.logger,
            "Purged {} segments, first index is now {}",
            num_purgeable,
            self.first_u64()
        );
        Ok(())
    }

    fn reset(&mut self, next_index: Index) -> Result<(), io::Error> {
        let next_index = next_index.as_u64();
        let mut delete: Vec<PathBuf> = self.closed.iter().map(|s| s.path.clone()).collect();
        delete.push(self.open_path());
        let new_open_path = segment::open_segment_path(&self.directory, next_index);

        self.writer.submit(WriteOp::ReplaceOpen {
            delete,
            reopen: Reopen {
                from: new_open_path.clone(),
                to: new_open_path,
                len: 0,
            },
        })?;

        self.lock_cache()?.clear();
        self.closed.clear();
        self.open = OpenSegment::empty(next_index);
        self.mark_flushed();

        slog::info!(self.logger, "Reset log, next index is {}", next_index);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), io::Error> {
        if self.flushed_next < self.next_u64() {
            self.writer.submit(WriteOp::Flush)?;
            self.mark_flushed();
        }
        Ok(())
    }

    fn first_index(&self) -> Index {
        Index::new(self.first_u64())
    }

    fn next_index(&self) -> Index {
        Index::new(self.next_u64())
    }

    fn flushed_index(&self) -> Option<Index> {
        Index::from_u64(self.flushed_next - 1)
    }
}
