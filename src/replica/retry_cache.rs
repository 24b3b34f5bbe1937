use crate::commitlog::Index;
use bytes::Bytes;
use std::collections::HashMap;
use tokio::time::{Duration, Instant};

/// Identifies one logical client request across retries.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub(crate) struct RetryKey {
    pub(crate) client_id: String,
    pub(crate) call_id: u64,
}

impl RetryKey {
    pub(crate) fn new(client_id: impl Into<String>, call_id: u64) -> Self {
        RetryKey {
            client_id: client_id.into(),
            call_id,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
enum EntryState {
    /// Accepted by the leader, not yet in the log.
    Pending,
    /// In the log at `index`, not yet committed.
    Submitted { index: Index },
    /// Handed to the state machine at `index`.
    Dispatched { index: Index },
    Applied { index: Index, result: Bytes },
}

struct CacheEntry<W> {
    state: EntryState,
    waiters: Vec<W>,
    // Creation time, or completion time once applied.
    updated_at: Instant,
}

/// Outcome of looking up a client request.
#[derive(Debug, PartialEq)]
pub(crate) enum Lookup {
    /// First time we see this request. Caller should append it to the log.
    Created,
    /// Same request is already being processed. Caller should wait for it.
    InProgress,
    /// Same request was already applied, here is what the state machine returned.
    Applied { index: Index, result: Bytes },
}

/// What to do with a committed command.
#[derive(Debug, PartialEq)]
pub(crate) enum Dispatch {
    Apply,
    /// Same request was already applied (or is being applied) at `original_index`.
    Duplicate { original_index: Index },
}

#[derive(Debug, thiserror::Error, PartialEq)]
#[error("Retry cache is full")]
pub(crate) struct RetryCacheFull;

/// RetryCache remembers the outcome of client requests, so that a client retrying a request
/// (possibly against a different leader) gets the original result instead of a second
/// application. `W` is whatever the caller uses to notify waiting clients.
///
/// Every replica fills the cache as it applies committed entries, so a newly elected leader
/// can answer retries too.
pub(crate) struct RetryCache<W> {
    entries: HashMap<RetryKey, CacheEntry<W>>,
    capacity: usize,
    expiry: Duration,
}

impl<W> RetryCache<W> {
    pub(crate) fn new(capacity: usize, expiry: Duration) -> Self {
        RetryCache {
            entries: HashMap::new(),
            capacity,
            expiry,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn get_or_create(&mut self, key: RetryKey, now: Instant) -> Result<Lookup, RetryCacheFull> {
        if let Some(entry) = self.entries.get(&key) {
            return Ok(match &entry.state {
                EntryState::Applied { index, result } => Lookup::Applied {
                    index: *index,
                    result: result.clone(),
                },
                _ => Lookup::InProgress,
            });
        }

        if !self.make_room(now) {
            return Err(RetryCacheFull);
        }

        self.entries.insert(key, CacheEntry::new(EntryState::Pending, now));
        Ok(Lookup::Created)
    }

    /// Returns false (and drops nothing) if the key is unknown, so caller can respond itself.
    pub(crate) fn add_waiter(&mut self, key: &RetryKey, waiter: W) -> Result<(), W> {
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.waiters.push(waiter);
                Ok(())
            }
            None => Err(waiter),
        }
    }

    /// Request is in the log at `index`. Creates the entry if it doesn't exist, which happens for
    /// uncommitted entries inherited by a new leader.
    pub(crate) fn mark_submitted(&mut self, key: RetryKey, index: Index, now: Instant) {
        let entry = self
            .entries
            .entry(key)
            .or_insert_with(|| CacheEntry::new(EntryState::Pending, now));
        if matches!(entry.state, EntryState::Pending | EntryState::Submitted { .. }) {
            entry.state = EntryState::Submitted { index };
        }
    }

    /// Request at `index` is committed. Decides whether it must be applied, or whether it is a
    /// retry of a request that was already applied at an earlier index.
    pub(crate) fn mark_dispatched(&mut self, key: RetryKey, index: Index, now: Instant) -> Dispatch {
        if !self.entries.contains_key(&key) {
            // Followers must apply regardless of capacity.
            self.make_room(now);
        }

        let entry = self
            .entries
            .entry(key)
            .or_insert_with(|| CacheEntry::new(EntryState::Pending, now));

        match entry.state {
            EntryState::Dispatched { index: original_index } | EntryState::Applied { index: original_index, .. }
                if original_index != index =>
            {
                Dispatch::Duplicate { original_index }
            }
            _ => {
                entry.state = EntryState::Dispatched { index };
                Dispatch::Apply
            }
        }
    }

    /// Request at `index` was applied. Returns the waiters to notify with `result`.
    pub(crate) fn complete(&mut self, key: &RetryKey, index: Index, result: Bytes, now: Instant) -> Vec<W> {
        let entry = match self.entries.get_mut(key) {
            Some(entry) => entry,
            None => return Vec::new(),
        };

        match entry.state {
            EntryState::Dispatched { index: dispatched } if dispatched == index => {
                entry.state = EntryState::Applied { index, result };
                entry.updated_at = now;
                std::mem::take(&mut entry.waiters)
            }
            _ => Vec::new(),
        }
    }

    /// Removes every waiter, e.g. when we stop being leader. Requests that never made it into the
    /// log are forgotten, so a retry is treated as new.
    pub(crate) fn drain_waiters(&mut self) -> Vec<W> {
        self.entries
            .retain(|_, entry| !matches!(entry.state, EntryState::Pending));
        self.entries
            .values_mut()
            .flat_map(|entry| std::mem::take(&mut entry.waiters))
            .collect()
    }

    /// Log was truncated from `index`. Requests only known from the removed entries are
    /// forgotten; their waiters are returned.
    pub(crate) fn remove_uncommitted_from(&mut self, index: Index) -> Vec<W> {
        let removed_keys: Vec<RetryKey> = self
            .entries
            .iter()
            .filter(|(_, entry)| matches!(entry.state, EntryState::Submitted { index: i } if i >= index))
            .map(|(key, _)| key.clone())
            .collect();

        removed_keys
            .into_iter()
            .filter_map(|key| self.entries.remove(&key))
            .flat_map(|entry| entry.waiters)
            .collect()
    }

    /// Drops applied entries older than the expiry.
    pub(crate) fn expire(&mut self, now: Instant) {
        let expiry = self.expiry;
        self.entries.retain(|_, entry| {
            let applied = matches!(entry.state, EntryState::Applied { .. });
            !(applied && now.saturating_duration_since(entry.updated_at) >= expiry)
        });
    }

    fn make_room(&mut self, now: Instant) -> bool {
        if self.entries.len() < self.capacity {
            return true;
        }

        self.expire(now);
        if self.entries.len() < self.capacity {
            return true;
        }

        // Still full: evict the oldest applied entry. In-flight requests are never evicted.
        let oldest_applied = self
            .entries
            .iter()
            .filter(|(_, entry)| matches!(entry.state, EntryState::Applied { .. }) && entry.waiters.is_empty())
            .min_by_key(|(_, entry)| entry.updated_at)
            .map(|(key, _)| key.clone());

        match oldest_applied {
            Some(key) => {
                self.entries.remove(&key);
                true
            }
            None => false,
        }
    }
}

impl<W> CacheEntry<W> {
    fn new(state: EntryState, now: Instant) -> Self {
        CacheEntry {
            state,
            waiters: Vec::new(),
            updated_at: now,
        }
    }
}
