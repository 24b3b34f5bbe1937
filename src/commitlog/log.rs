use std::convert::TryFrom;
use std::{fmt, io};

#[derive(Copy, Clone, PartialOrd, PartialEq, Ord, Eq, Hash)]
struct U64NonZero(u64);

impl U64NonZero {
    fn new(val: u64) -> Self {
        assert_ne!(val, 0);
        U64NonZero(val)
    }
}

/// Index is an index of an entry in the log; i.e. a log entry's index.
#[derive(Copy, Clone, PartialOrd, PartialEq, Ord, Eq, Hash)]
pub struct Index(U64NonZero);

impl Index {
    pub fn new(index: u64) -> Self {
        Index(U64NonZero::new(index))
    }

    pub fn new_usize(index: usize) -> Self {
        Self::new(index as u64)
    }

    /// `from_u64()` maps the wire/disk representation (0 = no entry) into an optional index.
    pub fn from_u64(index: u64) -> Option<Self> {
        match index {
            0 => None,
            i => Some(Index::new(i)),
        }
    }

    pub fn start_index() -> Self {
        Self::new(1)
    }

    pub fn as_u64(&self) -> u64 {
        self.0 .0
    }

    pub fn plus(&self, delta: u64) -> Index {
        Index::new(self.as_u64() + delta)
    }

    pub fn minus(&self, delta: u64) -> Index {
        Index::new(self.as_u64() - delta)
    }

    pub fn checked_minus(&self, delta: u64) -> Option<Index> {
        Index::from_u64(self.as_u64().saturating_sub(delta))
    }
}

impl fmt::Debug for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0 .0)
    }
}

/// Converts an optional index into its wire/disk representation.
pub fn index_as_u64(index: Option<Index>) -> u64 {
    index.map(|i| i.as_u64()).unwrap_or(0)
}

/// Log is an append only log intended for use as a replicated commit log in a database.
///
/// Log indexes entries starting from 1. There will be no entry existing at index 0. The first
/// entry is written at index 1, unless the log was `reset()` to start at a later index.
///
/// Entries can be removed from the tail (`truncate()`) and from the head (`purge()`). A purge may
/// retain more entries than asked for, depending on the implementation's storage granularity.
pub trait Log<E: Entry>: Send {
    /// append() appends entries to the log starting at `next_index()`, then returns the index of
    /// the last appended entry. Returns once the write is durable as far as the log's sync policy
    /// requires; `flushed_index()` reports how far the log is actually durable.
    fn append(&mut self, entries: Vec<E>) -> Result<Index, io::Error>;

    /// Read log entry at specified index. Returns None for purged or not-yet-written indexes.
    fn read(&self, index: Index) -> Result<Option<E>, io::Error>;

    /// Read entries in `[start, end_exclusive)`. Stops early at the first missing entry.
    fn read_range(&self, start: Index, end_exclusive: Index) -> Result<Vec<E>, io::Error> {
        let mut entries = Vec::new();
        let mut index = start;
        while index < end_exclusive {
            match self.read(index)? {
                Some(entry) => entries.push(entry),
                None => break,
            }
            index = index.plus(1);
        }

        Ok(entries)
    }

    /// Deletes everything starting at `index` and later.
    fn truncate(&mut self, index: Index) -> Result<(), io::Error>;

    /// Deletes entries up to and including `up_to`, at the storage's granularity.
    fn purge(&mut self, up_to: Index) -> Result<(), io::Error>;

    /// Deletes every entry. The next append will be written at `next_index`.
    fn reset(&mut self, next_index: Index) -> Result<(), io::Error>;

    /// Makes every appended entry durable.
    fn flush(&mut self) -> Result<(), io::Error>;

    /// Index of the first retained entry. Equal to `next_index()` when the log is empty.
    fn first_index(&self) -> Index;

    /// next_index returns the next index that will be used to append an entry.
    fn next_index(&self) -> Index;

    /// Highest index known to be durable.
    fn flushed_index(&self) -> Option<Index>;
}

pub trait Entry: Clone + Send + Into<Vec<u8>> + TryFrom<Vec<u8>, Error = io::Error> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_arithmetic() {
        let i = Index::new(5);
        assert_eq!(i.plus(2), Index::new(7));
        assert_eq!(i.minus(4), Index::start_index());
        assert_eq!(i.checked_minus(5), None);
        assert_eq!(i.checked_minus(9), None);
        assert_eq!(Index::from_u64(0), None);
        assert_eq!(index_as_u64(Some(i)), 5);
        assert_eq!(index_as_u64(None), 0);
    }
}
