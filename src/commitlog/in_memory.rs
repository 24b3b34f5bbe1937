use crate::commitlog::{Entry, Index, Log};
use std::convert::TryFrom;
use std::io;
use std::marker::PhantomData;

/// InMemoryLog keeps the whole log in RAM. Used for volatile replicas and tests.
///
/// Entries are stored in their serialized form to exercise the same conversion logic as the
/// on-disk log.
pub struct InMemoryLog<E: Entry> {
    log: Vec<Vec<u8>>,
    // Index of `log[0]`.
    first_index: Index,
    _pd: PhantomData<E>,
}

impl<E: Entry> InMemoryLog<E> {
    pub fn create() -> Self {
        InMemoryLog {
            log: vec![],
            first_index: Index::start_index(),
            _pd: PhantomData::default(),
        }
    }

    fn vec_index(&self, index: Index) -> Option<usize> {
        if index < self.first_index {
            None
        } else {
            Some((index.as_u64() - self.first_index.as_u64()) as usize)
        }
    }
}

impl<E: Entry> Log<E> for InMemoryLog<E> {
    fn append(&mut self, entries: Vec<E>) -> Result<Index, io::Error> {
        if entries.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "Can't append zero entries"));
        }

        for entry in entries {
            self.log.push(entry.into());
        }

        Ok(self.next_index().minus(1))
    }

    fn read(&self, index: Index) -> Result<Option<E>, io::Error> {
        match self.vec_index(index).and_then(|i| self.log.get(i)) {
            Some(bytes) => E::try_from(bytes.clone()).map(Some),
            None => Ok(None),
        }
    }

    fn truncate(&mut self, index: Index) -> Result<(), io::Error> {
        match self.vec_index(index) {
            Some(vec_index) => self.log.truncate(vec_index),
            None => self.log.clear(),
        }

        Ok(())
    }

    fn purge(&mut self, up_to: Index) -> Result<(), io::Error> {
        if let Some(vec_index) = self.vec_index(up_to) {
            let num_to_remove = std::cmp::min(vec_index + 1, self.log.len());
            self.log.drain(..num_to_remove);
            self.first_index = self.first_index.plus(num_to_remove as u64);
        }

        Ok(())
    }

    fn reset(&mut self, next_index: Index) -> Result<(), io::Error> {
        self.log.clear();
        self.first_index = next_index;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), io::Error> {
        Ok(())
    }

    fn first_index(&self) -> Index {
        self.first_index
    }

    fn next_index(&self) -> Index {
        self.first_index.plus(self.log.len() as u64)
    }

    fn flushed_index(&self) -> Option<Index> {
        self.next_index().checked_minus(1)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Minimal entry used by commitlog tests.
    #[derive(Clone, Debug, PartialEq)]
    pub(crate) struct TestEntry(pub(crate) Vec<u8>);

    impl Entry for TestEntry {}

    impl From<TestEntry> for Vec<u8> {
        fn from(entry: TestEntry) -> Self {
            entry.0
        }
    }

    impl TryFrom<Vec<u8>> for TestEntry {
        type Error = io::Error;

        fn try_from(bytes: Vec<u8>) -> Result<Self, Self::Error> {
            Ok(TestEntry(bytes))
        }
    }

    pub(crate) fn entry(val: u8) -> TestEntry {
        TestEntry(vec![val; 3])
    }

    #[test]
    fn append_read_truncate() {
        let mut log = InMemoryLog::create();
        assert_eq!(log.append(vec![entry(1), entry(2), entry(3)]).unwrap(), Index::new(3));
        assert_eq!(log.read(Index::new(2)).unwrap(), Some(entry(2)));
        assert_eq!(log.read(Index::new(4)).unwrap(), None);

        log.truncate(Index::new(2)).unwrap();
        assert_eq!(log.next_index(), Index::new(2));
        assert_eq!(log.append(vec![entry(9)]).unwrap(), Index::new(2));
        assert_eq!(log.read(Index::new(2)).unwrap(), Some(entry(9)));
    }

    #[test]
    fn purge_and_reset_move_first_index() {
        let mut log = InMemoryLog::create();
        log.append((1..=5).map(entry).collect()).unwrap();

        log.purge(Index::new(3)).unwrap();
        assert_eq!(log.first_index(), Index::new(4));
        assert_eq!(log.read(Index::new(3)).unwrap(), None);
        assert_eq!(log.read(Index::new(4)).unwrap(), Some(entry(4)));
        assert_eq!(log.read_range(Index::new(1), Index::new(10)).unwrap(), vec![]);
        assert_eq!(
            log.read_range(Index::new(4), Index::new(10)).unwrap(),
            vec![entry(4), entry(5)]
        );

        log.reset(Index::new(20)).unwrap();
        assert_eq!(log.first_index(), Index::new(20));
        assert_eq!(log.next_index(), Index::new(20));
        assert_eq!(log.flushed_index(), Some(Index::new(19)));
        assert_eq!(log.append(vec![entry(7)]).unwrap(), Index::new(20));
    }
}
