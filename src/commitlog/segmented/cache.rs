use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

pub(super) type SegmentRecords = Arc<Vec<Vec<u8>>>;

/// SegmentCache holds the payloads of recently used closed segments, keyed by the segment's first
/// index. Least-recently-used segments are evicted beyond `max_segments`.
pub(super) struct SegmentCache {
    max_segments: usize,
    segments: HashMap<u64, SegmentRecords>,
    // Front is least recently used.
    recency: VecDeque<u64>,
}

impl SegmentCache {
    pub(super) fn new(max_segments: usize) -> Self {
        SegmentCache {
            max_segments,
            segments: HashMap::with_capacity(max_segments),
            recency: VecDeque::with_capacity(max_segments),
        }
    }

    pub(super) fn get(&mut self, first: u64) -> Option<SegmentRecords> {
        let records = self.segments.get(&first).cloned()?;
        self.touch(first);
        Some(records)
    }

    pub(super) fn insert(&mut self, first: u64, records: SegmentRecords) {
        self.segments.insert(first, records);
        self.touch(first);

        while self.segments.len() > self.max_segments {
            match self.recency.pop_front() {
                Some(evicted) => {
                    self.segments.remove(&evicted);
                }
                None => break,
            }
        }
    }

    pub(super) fn remove(&mut self, first: u64) {
        self.segments.remove(&first);
        self.recency.retain(|f| *f != first);
    }

    pub(super) fn clear(&mut self) {
        self.segments.clear();
        self.recency.clear();
    }

    fn touch(&mut self, first: u64) {
        self.recency.retain(|f| *f != first);
        self.recency.push_back(first);
    }

    #[cfg(test)]
    fn resident(&self) -> Vec<u64> {
        self.recency.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records(val: u8) -> SegmentRecords {
        Arc::new(vec![vec![val]])
    }

    #[test]
    fn evicts_least_recently_used() {
        let mut cache = SegmentCache::new(2);
        cache.insert(1, records(1));
        cache.insert(10, records(10));

        // Touch 1 so that 10 becomes the eviction candidate.
        assert!(cache.get(1).is_some());
        cache.insert(20, records(20));

        assert_eq!(cache.resident(), vec![1, 20]);
        assert!(cache.get(10).is_none());
    }

    #[test]
    fn zero_capacity_caches_nothing() {
        let mut cache = SegmentCache::new(0);
        cache.insert(1, records(1));
        assert!(cache.get(1).is_none());
    }

    #[test]
    fn remove_and_clear() {
        let mut cache = SegmentCache::new(3);
        cache.insert(1, records(1));
        cache.insert(2, records(2));
        cache.remove(1);
        assert_eq!(cache.resident(), vec![2]);

        cache.clear();
        assert!(cache.get(2).is_none());
    }
}
