//! In-memory segment store.
//!
//! Used when the buffer has no storage directory, and by tests that need a
//! store with a tiny capacity. Contents live as long as the backend does.

use crate::encoding::{decode_attributes, decode_timestamp, encode_attributes, encode_key};
use crate::segment::{SegmentBackend, SegmentStore, SharedSegment, charge};
use crate::{Attributes, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// A segment store backed by an ordered map on the heap.
pub struct MemorySegment {
    inner: RwLock<MemoryInner>,
    capacity: Option<u64>,
}

#[derive(Default)]
struct MemoryInner {
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
    used: u64,
}

impl MemorySegment {
    /// Creates an empty store with an optional byte quota.
    pub fn new(capacity: Option<u64>) -> Self {
        Self {
            inner: RwLock::new(MemoryInner::default()),
            capacity,
        }
    }

    /// Number of stored samples across all feeds.
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    /// Returns true when the store holds no samples.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SegmentStore for MemorySegment {
    fn upsert(&self, feed_id: &str, timestamp: i64, attributes: &Attributes) -> Result<()> {
        let key = encode_key(feed_id, timestamp)?;
        let value = encode_attributes(attributes)?;

        let mut inner = self.inner.write();
        let replaced = inner
            .entries
            .get(&key)
            .map(|old| (key.len() + old.len()) as u64)
            .unwrap_or(0);
        let incoming = (key.len() + value.len()) as u64;
        inner.used = charge(self.capacity, inner.used, replaced, incoming)?;
        inner.entries.insert(key, value);
        Ok(())
    }

    fn range_scan(&self, feed_id: &str, start: i64, end: i64) -> Result<Vec<(i64, Attributes)>> {
        if start > end {
            return Ok(Vec::new());
        }
        let lo = encode_key(feed_id, start)?;
        let hi = encode_key(feed_id, end)?;

        let inner = self.inner.read();
        inner
            .entries
            .range(lo..=hi)
            .map(|(key, value)| Ok((decode_timestamp(key)?, decode_attributes(value)?)))
            .collect()
    }

    fn last_before_or_at(
        &self,
        feed_id: &str,
        end: i64,
        start: i64,
    ) -> Result<Option<(i64, Attributes)>> {
        if start > end {
            return Ok(None);
        }
        let lo = encode_key(feed_id, start)?;
        let hi = encode_key(feed_id, end)?;

        let inner = self.inner.read();
        match inner.entries.range(lo..=hi).next_back() {
            Some((key, value)) => Ok(Some((decode_timestamp(key)?, decode_attributes(value)?))),
            None => Ok(None),
        }
    }

    fn used_bytes(&self) -> u64 {
        self.inner.read().used
    }

    fn capacity_bytes(&self) -> Option<u64> {
        self.capacity
    }
}

/// Hands out [`MemorySegment`]s keyed by `(partition, segment)`.
pub struct MemoryBackend {
    segments: Mutex<HashMap<(u64, usize), Arc<MemorySegment>>>,
    capacity: Option<u64>,
}

impl MemoryBackend {
    /// Creates a backend whose segments share the given byte quota.
    pub fn new(capacity: Option<u64>) -> Self {
        Self {
            segments: Mutex::new(HashMap::new()),
            capacity,
        }
    }
}

impl SegmentBackend for MemoryBackend {
    fn open(&self, partition: u64, segment: usize) -> Result<SharedSegment> {
        let store = self
            .segments
            .lock()
            .entry((partition, segment))
            .or_insert_with(|| Arc::new(MemorySegment::new(self.capacity)))
            .clone();
        Ok(store)
    }

    fn destroy(&self, partition: u64, segment: usize) -> Result<()> {
        self.segments.lock().remove(&(partition, segment));
        Ok(())
    }

    fn remove_partition(&self, partition: u64) -> Result<()> {
        self.segments.lock().retain(|(p, _), _| *p != partition);
        Ok(())
    }

    fn existing_partitions(&self) -> Result<Vec<u64>> {
        let mut partitions: Vec<u64> = self.segments.lock().keys().map(|(p, _)| *p).collect();
        partitions.sort_unstable();
        partitions.dedup();
        Ok(partitions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TelebufError;

    fn attrs(value: &str) -> Attributes {
        let mut attrs = Attributes::new();
        attrs.insert("v".to_string(), value.to_string());
        attrs
    }

    #[test]
    fn range_scan_is_inclusive_and_ordered() {
        let store = MemorySegment::new(None);
        for ts in [30, 10, 20, 40] {
            store.upsert("feed", ts, &attrs(&ts.to_string())).unwrap();
        }
        store.upsert("other", 20, &attrs("x")).unwrap();

        let got = store.range_scan("feed", 10, 30).unwrap();
        let timestamps: Vec<i64> = got.iter().map(|(ts, _)| *ts).collect();
        assert_eq!(timestamps, vec![10, 20, 30]);
        assert_eq!(got[1].1, attrs("20"));

        assert!(store.range_scan("feed", 31, 39).unwrap().is_empty());
        assert!(store.range_scan("feed", 30, 10).unwrap().is_empty());
        assert!(store.range_scan("missing", 0, 100).unwrap().is_empty());
    }

    #[test]
    fn last_before_or_at_honours_both_bounds() {
        let store = MemorySegment::new(None);
        for ts in [10, 20, 30] {
            store.upsert("feed", ts, &attrs(&ts.to_string())).unwrap();
        }

        assert_eq!(
            store.last_before_or_at("feed", 25, 0).unwrap(),
            Some((20, attrs("20")))
        );
        assert_eq!(
            store.last_before_or_at("feed", 30, 0).unwrap(),
            Some((30, attrs("30")))
        );
        assert_eq!(store.last_before_or_at("feed", 29, 21).unwrap(), None);
        assert_eq!(store.last_before_or_at("feed", 5, 0).unwrap(), None);
    }

    #[test]
    fn overwrite_replaces_attributes_and_usage() {
        let store = MemorySegment::new(None);
        store.upsert("feed", 1, &attrs("a")).unwrap();
        let used = store.used_bytes();
        store.upsert("feed", 1, &attrs("b")).unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.used_bytes(), used);
        assert_eq!(store.range_scan("feed", 1, 1).unwrap(), vec![(1, attrs("b"))]);
    }

    #[test]
    fn full_store_keeps_earlier_entries() {
        let probe = MemorySegment::new(None);
        probe.upsert("feed", 1, &attrs("a")).unwrap();
        let one_entry = probe.used_bytes();

        let store = MemorySegment::new(Some(one_entry * 2));
        let mut samples = crate::FeedSamples::new();
        for ts in 1..=5 {
            samples.insert(ts, attrs("a"));
        }

        let outcome = store.upsert_batch("feed", &samples);
        assert_eq!(outcome.written, 2);
        assert!(matches!(outcome.error, Some(TelebufError::StoreFull { .. })));
        let extent = outcome.extent.unwrap();
        assert_eq!((extent.start, extent.end), (1, 2));
        assert_eq!(store.range_scan("feed", 0, 10).unwrap().len(), 2);
    }

    #[test]
    fn backend_reopens_and_destroys() {
        let backend = MemoryBackend::new(None);
        backend.open(3, 0).unwrap().upsert("feed", 1, &attrs("a")).unwrap();
        backend.open(5, 1).unwrap();

        let reopened = backend.open(3, 0).unwrap();
        assert_eq!(reopened.range_scan("feed", 1, 1).unwrap().len(), 1);
        assert_eq!(backend.existing_partitions().unwrap(), vec![3, 5]);

        backend.destroy(3, 0).unwrap();
        assert!(backend.open(3, 0).unwrap().range_scan("feed", 1, 1).unwrap().is_empty());

        backend.remove_partition(3).unwrap();
        assert_eq!(backend.existing_partitions().unwrap(), vec![5]);
    }
}
