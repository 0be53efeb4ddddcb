//! Segment store contract.
//!
//! A segment is an ordered, persistent map from `(feed_id, timestamp_ns)` to an
//! attribute map. Every partition owns a fixed number of segments and each feed
//! id is routed to exactly one of them by the [`SegmentHasher`](crate::SegmentHasher).
//! Implementations must tolerate concurrent calls for different feed ids.

use crate::meta::PartitionTimestamps;
use crate::{Attributes, FeedSamples, Result, TelebufError};
use std::sync::Arc;

/// Ordered key-value store holding the samples of one segment.
pub trait SegmentStore: Send + Sync {
    /// Inserts or replaces the attributes stored for `(feed_id, timestamp)`.
    ///
    /// Fails with [`TelebufError::StoreFull`] when the store cannot take the
    /// entry. Previously written entries are unaffected by that failure.
    fn upsert(&self, feed_id: &str, timestamp: i64, attributes: &Attributes) -> Result<()>;

    /// Writes samples in timestamp order and stops at the first failure.
    ///
    /// Entries written before the failure stay committed.
    fn upsert_batch(&self, feed_id: &str, samples: &FeedSamples) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for (&timestamp, attributes) in samples {
            if let Err(e) = self.upsert(feed_id, timestamp, attributes) {
                outcome.error = Some(e);
                break;
            }
            outcome.record(timestamp);
        }
        outcome
    }

    /// Returns samples with `start <= timestamp <= end`, ascending.
    fn range_scan(&self, feed_id: &str, start: i64, end: i64) -> Result<Vec<(i64, Attributes)>>;

    /// Returns the newest sample with `start <= timestamp <= end`.
    fn last_before_or_at(
        &self,
        feed_id: &str,
        end: i64,
        start: i64,
    ) -> Result<Option<(i64, Attributes)>>;

    /// Bytes charged against the store's capacity.
    fn used_bytes(&self) -> u64;

    /// Configured capacity, if any.
    fn capacity_bytes(&self) -> Option<u64>;

    /// Makes buffered state durable.
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Shared segment store handle.
pub type SharedSegment = Arc<dyn SegmentStore>;

/// Result of [`SegmentStore::upsert_batch`].
#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// Number of leading entries that were committed.
    pub written: usize,
    /// Timestamp extent of the committed entries.
    pub extent: Option<PartitionTimestamps>,
    /// The failure that stopped the batch.
    pub error: Option<TelebufError>,
}

impl BatchOutcome {
    /// Records one committed timestamp.
    pub fn record(&mut self, timestamp: i64) {
        self.written += 1;
        match &mut self.extent {
            Some(extent) => extent.observe(timestamp),
            None => self.extent = Some(PartitionTimestamps::at(timestamp)),
        }
    }
}

/// Creates, reopens and destroys segment stores.
pub trait SegmentBackend: Send + Sync {
    /// Opens the store for `(partition, segment)`, creating it when missing.
    /// Existing contents are preserved.
    fn open(&self, partition: u64, segment: usize) -> Result<SharedSegment>;

    /// Discards the store for `(partition, segment)`. Open handles must have
    /// been dropped by the caller.
    fn destroy(&self, partition: u64, segment: usize) -> Result<()>;

    /// Discards every store of a partition.
    fn remove_partition(&self, partition: u64) -> Result<()>;

    /// Partition indices that currently have storage allocated.
    fn existing_partitions(&self) -> Result<Vec<u64>>;

    /// Bytes a partition occupies on the storage medium, including file
    /// overhead. Zero when the backend has no such notion.
    fn footprint_bytes(&self, _partition: u64) -> Result<u64> {
        Ok(0)
    }
}

/// Checks whether replacing `replaced` bytes with `incoming` bytes fits the quota
/// and returns the new usage.
pub(crate) fn charge(capacity: Option<u64>, used: u64, replaced: u64, incoming: u64) -> Result<u64> {
    let next = used.saturating_sub(replaced).saturating_add(incoming);
    match capacity {
        Some(capacity) if next > capacity && incoming > replaced => Err(TelebufError::StoreFull {
            capacity,
            used,
            requested: incoming - replaced,
        }),
        _ => Ok(next),
    }
}
