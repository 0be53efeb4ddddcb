//! telebuf - A segmented, time-partitioned, disk-backed telemetry buffer
//!
//! telebuf durably holds high-rate timestamped samples (one attribute map per
//! feed per timestamp) and serves range and "latest value" queries under
//! concurrent load. Data is sharded into partitions, each partition into
//! independently locked segments, and the disk footprint is bounded by rotating
//! and evicting partitions.
//!
//! Writes are best effort across segments: a write that fails with
//! [`TelebufError::BufferFull`] may still have committed entries to the
//! segments that had room. Callers rotate and retry rather than assuming the
//! write had no effect.

pub mod buffer;
pub mod concurrency;
pub mod config;
pub mod disk;
pub mod encoding;
pub mod error;
pub mod hasher;
pub mod memory;
pub mod meta;
pub mod partition;
pub mod segment;

pub use buffer::{BufferState, FeedBuffer, FeedBufferBuilder};
pub use concurrency::{BufferPools, ElasticPool, InlineExecutor, TaskExecutor, WorkerPool};
pub use config::{BufferConfig, MetadataRefresh};
pub use error::{Result, TelebufError};
pub use hasher::SegmentHasher;
pub use meta::{PartitionMetadata, PartitionTimestamps};
pub use partition::PartitionBuffer;
pub use segment::{SegmentBackend, SegmentStore};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Free-form key/value pairs attached to a sample (rendered value, quality flag, ...).
pub type Attributes = BTreeMap<String, String>;

/// Samples of a single feed, ordered by timestamp.
pub type FeedSamples = BTreeMap<i64, Attributes>;

/// Samples keyed by feed id. Used both as a write request and as a read result.
pub type FeedData = HashMap<String, FeedSamples>;

/// Unit of the timestamps supplied by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeUnit {
    Nanoseconds,
    Microseconds,
    Milliseconds,
    Seconds,
}

impl TimeUnit {
    fn nanos_per_unit(self) -> i64 {
        match self {
            TimeUnit::Nanoseconds => 1,
            TimeUnit::Microseconds => 1_000,
            TimeUnit::Milliseconds => 1_000_000,
            TimeUnit::Seconds => 1_000_000_000,
        }
    }

    /// Converts a timestamp in this unit to nanoseconds.
    pub fn to_nanos(self, timestamp: i64) -> Result<i64> {
        timestamp
            .checked_mul(self.nanos_per_unit())
            .ok_or(TelebufError::TimestampOverflow { timestamp })
    }

    /// Converts an inclusive `[start, end]` query range in this unit to
    /// nanoseconds. The end bound covers the whole last unit. Bounds outside the
    /// nanosecond range are clamped, since no stored sample can lie beyond them.
    pub fn range_to_nanos(self, start: i64, end: i64) -> (i64, i64) {
        let per_unit = self.nanos_per_unit();
        let start_ns = start.saturating_mul(per_unit);
        let end_ns = end.saturating_mul(per_unit).saturating_add(per_unit - 1);
        (start_ns, end_ns)
    }

    /// Converts a nanosecond timestamp back to this unit, rounding down.
    pub fn from_nanos(self, nanos: i64) -> i64 {
        nanos.div_euclid(self.nanos_per_unit())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_unit_conversion() {
        assert_eq!(TimeUnit::Nanoseconds.to_nanos(42).unwrap(), 42);
        assert_eq!(TimeUnit::Microseconds.to_nanos(42).unwrap(), 42_000);
        assert_eq!(TimeUnit::Milliseconds.to_nanos(-3).unwrap(), -3_000_000);
        assert_eq!(TimeUnit::Seconds.to_nanos(2).unwrap(), 2_000_000_000);
        assert_eq!(TimeUnit::Seconds.from_nanos(2_999_999_999), 2);
        assert_eq!(TimeUnit::Microseconds.from_nanos(-1_500), -2);
    }

    #[test]
    fn ranges_cover_the_whole_end_unit() {
        assert_eq!(
            TimeUnit::Milliseconds.range_to_nanos(1, 2),
            (1_000_000, 2_999_999)
        );
        assert_eq!(TimeUnit::Nanoseconds.range_to_nanos(5, 5), (5, 5));
    }

    #[test]
    fn open_ended_ranges_are_clamped() {
        assert_eq!(
            TimeUnit::Milliseconds.range_to_nanos(0, i64::MAX),
            (0, i64::MAX)
        );
        assert_eq!(
            TimeUnit::Seconds.range_to_nanos(i64::MIN, i64::MAX),
            (i64::MIN, i64::MAX)
        );
    }

    #[test]
    fn time_unit_overflow_is_reported() {
        let err = TimeUnit::Seconds.to_nanos(i64::MAX).unwrap_err();
        assert!(matches!(
            err,
            TelebufError::TimestampOverflow { timestamp } if timestamp == i64::MAX
        ));
    }
}
