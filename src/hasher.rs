//! Feed id to segment routing.

use xxhash_rust::xxh64::xxh64;

/// Seed of the feed id hash. Must not change: persisted segments are
/// addressed by the resulting value.
const FEED_HASH_SEED: u64 = 0;

/// Maps feed ids onto a power-of-two number of segments.
///
/// The mapping only depends on the feed id bytes and the segment count, so it
/// is stable across calls and across process restarts. Changing the segment
/// count of an existing partition requires rebuilding it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHasher {
    segment_count: usize,
    shift: u32,
}

impl SegmentHasher {
    /// Creates a hasher for the given concurrency degree, rounded up to the next
    /// power of two. A degree of zero is treated as one.
    pub fn new(concurrency_degree: usize) -> Self {
        let segment_count = concurrency_degree.max(1).next_power_of_two();
        let bits = segment_count.trailing_zeros();
        Self {
            segment_count,
            // Unused when there is a single segment.
            shift: 64 - bits,
        }
    }

    /// Number of segments.
    pub fn segment_count(&self) -> usize {
        self.segment_count
    }

    /// Returns the segment index in `[0, segment_count)` for a feed id.
    pub fn segment_for(&self, feed_id: &str) -> usize {
        if self.segment_count == 1 {
            return 0;
        }
        (xxh64(feed_id.as_bytes(), FEED_HASH_SEED) >> self.shift) as usize
    }
}
