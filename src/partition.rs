//! Partition buffer: one partition's worth of segment stores.
//!
//! A partition owns `S` segment stores. Every feed id is routed to exactly one
//! of them, so a write or read fans out as at most one task per segment and
//! the results are joined back on the calling thread.
//!
//! Writes are not atomic across segments. When some segments fail, the entries
//! committed by the others stay in place and are reported through the `written`
//! field of the returned error so the caller can still account for them.

use crate::concurrency::{BufferPools, FanTask, TaskOutcome, fan_out};
use crate::encoding::validate_feed_id;
use crate::hasher::SegmentHasher;
use crate::meta::PartitionTimestamps;
use crate::segment::{SegmentBackend, SegmentStore, SharedSegment};
use crate::{Attributes, FeedData, FeedSamples, Result, TelebufError, TimeUnit};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Extents committed per feed, in nanoseconds.
pub type WrittenExtents = HashMap<String, PartitionTimestamps>;

/// Segment stores of a single partition plus the pools used to drive them.
pub struct PartitionBuffer {
    index: u64,
    hasher: SegmentHasher,
    backend: Arc<dyn SegmentBackend>,
    pools: BufferPools,
    task_timeout: Option<Duration>,
    /// `None` once closed. Calls hold the read guard for their whole fan-out,
    /// so `close` and `reset` wait for in-flight work.
    segments: RwLock<Option<Vec<SharedSegment>>>,
}

/// What a single segment write task reports back.
struct SegmentWriteReport {
    written: WrittenExtents,
    error: Option<TelebufError>,
}

impl PartitionBuffer {
    /// Opens (or creates) every segment store of partition `index`.
    pub fn open(
        index: u64,
        hasher: SegmentHasher,
        backend: Arc<dyn SegmentBackend>,
        pools: BufferPools,
        task_timeout: Option<Duration>,
    ) -> Result<Self> {
        let segments = open_segments(backend.as_ref(), index, hasher.segment_count())?;
        debug!(
            partition = index,
            segments = segments.len(),
            "Opened partition buffer"
        );
        Ok(Self {
            index,
            hasher,
            backend,
            pools,
            task_timeout,
            segments: RwLock::new(Some(segments)),
        })
    }

    /// Partition index.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Number of segment stores.
    pub fn segment_count(&self) -> usize {
        self.hasher.segment_count()
    }

    pub fn is_closed(&self) -> bool {
        self.segments.read().is_none()
    }

    /// Bytes used across all segments. Zero once closed.
    pub fn used_bytes(&self) -> u64 {
        self.segments
            .read()
            .as_ref()
            .map(|segments| segments.iter().map(|s| s.used_bytes()).sum())
            .unwrap_or(0)
    }

    /// Bytes counted against the disk budget: the storage footprint reported by
    /// the backend, or the logical usage when that is larger.
    pub fn footprint_bytes(&self) -> u64 {
        let logical = self.used_bytes();
        match self.backend.footprint_bytes(self.index) {
            Ok(bytes) => bytes.max(logical),
            Err(e) => {
                warn!(partition = self.index, "Failed to measure partition storage: {}", e);
                logical
            }
        }
    }

        /// Writes every sample in `entries`, with timestamps given in `unit`.
    ///
    /// Returns the per-feed extents that were committed, in nanoseconds.
    ///
    /// When any segment runs out of room the call fails with
    /// [`TelebufError::BufferFull`], which takes precedence over other segment
    /// failures ([`TelebufError::SegmentWrite`]). Both carry the extents that
    /// were committed anyway. A task that does not finish within the task
    /// timeout fails the call with [`TelebufError::Timeout`].
    pub fn put_data(&self, entries: &FeedData, unit: TimeUnit) -> Result<WrittenExtents> {
        let mut groups: Vec<Vec<(String, FeedSamples)>> =
            (0..self.segment_count()).map(|_| Vec::new()).collect();
        for (feed_id, samples) in entries {
            if samples.is_empty() {
                continue;
            }
            validate_feed_id(feed_id)?;
            let converted = samples
                .iter()
                .map(|(&ts, attributes)| Ok((unit.to_nanos(ts)?, attributes.clone())))
                .collect::<Result<FeedSamples>>()?;
            groups[self.hasher.segment_for(feed_id)].push((feed_id.clone(), converted));
        }

        let guard = self.segments.read();
        let segments = guard.as_ref().ok_or(TelebufError::PartitionClosed {
            partition: self.index,
        })?;

        let mut task_segments = Vec::new();
        let mut tasks: Vec<FanTask<SegmentWriteReport>> = Vec::new();
        for (segment, group) in groups.into_iter().enumerate() {
            if group.is_empty() {
                continue;
            }
            let store = Arc::clone(&segments[segment]);
            task_segments.push(segment);
            tasks.push(Box::new(move || write_segment(store.as_ref(), group)));
        }
        if tasks.is_empty() {
            return Ok(WrittenExtents::new());
        }

        let outcomes = fan_out(
            self.pools.write.as_ref(),
            tasks,
            self.task_timeout,
            "put_data",
        )?;
        drop(guard);

        let mut written = WrittenExtents::new();
        let mut full_segments = Vec::new();
        let mut failed_segments = Vec::new();
        let mut reasons = Vec::new();
        for (segment, outcome) in task_segments.into_iter().zip(outcomes) {
            match outcome {
                TaskOutcome::Done(report) => {
                    merge_written(&mut written, report.written);
                    match report.error {
                        Some(e) if e.is_full() => full_segments.push(segment),
                        Some(e) => {
                            error!(partition = self.index, segment, "Segment write failed: {}", e);
                            failed_segments.push(segment);
                            reasons.push(e.to_string());
                        }
                        None => {}
                    }
                }
                TaskOutcome::Lost => {
                    error!(partition = self.index, segment, "Segment write task was lost");
                    failed_segments.push(segment);
                    reasons.push(format!("segment {segment} task lost"));
                }
            }
        }

        if !full_segments.is_empty() {
            warn!(
                partition = self.index,
                segments = ?full_segments,
                "Partition is full"
            );
            return Err(TelebufError::BufferFull {
                partition: self.index,
                segments: full_segments,
                written,
            });
        }
        if !failed_segments.is_empty() {
            return Err(TelebufError::SegmentWrite {
                partition: self.index,
                segments: failed_segments,
                reason: reasons.join("; "),
                written,
            });
        }
        Ok(written)
    }

    /// Returns samples of `feed_ids` with `start <= timestamp <= end`, where all
    /// timestamps are in `unit`.
    ///
    /// Feeds without samples are absent from the result. A segment that fails
    /// is logged and skipped, so the result may be partial.
    pub fn get_data(
        &self,
        feed_ids: &[&str],
        unit: TimeUnit,
        start: i64,
        end: i64,
    ) -> Result<FeedData> {
        let (start_ns, end_ns) = validate_range(unit, start, end)?;
        self.read_fan_out(feed_ids, unit, "get_data", move |store, feed_id| {
            store.range_scan(feed_id, start_ns, end_ns)
        })
    }

    /// Returns, per feed, the newest sample with `start <= timestamp <= end`.
    pub fn get_last_data(
        &self,
        feed_ids: &[&str],
        unit: TimeUnit,
        start: i64,
        end: i64,
    ) -> Result<FeedData> {
        let (start_ns, end_ns) = validate_range(unit, start, end)?;
        self.read_fan_out(feed_ids, unit, "get_last_data", move |store, feed_id| {
            Ok(store
                .last_before_or_at(feed_id, end_ns, start_ns)?
                .into_iter()
                .collect())
        })
    }

    fn read_fan_out<F>(
        &self,
        feed_ids: &[&str],
        unit: TimeUnit,
        operation: &'static str,
        read: F,
    ) -> Result<FeedData>
    where
        F: Fn(&dyn SegmentStore, &str) -> Result<Vec<(i64, Attributes)>> + Send + Sync + 'static,
    {
        let mut groups: Vec<BTreeSet<String>> =
            (0..self.segment_count()).map(|_| BTreeSet::new()).collect();
        for &feed_id in feed_ids {
            validate_feed_id(feed_id)?;
            groups[self.hasher.segment_for(feed_id)].insert(feed_id.to_string());
        }

        let guard = self.segments.read();
        let segments = guard.as_ref().ok_or(TelebufError::PartitionClosed {
            partition: self.index,
        })?;

        let read = Arc::new(read);
        let partition = self.index;
        let mut tasks: Vec<FanTask<Vec<(String, Vec<(i64, Attributes)>)>>> = Vec::new();
        for (segment, feeds) in groups.into_iter().enumerate() {
            if feeds.is_empty() {
                continue;
            }
            let store = Arc::clone(&segments[segment]);
            let read = Arc::clone(&read);
            tasks.push(Box::new(move || {
                let mut found = Vec::with_capacity(feeds.len());
                for feed_id in feeds {
                    match (*read)(store.as_ref(), feed_id.as_str()) {
                        Ok(samples) if samples.is_empty() => {}
                        Ok(samples) => found.push((feed_id, samples)),
                        Err(e) => error!(
                            partition,
                            segment,
                            feed_id = %feed_id,
                            operation,
                            "Segment read failed: {}",
                            e
                        ),
                    }
                }
                found
            }));
        }

        let outcomes = fan_out(self.pools.read.as_ref(), tasks, self.task_timeout, operation)?;
        drop(guard);

        let mut result = FeedData::new();
        for outcome in outcomes {
            match outcome {
                TaskOutcome::Done(found) => {
                    for (feed_id, samples) in found {
                        let feed = result.entry(feed_id).or_default();
                        // Truncating to a coarser unit may collide; the newest sample wins.
                        for (ts, attributes) in samples {
                            feed.insert(unit.from_nanos(ts), attributes);
                        }
                    }
                }
                TaskOutcome::Lost => {
                    error!(partition, operation, "Segment read task was lost");
                }
            }
        }
        Ok(result)
    }

    /// Makes all segment stores durable.
    pub fn flush(&self) -> Result<()> {
        let guard = self.segments.read();
        if let Some(segments) = guard.as_ref() {
            for segment in segments {
                segment.flush()?;
            }
        }
        Ok(())
    }

    /// Closes every segment store. Later calls fail with
    /// [`TelebufError::PartitionClosed`]; closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        let Some(segments) = self.segments.write().take() else {
            return Ok(());
        };
        let mut first_error = None;
        for (segment, store) in segments.iter().enumerate() {
            if let Err(e) = store.flush() {
                error!(partition = self.index, segment, "Failed to flush segment on close: {}", e);
                first_error.get_or_insert(e);
            }
        }
        debug!(partition = self.index, "Closed partition buffer");
        first_error.map_or(Ok(()), Err)
    }

    /// Drops all data of this partition and reopens empty segment stores.
    ///
    /// If reopening fails the partition stays closed.
    pub fn reset(&self) -> Result<()> {
        let mut guard = self.segments.write();
        guard.take();
        for segment in 0..self.segment_count() {
            self.backend.destroy(self.index, segment)?;
        }
        *guard = Some(open_segments(
            self.backend.as_ref(),
            self.index,
            self.segment_count(),
        )?);
        info!(partition = self.index, "Reset partition buffer");
        Ok(())
    }

    /// Closes the partition and deletes its storage.
    pub fn destroy(&self) -> Result<()> {
        self.segments.write().take();
        self.backend.remove_partition(self.index)?;
        info!(partition = self.index, "Removed partition storage");
        Ok(())
    }
}

fn open_segments(
    backend: &dyn SegmentBackend,
    partition: u64,
    count: usize,
) -> Result<Vec<SharedSegment>> {
    (0..count)
        .map(|segment| backend.open(partition, segment))
        .collect()
}

fn validate_range(unit: TimeUnit, start: i64, end: i64) -> Result<(i64, i64)> {
    if start > end {
        return Err(TelebufError::InvalidTimeRange { start, end });
    }
    Ok(unit.range_to_nanos(start, end))
}

/// Writes one segment's feeds in order, stopping at the first failure.
fn write_segment(store: &dyn SegmentStore, group: Vec<(String, FeedSamples)>) -> SegmentWriteReport {
    let mut report = SegmentWriteReport {
        written: WrittenExtents::new(),
        error: None,
    };
    for (feed_id, samples) in group {
        let outcome = store.upsert_batch(&feed_id, &samples);
        if let Some(extent) = outcome.extent {
            report.written.insert(feed_id, extent);
        }
        if let Some(e) = outcome.error {
            report.error = Some(e);
            break;
        }
    }
    report
}

pub(crate) fn merge_written(into: &mut WrittenExtents, from: WrittenExtents) {
    for (feed_id, extent) in from {
        into.entry(feed_id)
            .and_modify(|existing| existing.merge(&extent))
            .or_insert(extent);
    }
}
