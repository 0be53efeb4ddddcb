//! Feed buffer coordinator.
//!
//! The coordinator owns every open [`PartitionBuffer`], decides which one
//! receives writes, routes reads through the partition extents kept by the
//! [`MetadataStore`], and bounds the footprint by rotating and evicting
//! partitions.

use crate::concurrency::BufferPools;
use crate::config::{BufferConfig, MetadataRefresh};
use crate::disk::DiskBackend;
use crate::encoding::validate_feed_id;
use crate::hasher::SegmentHasher;
use crate::memory::MemoryBackend;
use crate::meta::{MetadataStore, PartitionTimestamps};
use crate::partition::{PartitionBuffer, WrittenExtents};
use crate::segment::SegmentBackend;
use crate::{Attributes, FeedData, Result, TelebufError, TimeUnit};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// Attempts made when the target partition is rotated away mid-write.
const WRITE_ATTEMPTS: usize = 3;

/// Lifecycle state of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// The buffer is closed; no partition accepts writes.
    NoPartitionOpen,
    /// Writes are routed to this partition.
    PartitionActive(u64),
}

/// Thread-safe, partitioned telemetry buffer.
///
/// Timestamps passed in and returned are in the `unit` given with each call.
pub trait FeedBuffer: Send + Sync {
    /// Writes samples to the current partition and returns the committed
    /// extent of every feed.
    ///
    /// A [`TelebufError::BufferFull`] error may follow a partial write; the
    /// committed extents are carried by the error. When rotation on full is
    /// enabled the buffer has already moved to a fresh partition and the caller
    /// should retry the write.
    fn put(&self, entries: &FeedData, unit: TimeUnit) -> Result<HashMap<String, PartitionTimestamps>>;

    /// Writes samples to a specific open partition.
    fn put_in(
        &self,
        partition: u64,
        entries: &FeedData,
        unit: TimeUnit,
    ) -> Result<HashMap<String, PartitionTimestamps>>;

    /// Returns every sample with `start <= timestamp <= end` for `feed_ids`.
    ///
    /// Partitions are merged oldest first, so at an identical timestamp the
    /// newer partition's sample is returned.
    fn get(&self, feed_ids: &[&str], unit: TimeUnit, start: i64, end: i64) -> Result<FeedData>;

    /// Returns the newest sample in `[start, end]` of every feed.
    fn get_last(&self, feed_ids: &[&str], unit: TimeUnit, start: i64, end: i64)
    -> Result<FeedData>;

    /// Like [`FeedBuffer::get`] but keeps the results of each partition apart.
    fn get_by_partition(
        &self,
        feed_ids: &[&str],
        unit: TimeUnit,
        start: i64,
        end: i64,
    ) -> Result<BTreeMap<u64, FeedData>>;

    /// Opens a new current partition and returns its index.
    fn rotate(&self) -> Result<u64>;

    /// Evicts the oldest non-current partition, if there is one.
    fn evict_oldest(&self) -> Result<Option<u64>>;

    /// Index of the partition receiving writes.
    fn current_partition(&self) -> u64;

    /// Indices of all open partitions, ascending.
    fn partitions(&self) -> Vec<u64>;

    fn state(&self) -> BufferState;

    /// Makes segment data and partition metadata durable.
    fn flush(&self) -> Result<()>;

    /// Flushes and closes every partition. Later calls fail with
    /// [`TelebufError::BufferClosed`].
    fn close(&self) -> Result<()>;

    /// Discards all samples while keeping the open partitions.
    fn reset(&self) -> Result<()>;

    /// Discards all partitions and starts over at partition 0.
    fn restart(&self) -> Result<()>;
}

/// Builder for a [`FeedBuffer`].
#[derive(Default)]
pub struct FeedBufferBuilder {
    config: BufferConfig,
    pools: Option<BufferPools>,
}

impl FeedBufferBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces every option with the values in `config`.
    pub fn with_config(mut self, config: BufferConfig) -> Self {
        self.config = config;
        self
    }

    /// Stores segments and metadata below `path` instead of in memory.
    pub fn with_storage_directory(mut self, path: impl AsRef<Path>) -> Self {
        self.config.storage_directory = Some(path.as_ref().to_path_buf());
        self
    }

    /// Sets the write concurrency; the segment count is the next power of two.
    pub fn with_segment_concurrency_degree(mut self, degree: usize) -> Self {
        self.config.segment_concurrency_degree = degree;
        self
    }

    /// Sets how many partitions stay open before the oldest is evicted.
    pub fn with_partition_retention_count(mut self, count: usize) -> Self {
        self.config.partition_retention_count = count;
        self
    }

    pub fn with_metadata_refresh(mut self, refresh: MetadataRefresh) -> Self {
        self.config.metadata_refresh_interval = refresh;
        self
    }

    /// Sets the byte quota of every segment store.
    pub fn with_segment_capacity_bytes(mut self, bytes: u64) -> Self {
        self.config.segment_capacity_bytes = Some(bytes);
        self
    }

    /// Sets the byte budget across all partitions, enforced after rotation.
    /// On disk this is the size of the segment files, not just the samples.
    pub fn with_max_disk_bytes(mut self, bytes: u64) -> Self {
        self.config.max_disk_bytes = Some(bytes);
        self
    }

    /// Sets how long a call waits for its segment tasks. `None` waits forever.
    pub fn with_task_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.task_timeout_ms = timeout.map(|t| t.as_millis() as u64);
        self
    }

    pub fn with_rotate_on_full(mut self, enabled: bool) -> Self {
        self.config.rotate_on_full = enabled;
        self
    }

    /// Uses caller-owned pools. They are not shut down when the buffer closes.
    pub fn with_pools(mut self, pools: BufferPools) -> Self {
        self.pools = Some(pools);
        self
    }

    /// Opens the buffer, loading any partitions persisted in the storage
    /// directory.
    pub fn build(self) -> Result<Arc<dyn FeedBuffer>> {
        let buffer: Arc<dyn FeedBuffer> = self.open_buffer()?;
        Ok(buffer)
    }

    fn open_buffer(self) -> Result<Arc<BufferImpl>> {
        self.config.validate()?;
        let config = self.config;
        let hasher = SegmentHasher::new(config.segment_concurrency_degree);

        #[cfg(unix)]
        if config.storage_directory.is_some() {
            check_file_limit(&config, &hasher);
        }

        let backend: Arc<dyn SegmentBackend> = match &config.storage_directory {
            Some(dir) => Arc::new(DiskBackend::new(dir, config.segment_capacity_bytes)?),
            None => Arc::new(MemoryBackend::new(config.segment_capacity_bytes)),
        };
        let metadata = MetadataStore::open(
            config.storage_directory.as_deref(),
            config.metadata_refresh_interval,
        )?;

        let (pools, owns_pools) = match self.pools {
            Some(pools) => (pools, false),
            None => (BufferPools::default(), true),
        };

        let buffer = Arc::new(BufferImpl {
            storage_directory: config.storage_directory.clone(),
            retention_count: config.partition_retention_count,
            max_disk_bytes: config.max_disk_bytes,
            rotate_on_full: config.rotate_on_full,
            task_timeout: config.task_timeout(),
            hasher,
            backend,
            metadata,
            pools,
            owns_pools,
            partitions: RwLock::new(BTreeMap::new()),
            rotation_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        });

        buffer.remove_orphans()?;
        buffer.open_known_partitions()?;
        {
            let _rotation = buffer.rotation_lock.lock();
            buffer.enforce_retention()?;
        }

        info!(
            storage_directory = ?buffer.storage_directory,
            segments = hasher.segment_count(),
            partitions = buffer.partitions.read().len(),
            current = buffer.metadata.current_partition(),
            "Feed buffer opened"
        );
        Ok(buffer)
    }
}

/// Warns when the open-file limit is too low for the segment files this
/// configuration keeps open.
#[cfg(unix)]
fn check_file_limit(config: &BufferConfig, hasher: &SegmentHasher) {
    let required = ((config.partition_retention_count + 1) * hasher.segment_count() + 16) as u64;
    let mut rlim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: getrlimit only writes into the struct we pass.
    let ok = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlim) == 0 };
    if ok && (rlim.rlim_cur as u64) < required {
        warn!(
            limit = rlim.rlim_cur as u64,
            required,
            "Low file descriptor limit. Consider increasing with 'ulimit -n'"
        );
    }
}

struct BufferImpl {
    storage_directory: Option<PathBuf>,
    retention_count: usize,
    max_disk_bytes: Option<u64>,
    rotate_on_full: bool,
    task_timeout: Option<Duration>,
    hasher: SegmentHasher,
    backend: Arc<dyn SegmentBackend>,
    metadata: Arc<MetadataStore>,
    pools: BufferPools,
    owns_pools: bool,
    partitions: RwLock<BTreeMap<u64, Arc<PartitionBuffer>>>,
    /// Serializes rotation, eviction, reset and restart.
    rotation_lock: Mutex<()>,
    closed: AtomicBool,
}

impl BufferImpl {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TelebufError::BufferClosed);
        }
        Ok(())
    }

    fn open_partition(&self, index: u64) -> Result<Arc<PartitionBuffer>> {
        Ok(Arc::new(PartitionBuffer::open(
            index,
            self.hasher,
            Arc::clone(&self.backend),
            self.pools.clone(),
            self.task_timeout,
        )?))
    }

    fn partition(&self, index: u64) -> Result<Arc<PartitionBuffer>> {
        self.partitions
            .read()
            .get(&index)
            .cloned()
            .ok_or(TelebufError::PartitionNotFound { partition: index })
    }

    /// Deletes partition storage that has no metadata row, left behind by a
    /// rotation or eviction that did not complete.
    fn remove_orphans(&self) -> Result<()> {
        let known: BTreeSet<u64> = self.metadata.partition_indices().into_iter().collect();
        for partition in self.backend.existing_partitions()? {
            if !known.contains(&partition) {
                warn!(partition, "Removing orphaned partition storage");
                self.backend.remove_partition(partition)?;
            }
        }
        Ok(())
    }

    fn open_known_partitions(&self) -> Result<()> {
        let mut opened = BTreeMap::new();
        for index in self.metadata.partition_indices() {
            opened.insert(index, self.open_partition(index)?);
        }
        *self.partitions.write() = opened;
        Ok(())
    }

    fn write_to(&self, index: u64, entries: &FeedData, unit: TimeUnit) -> Result<WrittenExtents> {
        let partition = self.partition(index)?;
        match partition.put_data(entries, unit) {
            Ok(mut written) => {
                self.record_extents(index, &written)?;
                to_unit(&mut written, unit);
                Ok(written)
            }
            Err(mut e) => {
                match &mut e {
                    TelebufError::BufferFull { written, .. }
                    | TelebufError::SegmentWrite { written, .. } => {
                        self.record_extents(index, written)?;
                        to_unit(written, unit);
                    }
                    // Tasks still running may commit anything that was requested.
                    TelebufError::Timeout { .. } => {
                        self.record_extents(index, &requested_extents(entries, unit))?;
                    }
                    _ => {}
                }
                Err(e)
            }
        }
    }

    fn record_extents(&self, index: u64, written: &WrittenExtents) -> Result<()> {
        if written.is_empty() {
            return Ok(());
        }
        self.metadata
            .merge_extents(index, written.iter().map(|(feed, extent)| (feed.as_str(), *extent)))
    }

    /// Rotates away from `expected` unless another caller already did.
    fn rotate_from(&self, expected: u64) -> Result<u64> {
        let _rotation = self.rotation_lock.lock();
        self.ensure_open()?;
        let current = self.metadata.current_partition();
        if current != expected {
            return Ok(current);
        }

        let newest = self
            .partitions
            .read()
            .keys()
            .next_back()
            .copied()
            .unwrap_or(current)
            .max(current);
        let next = newest
            .checked_add(1)
            .ok_or_else(|| TelebufError::Other("partition index space exhausted".to_string()))?;

        let buffer = self.open_partition(next)?;
        self.partitions.write().insert(next, buffer);
        if let Err(e) = self.metadata.write_current_partition(next) {
            error!(partition = next, "Failed to record new current partition: {}", e);
            if let Some(buffer) = self.partitions.write().remove(&next)
                && let Err(e) = buffer.destroy()
            {
                error!(partition = next, "Failed to remove unused partition: {}", e);
            }
            return Err(e);
        }

        if let Ok(previous) = self.partition(current)
            && let Err(e) = previous.flush()
        {
            error!(partition = current, "Failed to flush rotated partition: {}", e);
        }
        info!(old_partition = current, new_partition = next, "Rotated partition");

        self.enforce_retention()?;
        Ok(next)
    }

    /// Evicts partitions until the retention count and disk budget hold.
    /// Caller holds `rotation_lock`.
    fn enforce_retention(&self) -> Result<()> {
        loop {
            let (open, used) = {
                let partitions = self.partitions.read();
                let used: u64 = partitions.values().map(|p| p.footprint_bytes()).sum();
                (partitions.len(), used)
            };
            let over_count = open > self.retention_count;
            let over_budget = self.max_disk_bytes.is_some_and(|max| used > max);
            if !over_count && !over_budget {
                return Ok(());
            }
            if self.evict_oldest_locked()?.is_none() {
                if over_budget {
                    warn!(
                        used,
                        max_disk_bytes = ?self.max_disk_bytes,
                        "Current partition alone exceeds the disk budget"
                    );
                }
                return Ok(());
            }
        }
    }

    /// Caller holds `rotation_lock`.
    fn evict_oldest_locked(&self) -> Result<Option<u64>> {
        let current = self.metadata.current_partition();
        let Some(oldest) = self
            .partitions
            .read()
            .keys()
            .copied()
            .find(|&index| index != current)
        else {
            return Ok(None);
        };

        // Metadata goes first so reads stop routing to the partition.
        let removed = self.metadata.remove_partition_metadata(oldest)?;
        if let Some(meta) = &removed
            && !meta.extents.is_empty()
        {
            warn!(
                partition = oldest,
                feeds = meta.extents.len(),
                "Evicting partition that still holds samples"
            );
        }

        let buffer = self.partitions.write().remove(&oldest);
        match buffer {
            Some(buffer) => buffer.destroy()?,
            None => self.backend.remove_partition(oldest)?,
        }
        info!(partition = oldest, "Evicted partition");
        Ok(Some(oldest))
    }

    /// Validates a read and returns the range in nanoseconds.
    fn read_range(&self, feed_ids: &[&str], unit: TimeUnit, start: i64, end: i64) -> Result<(i64, i64)> {
        self.ensure_open()?;
        if start > end {
            return Err(TelebufError::InvalidTimeRange { start, end });
        }
        for feed_id in feed_ids {
            validate_feed_id(feed_id)?;
        }
        Ok(unit.range_to_nanos(start, end))
    }

    /// Open partitions whose extents intersect the range, ascending.
    fn candidates(&self, feed_ids: &[&str], start_ns: i64, end_ns: i64) -> Vec<Arc<PartitionBuffer>> {
        let indices = self
            .metadata
            .candidate_partitions(feed_ids.iter().copied(), start_ns, end_ns);
        let partitions = self.partitions.read();
        indices
            .into_iter()
            .filter_map(|index| partitions.get(&index).cloned())
            .collect()
    }

    fn read_partitions<F>(
        &self,
        feed_ids: &[&str],
        unit: TimeUnit,
        start: i64,
        end: i64,
        read: F,
    ) -> Result<BTreeMap<u64, FeedData>>
    where
        F: Fn(&PartitionBuffer) -> Result<FeedData>,
    {
        let (start_ns, end_ns) = self.read_range(feed_ids, unit, start, end)?;
        let candidates = self.candidates(feed_ids, start_ns, end_ns);
        debug!(
            candidates = candidates.len(),
            start_ns, end_ns, "Routing read to partitions"
        );

        let mut results = BTreeMap::new();
        for partition in candidates {
            match read(partition.as_ref()) {
                Ok(data) if data.is_empty() => {}
                Ok(data) => {
                    results.insert(partition.index(), data);
                }
                // Evicted while the read was routed.
                Err(TelebufError::PartitionClosed { partition }) => {
                    debug!(partition, "Skipping closed partition");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(results)
    }
}

impl FeedBuffer for BufferImpl {
    #[instrument(level = "debug", skip(self, entries), fields(feeds = entries.len()))]
    fn put(&self, entries: &FeedData, unit: TimeUnit) -> Result<HashMap<String, PartitionTimestamps>> {
        let mut attempt = 0;
        loop {
            self.ensure_open()?;
            attempt += 1;
            let current = self.metadata.current_partition();
            match self.write_to(current, entries, unit) {
                Err(TelebufError::PartitionClosed { .. } | TelebufError::PartitionNotFound { .. })
                    if attempt < WRITE_ATTEMPTS && self.metadata.current_partition() != current =>
                {
                    debug!(partition = current, "Current partition rotated away, retrying write");
                }
                Err(e) if e.is_full() && self.rotate_on_full => {
                    if let Err(rotate_err) = self.rotate_from(current) {
                        error!("Failed to rotate full partition {}: {}", current, rotate_err);
                    }
                    return Err(e);
                }
                result => return result,
            }
        }
    }

    fn put_in(
        &self,
        partition: u64,
        entries: &FeedData,
        unit: TimeUnit,
    ) -> Result<HashMap<String, PartitionTimestamps>> {
        self.ensure_open()?;
        let result = self.write_to(partition, entries, unit);
        if let Err(e) = &result
            && e.is_full()
            && self.rotate_on_full
            && partition == self.metadata.current_partition()
            && let Err(rotate_err) = self.rotate_from(partition)
        {
            error!("Failed to rotate full partition {}: {}", partition, rotate_err);
        }
        result
    }

    #[instrument(level = "debug", skip(self))]
    fn get(&self, feed_ids: &[&str], unit: TimeUnit, start: i64, end: i64) -> Result<FeedData> {
        let by_partition = self.get_by_partition(feed_ids, unit, start, end)?;
        let mut merged = FeedData::new();
        // Which partition each (feed, timestamp) came from, tracked only for collision logs.
        let mut origin: HashMap<(String, i64), u64> = HashMap::new();
        let multiple = by_partition.len() > 1;
        for (partition, data) in by_partition {
            for (feed_id, samples) in data {
                let merged_feed = merged.entry(feed_id.clone()).or_default();
                for (ts, attributes) in samples {
                    if merged_feed.insert(ts, attributes).is_some() {
                        warn!(
                            feed_id = %feed_id,
                            timestamp = ts,
                            older_partition = origin.get(&(feed_id.clone(), ts)).copied(),
                            newer_partition = partition,
                            "Overlapping sample across partitions, keeping the newer one"
                        );
                    }
                    if multiple {
                        origin.insert((feed_id.clone(), ts), partition);
                    }
                }
            }
        }
        Ok(merged)
    }

    #[instrument(level = "debug", skip(self))]
    fn get_last(
        &self,
        feed_ids: &[&str],
        unit: TimeUnit,
        start: i64,
        end: i64,
    ) -> Result<FeedData> {
        let by_partition = self.read_partitions(feed_ids, unit, start, end, |partition| {
            partition.get_last_data(feed_ids, unit, start, end)
        })?;

        let mut newest: HashMap<String, (i64, Attributes)> = HashMap::new();
        for (_, data) in by_partition {
            for (feed_id, samples) in data {
                let Some((&ts, attributes)) = samples.iter().next_back() else {
                    continue;
                };
                match newest.get(&feed_id) {
                    Some((best, _)) if *best > ts => {}
                    _ => {
                        newest.insert(feed_id, (ts, attributes.clone()));
                    }
                }
            }
        }

        Ok(newest
            .into_iter()
            .map(|(feed_id, (ts, attributes))| (feed_id, BTreeMap::from([(ts, attributes)])))
            .collect())
    }

    fn get_by_partition(
        &self,
        feed_ids: &[&str],
        unit: TimeUnit,
        start: i64,
        end: i64,
    ) -> Result<BTreeMap<u64, FeedData>> {
        self.read_partitions(feed_ids, unit, start, end, |partition| {
            partition.get_data(feed_ids, unit, start, end)
        })
    }

    fn rotate(&self) -> Result<u64> {
        self.ensure_open()?;
        self.rotate_from(self.metadata.current_partition())
    }

    fn evict_oldest(&self) -> Result<Option<u64>> {
        let _rotation = self.rotation_lock.lock();
        self.ensure_open()?;
        self.evict_oldest_locked()
    }

    fn current_partition(&self) -> u64 {
        self.metadata.current_partition()
    }

    fn partitions(&self) -> Vec<u64> {
        self.partitions.read().keys().copied().collect()
    }

    fn state(&self) -> BufferState {
        if self.closed.load(Ordering::Acquire) {
            BufferState::NoPartitionOpen
        } else {
            BufferState::PartitionActive(self.metadata.current_partition())
        }
    }

    fn flush(&self) -> Result<()> {
        self.ensure_open()?;
        let partitions: Vec<Arc<PartitionBuffer>> =
            self.partitions.read().values().cloned().collect();
        for partition in partitions {
            partition.flush()?;
        }
        self.metadata.flush()
    }

    fn close(&self) -> Result<()> {
        let _rotation = self.rotation_lock.lock();
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("Closing feed buffer");

        let mut first_error = None;
        let partitions = std::mem::take(&mut *self.partitions.write());
        for (index, partition) in partitions {
            if let Err(e) = partition.close() {
                error!(partition = index, "Failed to close partition: {}", e);
                first_error.get_or_insert(e);
            }
        }
        if let Err(e) = self.metadata.close() {
            error!("Failed to close metadata store: {}", e);
            first_error.get_or_insert(e);
        }
        if self.owns_pools
            && let Err(e) = self.pools.shutdown()
        {
            error!("Failed to shut down buffer pools: {}", e);
            first_error.get_or_insert(e);
        }
        first_error.map_or(Ok(()), Err)
    }

    fn reset(&self) -> Result<()> {
        let _rotation = self.rotation_lock.lock();
        self.ensure_open()?;
        let partitions: Vec<Arc<PartitionBuffer>> =
            self.partitions.read().values().cloned().collect();
        for partition in partitions {
            partition.reset()?;
            self.metadata.clear_extents(partition.index())?;
        }
        info!("Feed buffer reset");
        Ok(())
    }

    fn restart(&self) -> Result<()> {
        let _rotation = self.rotation_lock.lock();
        self.ensure_open()?;

        // Storage goes before metadata so a crash in between leaves no stale
        // samples behind a fresh partition 0.
        let partitions = std::mem::take(&mut *self.partitions.write());
        for (_, partition) in partitions {
            partition.destroy()?;
        }
        for orphan in self.backend.existing_partitions()? {
            self.backend.remove_partition(orphan)?;
        }
        self.metadata.restart()?;

        let initial = self.open_partition(0)?;
        self.partitions.write().insert(0, initial);
        info!("Feed buffer restarted at partition 0");
        Ok(())
    }
}

/// Converts nanosecond extents to `unit` in place.
fn to_unit(written: &mut WrittenExtents, unit: TimeUnit) {
    for extent in written.values_mut() {
        *extent = PartitionTimestamps::new(unit.from_nanos(extent.start), unit.from_nanos(extent.end));
    }
}

/// Extents, in nanoseconds, of everything a write asked for.
fn requested_extents(entries: &FeedData, unit: TimeUnit) -> WrittenExtents {
    let mut requested = WrittenExtents::new();
    for (feed_id, samples) in entries {
        let (Some(first), Some(last)) = (samples.keys().next(), samples.keys().next_back()) else {
            continue;
        };
        if let (Ok(start), Ok(end)) = (unit.to_nanos(*first), unit.to_nanos(*last)) {
            requested.insert(feed_id.clone(), PartitionTimestamps::new(start, end));
        }
    }
    requested
}
