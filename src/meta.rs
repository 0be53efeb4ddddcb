//! Partition metadata: which partition is current and, per feed, the timestamp
//! extent observed in each partition.
//!
//! Metadata is the read path's index. A partition whose extents do not overlap
//! a query for any requested feed is skipped without touching its segments, so
//! extents must never be narrower than the data actually stored. Extents only
//! ever widen.
//!
//! Rows live in memory and are persisted to a redb table, one JSON record per
//! partition index. Extent merges mark rows dirty; dirty rows are written by a
//! background refresher, on rotation, and on [`MetadataStore::flush`]. When the
//! refresher is disabled, merges write through immediately.

use crate::config::MetadataRefresh;
use crate::{Result, TelebufError};
use crossbeam_channel::{RecvTimeoutError, Sender, bounded};
use parking_lot::{Mutex, RwLock};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

const PARTITION_META: TableDefinition<u64, &[u8]> = TableDefinition::new("partition_meta");

pub const METADATA_FILE_NAME: &str = "metadata.redb";

/// Inclusive `[start, end]` nanosecond range observed for a feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionTimestamps {
    pub start: i64,
    pub end: i64,
}

impl PartitionTimestamps {
    /// Creates an extent, ordering the bounds if needed.
    pub fn new(a: i64, b: i64) -> Self {
        Self {
            start: a.min(b),
            end: a.max(b),
        }
    }

    /// Extent covering a single timestamp.
    pub fn at(timestamp: i64) -> Self {
        Self {
            start: timestamp,
            end: timestamp,
        }
    }

    /// Widens the extent to include `timestamp`.
    pub fn observe(&mut self, timestamp: i64) {
        self.start = self.start.min(timestamp);
        self.end = self.end.max(timestamp);
    }

    /// Widens the extent to include `other` (pairwise min/max).
    pub fn merge(&mut self, other: &PartitionTimestamps) {
        self.start = self.start.min(other.start);
        self.end = self.end.max(other.end);
    }

    /// Returns true when `timestamp` lies inside the extent.
    pub fn contains(&self, timestamp: i64) -> bool {
        self.start <= timestamp && timestamp <= self.end
    }

    /// Returns true when the extent overlaps `[start, end]`.
    pub fn intersects(&self, start: i64, end: i64) -> bool {
        self.start <= end && start <= self.end
    }
}

/// Metadata row of one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionMetadata {
    pub partition: u64,
    pub is_current: bool,
    #[serde(default)]
    pub extents: HashMap<String, PartitionTimestamps>,
}

impl PartitionMetadata {
    pub fn new(partition: u64, is_current: bool) -> Self {
        Self {
            partition,
            is_current,
            extents: HashMap::new(),
        }
    }

    /// Merges an observed extent for `feed_id`. Returns true if the stored
    /// extent changed.
    pub fn merge_extent(&mut self, feed_id: &str, observed: PartitionTimestamps) -> bool {
        match self.extents.get_mut(feed_id) {
            Some(extent) => {
                let before = *extent;
                extent.merge(&observed);
                before != *extent
            }
            None => {
                self.extents.insert(feed_id.to_string(), observed);
                true
            }
        }
    }

    /// Extent recorded for `feed_id`.
    pub fn extent(&self, feed_id: &str) -> Option<PartitionTimestamps> {
        self.extents.get(feed_id).copied()
    }

    /// Returns true if any of `feed_ids` may have samples in `[start, end]`.
    pub fn overlaps<'a>(
        &self,
        feed_ids: impl IntoIterator<Item = &'a str>,
        start: i64,
        end: i64,
    ) -> bool {
        feed_ids.into_iter().any(|feed| {
            self.extents
                .get(feed)
                .is_some_and(|extent| extent.intersects(start, end))
        })
    }
}

struct MetadataRow {
    meta: PartitionMetadata,
    dirty: bool,
}

type SharedRow = Arc<Mutex<MetadataRow>>;

struct Refresher {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

/// Durable bookkeeping of partitions and their per-feed extents.
pub struct MetadataStore {
    db: Option<Database>,
    rows: RwLock<BTreeMap<u64, SharedRow>>,
    /// Partitions removed since open. Late extent merges for them are dropped
    /// instead of re-creating their rows. Guarded together with `rows`.
    evicted: Mutex<BTreeSet<u64>>,
    current: AtomicU64,
    /// Every write to the database goes through this lock.
    persist_lock: Mutex<()>,
    refresh: MetadataRefresh,
    refresher: Mutex<Option<Refresher>>,
}

impl MetadataStore {
    /// Opens the store, loading persisted rows from `storage_directory`, or a
    /// memory-only store when no directory is given. Starts the background
    /// refresher when `refresh` has an interval.
    pub fn open(storage_directory: Option<&Path>, refresh: MetadataRefresh) -> Result<Arc<Self>> {
        let db = match storage_directory {
            Some(dir) => {
                fs::create_dir_all(dir).map_err(|source| TelebufError::IoWithPath {
                    path: dir.to_path_buf(),
                    source,
                })?;
                let db = Database::create(dir.join(METADATA_FILE_NAME))?;
                let write_txn = db.begin_write()?;
                {
                    let _t = write_txn.open_table(PARTITION_META)?;
                }
                write_txn.commit()?;
                Some(db)
            }
            None => None,
        };

        let store = Arc::new(Self {
            db,
            rows: RwLock::new(BTreeMap::new()),
            evicted: Mutex::new(BTreeSet::new()),
            current: AtomicU64::new(0),
            persist_lock: Mutex::new(()),
            refresh,
            refresher: Mutex::new(None),
        });

        store.load()?;

        if let Some(interval) = refresh.interval() {
            store.start_refresher(interval)?;
        }

        Ok(store)
    }

    fn load(&self) -> Result<()> {
        let _persist = self.persist_lock.lock();
        let mut loaded = self.read_all_rows()?;

        if loaded.is_empty() {
            info!("No partition metadata found, initializing partition 0 as current");
            let initial = PartitionMetadata::new(0, true);
            self.write_rows(&[&initial])?;
            loaded.push(initial);
        }

        let current_rows: Vec<u64> = loaded
            .iter()
            .filter(|m| m.is_current)
            .map(|m| m.partition)
            .collect();
        let current = match current_rows.as_slice() {
            [single] => *single,
            _ => {
                // Fall back to the newest partition, which received the latest writes.
                let newest = loaded.iter().map(|m| m.partition).max().unwrap_or(0);
                warn!(
                    ?current_rows,
                    chosen = newest,
                    "Partition metadata does not name exactly one current partition"
                );
                for meta in loaded.iter_mut() {
                    meta.is_current = meta.partition == newest;
                }
                let refs: Vec<&PartitionMetadata> = loaded.iter().collect();
                self.write_rows(&refs)?;
                newest
            }
        };

        let mut rows = self.rows.write();
        rows.clear();
        for meta in loaded {
            rows.insert(
                meta.partition,
                Arc::new(Mutex::new(MetadataRow { meta, dirty: false })),
            );
        }
        self.current.store(current, Ordering::Release);
        info!(partitions = rows.len(), current, "Loaded partition metadata");
        Ok(())
    }

    fn start_refresher(self: &Arc<Self>, interval: std::time::Duration) -> Result<()> {
        let (stop, stop_rx) = bounded::<()>(1);
        let store: Weak<MetadataStore> = Arc::downgrade(self);

        let handle = thread::Builder::new()
            .name("telebuf-meta-refresh".to_string())
            .spawn(move || {
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    let Some(store) = store.upgrade() else {
                        break;
                    };
                    if let Err(e) = store.persist_dirty() {
                        error!("Failed to refresh partition metadata: {}", e);
                    }
                }
                debug!("Metadata refresher stopped");
            })?;

        *self.refresher.lock() = Some(Refresher { stop, handle });
        Ok(())
    }

    fn read_all_rows(&self) -> Result<Vec<PartitionMetadata>> {
        let Some(db) = &self.db else {
            return Ok(Vec::new());
        };
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(PARTITION_META)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let (key, value) = entry?;
            let meta: PartitionMetadata = serde_json::from_slice(value.value()).map_err(|e| {
                TelebufError::DataCorruption(format!(
                    "metadata row for partition {} is unreadable: {e}",
                    key.value()
                ))
            })?;
            result.push(meta);
        }
        Ok(result)
    }

    /// Writes rows in a single transaction. Caller holds `persist_lock`.
    fn write_rows(&self, metas: &[&PartitionMetadata]) -> Result<()> {
        let Some(db) = &self.db else {
            return Ok(());
        };
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(PARTITION_META)?;
            for meta in metas {
                let bytes = serde_json::to_vec(meta)?;
                table.insert(meta.partition, bytes.as_slice())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    fn row(&self, partition: u64) -> Option<SharedRow> {
        self.rows.read().get(&partition).cloned()
    }

    /// Returns the row of `partition`, creating it if it is missing. Returns
    /// `None` for partitions that were removed.
    fn row_or_create(&self, partition: u64) -> Option<SharedRow> {
        if let Some(row) = self.row(partition) {
            return Some(row);
        }
        let mut rows = self.rows.write();
        if self.evicted.lock().contains(&partition) {
            debug!(partition, "Dropping extent update for removed partition");
            return None;
        }
        let row = rows
            .entry(partition)
            .or_insert_with(|| {
                debug!(partition, "Creating missing metadata row");
                Arc::new(Mutex::new(MetadataRow {
                    meta: PartitionMetadata::new(partition, false),
                    dirty: true,
                }))
            })
            .clone();
        Some(row)
    }

    /// Index of the partition currently accepting writes.
    pub fn current_partition(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }

    /// All known partition indices, ascending.
    pub fn partition_indices(&self) -> Vec<u64> {
        self.rows.read().keys().copied().collect()
    }

    /// Snapshot of one partition's row.
    pub fn get(&self, partition: u64) -> Option<PartitionMetadata> {
        self.row(partition).map(|row| row.lock().meta.clone())
    }

    /// Marks `new_partition` current and the previous current partition not
    /// current. Both rows are persisted in one transaction before the
    /// in-memory pointer moves.
    pub fn write_current_partition(&self, new_partition: u64) -> Result<()> {
        let _persist = self.persist_lock.lock();
        let mut rows = self.rows.write();
        self.evicted.lock().remove(&new_partition);
        let old_partition = self.current.load(Ordering::Acquire);

        let mut new_meta = rows
            .get(&new_partition)
            .map(|row| row.lock().meta.clone())
            .unwrap_or_else(|| PartitionMetadata::new(new_partition, false));
        new_meta.is_current = true;

        let old_meta = if old_partition != new_partition {
            rows.get(&old_partition).map(|row| {
                let mut meta = row.lock().meta.clone();
                meta.is_current = false;
                meta
            })
        } else {
            None
        };

        let mut to_write = vec![&new_meta];
        to_write.extend(old_meta.as_ref());
        self.write_rows(&to_write)?;

        for meta in [Some(new_meta.clone()), old_meta].into_iter().flatten() {
            match rows.get(&meta.partition) {
                Some(row) => {
                    let mut row = row.lock();
                    row.meta.is_current = meta.is_current;
                    // Extents merged since the snapshot stay dirty.
                    row.dirty = row.meta != meta;
                }
                None => {
                    rows.insert(
                        meta.partition,
                        Arc::new(Mutex::new(MetadataRow { meta, dirty: false })),
                    );
                }
            }
        }
        self.current.store(new_partition, Ordering::Release);

        info!(old_partition, new_partition, "Current partition changed");
        Ok(())
    }

    /// Merges an observed extent for one feed into a partition's row, creating
    /// the row if it does not exist yet.
    pub fn update_partition_metadata(
        &self,
        partition: u64,
        feed_id: &str,
        observed_start: i64,
        observed_end: i64,
    ) -> Result<()> {
        let observed = PartitionTimestamps::new(observed_start, observed_end);
        self.merge_extents(partition, std::iter::once((feed_id, observed)))
    }

    /// Merges several observed extents into a partition's row.
    pub fn merge_extents<'a>(
        &self,
        partition: u64,
        extents: impl IntoIterator<Item = (&'a str, PartitionTimestamps)>,
    ) -> Result<()> {
        let Some(row) = self.row_or_create(partition) else {
            return Ok(());
        };
        let changed = {
            let mut row = row.lock();
            let mut changed = false;
            for (feed_id, observed) in extents {
                changed |= row.meta.merge_extent(feed_id, observed);
            }
            row.dirty |= changed;
            changed
        };

        if changed && self.refresh == MetadataRefresh::Disabled {
            self.persist_partition(partition)?;
        }
        Ok(())
    }

    /// Drops every extent recorded for a partition and persists the empty row.
    pub fn clear_extents(&self, partition: u64) -> Result<()> {
        let Some(row) = self.row_or_create(partition) else {
            return Ok(());
        };
        {
            let mut row = row.lock();
            row.meta.extents.clear();
            row.dirty = true;
        }
        self.persist_partition(partition)
    }

    /// Deletes a partition's row and returns it. The current partition cannot
    /// be removed.
    pub fn remove_partition_metadata(&self, partition: u64) -> Result<Option<PartitionMetadata>> {
        let _persist = self.persist_lock.lock();
        if partition == self.current.load(Ordering::Acquire) {
            return Err(TelebufError::EvictCurrentPartition { partition });
        }

        if let Some(db) = &self.db {
            let write_txn = db.begin_write()?;
            {
                let mut table = write_txn.open_table(PARTITION_META)?;
                table.remove(partition)?;
            }
            write_txn.commit()?;
        }

        let removed = {
            let mut rows = self.rows.write();
            self.evicted.lock().insert(partition);
            rows.remove(&partition)
        };
        Ok(removed.map(|row| row.lock().meta.clone()))
    }

    /// Partitions, ascending, whose extents overlap `[start, end]` for at least
    /// one of `feed_ids`.
    pub fn candidate_partitions<'a>(
        &self,
        feed_ids: impl IntoIterator<Item = &'a str> + Clone,
        start: i64,
        end: i64,
    ) -> Vec<u64> {
        let rows: Vec<(u64, SharedRow)> = self
            .rows
            .read()
            .iter()
            .map(|(index, row)| (*index, Arc::clone(row)))
            .collect();

        rows.into_iter()
            .filter(|(_, row)| row.lock().meta.overlaps(feed_ids.clone(), start, end))
            .map(|(index, _)| index)
            .collect()
    }

    /// Persists one partition's row if it is dirty.
    fn persist_partition(&self, partition: u64) -> Result<()> {
        let _persist = self.persist_lock.lock();
        let Some(row) = self.row(partition) else {
            return Ok(());
        };
        let snapshot = {
            let mut row = row.lock();
            if !row.dirty {
                return Ok(());
            }
            row.dirty = false;
            row.meta.clone()
        };
        self.write_rows(&[&snapshot]).inspect_err(|_| {
            row.lock().dirty = true;
        })
    }

    /// Persists every dirty row in one transaction.
    pub fn persist_dirty(&self) -> Result<()> {
        let _persist = self.persist_lock.lock();
        let rows: Vec<SharedRow> = self.rows.read().values().cloned().collect();

        let mut flushed = Vec::new();
        let mut snapshots = Vec::new();
        for row in rows {
            let mut guard = row.lock();
            if guard.dirty {
                guard.dirty = false;
                snapshots.push(guard.meta.clone());
                drop(guard);
                flushed.push(row);
            }
        }

        if snapshots.is_empty() {
            return Ok(());
        }

        let refs: Vec<&PartitionMetadata> = snapshots.iter().collect();
        if let Err(e) = self.write_rows(&refs) {
            for row in flushed {
                row.lock().dirty = true;
            }
            return Err(e);
        }
        debug!(rows = snapshots.len(), "Persisted partition metadata");
        Ok(())
    }

    /// Persists all pending extent changes.
    pub fn flush(&self) -> Result<()> {
        self.persist_dirty()
    }

    /// Forgets every partition and reinitializes partition 0 as current.
    pub fn restart(&self) -> Result<()> {
        let _persist = self.persist_lock.lock();
        let mut rows = self.rows.write();
        let initial = PartitionMetadata::new(0, true);

        if let Some(db) = &self.db {
            let write_txn = db.begin_write()?;
            {
                write_txn.delete_table(PARTITION_META)?;
                let mut table = write_txn.open_table(PARTITION_META)?;
                let bytes = serde_json::to_vec(&initial)?;
                table.insert(0u64, bytes.as_slice())?;
            }
            write_txn.commit()?;
        }

        rows.clear();
        self.evicted.lock().clear();
        rows.insert(
            0,
            Arc::new(Mutex::new(MetadataRow {
                meta: initial,
                dirty: false,
            })),
        );
        self.current.store(0, Ordering::Release);
        info!("Partition metadata restarted");
        Ok(())
    }

    /// Stops the refresher and persists pending changes.
    pub fn close(&self) -> Result<()> {
        if let Some(refresher) = self.refresher.lock().take() {
            let _ = refresher.stop.send(());
            if refresher.handle.join().is_err() {
                error!("Metadata refresher panicked");
            }
        }
        self.persist_dirty()
    }
}

impl Drop for MetadataStore {
    fn drop(&mut self) {
        // The refresher only holds a weak reference and exits on its own.
        if let Some(refresher) = self.refresher.get_mut().take() {
            let _ = refresher.stop.send(());
        }
        if let Err(e) = self.persist_dirty() {
            error!("Failed to persist partition metadata on drop: {}", e);
        }
    }
}
