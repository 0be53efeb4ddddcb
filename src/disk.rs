//! Disk segment store backed by redb.
//!
//! Every `(partition, segment)` pair gets its own database file:
//!
//! ```text
//! <storage_directory>/partitions/p-<partition>/segment-<segment>.redb
//! ```
//!
//! Byte usage is kept in a side table that is updated in the same write
//! transaction as the samples, so the quota survives restarts without a scan.

use crate::encoding::{decode_attributes, decode_timestamp, encode_attributes, encode_key};
use crate::error::is_out_of_space;
use crate::segment::{BatchOutcome, SegmentBackend, SegmentStore, SharedSegment, charge};
use crate::{Attributes, FeedSamples, Result, TelebufError};
use redb::{Database, ReadableTable, TableDefinition};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

const SAMPLES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("samples");
const USAGE: TableDefinition<&str, u64> = TableDefinition::new("usage");
const USED_BYTES_KEY: &str = "used_bytes";

pub const PARTITIONS_DIR_NAME: &str = "partitions";
const PARTITION_DIR_PREFIX: &str = "p-";
const SEGMENT_FILE_PREFIX: &str = "segment-";
const SEGMENT_FILE_SUFFIX: &str = ".redb";

/// Page cache per segment database.
const SEGMENT_CACHE_BYTES: usize = 16 * 1024 * 1024;

/// A segment store persisted in a single redb database file.
pub struct DiskSegment {
    path: PathBuf,
    db: Database,
    used: AtomicU64,
    capacity: Option<u64>,
}

impl DiskSegment {
    /// Opens (or creates) the segment database at `path`.
    pub fn open(path: impl AsRef<Path>, capacity: Option<u64>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| TelebufError::IoWithPath {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let db = Database::builder()
            .set_cache_size(SEGMENT_CACHE_BYTES)
            .create(path)?;

        // Create both tables eagerly so read transactions never miss them.
        let write_txn = db.begin_write()?;
        let used = {
            let _samples = write_txn.open_table(SAMPLES)?;
            let usage = write_txn.open_table(USAGE)?;
            usage.get(USED_BYTES_KEY)?.map(|g| g.value()).unwrap_or(0)
        };
        write_txn.commit()?;

        debug!(path = ?path, used, "Opened disk segment");

        Ok(Self {
            path: path.to_path_buf(),
            db,
            used: AtomicU64::new(used),
            capacity,
        })
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes entries in one transaction, stopping at the first quota rejection.
    ///
    /// Entries inserted before the rejection are committed. Any other failure
    /// aborts the transaction, so nothing from this call is written.
    fn write_entries<'a>(
        &self,
        feed_id: &str,
        entries: impl Iterator<Item = (i64, &'a Attributes)>,
    ) -> Result<BatchOutcome> {
        let mut outcome = BatchOutcome::default();
        let write_txn = self.db.begin_write()?;
        let used_after = {
            let mut samples = write_txn.open_table(SAMPLES)?;
            let mut usage = write_txn.open_table(USAGE)?;
            let mut used = usage.get(USED_BYTES_KEY)?.map(|g| g.value()).unwrap_or(0);

            for (timestamp, attributes) in entries {
                let key = encode_key(feed_id, timestamp)?;
                let value = encode_attributes(attributes)?;
                let replaced = samples
                    .get(key.as_slice())?
                    .map(|old| (key.len() + old.value().len()) as u64)
                    .unwrap_or(0);
                let incoming = (key.len() + value.len()) as u64;

                match charge(self.capacity, used, replaced, incoming) {
                    Ok(next) => {
                        samples.insert(key.as_slice(), value.as_slice())?;
                        used = next;
                        outcome.record(timestamp);
                    }
                    Err(e) => {
                        outcome.error = Some(e);
                        break;
                    }
                }
            }

            usage.insert(USED_BYTES_KEY, used)?;
            used
        };
        write_txn.commit()?;
        self.used.store(used_after, Ordering::Release);
        Ok(outcome)
    }

    /// Maps disk exhaustion reported by redb onto `StoreFull`.
    fn classify(&self, err: TelebufError) -> TelebufError {
        let io = match &err {
            TelebufError::Storage(redb::StorageError::Io(io)) => Some(io),
            TelebufError::Commit(redb::CommitError::Storage(redb::StorageError::Io(io))) => {
                Some(io)
            }
            TelebufError::Io(io) => Some(io),
            _ => None,
        };

        match io {
            Some(io) if is_out_of_space(io) => {
                let used = self.used.load(Ordering::Acquire);
                warn!(path = ?self.path, used, "Disk full while writing segment");
                TelebufError::StoreFull {
                    capacity: self.capacity.unwrap_or(used),
                    used,
                    requested: 0,
                }
            }
            _ => err,
        }
    }
}

impl SegmentStore for DiskSegment {
    fn upsert(&self, feed_id: &str, timestamp: i64, attributes: &Attributes) -> Result<()> {
        let outcome = self
            .write_entries(feed_id, std::iter::once((timestamp, attributes)))
            .map_err(|e| self.classify(e))?;
        match outcome.error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn upsert_batch(&self, feed_id: &str, samples: &FeedSamples) -> BatchOutcome {
        let entries = samples.iter().map(|(&ts, attrs)| (ts, attrs));
        match self.write_entries(feed_id, entries) {
            Ok(outcome) => outcome,
            Err(e) => BatchOutcome {
                error: Some(self.classify(e)),
                ..BatchOutcome::default()
            },
        }
    }

    fn range_scan(&self, feed_id: &str, start: i64, end: i64) -> Result<Vec<(i64, Attributes)>> {
        if start > end {
            return Ok(Vec::new());
        }
        let lo = encode_key(feed_id, start)?;
        let hi = encode_key(feed_id, end)?;

        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SAMPLES)?;
        let mut result = Vec::new();
        for entry in table.range(lo.as_slice()..=hi.as_slice())? {
            let (key, value) = entry?;
            result.push((decode_timestamp(key.value())?, decode_attributes(value.value())?));
        }
        Ok(result)
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

        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SAMPLES)?;
        let last = table.range(lo.as_slice()..=hi.as_slice())?.next_back();
        match last {
            Some(entry) => {
                let (key, value) = entry?;
                Ok(Some((
                    decode_timestamp(key.value())?,
                    decode_attributes(value.value())?,
                )))
            }
            None => Ok(None),
        }
    }

    fn used_bytes(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    fn capacity_bytes(&self) -> Option<u64> {
        self.capacity
    }
}

/// Lays out [`DiskSegment`] files under a storage directory.
pub struct DiskBackend {
    root: PathBuf,
    capacity: Option<u64>,
}

impl DiskBackend {
    /// Creates a backend rooted at `<storage_directory>/partitions`.
    pub fn new(storage_directory: impl AsRef<Path>, capacity: Option<u64>) -> Result<Self> {
        let root = storage_directory.as_ref().join(PARTITIONS_DIR_NAME);
        fs::create_dir_all(&root).map_err(|source| TelebufError::IoWithPath {
            path: root.clone(),
            source,
        })?;
        Ok(Self { root, capacity })
    }

    /// Directory holding the segments of a partition.
    pub fn partition_dir(&self, partition: u64) -> PathBuf {
        self.root.join(format!("{PARTITION_DIR_PREFIX}{partition}"))
    }

    /// Database file of one segment.
    pub fn segment_path(&self, partition: u64, segment: usize) -> PathBuf {
        self.partition_dir(partition)
            .join(format!("{SEGMENT_FILE_PREFIX}{segment}{SEGMENT_FILE_SUFFIX}"))
    }
}

impl SegmentBackend for DiskBackend {
    fn open(&self, partition: u64, segment: usize) -> Result<SharedSegment> {
        let store = DiskSegment::open(self.segment_path(partition, segment), self.capacity)?;
        Ok(Arc::new(store))
    }

    fn destroy(&self, partition: u64, segment: usize) -> Result<()> {
        let path = self.segment_path(partition, segment);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(TelebufError::IoWithPath { path, source }),
        }
    }

    fn remove_partition(&self, partition: u64) -> Result<()> {
        let dir = self.partition_dir(partition);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                info!(partition, "Removed partition storage");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(TelebufError::IoWithPath { path: dir, source }),
        }
    }

    fn existing_partitions(&self) -> Result<Vec<u64>> {
        let mut partitions = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            let index = path
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(|name| name.strip_prefix(PARTITION_DIR_PREFIX))
                .and_then(|index| index.parse::<u64>().ok());
            if let Some(index) = index {
                partitions.push(index);
            }
        }
        partitions.sort_unstable();
        Ok(partitions)
    }

    fn footprint_bytes(&self, partition: u64) -> Result<u64> {
        let dir = self.partition_dir(partition);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(source) => return Err(TelebufError::IoWithPath { path: dir, source }),
        };
        let mut total = 0;
        for entry in entries {
            let metadata = entry?.metadata()?;
            if metadata.is_file() {
                total += metadata.len();
            }
        }
        Ok(total)
    }
}
