//! Buffer configuration.

use crate::{Result, TelebufError};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upper bound on segments per partition.
pub const MAX_SEGMENT_CONCURRENCY_DEGREE: usize = 1024;

/// How often in-memory partition extents are written to the metadata store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataRefresh {
    /// No background refresher; every extent merge is written through.
    Disabled,
    /// Dirty rows are persisted by a background thread at this period.
    EveryMs(u64),
}

impl MetadataRefresh {
    /// Background refresh every `interval`.
    pub fn every(interval: Duration) -> Self {
        MetadataRefresh::EveryMs(interval.as_millis() as u64)
    }

    /// Refresh period, `None` when disabled.
    pub fn interval(self) -> Option<Duration> {
        match self {
            MetadataRefresh::Disabled => None,
            MetadataRefresh::EveryMs(ms) => Some(Duration::from_millis(ms)),
        }
    }
}

/// Options recognized when opening a buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Root directory for segment and metadata files. `None` keeps everything
    /// in memory.
    pub storage_directory: Option<PathBuf>,
    /// Requested write concurrency, rounded up to a power-of-two segment count.
    pub segment_concurrency_degree: usize,
    /// Maximum number of partitions kept open before the oldest is evicted.
    pub partition_retention_count: usize,
    /// Metadata persistence cadence.
    pub metadata_refresh_interval: MetadataRefresh,
    /// Byte quota per segment store. `None` means bounded only by the disk.
    pub segment_capacity_bytes: Option<u64>,
    /// Total byte budget across all partitions, enforced on rotation. Disk
    /// partitions count the size of their database files.
    pub max_disk_bytes: Option<u64>,
    /// Maximum time a call waits for its segment tasks. `None` waits forever.
    pub task_timeout_ms: Option<u64>,
    /// Rotate to a fresh partition when the current one reports it is full.
    pub rotate_on_full: bool,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            storage_directory: None,
            segment_concurrency_degree: 4,
            partition_retention_count: 3,
            metadata_refresh_interval: MetadataRefresh::EveryMs(5_000),
            segment_capacity_bytes: None,
            max_disk_bytes: None,
            task_timeout_ms: Some(30_000),
            rotate_on_full: true,
        }
    }
}

impl BufferConfig {
    /// Reads a JSON configuration file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| TelebufError::IoWithPath {
            path: path.to_path_buf(),
            source,
        })?;
        let config: BufferConfig = serde_json::from_reader(BufReader::new(file))?;
        config.validate()?;
        Ok(config)
    }

    /// Task timeout as a duration.
    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_ms.map(Duration::from_millis)
    }

    /// Rejects values the buffer cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if self.segment_concurrency_degree == 0
            || self.segment_concurrency_degree > MAX_SEGMENT_CONCURRENCY_DEGREE
        {
            return Err(TelebufError::InvalidConfiguration(format!(
                "segment_concurrency_degree must be within 1..={MAX_SEGMENT_CONCURRENCY_DEGREE}, got {}",
                self.segment_concurrency_degree
            )));
        }
        if self.partition_retention_count == 0 {
            return Err(TelebufError::InvalidConfiguration(
                "partition_retention_count must be at least 1".to_string(),
            ));
        }
        if self.metadata_refresh_interval == MetadataRefresh::EveryMs(0) {
            return Err(TelebufError::InvalidConfiguration(
                "metadata_refresh_interval must be positive or \"disabled\"".to_string(),
            ));
        }
        if self.segment_capacity_bytes == Some(0) {
            return Err(TelebufError::InvalidConfiguration(
                "segment_capacity_bytes must be positive".to_string(),
            ));
        }
        if self.task_timeout_ms == Some(0) {
            return Err(TelebufError::InvalidConfiguration(
                "task_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
