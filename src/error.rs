//! Error types for telebuf.

use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

use crate::meta::PartitionTimestamps;

/// Result type alias for telebuf operations.
pub type Result<T> = std::result::Result<T, TelebufError>;

/// Main error type for telebuf operations.
#[derive(Error, Debug)]
pub enum TelebufError {
    /// A single segment store ran out of room.
    #[error("Segment store is full: {used} of {capacity} bytes used, {requested} more requested")]
    StoreFull {
        capacity: u64,
        used: u64,
        requested: u64,
    },

    /// At least one segment of a partition rejected writes. Entries in `written`
    /// were committed before the failure and are not rolled back.
    #[error("Partition {partition} is full: segments {segments:?} rejected writes")]
    BufferFull {
        partition: u64,
        segments: Vec<usize>,
        written: HashMap<String, PartitionTimestamps>,
    },

    /// At least one segment failed with an I/O or codec error during a write.
    #[error("Write to partition {partition} failed in segments {segments:?}: {reason}")]
    SegmentWrite {
        partition: u64,
        segments: Vec<usize>,
        reason: String,
        written: HashMap<String, PartitionTimestamps>,
    },

    #[error("Feed id must not be empty")]
    InvalidFeedId,

    #[error("Feed id of {len} bytes exceeds the maximum of {max}")]
    FeedIdTooLong { len: usize, max: usize },

    #[error("Invalid timestamp range: start {start} > end {end}")]
    InvalidTimeRange { start: i64, end: i64 },

    #[error("Timestamp {timestamp} overflows when converted to nanoseconds")]
    TimestampOverflow { timestamp: i64 },

    #[error("Partition {partition} is not open")]
    PartitionNotFound { partition: u64 },

    #[error("Partition {partition} is closed")]
    PartitionClosed { partition: u64 },

    #[error("Cannot evict current partition {partition}")]
    EvictCurrentPartition { partition: u64 },

    #[error("{operation} did not complete within {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Buffer is shutting down")]
    BufferShuttingDown,

    #[error("Buffer already closed")]
    BufferClosed,

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Data corruption detected: {0}")]
    DataCorruption(String),

    #[error("IO error at path {path:?}: {source}")]
    IoWithPath {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Bincode serialization error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("redb database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),

    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("Channel send error for {channel}")]
    ChannelSend { channel: String },

    #[error("Channel receive error for {channel}")]
    ChannelReceive { channel: String },

    #[error("Other error: {0}")]
    Other(String),
}

impl TelebufError {
    /// Returns true for capacity exhaustion at either the segment or partition level.
    pub fn is_full(&self) -> bool {
        matches!(self, Self::StoreFull { .. } | Self::BufferFull { .. })
    }

    /// Extents that were durably written by a write call that ultimately failed.
    pub fn written_extents(&self) -> Option<&HashMap<String, PartitionTimestamps>> {
        match self {
            Self::BufferFull { written, .. } | Self::SegmentWrite { written, .. } => Some(written),
            _ => None,
        }
    }
}

impl From<redb::TransactionError> for TelebufError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl<T> From<crossbeam_channel::SendError<T>> for TelebufError {
    fn from(err: crossbeam_channel::SendError<T>) -> Self {
        TelebufError::ChannelSend {
            channel: format!("{:?}", err),
        }
    }
}

impl From<crossbeam_channel::RecvError> for TelebufError {
    fn from(err: crossbeam_channel::RecvError) -> Self {
        TelebufError::ChannelReceive {
            channel: format!("{:?}", err),
        }
    }
}

/// Returns true when an I/O error means the device has no space left.
pub(crate) fn is_out_of_space(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::StorageFull || err.raw_os_error() == Some(libc::ENOSPC)
}
