use tempfile::TempDir;
use telebuf::{
    Attributes, BufferPools, FeedBuffer, FeedBufferBuilder, FeedData, TelebufError, TimeUnit,
};

/// Routes buffer logs to the test output. Filter with `RUST_LOG`.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn payload_sample(feed: &str, ts: i64, bytes: usize) -> FeedData {
    let mut data = FeedData::new();
    data.entry(feed.to_string())
        .or_default()
        .insert(ts, Attributes::from([("blob".to_string(), "x".repeat(bytes))]));
    data
}

/// Writes one sample per timestamp until the buffer reports it is full and
/// returns the first timestamp that was rejected.
fn fill(buffer: &dyn FeedBuffer, feed: &str) -> (i64, TelebufError) {
    let mut ts = 0;
    loop {
        match buffer.put(&payload_sample(feed, ts, 256), TimeUnit::Nanoseconds) {
            Ok(_) => ts += 1,
            Err(e) => return (ts, e),
        }
    }
}

#[test]
fn test_full_disk_segment_keeps_earlier_samples() {
    init_tracing();
    let temp_dir = TempDir::new().unwrap();
    let buffer = FeedBufferBuilder::new()
        .with_storage_directory(temp_dir.path())
        .with_segment_concurrency_degree(1)
        .with_segment_capacity_bytes(4096)
        .with_rotate_on_full(false)
        .build()
        .unwrap();

    let (rejected, err) = fill(buffer.as_ref(), "feedA");
    assert!(rejected > 0);
    match err {
        TelebufError::BufferFull {
            partition,
            segments,
            written,
        } => {
            assert_eq!(partition, 0);
            assert_eq!(segments, vec![0]);
            assert!(written.is_empty());
        }
        other => panic!("expected BufferFull, got {other:?}"),
    }

    // Without rotation the partition keeps refusing writes.
    assert_eq!(buffer.current_partition(), 0);
    assert!(
        buffer
            .put(&payload_sample("feedA", rejected, 256), TimeUnit::Nanoseconds)
            .unwrap_err()
            .is_full()
    );

    let read = buffer
        .get(&["feedA"], TimeUnit::Nanoseconds, 0, rejected)
        .unwrap();
    assert_eq!(read["feedA"].len() as i64, rejected);

    // A manual rotation makes room again.
    buffer.rotate().unwrap();
    buffer
        .put(&payload_sample("feedA", rejected, 256), TimeUnit::Nanoseconds)
        .unwrap();
    let read = buffer
        .get(&["feedA"], TimeUnit::Nanoseconds, 0, rejected)
        .unwrap();
    assert_eq!(read["feedA"].len() as i64, rejected + 1);
}

#[test]
fn test_full_partition_rotates_and_retry_succeeds() {
    init_tracing();
    let temp_dir = TempDir::new().unwrap();
    let buffer = FeedBufferBuilder::new()
        .with_storage_directory(temp_dir.path())
        .with_segment_concurrency_degree(1)
        .with_segment_capacity_bytes(4096)
        .build()
        .unwrap();

    let (rejected, err) = fill(buffer.as_ref(), "feedA");
    assert!(err.is_full());
    assert_eq!(buffer.current_partition(), 1);

    buffer
        .put(&payload_sample("feedA", rejected, 256), TimeUnit::Nanoseconds)
        .unwrap();
    let last = buffer
        .get_last(&["feedA"], TimeUnit::Nanoseconds, 0, i64::MAX)
        .unwrap();
    assert!(last["feedA"].contains_key(&rejected));
}

#[test]
fn test_disk_budget_evicts_oldest_partitions() {
    init_tracing();
    let buffer = FeedBufferBuilder::new()
        .with_segment_concurrency_degree(2)
        .with_partition_retention_count(10)
        .with_max_disk_bytes(3_000)
        .with_pools(BufferPools::inline())
        .build()
        .unwrap();

    for ts in 0..8 {
        buffer
            .put(&payload_sample("feedA", ts, 256), TimeUnit::Nanoseconds)
            .unwrap();
    }
    buffer.rotate().unwrap();
    for ts in 8..16 {
        buffer
            .put(&payload_sample("feedA", ts, 256), TimeUnit::Nanoseconds)
            .unwrap();
    }
    buffer.rotate().unwrap();

    // Partition 0 and 1 together exceed the budget, 1 alone does not.
    assert_eq!(buffer.partitions(), vec![1, 2]);
    let read = buffer
        .get(&["feedA"], TimeUnit::Nanoseconds, 0, 100)
        .unwrap();
    let keys: Vec<i64> = read["feedA"].keys().copied().collect();
    assert_eq!(keys, (8..16).collect::<Vec<_>>());
}

#[test]
fn test_disk_budget_counts_segment_files() {
    init_tracing();
    let temp_dir = TempDir::new().unwrap();
    // A handful of samples is far below the budget; the database files are not.
    let buffer = FeedBufferBuilder::new()
        .with_storage_directory(temp_dir.path())
        .with_segment_concurrency_degree(4)
        .with_partition_retention_count(10)
        .with_max_disk_bytes(10_000)
        .build()
        .unwrap();

    buffer
        .put(&payload_sample("feedA", 1, 8), TimeUnit::Nanoseconds)
        .unwrap();
    buffer.rotate().unwrap();

    assert_eq!(buffer.partitions(), vec![1]);
    assert!(!temp_dir.path().join("partitions").join("p-0").exists());
    assert!(temp_dir.path().join("partitions").join("p-1").exists());
}
