use std::collections::BTreeMap;
use std::io::Write;
use tempfile::{NamedTempFile, TempDir};
use telebuf::{
    Attributes, BufferConfig, BufferPools, BufferState, FeedBuffer, FeedBufferBuilder, FeedData,
    MetadataRefresh, PartitionTimestamps, TelebufError, TimeUnit,
};

fn attrs(value: &str) -> Attributes {
    let mut attrs = Attributes::new();
    attrs.insert("value".to_string(), value.to_string());
    attrs.insert("status".to_string(), "ok".to_string());
    attrs
}

fn samples(feed: &str, points: &[(i64, &str)]) -> FeedData {
    let mut data = FeedData::new();
    let feed_samples = data.entry(feed.to_string()).or_default();
    for (ts, value) in points {
        feed_samples.insert(*ts, attrs(value));
    }
    data
}

fn disk_buffer(dir: &TempDir) -> std::sync::Arc<dyn FeedBuffer> {
    FeedBufferBuilder::new()
        .with_storage_directory(dir.path())
        .with_segment_concurrency_degree(4)
        .with_partition_retention_count(3)
        .build()
        .unwrap()
}

#[test]
fn test_two_feeds_round_trip_on_disk() {
    let temp_dir = TempDir::new().unwrap();
    let buffer = disk_buffer(&temp_dir);

    let mut data = samples("feedA", &[(1000, "1")]);
    data.extend(samples("feedB", &[(1000, "2")]));
    let extents = buffer.put(&data, TimeUnit::Nanoseconds).unwrap();
    assert_eq!(extents["feedA"], PartitionTimestamps::new(1000, 1000));
    assert_eq!(extents["feedB"], PartitionTimestamps::new(1000, 1000));

    let read = buffer
        .get(&["feedA", "feedB"], TimeUnit::Nanoseconds, 0, 2000)
        .unwrap();
    assert_eq!(read, data);

    buffer.close().unwrap();
}

#[test]
fn test_range_and_last_queries() {
    let temp_dir = TempDir::new().unwrap();
    let buffer = disk_buffer(&temp_dir);

    buffer
        .put(
            &samples("temperature", &[(10, "20.1"), (20, "20.4"), (30, "20.9")]),
            TimeUnit::Milliseconds,
        )
        .unwrap();

    let window = buffer
        .get(&["temperature"], TimeUnit::Milliseconds, 15, 30)
        .unwrap();
    let keys: Vec<i64> = window["temperature"].keys().copied().collect();
    assert_eq!(keys, vec![20, 30]);

    let last = buffer
        .get_last(&["temperature"], TimeUnit::Milliseconds, 0, 100)
        .unwrap();
    assert_eq!(last["temperature"], BTreeMap::from([(30, attrs("20.9"))]));

    let empty = buffer
        .get(&["temperature"], TimeUnit::Milliseconds, 31, 100)
        .unwrap();
    assert!(empty.is_empty());

    let missing = buffer
        .get(&["pressure"], TimeUnit::Milliseconds, 0, 100)
        .unwrap();
    assert!(missing.is_empty());
}

#[test]
fn test_overwrite_returns_latest_attributes() {
    let temp_dir = TempDir::new().unwrap();
    let buffer = disk_buffer(&temp_dir);

    buffer
        .put(&samples("feedA", &[(5, "first")]), TimeUnit::Nanoseconds)
        .unwrap();
    buffer
        .put(&samples("feedA", &[(5, "second")]), TimeUnit::Nanoseconds)
        .unwrap();

    let read = buffer.get(&["feedA"], TimeUnit::Nanoseconds, 5, 5).unwrap();
    assert_eq!(read["feedA"], BTreeMap::from([(5, attrs("second"))]));
}

#[test]
fn test_negative_timestamps_sort_before_positive() {
    let temp_dir = TempDir::new().unwrap();
    let buffer = disk_buffer(&temp_dir);

    buffer
        .put(
            &samples("feedA", &[(-50, "a"), (-1, "b"), (0, "c"), (7, "d")]),
            TimeUnit::Nanoseconds,
        )
        .unwrap();

    let read = buffer
        .get(&["feedA"], TimeUnit::Nanoseconds, -10, 10)
        .unwrap();
    let keys: Vec<i64> = read["feedA"].keys().copied().collect();
    assert_eq!(keys, vec![-1, 0, 7]);
}

#[test]
fn test_rotation_isolates_and_eviction_removes() {
    let temp_dir = TempDir::new().unwrap();
    let buffer = FeedBufferBuilder::new()
        .with_storage_directory(temp_dir.path())
        .with_partition_retention_count(2)
        .build()
        .unwrap();

    buffer
        .put(&samples("feedA", &[(100, "p0")]), TimeUnit::Nanoseconds)
        .unwrap();
    assert_eq!(buffer.rotate().unwrap(), 1);
    buffer
        .put(&samples("feedA", &[(200, "p1")]), TimeUnit::Nanoseconds)
        .unwrap();

    // Both partitions serve reads after rotation.
    let read = buffer
        .get(&["feedA"], TimeUnit::Nanoseconds, 0, 1000)
        .unwrap();
    assert_eq!(read["feedA"].len(), 2);

    // Retention of two evicts partition 0 on the next rotation.
    assert_eq!(buffer.rotate().unwrap(), 2);
    assert_eq!(buffer.partitions(), vec![1, 2]);
    assert!(!temp_dir.path().join("partitions").join("p-0").exists());

    let read = buffer
        .get(&["feedA"], TimeUnit::Nanoseconds, 0, 150)
        .unwrap();
    assert!(read.is_empty());
    let read = buffer
        .get(&["feedA"], TimeUnit::Nanoseconds, 150, 250)
        .unwrap();
    assert_eq!(read["feedA"][&200], attrs("p1"));
}

#[test]
fn test_current_partition_is_never_evicted() {
    let buffer = FeedBufferBuilder::new()
        .with_partition_retention_count(1)
        .with_pools(BufferPools::inline())
        .build()
        .unwrap();

    for expected in 1..=3 {
        assert_eq!(buffer.rotate().unwrap(), expected);
        assert_eq!(buffer.partitions(), vec![expected]);
    }
    assert_eq!(buffer.evict_oldest().unwrap(), None);
    assert_eq!(buffer.state(), BufferState::PartitionActive(3));
}

#[test]
fn test_put_in_targets_an_older_partition() {
    let buffer = FeedBufferBuilder::new()
        .with_pools(BufferPools::inline())
        .build()
        .unwrap();

    buffer.rotate().unwrap();
    buffer
        .put_in(0, &samples("feedA", &[(1, "late")]), TimeUnit::Nanoseconds)
        .unwrap();

    let by_partition = buffer
        .get_by_partition(&["feedA"], TimeUnit::Nanoseconds, 0, 10)
        .unwrap();
    assert_eq!(by_partition.len(), 1);
    assert_eq!(by_partition[&0]["feedA"][&1], attrs("late"));
    assert_eq!(buffer.current_partition(), 1);
}

#[test]
fn test_argument_validation() {
    let buffer = FeedBufferBuilder::new()
        .with_pools(BufferPools::inline())
        .build()
        .unwrap();

    assert!(matches!(
        buffer.get(&["feedA"], TimeUnit::Nanoseconds, 10, 0),
        Err(TelebufError::InvalidTimeRange { start: 10, end: 0 })
    ));
    assert!(matches!(
        buffer.put(&samples("", &[(1, "x")]), TimeUnit::Nanoseconds),
        Err(TelebufError::InvalidFeedId)
    ));
    assert!(matches!(
        buffer.put(&samples("feedA", &[(i64::MIN, "x")]), TimeUnit::Microseconds),
        Err(TelebufError::TimestampOverflow { .. })
    ));
    assert!(matches!(
        FeedBufferBuilder::new()
            .with_segment_concurrency_degree(0)
            .build(),
        Err(TelebufError::InvalidConfiguration(_))
    ));
}

#[test]
fn test_builder_from_json_config() {
    let temp_dir = TempDir::new().unwrap();
    let mut file = NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{
            "storage_directory": {},
            "segment_concurrency_degree": 3,
            "partition_retention_count": 2,
            "metadata_refresh_interval": {{"every_ms": 100}}
        }}"#,
        serde_json::to_string(temp_dir.path()).unwrap()
    )
    .unwrap();

    let config = BufferConfig::from_json_file(file.path()).unwrap();
    assert_eq!(
        config.metadata_refresh_interval,
        MetadataRefresh::EveryMs(100)
    );

    let buffer = FeedBufferBuilder::new().with_config(config).build().unwrap();
    buffer
        .put(&samples("feedA", &[(1, "x")]), TimeUnit::Seconds)
        .unwrap();

    // Degree 3 rounds up to four segment files.
    let segment_files = std::fs::read_dir(temp_dir.path().join("partitions").join("p-0"))
        .unwrap()
        .count();
    assert_eq!(segment_files, 4);
    assert!(temp_dir.path().join("metadata.redb").exists());
}
