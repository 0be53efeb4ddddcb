use std::fs;
use tempfile::TempDir;
use telebuf::{
    Attributes, BufferState, FeedBufferBuilder, FeedData, MetadataRefresh, PartitionTimestamps,
    TimeUnit,
};

fn attrs(value: &str) -> Attributes {
    Attributes::from([("value".to_string(), value.to_string())])
}

fn sample(feed: &str, ts: i64, value: &str) -> FeedData {
    let mut data = FeedData::new();
    data.entry(feed.to_string())
        .or_default()
        .insert(ts, attrs(value));
    data
}

#[test]
fn test_reopen_restores_partitions_and_samples() {
    let temp_dir = TempDir::new().unwrap();

    {
        let buffer = FeedBufferBuilder::new()
            .with_storage_directory(temp_dir.path())
            .with_metadata_refresh(MetadataRefresh::every(std::time::Duration::from_secs(60)))
            .build()
            .unwrap();
        buffer
            .put(&sample("feedA", 10, "a"), TimeUnit::Nanoseconds)
            .unwrap();
        buffer.rotate().unwrap();
        buffer
            .put(&sample("feedA", 20, "b"), TimeUnit::Nanoseconds)
            .unwrap();
        // Close persists extents the refresher has not written yet.
        buffer.close().unwrap();
    }

    let buffer = FeedBufferBuilder::new()
        .with_storage_directory(temp_dir.path())
        .build()
        .unwrap();
    assert_eq!(buffer.partitions(), vec![0, 1]);
    assert_eq!(buffer.state(), BufferState::PartitionActive(1));

    let read = buffer
        .get(&["feedA"], TimeUnit::Nanoseconds, 0, 100)
        .unwrap();
    assert_eq!(read["feedA"][&10], attrs("a"));
    assert_eq!(read["feedA"][&20], attrs("b"));
}

#[test]
fn test_write_through_metadata_survives_without_close() {
    let temp_dir = TempDir::new().unwrap();

    {
        let buffer = FeedBufferBuilder::new()
            .with_storage_directory(temp_dir.path())
            .with_metadata_refresh(MetadataRefresh::Disabled)
            .build()
            .unwrap();
        buffer
            .put(&sample("feedA", 42, "kept"), TimeUnit::Nanoseconds)
            .unwrap();
        drop(buffer);
    }

    let buffer = FeedBufferBuilder::new()
        .with_storage_directory(temp_dir.path())
        .build()
        .unwrap();
    let by_partition = buffer
        .get_by_partition(&["feedA"], TimeUnit::Nanoseconds, 42, 42)
        .unwrap();
    assert_eq!(by_partition[&0]["feedA"][&42], attrs("kept"));
}

#[test]
fn test_orphaned_partition_storage_is_removed_on_open() {
    let temp_dir = TempDir::new().unwrap();

    {
        let buffer = FeedBufferBuilder::new()
            .with_storage_directory(temp_dir.path())
            .build()
            .unwrap();
        buffer
            .put(&sample("feedA", 1, "x"), TimeUnit::Nanoseconds)
            .unwrap();
        buffer.close().unwrap();
    }

    // A partition directory without a metadata row, as left by a crash mid-rotation.
    let orphan = temp_dir.path().join("partitions").join("p-7");
    fs::create_dir_all(&orphan).unwrap();
    fs::write(orphan.join("segment-0.redb"), b"partial").unwrap();

    let buffer = FeedBufferBuilder::new()
        .with_storage_directory(temp_dir.path())
        .build()
        .unwrap();
    assert!(!orphan.exists());
    assert_eq!(buffer.partitions(), vec![0]);
    let read = buffer.get(&["feedA"], TimeUnit::Nanoseconds, 0, 10).unwrap();
    assert_eq!(read["feedA"].len(), 1);
}

#[test]
fn test_restart_wipes_disk_state() {
    let temp_dir = TempDir::new().unwrap();

    {
        let buffer = FeedBufferBuilder::new()
            .with_storage_directory(temp_dir.path())
            .build()
            .unwrap();
        buffer
            .put(&sample("feedA", 1, "x"), TimeUnit::Nanoseconds)
            .unwrap();
        buffer.rotate().unwrap();
        buffer.rotate().unwrap();
        buffer.restart().unwrap();
        assert_eq!(buffer.partitions(), vec![0]);
        buffer
            .put(&sample("feedB", 5, "fresh"), TimeUnit::Nanoseconds)
            .unwrap();
        buffer.close().unwrap();
    }

    let partition_dirs: Vec<String> = fs::read_dir(temp_dir.path().join("partitions"))
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(partition_dirs, vec!["p-0".to_string()]);

    let buffer = FeedBufferBuilder::new()
        .with_storage_directory(temp_dir.path())
        .build()
        .unwrap();
    assert_eq!(buffer.current_partition(), 0);
    assert!(
        buffer
            .get(&["feedA"], TimeUnit::Nanoseconds, 0, 10)
            .unwrap()
            .is_empty()
    );
    let read = buffer.get(&["feedB"], TimeUnit::Nanoseconds, 0, 10).unwrap();
    assert_eq!(read["feedB"][&5], attrs("fresh"));
}

#[test]
fn test_reset_keeps_layout_and_clears_extents() {
    let temp_dir = TempDir::new().unwrap();

    {
        let buffer = FeedBufferBuilder::new()
            .with_storage_directory(temp_dir.path())
            .build()
            .unwrap();
        buffer
            .put(&sample("feedA", 1, "x"), TimeUnit::Nanoseconds)
            .unwrap();
        buffer.rotate().unwrap();
        buffer.reset().unwrap();
        let extents = buffer
            .put(&sample("feedA", 3, "y"), TimeUnit::Nanoseconds)
            .unwrap();
        assert_eq!(extents["feedA"], PartitionTimestamps::new(3, 3));
        buffer.close().unwrap();
    }

    let buffer = FeedBufferBuilder::new()
        .with_storage_directory(temp_dir.path())
        .build()
        .unwrap();
    assert_eq!(buffer.partitions(), vec![0, 1]);
    let read = buffer.get(&["feedA"], TimeUnit::Nanoseconds, 0, 10).unwrap();
    assert_eq!(read["feedA"].keys().copied().collect::<Vec<_>>(), vec![3]);
}
