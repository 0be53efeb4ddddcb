//! End-to-end walkthrough of telebuf: writes, rotation, provenance-preserving
//! reads, capacity handling and reopening.
//!
//! Run with: cargo run --example comprehensive
//! Set `RUST_LOG=telebuf=debug` to see the buffer's own logs.

use std::collections::BTreeMap;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;
use telebuf::{
    Attributes, BufferPools, FeedBufferBuilder, FeedData, MetadataRefresh, TelebufError, TimeUnit,
};

fn reading(value: f64, status: &str) -> Attributes {
    Attributes::from([
        ("value".to_string(), value.to_string()),
        ("status".to_string(), status.to_string()),
    ])
}

fn feed(name: &str, samples: impl IntoIterator<Item = (i64, Attributes)>) -> FeedData {
    FeedData::from([(name.to_string(), samples.into_iter().collect())])
}

/// Example: put, rotate, and read back across partitions
fn example_put_rotate_and_read(dir: &TempDir) -> telebuf::Result<()> {
    println!("\n=== Example: Put, Rotate and Read ===");

    let buffer = FeedBufferBuilder::new()
        .with_storage_directory(dir.path().join("rotate"))
        .with_segment_concurrency_degree(4)
        .with_partition_retention_count(3)
        .build()?;

    let mut data = feed("temperature", [(1_000, reading(20.5, "ok")), (2_000, reading(20.7, "ok"))]);
    data.extend(feed("pressure", [(1_000, reading(1013.2, "ok"))]));
    let extents = buffer.put(&data, TimeUnit::Milliseconds)?;
    println!("Wrote partition 0, extents: {:?}", extents);

    let next = buffer.rotate()?;
    buffer.put(
        &feed("temperature", [(3_000, reading(21.1, "ok"))]),
        TimeUnit::Milliseconds,
    )?;
    println!("Rotated to partition {}", next);

    let merged = buffer.get(&["temperature", "pressure"], TimeUnit::Milliseconds, 0, 10_000)?;
    for (feed_id, samples) in &merged {
        println!("  {} -> {} samples", feed_id, samples.len());
    }

    let by_partition = buffer.get_by_partition(&["temperature"], TimeUnit::Milliseconds, 0, 10_000)?;
    for (partition, data) in &by_partition {
        let timestamps: Vec<i64> = data["temperature"].keys().copied().collect();
        println!("  partition {} holds temperature at {:?}", partition, timestamps);
    }

    let last = buffer.get_last(&["temperature"], TimeUnit::Seconds, 0, i64::MAX)?;
    println!("Latest temperature: {:?}", last["temperature"]);

    buffer.close()?;
    Ok(())
}

/// Example: a full partition rotates and the write is retried
fn example_full_partition(dir: &TempDir) -> telebuf::Result<()> {
    println!("\n=== Example: Full Partition ===");

    let buffer = FeedBufferBuilder::new()
        .with_storage_directory(dir.path().join("full"))
        .with_segment_concurrency_degree(1)
        .with_segment_capacity_bytes(8 * 1024)
        .build()?;

    let payload = "x".repeat(512);
    let mut rotations = 0;
    for ts in 0..64 {
        let data = feed("blob", [(ts, Attributes::from([("data".to_string(), payload.clone())]))]);
        match buffer.put(&data, TimeUnit::Nanoseconds) {
            Ok(_) => {}
            Err(e @ TelebufError::BufferFull { .. }) => {
                // The buffer already rotated; entries listed in the error are kept.
                println!("  {} (committed: {:?})", e, e.written_extents());
                rotations += 1;
                buffer.put(&data, TimeUnit::Nanoseconds)?;
            }
            Err(e) => return Err(e),
        }
    }

    println!(
        "Rotated {} times, open partitions: {:?}",
        rotations,
        buffer.partitions()
    );
    buffer.close()?;
    Ok(())
}

/// Example: concurrent writers sharing caller-owned pools
fn example_concurrent_writers() -> telebuf::Result<()> {
    println!("\n=== Example: Concurrent Writers ===");

    let pools = BufferPools::new(4, 4, Duration::from_secs(5));
    let buffer = FeedBufferBuilder::new()
        .with_segment_concurrency_degree(8)
        .with_pools(pools.clone())
        .build()?;

    let handles: Vec<_> = (0..4)
        .map(|writer| {
            let buffer = buffer.clone();
            thread::spawn(move || -> telebuf::Result<()> {
                let name = format!("sensor-{writer}");
                for ts in 0..250 {
                    buffer.put(
                        &feed(&name, [(ts, reading(ts as f64, "ok"))]),
                        TimeUnit::Seconds,
                    )?;
                }
                Ok(())
            })
        })
        .collect();

    for handle in handles {
        handle
            .join()
            .map_err(|_| TelebufError::Other("writer thread panicked".to_string()))??;
    }

    let feeds = ["sensor-0", "sensor-1", "sensor-2", "sensor-3"];
    let read = buffer.get(&feeds, TimeUnit::Seconds, 0, 1_000)?;
    let total: usize = read.values().map(BTreeMap::len).sum();
    println!("Read back {} samples from {} feeds", total, read.len());

    buffer.close()?;
    pools.shutdown()?;
    Ok(())
}

/// Example: data and partition layout survive a reopen
fn example_reopen(dir: &TempDir) -> telebuf::Result<()> {
    println!("\n=== Example: Reopen ===");
    let path = dir.path().join("reopen");

    {
        let buffer = FeedBufferBuilder::new()
            .with_storage_directory(&path)
            .with_metadata_refresh(MetadataRefresh::Disabled)
            .build()?;
        buffer.put(&feed("flow", [(10, reading(3.2, "ok"))]), TimeUnit::Seconds)?;
        buffer.rotate()?;
        buffer.put(&feed("flow", [(20, reading(3.4, "ok"))]), TimeUnit::Seconds)?;
        buffer.close()?;
    }

    let buffer = FeedBufferBuilder::new().with_storage_directory(&path).build()?;
    println!(
        "Reopened with partitions {:?}, state {:?}",
        buffer.partitions(),
        buffer.state()
    );
    let read = buffer.get(&["flow"], TimeUnit::Seconds, 0, 100)?;
    println!("flow samples: {:?}", read["flow"].keys().collect::<Vec<_>>());
    buffer.close()?;
    Ok(())
}

fn main() -> telebuf::Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    println!("telebuf Comprehensive Examples");
    println!("==============================");

    let dir = TempDir::new()?;
    example_put_rotate_and_read(&dir)?;
    example_full_partition(&dir)?;
    example_concurrent_writers()?;
    example_reopen(&dir)?;

    println!("\nAll examples completed successfully!");
    Ok(())
}
