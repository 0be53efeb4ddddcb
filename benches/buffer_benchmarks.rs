//! Benchmarks for telebuf buffer operations
//!
//! Run with: cargo bench

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;
use telebuf::{Attributes, FeedBuffer, FeedBufferBuilder, FeedData, TimeUnit};

fn attrs(i: i64) -> Attributes {
    Attributes::from([
        ("value".to_string(), (i as f64 / 10.0).to_string()),
        ("status".to_string(), "ok".to_string()),
    ])
}

/// `feeds` feeds with `per_feed` consecutive samples each, starting at `base`.
fn batch(feeds: usize, per_feed: i64, base: i64) -> FeedData {
    (0..feeds)
        .map(|f| {
            let samples = (0..per_feed).map(|i| (base + i, attrs(i))).collect();
            (format!("feed-{f}"), samples)
        })
        .collect()
}

fn memory_buffer(degree: usize) -> Arc<dyn FeedBuffer> {
    FeedBufferBuilder::new()
        .with_segment_concurrency_degree(degree)
        .build()
        .unwrap()
}

/// Benchmark writes of growing batches
fn bench_put(c: &mut Criterion) {
    let mut group = c.benchmark_group("put");

    for feeds in [1, 8, 64].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(feeds), feeds, |b, &feeds| {
            let buffer = memory_buffer(4);
            let mut base = 0;
            b.iter(|| {
                let data = batch(feeds, 10, base);
                base += 10;
                buffer.put(black_box(&data), TimeUnit::Seconds).unwrap();
            });
        });
    }

    group.finish();
}

/// Benchmark range reads over one thousand samples per feed
fn bench_get(c: &mut Criterion) {
    let buffer = memory_buffer(4);
    buffer.put(&batch(16, 1000, 0), TimeUnit::Seconds).unwrap();
    let feeds: Vec<String> = (0..16).map(|f| format!("feed-{f}")).collect();
    let feed_refs: Vec<&str> = feeds.iter().map(String::as_str).collect();

    c.bench_function("get_16_feeds_1000_samples", |b| {
        b.iter(|| {
            let read = buffer
                .get(black_box(&feed_refs), TimeUnit::Seconds, 0, 1000)
                .unwrap();
            black_box(read);
        });
    });

    c.bench_function("get_last_16_feeds", |b| {
        b.iter(|| {
            let read = buffer
                .get_last(black_box(&feed_refs), TimeUnit::Seconds, 0, 1000)
                .unwrap();
            black_box(read);
        });
    });
}

/// Benchmark reads routed across rotated partitions
fn bench_get_across_partitions(c: &mut Criterion) {
    let buffer = FeedBufferBuilder::new()
        .with_partition_retention_count(8)
        .build()
        .unwrap();
    for p in 0..8 {
        buffer.put(&batch(4, 100, p * 100), TimeUnit::Seconds).unwrap();
        buffer.rotate().unwrap();
    }

    c.bench_function("get_narrow_range_8_partitions", |b| {
        b.iter(|| {
            let read = buffer
                .get(black_box(&["feed-0"]), TimeUnit::Seconds, 350, 360)
                .unwrap();
            black_box(read);
        });
    });
}

/// Benchmark concurrent writers on distinct feeds
fn bench_concurrent_put(c: &mut Criterion) {
    c.bench_function("concurrent_put_8_threads", |b| {
        let buffer = memory_buffer(8);
        let mut round = 0;
        b.iter(|| {
            let base = round * 100;
            round += 1;
            let handles: Vec<_> = (0..8)
                .map(|t| {
                    let buffer = buffer.clone();
                    thread::spawn(move || {
                        let data = FeedData::from([(
                            format!("writer-{t}"),
                            (0..100).map(|i| (base + i, attrs(i))).collect(),
                        )]);
                        buffer.put(&data, TimeUnit::Seconds).unwrap();
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }
        });
    });
}

/// Benchmark disk-backed writes
fn bench_disk_put(c: &mut Criterion) {
    let temp_dir = TempDir::new().unwrap();
    let buffer = FeedBufferBuilder::new()
        .with_storage_directory(temp_dir.path())
        .build()
        .unwrap();
    let mut base = 0;

    c.bench_function("disk_put_8_feeds", |b| {
        b.iter(|| {
            let data = batch(8, 10, base);
            base += 10;
            buffer.put(black_box(&data), TimeUnit::Seconds).unwrap();
        });
    });
}

criterion_group!(
    benches,
    bench_put,
    bench_get,
    bench_get_across_partitions,
    bench_concurrent_put,
    bench_disk_put
);
criterion_main!(benches);
