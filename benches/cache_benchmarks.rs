//! Criterion benchmarks for the artifact cache and partition key codec.
//!
//! Run with: `cargo bench`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use std::time::Duration;

use object_store::ObjectStore;
use tablelake::cache::{CacheOpts, FileCache};
use tablelake::partition::keys_for_range;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap()
}

fn bench_cache_get_hit(c: &mut Criterion) {
    let rt = runtime();
    let tmp = tempfile::tempdir().unwrap();
    let cache = rt.block_on(async {
        let cache = FileCache::new(tmp.path(), 64 * 1024 * 1024, false, Duration::from_secs(86_400 * 90));
        let store = object_store::memory::InMemory::new();
        store
            .put(&object_store::path::Path::from("k.csv"), b"a,b\n1,2\n".to_vec().into())
            .await
            .unwrap();
        cache.register_store("bench", Arc::new(store));
        cache.get("bench", "k.csv", CacheOpts::default()).await.unwrap();
        cache
    });

    c.bench_function("cache_get_warm_hit", |b| {
        b.to_async(&rt)
            .iter(|| async { black_box(cache.get("bench", "k.csv", CacheOpts::default()).await.unwrap()) });
    });
}

fn bench_keys_for_range(c: &mut Criterion) {
    use chrono::{TimeZone, Utc};
    use tablelake::metadata::Granularity;

    let mut group = c.benchmark_group("keys_for_range_days");
    for days in [1, 30, 365] {
        group.bench_with_input(BenchmarkId::from_parameter(days), &days, |b, &days| {
            let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
            let stop = start + chrono::Duration::days(days);
            b.iter(|| black_box(keys_for_range(start, stop, Granularity::Day).len()));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_cache_get_hit, bench_keys_for_range);
criterion_main!(benches);
