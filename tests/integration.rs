//! End-to-end insert/gather scenarios against an in-memory object store.

use std::sync::Arc;
use std::time::Duration;

use arrow::array::{Int64Array, StringArray, TimestampMicrosecondArray};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::{TimeZone, Utc};

use tablelake::backend::BackendRegistry;
use tablelake::cache::{CacheHandle, FileCache};
use tablelake::gather::{gather, GatherOptions};
use tablelake::insert::{insert, InsertOptions};
use tablelake::metadata::{Compression, Format, Granularity};
use tablelake::ArchiveError;

const STORE_URI: &str = "ffs://s3://test-bucket/archives";

fn test_cache() -> CacheHandle {
    let tmp = tempfile::tempdir().unwrap();
    // Leak the tempdir so it survives the test; each test gets its own dir.
    let path = tmp.into_path();
    CacheHandle::new(FileCache::new(path, 64 * 1024 * 1024, false, Duration::from_secs(86_400 * 90)))
}

fn test_registry() -> Arc<BackendRegistry> {
    Arc::new(BackendRegistry::new(vec![("main".to_string(), STORE_URI.to_string())]))
}

async fn seed_in_memory_store(cache: &CacheHandle) {
    let store = object_store::memory::InMemory::new();
    cache.register_store("test-bucket", Arc::new(store));
}

fn rows(ts: &[i64], values: &[i64], names: &[&str]) -> RecordBatch {
    let schema = Arc::new(Schema::new(vec![
        Field::new("ts", DataType::Timestamp(TimeUnit::Microsecond, None), false),
        Field::new("value", DataType::Int64, false),
        Field::new("name", DataType::Utf8, false),
    ]));
    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(TimestampMicrosecondArray::from(ts.to_vec())),
            Arc::new(Int64Array::from(values.to_vec())),
            Arc::new(StringArray::from(names.to_vec())),
        ],
    )
    .unwrap()
}

fn micros(y: i32, m: u32, d: u32, h: u32) -> i64 {
    Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap().timestamp_micros()
}

#[tokio::test]
async fn insert_then_gather_round_trips_with_dedup() {
    let cache = test_cache();
    seed_in_memory_store(&cache).await;
    let registry = test_registry();

    let mut insert_opts = InsertOptions::new(cache.clone(), registry.clone(), "ts");
    insert_opts.file_format = Format::Parquet;
    insert_opts.compression = Compression::None;
    insert_opts.granularity = Granularity::Day;

    let day = micros(2024, 3, 17, 6);
    let batch1 = rows(&[day, day + 3_600_000_000], &[1, 2], &["a", "b"]);
    insert("events", "clicks", &batch1, "main", &insert_opts).await.unwrap();

    // Re-insert an overlapping row (same ts + value) plus a new one; the
    // duplicate must collapse away on merge.
    let batch2 = rows(&[day, day + 7_200_000_000], &[1, 3], &["a", "c"]);
    insert("events", "clicks", &batch2, "main", &insert_opts).await.unwrap();

    let gather_opts = GatherOptions::new(cache.clone(), registry.clone());
    let start = Utc.with_ymd_and_hms(2024, 3, 17, 0, 0, 0).unwrap();
    let stop = Utc.with_ymd_and_hms(2024, 3, 18, 0, 0, 0).unwrap();
    let result = gather("events", "clicks", start, stop, Some("main"), &gather_opts)
        .await
        .unwrap();

    assert_eq!(result.num_rows(), 3);
}

#[tokio::test]
async fn gather_on_reversed_range_returns_error() {
    // gather's range is closed (`[start, stop]`), so `start == stop` is a
    // valid single-instant range; only `stop < start` is rejected.
    let cache = test_cache();
    let registry = test_registry();
    let gather_opts = GatherOptions::new(cache, registry);
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let stop = start - chrono::Duration::hours(1);
    let result = gather("events", "clicks", start, stop, Some("main"), &gather_opts).await;
    assert!(matches!(result, Err(ArchiveError::Schema(_))));
}

#[tokio::test]
async fn insert_with_empty_table_is_schema_error() {
    let cache = test_cache();
    seed_in_memory_store(&cache).await;
    let registry = test_registry();
    let insert_opts = InsertOptions::new(cache, registry, "ts");

    let schema = Arc::new(Schema::new(vec![Field::new(
        "ts",
        DataType::Timestamp(TimeUnit::Microsecond, None),
        false,
    )]));
    let empty = RecordBatch::new_empty(schema);
    let result = insert("events", "clicks", &empty, "main", &insert_opts).await;
    assert!(matches!(result, Err(ArchiveError::Schema(_))));
}

#[tokio::test]
async fn gather_with_no_matching_store_is_missing_data() {
    let cache = test_cache();
    seed_in_memory_store(&cache).await;
    let registry = test_registry();
    let gather_opts = GatherOptions::new(cache, registry);
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let stop = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
    let result = gather("events", "does-not-exist", start, stop, Some("main"), &gather_opts).await;
    assert!(matches!(result, Err(ArchiveError::MissingData(_))));
}

#[tokio::test]
async fn dst_spanning_range_does_not_lose_hours() {
    // US DST spring-forward 2024-03-10: 2am -> 3am. Hour-granularity keys
    // for a range spanning the transition must still count every UTC hour;
    // this crate floors in UTC, so no hour is skipped or duplicated.
    use tablelake::partition::keys_for_range;

    let start = Utc.with_ymd_and_hms(2024, 3, 10, 5, 0, 0).unwrap();
    let stop = Utc.with_ymd_and_hms(2024, 3, 10, 10, 0, 0).unwrap();
    let keys = keys_for_range(start, stop, Granularity::Hour);
    // Closed range [start, stop]: hours 5 through 10 inclusive.
    assert_eq!(keys.len(), 6);
}
