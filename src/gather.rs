//! C6 — the gather engine: concurrent fetch/decode/filter/merge over a
//! closed `[start, stop]` range (spec.md §3, §4.6).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BooleanArray, Float64Array, Float64Builder, Int32Array, Int64Array, Int64Builder, ListBuilder,
    StringArray, StringBuilder, TimestampMicrosecondArray, UInt64Array,
};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use object_store::ObjectStore;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::debug;

use crate::backend::{BackendRegistry, Store};
use crate::cache::{CacheHandle, CacheOpts};
use crate::codec;
use crate::error::ArchiveError;
use crate::metadata::{DatasetDescriptor, MetadataStore};
use crate::partition::{self, PartitionKey};
use crate::table::Table;

const LISTING_PRUNE_THRESHOLD: usize = 8;

/// Tuning and override knobs for [`gather`].
pub struct GatherOptions {
    /// Number of concurrent fetch/decode/filter tasks. `1` gives strictly
    /// sequential fetch order, matching spec.md §4.6.3's ordering guarantee
    /// for a single worker.
    pub worker_count: usize,
    pub cache: CacheHandle,
    pub registry: Arc<BackendRegistry>,
    /// Against a read-only archive that declares a `superkey`, only the
    /// latest `release_date` at or before this instant is eligible per
    /// group (spec.md §4.6.1). `None` disables latest-release selection
    /// entirely (every row kept). Rejected with a [`crate::error::ArchiveError::Schema`]
    /// against a writable archive, which has no `release_date` concept.
    pub release_cutoff: Option<DateTime<Utc>>,
    pub cancel: Arc<AtomicBool>,
}

impl GatherOptions {
    pub fn new(cache: CacheHandle, registry: Arc<BackendRegistry>) -> Self {
        Self {
            worker_count: 4,
            cache,
            registry,
            release_cutoff: None,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// C6 — fetches, decodes, filters, and merges all rows of `(collection,
/// dataset)` whose index column falls in the closed range `[start, stop]`,
/// from `store_id` if given, else the first store in registry order that has
/// a descriptor for the dataset (spec.md §4.6).
pub async fn gather(
    collection: &str,
    dataset: &str,
    start: DateTime<Utc>,
    stop: DateTime<Utc>,
    store_id: Option<&str>,
    opts: &GatherOptions,
) -> Result<Table, ArchiveError> {
    if start > stop {
        return Err(ArchiveError::Schema("gather range is empty: start > stop".into()));
    }

    let (store, descriptor) = resolve_store_and_descriptor(collection, dataset, store_id, opts).await?;

    if opts.release_cutoff.is_some() && store.is_writable() {
        return Err(ArchiveError::Schema(
            "release_cutoff is only meaningful against a read-only archive; writable archives have no release_date concept".into(),
        ));
    }

    let granularity = descriptor.granularity();
    let format = descriptor.file_format;
    let compression = descriptor.compression;
    let index_key = descriptor.index_key().to_string();
    let schema = Arc::new(crate::metadata::schema_from_descriptor(&descriptor)?);

    let keys = partition::keys_for_range(start, stop, granularity);
    if keys.is_empty() {
        return Ok(crate::table::empty_like(schema));
    }

    let existing_keys = if keys.len() > LISTING_PRUNE_THRESHOLD {
        prune_via_listing(&opts.cache, &store, collection, dataset, &keys, granularity, format, compression).await?
    } else {
        keys.clone()
    };

    let tables = fetch_decode_filter_all(
        &store,
        collection,
        dataset,
        &existing_keys,
        granularity,
        format,
        compression,
        &index_key,
        start,
        stop,
        schema.clone(),
        opts,
    )
    .await?;

    if tables.is_empty() {
        return Ok(crate::table::empty_like(schema));
    }

    let merged = crate::table::concat_tables(&tables)?;
    let merged = if opts.release_cutoff.is_some() {
        // `store.is_writable()` was already rejected above when a cutoff is
        // present, so this is always a read-only archive here.
        let superkey = descriptor.superkey_from_details().ok_or_else(|| {
            ArchiveError::Schema("release_cutoff requires the archive to declare a superkey".into())
        })?;
        select_latest_release(&merged, &superkey, opts.release_cutoff)?
    } else {
        merged
    };

    post_process(merged, &store, &descriptor)
}

async fn resolve_store_and_descriptor(
    collection: &str,
    dataset: &str,
    store_id: Option<&str>,
    opts: &GatherOptions,
) -> Result<(Store, DatasetDescriptor), ArchiveError> {
    let candidates: Vec<Store> = match store_id {
        Some(id) => vec![opts.registry.lookup(id)?],
        None => (*opts.registry.ordered_stores()?).clone(),
    };

    if candidates.is_empty() {
        return Err(ArchiveError::Config("no stores available to gather from".into()));
    }

    let mut last_err = None;
    for store in candidates {
        crate::backend::object_store_for(&opts.cache, &store)?;
        match MetadataStore::get_descriptor(&opts.cache, store.bucket(), store.prefix(), collection, dataset).await {
            Ok(desc) => return Ok((store, desc)),
            Err(ArchiveError::MissingData(msg)) => {
                debug!(store = store.id(), %msg, "dataset not found in store, trying next");
                last_err = Some(ArchiveError::MissingData(msg));
            }
            Err(other) => return Err(other),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        ArchiveError::MissingData(format!("no store had a descriptor for {collection}/{dataset}"))
    }))
}

#[allow(clippy::too_many_arguments)]
async fn prune_via_listing(
    cache: &CacheHandle,
    store: &Store,
    collection: &str,
    dataset: &str,
    keys: &[PartitionKey],
    granularity: crate::metadata::Granularity,
    format: crate::metadata::Format,
    compression: crate::metadata::Compression,
) -> Result<Vec<PartitionKey>, ArchiveError> {
    // More than LISTING_PRUNE_THRESHOLD candidate keys: one listing call on
    // the dataset's key prefix is cheaper than one existence probe per key.
    let object_store = crate::backend::object_store_for(cache, store)?;
    let prefix = object_store::path::Path::from(format!("{}/{collection}/{dataset}", store.prefix()));
    let listing = object_store
        .list_with_delimiter(Some(&prefix))
        .await
        .map_err(crate::error::classify_object_store_error)?;
    let present: std::collections::HashSet<String> =
        listing.objects.iter().map(|o| o.location.to_string()).collect();

    Ok(keys
        .iter()
        .copied()
        .filter(|key| {
            let object_key = partition::object_key_for_partition(
                store.prefix(),
                collection,
                dataset,
                *key,
                granularity,
                format,
                compression,
            );
            present.contains(&object_key)
        })
        .collect())
}

#[allow(clippy::too_many_arguments)]
async fn fetch_decode_filter_all(
    store: &Store,
    collection: &str,
    dataset: &str,
    keys: &[PartitionKey],
    granularity: crate::metadata::Granularity,
    format: crate::metadata::Format,
    compression: crate::metadata::Compression,
    index_key: &str,
    start: DateTime<Utc>,
    stop: DateTime<Utc>,
    schema: arrow::datatypes::SchemaRef,
    opts: &GatherOptions,
) -> Result<Vec<Table>, ArchiveError> {
    let semaphore = Arc::new(Semaphore::new(opts.worker_count.max(1)));
    let mut tasks: JoinSet<Result<Option<Table>, ArchiveError>> = JoinSet::new();

    for key in keys.iter().copied() {
        let semaphore = semaphore.clone();
        let cache = opts.cache.clone();
        let store = store.clone();
        let collection = collection.to_string();
        let dataset = dataset.to_string();
        let index_key = index_key.to_string();
        let schema = schema.clone();
        let cancel = opts.cancel.clone();

        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
            if cancel.load(Ordering::Relaxed) {
                return Ok(None);
            }
            fetch_decode_filter_one(
                &cache, &store, &collection, &dataset, key, granularity, format, compression, &index_key, start,
                stop, schema,
            )
            .await
        });
    }

    let mut out = Vec::with_capacity(keys.len());
    while let Some(joined) = tasks.join_next().await {
        match joined.map_err(|e| ArchiveError::Format(format!("gather worker panicked: {e}")))? {
            Ok(Some(table)) => out.push(table),
            Ok(None) => {}
            Err(err) => {
                opts.cancel.store(true, Ordering::Relaxed);
                return Err(err);
            }
        }
    }
    Ok(out)
}

#[allow(clippy::too_many_arguments)]
async fn fetch_decode_filter_one(
    cache: &CacheHandle,
    store: &Store,
    collection: &str,
    dataset: &str,
    key: PartitionKey,
    granularity: crate::metadata::Granularity,
    format: crate::metadata::Format,
    compression: crate::metadata::Compression,
    index_key: &str,
    start: DateTime<Utc>,
    stop: DateTime<Utc>,
    schema: arrow::datatypes::SchemaRef,
) -> Result<Option<Table>, ArchiveError> {
    let object_key =
        partition::object_key_for_partition(store.prefix(), collection, dataset, key, granularity, format, compression);

    // Partitions are encoded-then-compressed; the decoder below expects
    // already-decompressed bytes, so always decompress on ingest here
    // regardless of the cache's ambient `DATA_CACHE_DECOMPRESS` default.
    let decode_opts = CacheOpts {
        decompress: Some(true),
        ..CacheOpts::default()
    };
    let local_path = match cache.get(store.bucket(), &object_key, decode_opts).await {
        Ok(path) => path,
        Err(ArchiveError::MissingData(msg)) => {
            debug!(%object_key, %msg, "partition key has no object, skipping");
            return Ok(None);
        }
        Err(other) => return Err(other),
    };

    let bytes = tokio::fs::read(&local_path)
        .await
        .map_err(|e| ArchiveError::Format(format!("reading cached partition: {e}")))?;
    let table = codec::decode_bytes(&bytes, format, Some(schema))?;

    let filtered = partition::filter_table(&table, index_key, start, stop, Some((key, granularity)))?;
    Ok(Some(filtered))
}

/// A superkey column's value at a single row, reduced to an owned,
/// hashable form so rows can be grouped without re-reading arrow arrays.
#[derive(Clone, PartialEq, Eq, Hash)]
enum GroupValue {
    Null,
    Int(i64),
    Bool(bool),
    Str(String),
    FloatBits(u64),
}

fn group_value(column: &ArrayRef, row: usize) -> GroupValue {
    if column.is_null(row) {
        return GroupValue::Null;
    }
    if let Some(a) = column.as_any().downcast_ref::<Int64Array>() {
        return GroupValue::Int(a.value(row));
    }
    if let Some(a) = column.as_any().downcast_ref::<Int32Array>() {
        return GroupValue::Int(a.value(row) as i64);
    }
    if let Some(a) = column.as_any().downcast_ref::<UInt64Array>() {
        return GroupValue::Int(a.value(row) as i64);
    }
    if let Some(a) = column.as_any().downcast_ref::<TimestampMicrosecondArray>() {
        return GroupValue::Int(a.value(row));
    }
    if let Some(a) = column.as_any().downcast_ref::<BooleanArray>() {
        return GroupValue::Bool(a.value(row));
    }
    if let Some(a) = column.as_any().downcast_ref::<Float64Array>() {
        return GroupValue::FloatBits(a.value(row).to_bits());
    }
    if let Some(a) = column.as_any().downcast_ref::<StringArray>() {
        return GroupValue::Str(a.value(row).to_string());
    }
    // Any other concrete array type still needs a stable, comparable
    // rendering to group on; falls back to its debug text.
    GroupValue::Str(format!("{:?}", column.slice(row, 1)))
}

/// Groups rows by `superkey` minus `{release_date, tag}` and keeps, per
/// group, the row whose `release_date` is the maximum not exceeding
/// `cutoff` (spec.md §4.6.1, seed scenario S6). Groups with no row meeting
/// the bound are dropped entirely. Uses stable row indices via
/// [`crate::table::take_rows`] so no per-group intermediate table is ever
/// materialized.
fn select_latest_release(
    table: &Table,
    superkey: &[String],
    cutoff: Option<DateTime<Utc>>,
) -> Result<Table, ArchiveError> {
    const RELEASE_DATE_COLUMN: &str = "release_date";
    const TAG_COLUMN: &str = "tag";

    let schema = table.schema();
    let release_idx = schema
        .index_of(RELEASE_DATE_COLUMN)
        .map_err(|_| ArchiveError::Schema(format!("superkey selection requires a '{RELEASE_DATE_COLUMN}' column")))?;
    let release_date = table
        .column(release_idx)
        .as_any()
        .downcast_ref::<TimestampMicrosecondArray>()
        .ok_or_else(|| ArchiveError::Schema(format!("'{RELEASE_DATE_COLUMN}' column is not a timestamp")))?;

    let group_columns: Vec<usize> = superkey
        .iter()
        .filter(|name| name.as_str() != RELEASE_DATE_COLUMN && name.as_str() != TAG_COLUMN)
        .map(|name| {
            schema
                .index_of(name)
                .map_err(|_| ArchiveError::Schema(format!("superkey column '{name}' not found")))
        })
        .collect::<Result<_, _>>()?;

    let cutoff_us = cutoff.map(|c| c.timestamp_micros());
    let mut best: HashMap<Vec<GroupValue>, (i64, u32)> = HashMap::new();
    for i in 0..table.num_rows() {
        if !release_date.is_valid(i) {
            continue;
        }
        let value = release_date.value(i);
        if let Some(cutoff_us) = cutoff_us {
            if value > cutoff_us {
                continue;
            }
        }
        let key: Vec<GroupValue> = group_columns.iter().map(|&idx| group_value(table.column(idx), i)).collect();
        best.entry(key)
            .and_modify(|(best_value, best_idx)| {
                if value > *best_value {
                    *best_value = value;
                    *best_idx = i as u32;
                }
            })
            .or_insert((value, i as u32));
    }

    let mut indices: Vec<u32> = best.into_values().map(|(_, idx)| idx).collect();
    indices.sort_unstable();
    crate::table::take_rows(table, &indices)
}

/// Post-processing per spec.md §4.6.2. The codec layer already decodes
/// zoned-timestamp columns to arrow's native `Timestamp` type with no
/// timezone attached (spec.md §4.1/§4.7.2's "Unix seconds on the wire" is
/// handled at the codec boundary, see `src/codec/csv.rs`) — this step's job
/// is to attach the descriptor's declared IANA zone to those columns for
/// display, and then either validate every other column against the
/// descriptor's declared types (writable archive) or apply the archive's
/// free-form bounds/list/bool coercions (read-only archive).
fn post_process(table: Table, store: &Store, descriptor: &DatasetDescriptor) -> Result<Table, ArchiveError> {
    let zoned = attach_declared_timezone(table, descriptor)?;
    if store.is_writable() {
        validate_against_declared_types(&zoned, descriptor)?;
        Ok(zoned)
    } else {
        post_process_read_only(zoned, descriptor)
    }
}

/// Re-tags every column the descriptor declares `ZonedDateTime` with the
/// descriptor's IANA timezone name, so the returned table carries a properly
/// zoned timestamp rather than a naive one (spec.md §4.6.2: "decode timestamp
/// columns ... to zoned timestamps in the descriptor's timezone"). The cast
/// runs once over the whole column rather than value-by-value, which already
/// gives repeated Unix values the reuse spec.md §4.6.2 asks for.
fn attach_declared_timezone(table: Table, descriptor: &DatasetDescriptor) -> Result<Table, ArchiveError> {
    let schema = table.schema();
    let mut changed = false;
    let mut fields = Vec::with_capacity(schema.fields().len());
    let mut columns: Vec<arrow::array::ArrayRef> = Vec::with_capacity(schema.fields().len());
    for (i, field) in schema.fields().iter().enumerate() {
        let column = table.column(i);
        let is_zoned = matches!(
            descriptor.column_types.get(field.name()),
            Some(crate::metadata::ColumnType::Simple(tag)) if tag == "ZonedDateTime"
        );
        if is_zoned {
            if let DataType::Timestamp(unit, None) = field.data_type() {
                changed = true;
                let tz: std::sync::Arc<str> = std::sync::Arc::from(descriptor.timezone.as_str());
                let target = DataType::Timestamp(*unit, Some(tz));
                let cast_column = arrow::compute::cast(column, &target)
                    .map_err(|e| ArchiveError::Format(format!("attaching timezone to '{}': {e}", field.name())))?;
                fields.push(Field::new(field.name(), target, field.is_nullable()));
                columns.push(cast_column);
                continue;
            }
        }
        fields.push(field.as_ref().clone());
        columns.push(column.clone());
    }

    if !changed {
        return Ok(table);
    }
    let new_schema = std::sync::Arc::new(Schema::new(fields));
    arrow::record_batch::RecordBatch::try_new(new_schema, columns)
        .map_err(|e| ArchiveError::Format(format!("rebuilding zoned-timestamp batch: {e}")))
}

/// Writable-archive post-processing check (spec.md §4.6.2): every column
/// that isn't a zoned timestamp must have an observed type that's a subtype
/// of the descriptor's declared type, or the stored data itself is corrupt
/// relative to the schema that's supposed to govern it.
fn validate_against_declared_types(table: &Table, descriptor: &DatasetDescriptor) -> Result<(), ArchiveError> {
    for field in table.schema().fields() {
        let Some(declared) = descriptor.column_types.get(field.name()) else {
            continue;
        };
        let is_timestamp = matches!(declared, crate::metadata::ColumnType::Simple(tag) if tag == "ZonedDateTime" || tag == "DateTime");
        let is_array = matches!(
            declared,
            crate::metadata::ColumnType::Array(_, _) | crate::metadata::ColumnType::ParametricArray(_, _)
        );
        if is_timestamp || is_array {
            // Timestamps are already cast back to their declared type above.
            // List columns are left as raw JSON text by the codec (spec.md
            // §4.1) and never reconstructed on this path, so they never
            // round-trip to their declared arrow type cleanly enough to
            // subtype-check here.
            continue;
        }
        let observed = crate::metadata::arrow_to_column_type(field.data_type());
        if !observed.is_subtype_of(declared) {
            return Err(ArchiveError::Schema(format!(
                "column '{}' observed type is not a subtype of the declared type",
                field.name()
            )));
        }
    }
    Ok(())
}

/// Read-only-archive post-processing (spec.md §4.6.2): columns tagged
/// `"bounds"` become bracket-notation strings, columns tagged `"list"` are
/// JSON-parsed into arrow list columns of the narrowest element type
/// present, and columns tagged `"bool"` are coerced from 0/1 to false/true.
/// Columns the archive doesn't tag pass through untouched.
fn post_process_read_only(table: Table, descriptor: &DatasetDescriptor) -> Result<Table, ArchiveError> {
    let tags = descriptor.column_tags_from_details();
    if tags.is_empty() {
        return Ok(table);
    }

    let schema = table.schema();
    let mut changed = false;
    let mut fields = Vec::with_capacity(schema.fields().len());
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(schema.fields().len());
    for (i, field) in schema.fields().iter().enumerate() {
        let column = table.column(i);
        let (new_field, new_column) = match tags.get(field.name()).map(String::as_str) {
            Some("bounds") => {
                changed = true;
                coerce_bounds_column(field.as_ref(), column)?
            }
            Some("list") => {
                changed = true;
                coerce_list_column(field.as_ref(), column)?
            }
            Some("bool") => {
                changed = true;
                coerce_bool_column(field.as_ref(), column)?
            }
            _ => (field.as_ref().clone(), column.clone()),
        };
        fields.push(new_field);
        columns.push(new_column);
    }

    if !changed {
        return Ok(table);
    }
    let new_schema = Arc::new(Schema::new(fields));
    RecordBatch::try_new(new_schema, columns)
        .map_err(|e| ArchiveError::Format(format!("rebuilding read-only post-processed batch: {e}")))
}

/// Canonical bracket notation for bounds integers 0..3 (spec.md §4.6.2,
/// glossary "Bounds notation"): `0 -> "()"`, `1 -> "[)"`, `2 -> "(]"`, `3 ->
/// "[]"`.
const BOUNDS_NOTATION: [&str; 4] = ["()", "[)", "(]", "[]"];

fn int_cell(column: &ArrayRef, row: usize) -> Option<i64> {
    if column.is_null(row) {
        return None;
    }
    if let Some(a) = column.as_any().downcast_ref::<Int64Array>() {
        return Some(a.value(row));
    }
    if let Some(a) = column.as_any().downcast_ref::<Int32Array>() {
        return Some(a.value(row) as i64);
    }
    if let Some(a) = column.as_any().downcast_ref::<UInt64Array>() {
        return Some(a.value(row) as i64);
    }
    None
}

fn coerce_bounds_column(field: &Field, column: &ArrayRef) -> Result<(Field, ArrayRef), ArchiveError> {
    let mut out: Vec<Option<&str>> = Vec::with_capacity(column.len());
    for i in 0..column.len() {
        let Some(value) = int_cell(column, i) else {
            out.push(None);
            continue;
        };
        let notation = BOUNDS_NOTATION.get(value as usize).ok_or_else(|| {
            ArchiveError::Format(format!("bounds value {value} out of range 0..3 in column '{}'", field.name()))
        })?;
        out.push(Some(*notation));
    }
    let new_field = Field::new(field.name(), DataType::Utf8, field.is_nullable());
    Ok((new_field, Arc::new(StringArray::from(out))))
}

fn coerce_bool_column(field: &Field, column: &ArrayRef) -> Result<(Field, ArrayRef), ArchiveError> {
    let mut out: Vec<Option<bool>> = Vec::with_capacity(column.len());
    for i in 0..column.len() {
        out.push(int_cell(column, i).map(|v| v != 0));
    }
    let new_field = Field::new(field.name(), DataType::Boolean, field.is_nullable());
    Ok((new_field, Arc::new(BooleanArray::from(out))))
}

/// Parses each non-null cell of a JSON-text list column (spec.md §4.1: list
/// columns decode off the wire as raw JSON text) and coerces the parsed
/// arrays to the narrowest element type present across the whole column —
/// `Int64` if every element is an integer, `Float64` if any element is a
/// non-integral number, otherwise `Utf8`. Nulls become missing list values.
fn coerce_list_column(field: &Field, column: &ArrayRef) -> Result<(Field, ArrayRef), ArchiveError> {
    let raw = column
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| ArchiveError::Schema(format!("'list'-tagged column '{}' is not a JSON-text column", field.name())))?;

    let mut cells: Vec<Option<Vec<serde_json::Value>>> = Vec::with_capacity(raw.len());
    let mut all_int = true;
    let mut all_numeric = true;
    for i in 0..raw.len() {
        if raw.is_null(i) {
            cells.push(None);
            continue;
        }
        let value: serde_json::Value = serde_json::from_str(raw.value(i))
            .map_err(|e| ArchiveError::Format(format!("parsing list cell in column '{}': {e}", field.name())))?;
        let elements = value
            .as_array()
            .cloned()
            .ok_or_else(|| ArchiveError::Format(format!("list cell in column '{}' is not a JSON array", field.name())))?;
        for element in &elements {
            match element {
                serde_json::Value::Null => {}
                serde_json::Value::Number(n) if n.as_i64().is_some() => {}
                serde_json::Value::Number(_) => all_int = false,
                _ => {
                    all_int = false;
                    all_numeric = false;
                }
            }
        }
        cells.push(Some(elements));
    }

    let array: ArrayRef = if all_numeric && all_int {
        let mut builder = ListBuilder::new(Int64Builder::new());
        for cell in &cells {
            match cell {
                None => builder.append(false),
                Some(values) => {
                    for v in values {
                        match v {
                            serde_json::Value::Null => builder.values().append_null(),
                            serde_json::Value::Number(n) => builder.values().append_value(n.as_i64().unwrap()),
                            other => {
                                return Err(ArchiveError::Format(format!(
                                    "unexpected non-numeric element '{other}' in integer list column '{}'",
                                    field.name()
                                )))
                            }
                        }
                    }
                    builder.append(true);
                }
            }
        }
        Arc::new(builder.finish())
    } else if all_numeric {
        let mut builder = ListBuilder::new(Float64Builder::new());
        for cell in &cells {
            match cell {
                None => builder.append(false),
                Some(values) => {
                    for v in values {
                        match v {
                            serde_json::Value::Null => builder.values().append_null(),
                            serde_json::Value::Number(n) => builder.values().append_value(n.as_f64().ok_or_else(|| {
                                ArchiveError::Format(format!("non-finite number in list column '{}'", field.name()))
                            })?),
                            other => {
                                return Err(ArchiveError::Format(format!(
                                    "unexpected non-numeric element '{other}' in float list column '{}'",
                                    field.name()
                                )))
                            }
                        }
                    }
                    builder.append(true);
                }
            }
        }
        Arc::new(builder.finish())
    } else {
        let mut builder = ListBuilder::new(StringBuilder::new());
        for cell in &cells {
            match cell {
                None => builder.append(false),
                Some(values) => {
                    for v in values {
                        match v {
                            serde_json::Value::Null => builder.values().append_null(),
                            serde_json::Value::String(s) => builder.values().append_value(s),
                            other => builder.values().append_value(other.to_string()),
                        }
                    }
                    builder.append(true);
                }
            }
        }
        Arc::new(builder.finish())
    };

    let new_field = Field::new(field.name(), array.data_type().clone(), field.is_nullable());
    Ok((new_field, array))
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::datatypes::TimeUnit;
    use chrono::TimeZone;

    fn micros_at(y: i32, m: u32, d: u32) -> i64 {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap().timestamp_micros()
    }

    #[test]
    fn s6_latest_release_selection_picks_max_release_at_or_before_cutoff() {
        // spec.md §8 seed scenario S6: superkey [release_date, target_start,
        // target_end, node_name, tag], one (target_start, target_end,
        // node_name) group, three releases r1 < r2 < r3 with distinct tags.
        let r1 = micros_at(2024, 1, 1);
        let r2 = micros_at(2024, 2, 1);
        let r3 = micros_at(2024, 3, 1);

        let schema = Arc::new(Schema::new(vec![
            Field::new("release_date", DataType::Timestamp(TimeUnit::Microsecond, None), false),
            Field::new("target_start", DataType::Int64, false),
            Field::new("target_end", DataType::Int64, false),
            Field::new("node_name", DataType::Utf8, false),
            Field::new("tag", DataType::Utf8, false),
            Field::new("value", DataType::Int64, false),
        ]));
        let table = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(TimestampMicrosecondArray::from(vec![r1, r2, r3])),
                Arc::new(Int64Array::from(vec![1, 1, 1])),
                Arc::new(Int64Array::from(vec![2, 2, 2])),
                Arc::new(StringArray::from(vec!["n1", "n1", "n1"])),
                Arc::new(StringArray::from(vec!["a", "b", "c"])),
                Arc::new(Int64Array::from(vec![10, 20, 30])),
            ],
        )
        .unwrap();

        let superkey: Vec<String> = ["release_date", "target_start", "target_end", "node_name", "tag"]
            .into_iter()
            .map(String::from)
            .collect();

        let between_r1_r2 = DateTime::<Utc>::from_timestamp_micros((r1 + r2) / 2).unwrap();
        let between = select_latest_release(&table, &superkey, Some(between_r1_r2)).unwrap();
        assert_eq!(between.num_rows(), 1);
        assert_eq!(between.column(5).as_any().downcast_ref::<Int64Array>().unwrap().value(0), 10);

        let at_r3 = DateTime::<Utc>::from_timestamp_micros(r3).unwrap();
        let at_or_after_r3 = select_latest_release(&table, &superkey, Some(at_r3)).unwrap();
        assert_eq!(at_or_after_r3.num_rows(), 1);
        assert_eq!(at_or_after_r3.column(5).as_any().downcast_ref::<Int64Array>().unwrap().value(0), 30);

        let before_r1 = DateTime::<Utc>::from_timestamp_micros(r1 - 1).unwrap();
        let dropped = select_latest_release(&table, &superkey, Some(before_r1)).unwrap();
        assert_eq!(dropped.num_rows(), 0);
    }

    #[test]
    fn post_process_read_only_coerces_bounds_list_and_bool_tags() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("bounds_col", DataType::Int64, false),
            Field::new("list_col", DataType::Utf8, true),
            Field::new("bool_col", DataType::Int64, false),
        ]));
        let table = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(vec![0, 1, 2, 3])),
                Arc::new(StringArray::from(vec![Some("[1,2,3]"), None, Some("[4,null,6]"), Some("[]")])),
                Arc::new(Int64Array::from(vec![0, 1, 1, 0])),
            ],
        )
        .unwrap();

        let mut details = HashMap::new();
        details.insert(
            "column_tags".to_string(),
            serde_json::json!({"bounds_col": "bounds", "list_col": "list", "bool_col": "bool"}).to_string(),
        );
        let descriptor = DatasetDescriptor {
            column_order: vec!["bounds_col".into(), "list_col".into(), "bool_col".into()],
            column_types: HashMap::new(),
            timezone: "UTC".into(),
            index: crate::metadata::IndexSpec::TimeSeries {
                key: "bounds_col".into(),
                partition_size: crate::metadata::Granularity::Day,
            },
            file_format: crate::metadata::Format::Csv,
            compression: crate::metadata::Compression::None,
            last_modified: 0,
            details: Some(details),
        };

        let processed = post_process_read_only(table, &descriptor).unwrap();

        let bounds = processed.column(0).as_any().downcast_ref::<StringArray>().unwrap();
        assert_eq!(bounds.value(0), "()");
        assert_eq!(bounds.value(1), "[)");
        assert_eq!(bounds.value(2), "(]");
        assert_eq!(bounds.value(3), "[]");

        let list = processed.column(1).as_any().downcast_ref::<arrow::array::ListArray>().unwrap();
        assert!(!list.is_null(0));
        assert!(list.is_null(1));
        assert!(!list.is_null(2));

        let bools = processed.column(2).as_any().downcast_ref::<BooleanArray>().unwrap();
        assert!(!bools.value(0));
        assert!(bools.value(1));
        assert!(bools.value(2));
        assert!(!bools.value(3));
    }
}
