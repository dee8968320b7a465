//! C7 — the insert engine: schema reconciliation and partitioned
//! read-modify-write (spec.md §3, §4.7).

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use arrow::datatypes::DataType;
use object_store::ObjectStore;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::backend::{BackendRegistry, Store};
use crate::cache::{CacheHandle, CacheOpts};
use crate::codec;
use crate::error::ArchiveError;
use crate::metadata::{Compression, DatasetDescriptor, Format, Granularity, IndexSpec, MetadataStore};
use crate::partition::{self, PartitionKey};
use crate::table::Table;

const ONE_DAY_SECS: i64 = 86_400;

/// Options and defaults used only when a dataset does not already exist
/// (spec.md §4.7.1 — ignored, except for `column_types` overrides, once a
/// descriptor is already on disk).
pub struct InsertOptions {
    pub worker_count: usize,
    pub cache: CacheHandle,
    pub registry: Arc<BackendRegistry>,
    pub index_column: String,
    pub timezone: String,
    pub granularity: Granularity,
    pub file_format: Format,
    pub compression: Compression,
    /// Explicit type overrides for specific columns, applied on top of the
    /// inferred/sanitized defaults when creating a new descriptor, and
    /// checked for subtype-compatibility against an existing one.
    pub column_types: std::collections::HashMap<String, crate::metadata::ColumnType>,
    pub details: Option<std::collections::HashMap<String, String>>,
}

impl InsertOptions {
    pub fn new(cache: CacheHandle, registry: Arc<BackendRegistry>, index_column: impl Into<String>) -> Self {
        Self {
            worker_count: 4,
            cache,
            registry,
            index_column: index_column.into(),
            timezone: "UTC".to_string(),
            granularity: Granularity::Day,
            file_format: Format::Csv,
            compression: Compression::Gzip,
            column_types: std::collections::HashMap::new(),
            details: None,
        }
    }
}

/// C7 — appends `table`'s rows into `(collection, dataset)` on `store_id`,
/// partitioning by the dataset's index column and merge-deduping each
/// touched partition (spec.md §4.7).
pub async fn insert(
    collection: &str,
    dataset: &str,
    table: &Table,
    store_id: &str,
    opts: &InsertOptions,
) -> Result<(), ArchiveError> {
    if table.num_rows() == 0 {
        return Err(ArchiveError::Schema("insert table has zero rows".into()));
    }

    let store = opts.registry.lookup(store_id)?;
    if !store.is_writable() {
        return Err(ArchiveError::Config(format!("store '{store_id}' is not writable")));
    }
    let object_store = crate::backend::object_store_for(&opts.cache, &store)?;

    let descriptor = ensure_descriptor(&object_store, &store, collection, dataset, table, opts).await?;

    let groups = partition::partition_rows(table, descriptor.index_key(), descriptor.granularity())?;
    if groups.is_empty() {
        return Ok(());
    }

    let semaphore = Arc::new(Semaphore::new(opts.worker_count.max(1)));
    let mut tasks: JoinSet<Result<(), ArchiveError>> = JoinSet::new();

    for (key, indices) in groups {
        let semaphore = semaphore.clone();
        let cache = opts.cache.clone();
        let object_store = object_store.clone();
        let store = store.clone();
        let collection = collection.to_string();
        let dataset = dataset.to_string();
        let descriptor = descriptor.clone();
        let new_rows = crate::table::take_rows(table, &indices)?;

        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
            merge_partition(&cache, &object_store, &store, &collection, &dataset, &descriptor, key, new_rows).await
        });
    }

    while let Some(joined) = tasks.join_next().await {
        joined.map_err(|e| ArchiveError::Format(format!("insert worker panicked: {e}")))??;
    }
    Ok(())
}

async fn ensure_descriptor(
    object_store: &Arc<dyn object_store::ObjectStore>,
    store: &Store,
    collection: &str,
    dataset: &str,
    table: &Table,
    opts: &InsertOptions,
) -> Result<DatasetDescriptor, ArchiveError> {
    let existing = MetadataStore::get_descriptor(&opts.cache, store.bucket(), store.prefix(), collection, dataset).await;

    let now = now_unix();

    match existing {
        Ok(mut desc) => {
            let input_columns: std::collections::HashSet<&str> =
                table.schema().fields().iter().map(|f| f.name().as_str()).collect();

            for declared_col in &desc.column_order {
                if !input_columns.contains(declared_col.as_str()) {
                    return Err(ArchiveError::Schema(format!(
                        "column '{declared_col}' declared in descriptor but missing from insert input"
                    )));
                }
            }
            let extras: Vec<&str> = input_columns
                .iter()
                .copied()
                .filter(|c| !desc.column_order.iter().any(|d| d == c))
                .collect();
            if !extras.is_empty() {
                warn!(?extras, "insert input has columns outside column_order; dropping them on write");
            }

            for declared_col in &desc.column_order {
                let declared = desc
                    .column_types
                    .get(declared_col)
                    .ok_or_else(|| ArchiveError::Schema(format!("column '{declared_col}' missing from column_types")))?;
                let field = table
                    .schema()
                    .field_with_name(declared_col)
                    .map_err(|_| ArchiveError::Schema(format!("column '{declared_col}' not found in insert input")))?;
                let observed = crate::metadata::arrow_to_column_type(field.data_type());
                if !observed.is_subtype_of(declared) {
                    return Err(ArchiveError::Schema(format!(
                        "column '{declared_col}' type is not a subtype of the declared type"
                    )));
                }
            }

            if !opts.column_types.is_empty() {
                warn!("column_types override supplied for an existing dataset; ignoring, schema is locked");
            }

            let mut details_changed = false;
            if let Some(new_details) = &opts.details {
                let mut merged = desc.details.clone().unwrap_or_default();
                for (k, v) in new_details {
                    if merged.get(k) != Some(v) {
                        merged.insert(k.clone(), v.clone());
                        details_changed = true;
                    }
                }
                if details_changed {
                    desc.details = Some(merged);
                }
            }

            if details_changed || now - desc.last_modified > ONE_DAY_SECS {
                desc.last_modified = now;
                put_descriptor(object_store, store, collection, dataset, &desc).await?;
                MetadataStore::invalidate_cache();
            }
            Ok(desc)
        }
        Err(ArchiveError::MissingData(_)) => {
            let column_order: Vec<String> =
                table.schema().fields().iter().map(|f| f.name().clone()).collect();
            if !column_order.iter().any(|c| c == &opts.index_column) {
                return Err(ArchiveError::Schema(format!(
                    "index column '{}' not present in insert table",
                    opts.index_column
                )));
            }
            let index_data_type = table
                .schema()
                .field_with_name(&opts.index_column)
                .map_err(|_| ArchiveError::Schema(format!("index column '{}' not found", opts.index_column)))?
                .data_type()
                .clone();
            if !matches!(index_data_type, DataType::Timestamp(_, _)) {
                return Err(ArchiveError::Schema(format!(
                    "index column '{}' must be a timestamp, found {:?}",
                    opts.index_column, index_data_type
                )));
            }

            let mut column_types = std::collections::HashMap::new();
            for field in table.schema().fields() {
                let concrete = crate::metadata::arrow_to_column_type(field.data_type());
                match opts.column_types.get(field.name()) {
                    Some(override_ty) => {
                        if !concrete.is_subtype_of(override_ty) {
                            return Err(ArchiveError::Schema(format!(
                                "column '{}' data is not compatible with the supplied column_types override",
                                field.name()
                            )));
                        }
                        column_types.insert(field.name().clone(), override_ty.clone());
                    }
                    None => {
                        column_types.insert(field.name().clone(), concrete.sanitize());
                    }
                }
            }
            for name in opts.column_types.keys() {
                if !column_order.iter().any(|c| c == name) {
                    warn!(column = %name, "column_types names a column not present in insert input; ignoring");
                }
            }

            let desc = DatasetDescriptor {
                column_order,
                column_types,
                timezone: opts.timezone.clone(),
                index: IndexSpec::TimeSeries {
                    key: opts.index_column.clone(),
                    partition_size: opts.granularity,
                },
                file_format: opts.file_format,
                compression: opts.compression,
                last_modified: now,
                details: opts.details.clone(),
            };
            put_descriptor(object_store, store, collection, dataset, &desc).await?;
            MetadataStore::invalidate_cache();
            Ok(desc)
        }
        Err(other) => Err(other),
    }
}

async fn put_descriptor(
    object_store: &Arc<dyn object_store::ObjectStore>,
    store: &Store,
    collection: &str,
    dataset: &str,
    desc: &DatasetDescriptor,
) -> Result<(), ArchiveError> {
    let path = MetadataStore::descriptor_path(store.prefix(), collection, dataset);
    MetadataStore::put_descriptor(object_store, &path, desc).await
}

#[allow(clippy::too_many_arguments)]
async fn merge_partition(
    cache: &CacheHandle,
    object_store: &Arc<dyn object_store::ObjectStore>,
    store: &Store,
    collection: &str,
    dataset: &str,
    descriptor: &DatasetDescriptor,
    key: PartitionKey,
    new_rows: Table,
) -> Result<(), ArchiveError> {
    let object_key = partition::object_key_for_partition(
        store.prefix(),
        collection,
        dataset,
        key,
        descriptor.granularity(),
        descriptor.file_format,
        descriptor.compression,
    );

    let decode_opts = CacheOpts {
        decompress: Some(true),
        ..CacheOpts::default()
    };
    let existing_rows = match cache.get(store.bucket(), &object_key, decode_opts).await {
        Ok(local_path) => {
            let bytes = tokio::fs::read(&local_path)
                .await
                .map_err(|e| ArchiveError::Format(format!("reading existing partition: {e}")))?;
            let schema = Arc::new(crate::metadata::schema_from_descriptor(descriptor)?);
            Some(codec::decode_bytes(&bytes, descriptor.file_format, Some(schema))?)
        }
        Err(ArchiveError::MissingData(msg)) => {
            debug!(%object_key, %msg, "no existing partition, creating one");
            None
        }
        Err(other) => return Err(other),
    };

    let merged = match existing_rows {
        Some(existing) => {
            // A CSV-encoded existing partition comes back from decode with
            // any list column already flattened to JSON text (spec.md §4.1 —
            // the codec never reconstructs it). Bring the fresh rows into the
            // same shape before concatenating, or the two batches' schemas
            // disagree on those columns' arrow type.
            let new_rows = if descriptor.file_format == Format::Csv {
                codec::csv::flatten_list_columns(&new_rows)?
            } else {
                new_rows
            };
            crate::table::concat_tables(&[existing, new_rows])?
        }
        None => new_rows,
    };

    let column_order: Vec<&str> = descriptor.column_order.iter().map(String::as_str).collect();
    let projected = crate::table::project(&merged, &column_order)?;
    let deduped = crate::table::sort_and_dedup(&projected, &column_order)?;

    let encoded = codec::encode_bytes(&deduped, descriptor.file_format)?;
    let compressed = codec::compression::compress(&encoded, descriptor.compression)?;

    let path = object_store::path::Path::from(object_key);
    object_store
        .put(&path, compressed.into())
        .await
        .map_err(crate::error::classify_object_store_error)?;
    Ok(())
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_day_threshold_constant_matches_spec() {
        assert_eq!(ONE_DAY_SECS, 86_400);
    }
}
