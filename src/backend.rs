//! C4 — backend resolution: URI parsing, the centralized/additional-store
//! merge, and store lookup (spec.md §3, §4.5, §9).

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use tracing::info;

use crate::config::Config;
use crate::error::ArchiveError;
use crate::metadata::{Compression, Format, Granularity};

/// A resolved backend. `WritableArchive` is this crate's own format, always
/// governed by a `METADATA.json` descriptor written by [`crate::insert`].
/// `ReadOnlyArchive` may be an externally produced archive with no
/// descriptor of its own, in which case the URI scheme suffix
/// (`s3db-<format>-<compression>-<partition>`) supplies the overrides that
/// would otherwise live in the descriptor (spec.md §4.3, §4.5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Store {
    WritableArchive {
        id: String,
        bucket: String,
        prefix: String,
    },
    ReadOnlyArchive {
        id: String,
        bucket: String,
        prefix: String,
        format_override: Option<Format>,
        compression_override: Option<Compression>,
        granularity_override: Option<Granularity>,
    },
}

impl Store {
    pub fn id(&self) -> &str {
        match self {
            Store::WritableArchive { id, .. } => id,
            Store::ReadOnlyArchive { id, .. } => id,
        }
    }

    pub fn bucket(&self) -> &str {
        match self {
            Store::WritableArchive { bucket, .. } => bucket,
            Store::ReadOnlyArchive { bucket, .. } => bucket,
        }
    }

    pub fn prefix(&self) -> &str {
        match self {
            Store::WritableArchive { prefix, .. } => prefix,
            Store::ReadOnlyArchive { prefix, .. } => prefix,
        }
    }

    pub fn is_writable(&self) -> bool {
        matches!(self, Store::WritableArchive { .. })
    }

    /// Builds the concrete [`object_store::ObjectStore`] this [`Store`]
    /// addresses, picking it up from process credentials (spec.md treats the
    /// object-store adapter as an external collaborator; this crate's
    /// concrete binding is the `object_store` crate's own environment-based
    /// AWS builder, same as any `s3://` URI elsewhere in the ecosystem).
    pub fn object_store_instance(&self) -> Result<Arc<dyn object_store::ObjectStore>, ArchiveError> {
        let bucket = self.bucket();
        let store = object_store::aws::AmazonS3Builder::from_env()
            .with_bucket_name(bucket)
            .build()
            .map_err(|e| ArchiveError::Config(format!("building S3 client for bucket '{bucket}': {e}")))?;
        Ok(Arc::new(store))
    }
}

/// Parses a store URI of the shape `<scheme>://s3://<bucket>/<prefix...>`
/// into a [`Store`]. The double scheme is deliberate: the outer scheme picks
/// this crate's archive kind, the inner `s3://` names the actual object
/// storage location the archive lives in (spec.md §4.5's "non-`s3://`
/// bucket spec is a config error" — the inner scheme is the part that must
/// be `s3`, so this crate's store URIs stay extensible to other object
/// stores later without changing the outer scheme vocabulary).
pub fn resolve(id: &str, uri: &str) -> Result<Store, ArchiveError> {
    let (outer_scheme, rest) = uri
        .split_once("://")
        .ok_or_else(|| ArchiveError::Config(format!("store uri '{uri}' has no scheme")))?;

    let (inner_scheme, rest) = rest
        .split_once("://")
        .ok_or_else(|| ArchiveError::Config(format!("store uri '{uri}' has no inner s3:// bucket spec")))?;
    if inner_scheme != "s3" {
        return Err(ArchiveError::Config(format!(
            "store uri '{uri}' has non-s3:// bucket spec '{inner_scheme}://'"
        )));
    }

    let mut parts = rest.splitn(2, '/');
    let bucket = parts
        .next()
        .filter(|b| !b.is_empty())
        .ok_or_else(|| ArchiveError::Config(format!("store uri '{uri}' has no bucket name")))?
        .to_string();
    let prefix = parts.next().unwrap_or("").trim_end_matches('/').to_string();

    if outer_scheme == "ffs" {
        return Ok(Store::WritableArchive {
            id: id.to_string(),
            bucket,
            prefix,
        });
    }

    if outer_scheme == "s3db" {
        return Ok(Store::ReadOnlyArchive {
            id: id.to_string(),
            bucket,
            prefix,
            format_override: None,
            compression_override: None,
            granularity_override: None,
        });
    }

    if let Some(suffix) = outer_scheme.strip_prefix("s3db-") {
        let tokens: Vec<&str> = suffix.split('-').collect();
        if tokens.len() != 3 {
            return Err(ArchiveError::Config(format!(
                "store scheme 's3db-{suffix}' must encode exactly format-compression-partition"
            )));
        }
        let format_override = Some(parse_format_token(tokens[0])?);
        let compression_override = Some(parse_compression_token(tokens[1])?);
        let granularity_override = Some(parse_granularity_token(tokens[2])?);
        return Ok(Store::ReadOnlyArchive {
            id: id.to_string(),
            bucket,
            prefix,
            format_override,
            compression_override,
            granularity_override,
        });
    }

    Err(ArchiveError::Config(format!("unknown store uri scheme: '{outer_scheme}'")))
}

fn parse_format_token(token: &str) -> Result<Format, ArchiveError> {
    match token {
        "csv" => Ok(Format::Csv),
        "arrow" => Ok(Format::Arrow),
        "parquet" => Ok(Format::Parquet),
        other => Err(ArchiveError::Config(format!("unknown format token in store scheme: {other}"))),
    }
}

fn parse_compression_token(token: &str) -> Result<Compression, ArchiveError> {
    match token {
        "nothing" => Ok(Compression::None),
        "bz2" => Ok(Compression::Bzip2),
        "gz" => Ok(Compression::Gzip),
        "lz4" => Ok(Compression::Lz4),
        "zst" => Ok(Compression::Zstd),
        other => Err(ArchiveError::Config(format!("unknown compression token in store scheme: {other}"))),
    }
}

fn parse_granularity_token(token: &str) -> Result<Granularity, ArchiveError> {
    match token {
        "hour" => Ok(Granularity::Hour),
        "day" => Ok(Granularity::Day),
        "month" => Ok(Granularity::Month),
        "year" => Ok(Granularity::Year),
        other => Err(ArchiveError::Config(format!("unknown partition token in store scheme: {other}"))),
    }
}

/// The merged, id-keyed registry of known stores (spec.md §4.5), lazily
/// built from the current [`crate::config::ConfigSnapshot`] and rebuilt on
/// [`BackendRegistry::reload`].
pub struct BackendRegistry {
    centralized: Vec<(String, String)>,
    cached: RwLock<Option<(Arc<HashMap<String, Store>>, Arc<Vec<Store>>)>>,
}

static DEFAULT_REGISTRY: OnceCell<BackendRegistry> = OnceCell::new();

impl BackendRegistry {
    /// Builds a registry whose "centralized" list is `centralized` — pairs
    /// of `(id, uri)` this process already knows about independent of its
    /// own config file, e.g. seeded by the host application at startup.
    pub fn new(centralized: Vec<(String, String)>) -> Self {
        Self {
            centralized,
            cached: RwLock::new(None),
        }
    }

    /// The process-wide default registry, with no centralized stores of its
    /// own — only `additional-stores` from [`crate::config::Config`]. Hosts
    /// that have a real centralized discovery mechanism should build their
    /// own [`BackendRegistry::new`] instead of using this default.
    pub fn default_registry() -> &'static BackendRegistry {
        DEFAULT_REGISTRY.get_or_init(|| BackendRegistry::new(Vec::new()))
    }

    /// Returns the merged, deduplicated `id -> Store` map honoring
    /// `disable-centralized` and `prioritize-additional-stores` (spec.md
    /// §4.5). First occurrence wins on an id collision between the two
    /// lists, in whichever order `prioritize-additional-stores` puts them.
    pub fn registry(&self) -> Result<Arc<HashMap<String, Store>>, ArchiveError> {
        Ok(self.build_or_get_cached()?.0)
    }

    /// Same merge as [`BackendRegistry::registry`], but preserving merge
    /// order — used by [`crate::gather::gather`]'s store-fallback iteration
    /// when no explicit `store_id` is given.
    pub fn ordered_stores(&self) -> Result<Arc<Vec<Store>>, ArchiveError> {
        Ok(self.build_or_get_cached()?.1)
    }

    fn build_or_get_cached(&self) -> Result<(Arc<HashMap<String, Store>>, Arc<Vec<Store>>), ArchiveError> {
        if let Some(cached) = self.cached.read().as_ref() {
            return Ok(cached.clone());
        }
        let snapshot = Config::snapshot()?;

        let additional: Vec<(String, String)> = snapshot
            .additional_stores
            .iter()
            .map(|s| (s.id.clone(), s.uri.clone()))
            .collect();

        let ordered: Vec<&(String, String)> = if snapshot.disable_centralized {
            additional.iter().collect()
        } else if snapshot.prioritize_additional_stores {
            additional.iter().chain(self.centralized.iter()).collect()
        } else {
            self.centralized.iter().chain(additional.iter()).collect()
        };

        let mut map = HashMap::new();
        let mut list = Vec::new();
        for (id, uri) in ordered {
            if map.contains_key(id) {
                continue;
            }
            let store = resolve(id, uri)?;
            map.insert(id.clone(), store.clone());
            list.push(store);
        }

        let built = (Arc::new(map), Arc::new(list));
        *self.cached.write() = Some(built.clone());
        Ok(built)
    }

    /// Looks up `store_id` in the merged registry; if absent, falls back to
    /// parsing `store_id` itself as an ad-hoc store URI. Both paths failing
    /// is always surfaced as [`ArchiveError::Config`] (spec.md §9's resolved
    /// Open Question: never silently coerce an unresolvable id).
    pub fn lookup(&self, store_id: &str) -> Result<Store, ArchiveError> {
        if let Some(store) = self.registry()?.get(store_id) {
            return Ok(store.clone());
        }
        resolve(store_id, store_id)
            .map_err(|_| ArchiveError::Config(format!("unknown store id and not a valid ad-hoc uri: '{store_id}'")))
    }

    /// Drops the cached registry so the next [`BackendRegistry::registry`]
    /// call rebuilds from the current config snapshot. Callers should call
    /// [`Config::reload`] first.
    pub fn reload(&self) {
        *self.cached.write() = None;
        info!("backend registry cache cleared, will rebuild from config on next lookup");
    }
}

/// Returns `store`'s object store, reusing whatever the cache already has
/// registered for its bucket (a test, or a host application, may have
/// pre-registered one) rather than always building a fresh AWS client via
/// [`Store::object_store_instance`].
pub fn object_store_for(cache: &crate::cache::FileCache, store: &Store) -> Result<Arc<dyn object_store::ObjectStore>, ArchiveError> {
    if let Some(existing) = cache.registered_store(store.bucket()) {
        return Ok(existing);
    }
    let built = store.object_store_instance()?;
    cache.register_store(store.bucket(), built.clone());
    Ok(built)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ffs_scheme_resolves_to_writable_archive() {
        let store = resolve("main", "ffs://s3://my-bucket/archives/main").unwrap();
        assert!(store.is_writable());
        assert_eq!(store.bucket(), "my-bucket");
        assert_eq!(store.prefix(), "archives/main");
    }

    #[test]
    fn s3db_scheme_resolves_to_read_only_archive_with_no_overrides() {
        let store = resolve("vendor", "s3db://s3://vendor-bucket/exports").unwrap();
        match store {
            Store::ReadOnlyArchive {
                format_override,
                compression_override,
                granularity_override,
                ..
            } => {
                assert!(format_override.is_none());
                assert!(compression_override.is_none());
                assert!(granularity_override.is_none());
            }
            _ => panic!("expected ReadOnlyArchive"),
        }
    }

    #[test]
    fn s3db_suffix_scheme_encodes_overrides() {
        let store = resolve("vendor", "s3db-parquet-gz-day://s3://vendor-bucket/exports").unwrap();
        match store {
            Store::ReadOnlyArchive {
                format_override,
                compression_override,
                granularity_override,
                ..
            } => {
                assert_eq!(format_override, Some(Format::Parquet));
                assert_eq!(compression_override, Some(Compression::Gzip));
                assert_eq!(granularity_override, Some(Granularity::Day));
            }
            _ => panic!("expected ReadOnlyArchive"),
        }
    }

    #[test]
    fn non_s3_bucket_spec_is_a_config_error() {
        let result = resolve("bad", "ffs://gcs://my-bucket/prefix");
        assert!(matches!(result, Err(ArchiveError::Config(_))));
    }

    #[test]
    fn unknown_scheme_is_a_config_error() {
        let result = resolve("bad", "ftp://s3://bucket/prefix");
        assert!(matches!(result, Err(ArchiveError::Config(_))));
    }
}
