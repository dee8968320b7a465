//! C1 — a bounded, thread-safe on-disk artifact cache with single-flight
//! downloads (spec.md §3, §4.4, §9).
//!
//! Generalizes the teacher's hand-rolled in-memory page buffer into an
//! on-disk cache fronting an [`object_store::ObjectStore`]: the LRU now
//! tracks *bytes on disk* rather than page count, and a second, smaller LRU
//! of per-key mutexes guarantees that N concurrent callers asking for the
//! same object key trigger exactly one underlying fetch (spec.md §8 seed
//! scenario S3).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use lru::LruCache;
use object_store::ObjectStore;
use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tracing::info;

use crate::error::ArchiveError;
use crate::metadata::Compression;

const SINGLE_FLIGHT_CAPACITY: usize = 100;
const MAX_RETRIES: u32 = 2;
const BASE_BACKOFF: Duration = Duration::from_millis(100);

/// Per-call overrides for [`FileCache::get`]. `None` fields fall back to the
/// cache's own defaults (spec.md §6's `DATA_CACHE_DECOMPRESS`).
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheOpts {
    pub decompress: Option<bool>,
    pub ttl_override: Option<Duration>,
}

#[derive(Debug, Clone)]
struct CachedArtifact {
    local_path: PathBuf,
    size_bytes: u64,
    written_at: SystemTime,
}

/// A bounded on-disk LRU cache of object-store artifacts.
pub struct FileCache {
    root_dir: PathBuf,
    ceiling_bytes: u64,
    default_decompress: bool,
    expire_after: Duration,
    artifacts: Mutex<LruCache<String, CachedArtifact>>,
    total_bytes: Mutex<u64>,
    flights: Mutex<LruCache<String, Arc<AsyncMutex<()>>>>,
    stores: parking_lot::RwLock<HashMap<String, Arc<dyn object_store::ObjectStore>>>,
}

impl FileCache {
    /// Builds a cache rooted at `root_dir`, bounded to `ceiling_bytes` of
    /// artifacts. Any files already present under `root_dir` are registered
    /// in mtime-ascending order (oldest-first, so the freshest survive a
    /// first eviction) and TTL-expired ones are pruned immediately (spec.md
    /// §4.4's "reconstruct an existing persistent directory on startup").
    pub fn new(root_dir: impl Into<PathBuf>, ceiling_bytes: u64, default_decompress: bool, expire_after: Duration) -> Self {
        let root_dir = root_dir.into();
        let cache = Self {
            root_dir: root_dir.clone(),
            ceiling_bytes,
            default_decompress,
            expire_after,
            artifacts: Mutex::new(LruCache::unbounded()),
            total_bytes: Mutex::new(0),
            flights: Mutex::new(LruCache::new(
                std::num::NonZeroUsize::new(SINGLE_FLIGHT_CAPACITY).unwrap(),
            )),
            stores: parking_lot::RwLock::new(HashMap::new()),
        };
        cache.reconstruct_from_disk();
        cache
    }

    fn reconstruct_from_disk(&self) {
        let Ok(entries) = std::fs::read_dir(&self.root_dir) else {
            return;
        };
        let mut found: Vec<(PathBuf, SystemTime, u64)> = Vec::new();
        for entry in entries.flatten() {
            let Ok(meta) = entry.metadata() else { continue };
            if !meta.is_file() {
                continue;
            }
            let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            found.push((entry.path(), mtime, meta.len()));
        }
        found.sort_by_key(|(_, mtime, _)| *mtime);

        let now = SystemTime::now();
        let mut artifacts = self.artifacts.lock();
        let mut total = self.total_bytes.lock();
        for (path, mtime, size) in found {
            if now.duration_since(mtime).unwrap_or_default() > self.expire_after {
                let _ = std::fs::remove_file(&path);
                continue;
            }
            let cache_id = Self::cache_id_from_path(&self.root_dir, &path);
            artifacts.put(
                cache_id,
                CachedArtifact {
                    local_path: path,
                    size_bytes: size,
                    written_at: mtime,
                },
            );
            *total += size;
        }
    }

    fn cache_id_from_path(root: &Path, path: &Path) -> String {
        path.strip_prefix(root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }

    /// Registers the concrete [`object_store::ObjectStore`] backing `bucket`.
    /// Called by [`crate::backend::BackendRegistry`] as it resolves stores.
    pub fn register_store(&self, bucket: &str, store: Arc<dyn object_store::ObjectStore>) {
        self.stores.write().insert(bucket.to_string(), store);
    }

    /// Returns the store already registered for `bucket`, if any — without
    /// building one. Lets callers (gather/insert) reuse a store a test or
    /// host application pre-registered instead of always going through
    /// [`crate::backend::Store::object_store_instance`].
    pub fn registered_store(&self, bucket: &str) -> Option<Arc<dyn object_store::ObjectStore>> {
        self.stores.read().get(bucket).cloned()
    }

    fn store_for(&self, bucket: &str) -> Result<Arc<dyn object_store::ObjectStore>, ArchiveError> {
        self.registered_store(bucket)
            .ok_or_else(|| ArchiveError::Config(format!("no object store registered for bucket '{bucket}'")))
    }

    fn flight_lock_for(&self, cache_id: &str) -> Arc<AsyncMutex<()>> {
        let mut flights = self.flights.lock();
        if let Some(lock) = flights.get(cache_id) {
            return lock.clone();
        }
        let lock = Arc::new(AsyncMutex::new(()));
        flights.put(cache_id.to_string(), lock.clone());
        lock
    }

    fn local_path_for(&self, cache_id: &str) -> PathBuf {
        self.root_dir.join(cache_id.replace('/', "__"))
    }

    /// Fetches `object_key` from `bucket`'s store, decodes it onto local
    /// disk if not already cached, and returns the absolute local path.
    /// Concurrent callers racing on the same `(bucket, object_key)` share a
    /// single underlying download (spec.md §8 S3); errors classified as
    /// transient are retried with exponential backoff before propagating.
    pub async fn get(&self, bucket: &str, object_key: &str, opts: CacheOpts) -> Result<PathBuf, ArchiveError> {
        // The logical key strips the compression suffix whenever decompression
        // is in play (spec.md §4.4 invariant 4), and it — not the raw
        // `object_key` — is what identifies this artifact everywhere: the LRU
        // lookup, the single-flight mutex, and the on-disk file name. Computing
        // it once up front (spec.md §4.4 step a) is what makes "k.csv.gz" and
        // "k.csv" collapse onto the same cache entry.
        let decompress = opts.decompress.unwrap_or(self.default_decompress);
        let logical_key = if decompress {
            match crate::codec::compression::compression_from_filename(object_key) {
                Some(comp) if comp != Compression::None => {
                    crate::codec::compression::strip_compression_extension(object_key)
                }
                _ => object_key.to_string(),
            }
        } else {
            object_key.to_string()
        };
        let cache_id = format!("{bucket}/{logical_key}");

        if let Some(path) = self.touch(&cache_id) {
            return Ok(path);
        }

        let flight_lock = self.flight_lock_for(&cache_id);
        let _guard = flight_lock.lock().await;

        if let Some(path) = self.touch(&cache_id) {
            return Ok(path);
        }

        let store = self.store_for(bucket)?;
        let path = object_store::path::Path::from(object_key);
        let raw = self.fetch_with_retry(&store, &path).await?;

        let bytes = if decompress {
            match crate::codec::compression::compression_from_filename(object_key) {
                Some(comp) if comp != Compression::None => crate::codec::compression::decompress(&raw, comp)?,
                _ => raw.to_vec(),
            }
        } else {
            raw.to_vec()
        };

        let local_path = self.local_path_for(&cache_id);
        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }
        tokio::fs::write(&local_path, &bytes)
            .await
            .map_err(|e| ArchiveError::Format(format!("writing cached artifact: {e}")))?;

        self.insert_and_evict(cache_id, local_path.clone(), bytes.len() as u64);
        Ok(local_path)
    }

    fn touch(&self, cache_id: &str) -> Option<PathBuf> {
        let mut artifacts = self.artifacts.lock();
        artifacts.get(cache_id).map(|a| a.local_path.clone())
    }

    fn insert_and_evict(&self, cache_id: String, local_path: PathBuf, size_bytes: u64) {
        let mut artifacts = self.artifacts.lock();
        let mut total = self.total_bytes.lock();
        artifacts.put(
            cache_id,
            CachedArtifact {
                local_path,
                size_bytes,
                written_at: SystemTime::now(),
            },
        );
        *total += size_bytes;
        while *total > self.ceiling_bytes {
            let Some((evicted_id, evicted)) = artifacts.pop_lru() else { break };
            *total = total.saturating_sub(evicted.size_bytes);
            let _ = std::fs::remove_file(&evicted.local_path);
            info!(cache_id = %evicted_id, size_bytes = evicted.size_bytes, "evicted cached artifact over ceiling");
        }
    }

    async fn fetch_with_retry(
        &self,
        store: &Arc<dyn object_store::ObjectStore>,
        path: &object_store::path::Path,
    ) -> Result<bytes::Bytes, ArchiveError> {
        let mut attempt = 0;
        loop {
            match store.get(path).await {
                Ok(result) => {
                    let bytes = result
                        .bytes()
                        .await
                        .map_err(crate::error::classify_object_store_error)?;
                    return Ok(bytes);
                }
                Err(err) => {
                    let classified = crate::error::classify_object_store_error(err);
                    if matches!(classified, ArchiveError::Transient(_)) && attempt < MAX_RETRIES {
                        tokio::time::sleep(BASE_BACKOFF * 2u32.pow(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(classified);
                }
            }
        }
    }
}

/// A cheaply cloneable handle to a process-wide [`FileCache`], built from
/// the current [`crate::config::ConfigSnapshot`] (spec.md §6).
#[derive(Clone)]
pub struct CacheHandle(pub Arc<FileCache>);

impl CacheHandle {
    pub fn new(cache: FileCache) -> Self {
        Self(Arc::new(cache))
    }

    pub fn from_config(snapshot: &crate::config::ConfigSnapshot) -> Result<Self, ArchiveError> {
        let dir = snapshot
            .data_cache_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        std::fs::create_dir_all(&dir)
            .map_err(|e| ArchiveError::Config(format!("creating cache dir {}: {e}", dir.display())))?;
        let ceiling_bytes = snapshot.data_cache_size_mb * 1024 * 1024;
        let expire_after = Duration::from_secs(snapshot.data_cache_expire_after_days * 86_400);
        Ok(Self::new(FileCache::new(
            dir,
            ceiling_bytes,
            snapshot.data_cache_decompress,
            expire_after,
        )))
    }
}

impl std::ops::Deref for CacheHandle {
    type Target = FileCache;
    fn deref(&self) -> &FileCache {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::ObjectStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingStore {
        inner: object_store::memory::InMemory,
        gets: Arc<AtomicUsize>,
    }

    impl std::fmt::Debug for CountingStore {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "CountingStore")
        }
    }

    impl std::fmt::Display for CountingStore {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "CountingStore")
        }
    }

    use async_trait::async_trait;

    #[async_trait]
    impl object_store::ObjectStore for CountingStore {
        async fn put_opts(
            &self,
            location: &object_store::path::Path,
            payload: object_store::PutPayload,
            opts: object_store::PutOptions,
        ) -> object_store::Result<object_store::PutResult> {
            self.inner.put_opts(location, payload, opts).await
        }

        async fn get_opts(
            &self,
            location: &object_store::path::Path,
            options: object_store::GetOptions,
        ) -> object_store::Result<object_store::GetResult> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            self.inner.get_opts(location, options).await
        }

        async fn delete(&self, location: &object_store::path::Path) -> object_store::Result<()> {
            self.inner.delete(location).await
        }

        fn list(
            &self,
            prefix: Option<&object_store::path::Path>,
        ) -> futures::stream::BoxStream<'_, object_store::Result<object_store::ObjectMeta>> {
            self.inner.list(prefix)
        }

        async fn list_with_delimiter(
            &self,
            prefix: Option<&object_store::path::Path>,
        ) -> object_store::Result<object_store::ListResult> {
            self.inner.list_with_delimiter(prefix).await
        }

        async fn copy(&self, from: &object_store::path::Path, to: &object_store::path::Path) -> object_store::Result<()> {
            self.inner.copy(from, to).await
        }

        async fn copy_if_not_exists(
            &self,
            from: &object_store::path::Path,
            to: &object_store::path::Path,
        ) -> object_store::Result<()> {
            self.inner.copy_if_not_exists(from, to).await
        }
    }

    #[tokio::test]
    async fn concurrent_gets_for_the_same_key_trigger_one_fetch() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = FileCache::new(tmp.path(), 64 * 1024 * 1024, false, Duration::from_secs(86_400 * 90));
        let inner = object_store::memory::InMemory::new();
        inner
            .put(&object_store::path::Path::from("k.csv"), b"a,b\n1,2\n".to_vec().into())
            .await
            .unwrap();
        let gets = Arc::new(AtomicUsize::new(0));
        let store: Arc<dyn object_store::ObjectStore> = Arc::new(CountingStore { inner, gets: gets.clone() });
        cache.register_store("bucket", store);

        let cache = Arc::new(cache);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                cache.get("bucket", "k.csv", CacheOpts::default()).await.unwrap()
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(gets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn compressed_and_decompressed_keys_share_one_cache_entry() {
        // spec.md §4.4 invariant 4: "k.csv.gz" (with decompress) and "k.csv"
        // map to the same logical key, so the second call must be a cache hit
        // even though it names a different raw object key than the first.
        let tmp = tempfile::tempdir().unwrap();
        let cache = FileCache::new(tmp.path(), 64 * 1024 * 1024, false, Duration::from_secs(86_400 * 90));
        let inner = object_store::memory::InMemory::new();
        let compressed = crate::codec::compression::compress(b"a,b\n1,2\n", Compression::Gzip).unwrap();
        inner
            .put(&object_store::path::Path::from("k.csv.gz"), compressed.into())
            .await
            .unwrap();
        let gets = Arc::new(AtomicUsize::new(0));
        let store: Arc<dyn object_store::ObjectStore> = Arc::new(CountingStore { inner, gets: gets.clone() });
        cache.register_store("bucket", store);

        let decode_opts = CacheOpts { decompress: Some(true), ..CacheOpts::default() };
        let first = cache.get("bucket", "k.csv.gz", decode_opts).await.unwrap();
        let second = cache.get("bucket", "k.csv.gz", decode_opts).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(gets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn eviction_keeps_total_under_ceiling() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = FileCache::new(tmp.path(), 6 * 1024 * 1024, false, Duration::from_secs(86_400));
        let inner = object_store::memory::InMemory::new();
        for key in ["a", "b", "c", "d"] {
            inner
                .put(
                    &object_store::path::Path::from(format!("{key}.bin")),
                    vec![0u8; 2 * 1024 * 1024].into(),
                )
                .await
                .unwrap();
        }
        let store: Arc<dyn object_store::ObjectStore> = Arc::new(inner);
        cache.register_store("bucket", store);

        for key in ["a", "b", "c", "d"] {
            cache
                .get("bucket", &format!("{key}.bin"), CacheOpts::default())
                .await
                .unwrap();
        }
        let total = *cache.total_bytes.lock();
        assert!(total <= 6 * 1024 * 1024);
        // "a" was the least recently used and should have been evicted.
        assert!(cache.touch("bucket/a.bin").is_none());
        assert!(cache.touch("bucket/d.bin").is_some());
    }
}
