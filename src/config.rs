//! Process-wide configuration snapshot.
//!
//! Recognized keys mirror spec.md §6: `additional-stores`,
//! `disable-centralized`, `prioritize-additional-stores`, `DATA_CACHE_DIR`,
//! `DATA_CACHE_SIZE_MB`, `DATA_CACHE_EXPIRE_AFTER_DAYS`,
//! `DATA_CACHE_DECOMPRESS`. Environment variables of the same name override
//! whatever a config file supplies; any other keys in the file pass through
//! untouched in [`ConfigSnapshot::extra`].
//!
//! The snapshot is immutable after [`Config::load`]; [`Config::reload`]
//! builds a fresh one and swaps it in atomically (`parking_lot::RwLock`),
//! which is also the signal [`crate::backend::BackendRegistry`] uses to drop
//! its cached registry (spec.md §5, §9).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ArchiveError;

/// A single `{id: uri}` entry from `additional-stores`, preserving insertion
/// order (spec.md §4.5: "a sequence of single-key mappings to preserve
/// insertion order").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdditionalStore {
    pub id: String,
    pub uri: String,
}

/// An immutable, process-wide configuration snapshot.
#[derive(Debug, Clone, Default)]
pub struct ConfigSnapshot {
    pub additional_stores: Vec<AdditionalStore>,
    pub disable_centralized: bool,
    pub prioritize_additional_stores: bool,
    pub data_cache_dir: Option<PathBuf>,
    pub data_cache_size_mb: u64,
    pub data_cache_expire_after_days: u64,
    pub data_cache_decompress: bool,
    /// Recognized-but-unused-by-this-crate keys, preserved for callers that
    /// layer their own config on top.
    pub extra: HashMap<String, Value>,
}

impl ConfigSnapshot {
    const DEFAULT_CACHE_SIZE_MB: u64 = 20_000;
    const DEFAULT_EXPIRE_AFTER_DAYS: u64 = 90;

    fn from_file_and_env(file: Option<RawFileConfig>) -> Result<Self, ArchiveError> {
        let file = file.unwrap_or_default();

        let additional_stores = file.additional_stores.unwrap_or_default();
        let disable_centralized =
            env_bool("DISABLE_CENTRALIZED").unwrap_or(file.disable_centralized.unwrap_or(false));
        let prioritize_additional_stores = env_bool("PRIORITIZE_ADDITIONAL_STORES")
            .unwrap_or(file.prioritize_additional_stores.unwrap_or(false));

        if disable_centralized && additional_stores.is_empty() {
            return Err(ArchiveError::Config(
                "disable-centralized requires a non-empty additional-stores list".into(),
            ));
        }

        let data_cache_dir = std::env::var("DATA_CACHE_DIR")
            .ok()
            .map(PathBuf::from)
            .or(file.data_cache_dir.map(PathBuf::from));

        let data_cache_size_mb = env_u64("DATA_CACHE_SIZE_MB")
            .unwrap_or(file.data_cache_size_mb.unwrap_or(Self::DEFAULT_CACHE_SIZE_MB));
        let data_cache_expire_after_days = env_u64("DATA_CACHE_EXPIRE_AFTER_DAYS").unwrap_or(
            file.data_cache_expire_after_days
                .unwrap_or(Self::DEFAULT_EXPIRE_AFTER_DAYS),
        );
        let data_cache_decompress = env_bool("DATA_CACHE_DECOMPRESS")
            .unwrap_or(file.data_cache_decompress.unwrap_or(true));

        Ok(Self {
            additional_stores,
            disable_centralized,
            prioritize_additional_stores,
            data_cache_dir,
            data_cache_size_mb,
            data_cache_expire_after_days,
            data_cache_decompress,
            extra: file.extra,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawFileConfig {
    #[serde(rename = "additional-stores")]
    additional_stores: Option<Vec<AdditionalStore>>,
    #[serde(rename = "disable-centralized")]
    disable_centralized: Option<bool>,
    #[serde(rename = "prioritize-additional-stores")]
    prioritize_additional_stores: Option<bool>,
    #[serde(rename = "DATA_CACHE_DIR")]
    data_cache_dir: Option<String>,
    #[serde(rename = "DATA_CACHE_SIZE_MB")]
    data_cache_size_mb: Option<u64>,
    #[serde(rename = "DATA_CACHE_EXPIRE_AFTER_DAYS")]
    data_cache_expire_after_days: Option<u64>,
    #[serde(rename = "DATA_CACHE_DECOMPRESS")]
    data_cache_decompress: Option<bool>,
    #[serde(flatten)]
    extra: HashMap<String, Value>,
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key).ok().and_then(|v| match v.to_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    })
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Loads, caches, and atomically reloads the process-wide configuration.
pub struct Config;

static SNAPSHOT: OnceCell<RwLock<Arc<ConfigSnapshot>>> = OnceCell::new();
static CONFIG_FILE_PATH: OnceCell<RwLock<Option<PathBuf>>> = OnceCell::new();

impl Config {
    /// Returns the current snapshot, loading it lazily from the environment
    /// (and, if set via [`Config::set_file_path`], a JSON config file) on
    /// first use.
    pub fn snapshot() -> Result<Arc<ConfigSnapshot>, ArchiveError> {
        let cell = SNAPSHOT.get_or_try_init(|| -> Result<_, ArchiveError> {
            Ok(RwLock::new(Arc::new(Self::load_fresh()?)))
        })?;
        Ok(cell.read().clone())
    }

    /// Points future loads (including the next [`Config::reload`]) at a JSON
    /// config file. Takes effect the next time the snapshot is (re)built.
    pub fn set_file_path(path: impl Into<PathBuf>) {
        let cell = CONFIG_FILE_PATH.get_or_init(|| RwLock::new(None));
        *cell.write() = Some(path.into());
    }

    /// Atomically replaces the snapshot with a freshly loaded one. Callers
    /// that hold a [`crate::backend::BackendRegistry`] must call its own
    /// `reload()` afterward — this function only replaces the config.
    pub fn reload() -> Result<Arc<ConfigSnapshot>, ArchiveError> {
        let fresh = Arc::new(Self::load_fresh()?);
        let cell = SNAPSHOT.get_or_init(|| RwLock::new(fresh.clone()));
        *cell.write() = fresh.clone();
        Ok(fresh)
    }

    fn load_fresh() -> Result<ConfigSnapshot, ArchiveError> {
        let path = CONFIG_FILE_PATH.get().and_then(|c| c.read().clone());
        let raw = match path {
            Some(p) if p.exists() => {
                let text = std::fs::read_to_string(&p)
                    .map_err(|e| ArchiveError::Config(format!("reading {}: {e}", p.display())))?;
                Some(
                    serde_json::from_str(&text)
                        .map_err(|e| ArchiveError::Config(format!("parsing {}: {e}", p.display())))?,
                )
            }
            _ => None,
        };
        ConfigSnapshot::from_file_and_env(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test_shim::serial;

    // A minimal in-crate mutex to serialize env-mutating tests without
    // pulling in `serial_test` for a single use site.
    mod serial_test_shim {
        use std::sync::Mutex;
        static LOCK: Mutex<()> = Mutex::new(());
        pub fn serial() -> std::sync::MutexGuard<'static, ()> {
            LOCK.lock().unwrap_or_else(|p| p.into_inner())
        }
    }

    #[test]
    fn disable_centralized_without_additional_stores_is_config_error() {
        let _g = serial();
        let raw = RawFileConfig {
            disable_centralized: Some(true),
            ..Default::default()
        };
        let result = ConfigSnapshot::from_file_and_env(Some(raw));
        assert!(matches!(result, Err(ArchiveError::Config(_))));
    }

    #[test]
    fn defaults_match_spec() {
        let _g = serial();
        let snap = ConfigSnapshot::from_file_and_env(None).unwrap();
        assert_eq!(snap.data_cache_size_mb, 20_000);
        assert_eq!(snap.data_cache_expire_after_days, 90);
        assert!(snap.data_cache_decompress);
        assert!(snap.data_cache_dir.is_none());
    }
}
