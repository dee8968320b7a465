//! tablelake - client library for a partitioned, content-addressed tabular
//! dataset warehouse.
//!
//! The physical backing is an object store organized as immutable,
//! partitioned files under per-dataset key prefixes. This crate exposes
//! two operations against logically named datasets: range queries via
//! [`gather::gather`], and append-merge-store via [`insert::insert`].
//!
//! Four subsystems do the work:
//! - [`cache`]: a bounded, thread-safe on-disk LRU with single-flight
//!   downloads.
//! - [`partition`]: range predicate <-> object key mapping.
//! - [`gather`]: concurrent fetch/decode/filter/merge.
//! - [`insert`]: schema reconciliation and partitioned read-modify-write.

pub mod backend;
pub mod cache;
pub mod codec;
pub mod config;
pub mod error;
pub mod gather;
pub mod insert;
pub mod metadata;
pub mod partition;
pub mod table;

pub use backend::{BackendRegistry, Store};
pub use cache::{CacheHandle, CacheOpts, FileCache};
pub use config::{Config, ConfigSnapshot};
pub use error::ArchiveError;
pub use gather::{gather, GatherOptions};
pub use insert::{insert, InsertOptions};
pub use metadata::{ColumnType, Compression, DatasetDescriptor, Format, IndexSpec};
pub use table::Table;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
