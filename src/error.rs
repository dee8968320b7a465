//! The five error kinds from which every public failure in this crate is
//! built (see spec.md §7). `Transient` never escapes the crate: it exists so
//! [`crate::cache`] can distinguish "retry this" from "propagate this" and is
//! always converted to one of the other variants (or retried away) before a
//! public function returns.

use thiserror::Error;

/// Errors produced by this crate's public operations.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// Malformed configuration, an unknown URI scheme, or a store id that
    /// cannot be resolved and cannot be parsed as an ad-hoc URI.
    #[error("config error: {0}")]
    Config(String),

    /// No descriptor exists for the requested (collection, dataset, store),
    /// or no rows intersected the requested range in any store.
    #[error("missing data: {0}")]
    MissingData(String),

    /// Empty or type-incompatible input table, a missing required column, or
    /// an incompatible user-supplied type override.
    #[error("schema error: {0}")]
    Schema(String),

    /// Corrupt file framing, a double compression extension, or an unknown
    /// type tag encountered while decoding metadata.
    #[error("format error: {0}")]
    Format(String),

    /// A transient transport failure (connection reset, unexpected EOF,
    /// timeout). Only ever observed inside [`crate::cache::FileCache`]'s
    /// retry loop; exhausting the retry budget converts this into whichever
    /// underlying object-store error caused it.
    #[error("transient transport error: {0}")]
    Transient(String),
}

impl From<std::io::Error> for ArchiveError {
    fn from(err: std::io::Error) -> Self {
        ArchiveError::Format(err.to_string())
    }
}

impl From<serde_json::Error> for ArchiveError {
    fn from(err: serde_json::Error) -> Self {
        ArchiveError::Format(err.to_string())
    }
}

/// Classifies an [`object_store::Error`] per spec.md §4.4: "no such key" is
/// never a retry candidate, transient transport failures come back as
/// [`ArchiveError::Transient`] so the cache can retry them, and everything
/// else propagates as-is.
pub(crate) fn classify_object_store_error(err: object_store::Error) -> ArchiveError {
    if matches!(err, object_store::Error::NotFound { .. }) {
        return ArchiveError::MissingData(err.to_string());
    }
    if is_transient(&err) {
        return ArchiveError::Transient(err.to_string());
    }
    ArchiveError::Format(err.to_string())
}

fn is_transient(err: &object_store::Error) -> bool {
    use std::error::Error as StdError;
    let mut source: Option<&(dyn StdError + 'static)> = StdError::source(err);
    while let Some(cause) = source {
        if let Some(io_err) = cause.downcast_ref::<std::io::Error>() {
            return matches!(
                io_err.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::TimedOut
            );
        }
        source = cause.source();
    }
    false
}
