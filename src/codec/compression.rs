//! Compression codecs layered under the file formats (spec.md §3, §4.1, §9).
//!
//! `Compression::None` is the "nothing" case: it is a no-op wrapper, not a
//! special-cased branch in the caller, so every call site can always call
//! [`compress`]/[`decompress`] unconditionally.

use std::io::{Read, Write};

use crate::error::ArchiveError;
use crate::metadata::Compression;

pub fn compress(bytes: &[u8], compression: Compression) -> Result<Vec<u8>, ArchiveError> {
    match compression {
        Compression::None => Ok(bytes.to_vec()),
        Compression::Gzip => {
            let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder
                .write_all(bytes)
                .map_err(|e| ArchiveError::Format(format!("gzip encode: {e}")))?;
            encoder
                .finish()
                .map_err(|e| ArchiveError::Format(format!("gzip encode: {e}")))
        }
        Compression::Bzip2 => {
            let mut encoder = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
            encoder
                .write_all(bytes)
                .map_err(|e| ArchiveError::Format(format!("bzip2 encode: {e}")))?;
            encoder
                .finish()
                .map_err(|e| ArchiveError::Format(format!("bzip2 encode: {e}")))
        }
        Compression::Lz4 => {
            let mut encoder = lz4::EncoderBuilder::new()
                .build(Vec::new())
                .map_err(|e| ArchiveError::Format(format!("lz4 encode: {e}")))?;
            encoder
                .write_all(bytes)
                .map_err(|e| ArchiveError::Format(format!("lz4 encode: {e}")))?;
            let (out, result) = encoder.finish();
            result.map_err(|e| ArchiveError::Format(format!("lz4 encode: {e}")))?;
            Ok(out)
        }
        Compression::Zstd => zstd::stream::encode_all(bytes, 0)
            .map_err(|e| ArchiveError::Format(format!("zstd encode: {e}"))),
    }
}

pub fn decompress(bytes: &[u8], compression: Compression) -> Result<Vec<u8>, ArchiveError> {
    match compression {
        Compression::None => Ok(bytes.to_vec()),
        Compression::Gzip => {
            let mut decoder = flate2::read::GzDecoder::new(bytes);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|e| ArchiveError::Format(format!("gzip decode: {e}")))?;
            Ok(out)
        }
        Compression::Bzip2 => {
            let mut decoder = bzip2::read::BzDecoder::new(bytes);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|e| ArchiveError::Format(format!("bzip2 decode: {e}")))?;
            Ok(out)
        }
        Compression::Lz4 => {
            let mut decoder = lz4::Decoder::new(bytes)
                .map_err(|e| ArchiveError::Format(format!("lz4 decode: {e}")))?;
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|e| ArchiveError::Format(format!("lz4 decode: {e}")))?;
            Ok(out)
        }
        Compression::Zstd => {
            zstd::stream::decode_all(bytes).map_err(|e| ArchiveError::Format(format!("zstd decode: {e}")))
        }
    }
}

/// Recognizes a single trailing compression extension (`.gz`, `.bz2`,
/// `.lz4`, `.zst`) on `filename`. Returns `None` (meaning `Compression::None`
/// is ambiguous with "no extension present") only when the caller does not
/// need to distinguish the two — see [`super::detect_from_filename`] for the
/// authoritative two-extension split used by the codec registry.
pub fn compression_from_filename(filename: &str) -> Option<Compression> {
    if filename.ends_with(".gz") {
        Some(Compression::Gzip)
    } else if filename.ends_with(".bz2") {
        Some(Compression::Bzip2)
    } else if filename.ends_with(".lz4") {
        Some(Compression::Lz4)
    } else if filename.ends_with(".zst") {
        Some(Compression::Zstd)
    } else {
        None
    }
}

/// Strips a single trailing compression extension, if any, leaving the
/// format extension in place. Used when the cache decompresses an artifact
/// on ingest so the logical local-disk key matches the format-only name.
pub fn strip_compression_extension(filename: &str) -> String {
    for ext in [".gz", ".bz2", ".lz4", ".zst"] {
        if let Some(stripped) = filename.strip_suffix(ext) {
            return stripped.to_string();
        }
    }
    filename.to_string()
}
