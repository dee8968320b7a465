//! The file-format + compression codec registry (spec.md §3, §4.1).
//!
//! A partition's object key always carries exactly one format extension and
//! at most one compression extension, in that order (`2024/03/17.csv.gz`,
//! never `2024/03/17.csv.gz.zst`). [`detect_from_filename`] is the single
//! place that splits a key into its `(Format, Compression)` pair; every
//! other module goes through it rather than re-deriving the split.

pub mod arrow_ipc;
pub mod compression;
pub mod csv;
pub mod parquet;

use arrow::datatypes::SchemaRef;

use crate::error::ArchiveError;
use crate::metadata::{Compression, Format};
use crate::table::Table;

/// Splits `filename`'s trailing extensions into `(format, compression)`.
/// Exactly one or two extensions are accepted; a third (a double-stacked
/// compression extension, or junk after the compression extension) is a
/// format error (spec.md §4.1, §8 seed scenario S1).
pub fn detect_from_filename(filename: &str) -> Result<(Format, Compression), ArchiveError> {
    let name = filename.rsplit('/').next().unwrap_or(filename);
    let exts: Vec<&str> = name.split('.').skip(1).collect();

    match exts.len() {
        0 => Err(ArchiveError::Format(format!("'{filename}' has no extension"))),
        1 => Ok((parse_format(exts[0])?, Compression::None)),
        2 => Ok((parse_format(exts[0])?, parse_compression(exts[1])?)),
        _ => Err(ArchiveError::Format(format!(
            "'{filename}' has too many extensions (double-stacked compression?)"
        ))),
    }
}

fn parse_format(ext: &str) -> Result<Format, ArchiveError> {
    match ext {
        "csv" => Ok(Format::Csv),
        "arrow" => Ok(Format::Arrow),
        "parquet" => Ok(Format::Parquet),
        other => Err(ArchiveError::Format(format!("unknown file format extension: {other}"))),
    }
}

fn parse_compression(ext: &str) -> Result<Compression, ArchiveError> {
    match ext {
        "gz" => Ok(Compression::Gzip),
        "bz2" => Ok(Compression::Bzip2),
        "lz4" => Ok(Compression::Lz4),
        "zst" => Ok(Compression::Zstd),
        other => Err(ArchiveError::Format(format!("unknown compression extension: {other}"))),
    }
}

/// Encodes `table` into `format`'s on-disk byte representation.
/// Compression, if any, is applied separately via [`compression::compress`]
/// — encoding and compression are independent stages so the cache can
/// decompress without re-parsing the format, and vice versa.
pub fn encode_bytes(table: &Table, format: Format) -> Result<Vec<u8>, ArchiveError> {
    match format {
        Format::Csv => csv::encode(table),
        Format::Arrow => arrow_ipc::encode(table),
        Format::Parquet => parquet::encode(table),
    }
}

/// Decodes `bytes` (already decompressed) as `format`. CSV is not
/// self-describing, so callers must supply the dataset's schema; Arrow and
/// Parquet carry their own and `schema` is ignored for them.
pub fn decode_bytes(bytes: &[u8], format: Format, schema: Option<SchemaRef>) -> Result<Table, ArchiveError> {
    match format {
        Format::Csv => {
            let schema = schema
                .ok_or_else(|| ArchiveError::Schema("CSV decoding requires an explicit schema".into()))?;
            csv::decode(bytes, schema)
        }
        Format::Arrow => arrow_ipc::decode(bytes),
        Format::Parquet => parquet::decode(bytes.to_vec()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_plain_csv() {
        let (format, compression) = detect_from_filename("2024/03/17.csv").unwrap();
        assert_eq!(format, Format::Csv);
        assert_eq!(compression, Compression::None);
    }

    #[test]
    fn detects_gzipped_parquet() {
        let (format, compression) = detect_from_filename("2024/03/17.parquet.gz").unwrap();
        assert_eq!(format, Format::Parquet);
        assert_eq!(compression, Compression::Gzip);
    }

    #[test]
    fn rejects_double_stacked_compression() {
        let result = detect_from_filename("2024/03/17.csv.gz.zst");
        assert!(matches!(result, Err(ArchiveError::Format(_))));
    }

    #[test]
    fn rejects_no_extension() {
        assert!(detect_from_filename("2024").is_err());
    }
}
