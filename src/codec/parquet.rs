//! Parquet encode/decode via `parquet::arrow` (spec.md §3).

use std::sync::Arc;

use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::file::properties::WriterProperties;

use crate::error::ArchiveError;
use crate::table::Table;

pub fn encode(table: &Table) -> Result<Vec<u8>, ArchiveError> {
    let mut buf = Vec::new();
    let props = WriterProperties::builder().build();
    let mut writer = ArrowWriter::try_new(&mut buf, table.schema(), Some(props))
        .map_err(|e| ArchiveError::Format(format!("opening Parquet writer: {e}")))?;
    writer
        .write(table)
        .map_err(|e| ArchiveError::Format(format!("writing Parquet row group: {e}")))?;
    writer
        .close()
        .map_err(|e| ArchiveError::Format(format!("finishing Parquet file: {e}")))?;
    Ok(buf)
}

pub fn decode(bytes: Vec<u8>) -> Result<Table, ArchiveError> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(bytes::Bytes::from(bytes))
        .map_err(|e| ArchiveError::Format(format!("opening Parquet reader: {e}")))?;
    let reader = builder
        .build()
        .map_err(|e| ArchiveError::Format(format!("building Parquet reader: {e}")))?;
    let mut batches = Vec::new();
    for batch in reader {
        batches.push(batch.map_err(|e| ArchiveError::Format(format!("reading Parquet row group: {e}")))?);
    }
    if batches.is_empty() {
        return Err(ArchiveError::Format("Parquet file contained no row groups".into()));
    }
    crate::table::concat_tables(&batches)
}

#[allow(dead_code)]
fn schema_arc(table: &Table) -> Arc<arrow::datatypes::Schema> {
    table.schema()
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int64Array;
    use arrow::datatypes::{DataType, Field, Schema};
    use arrow::record_batch::RecordBatch;

    #[test]
    fn round_trips_through_parquet() {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]));
        let table = RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(vec![10, 20]))]).unwrap();
        let bytes = encode(&table).unwrap();
        let decoded = decode(bytes).unwrap();
        assert_eq!(decoded.num_rows(), 2);
    }
}
