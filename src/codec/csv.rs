//! CSV encode/decode (spec.md §3, §4.1).
//!
//! `arrow`'s CSV writer has no notion of list-typed columns, and the spec's
//! CSV format is a genuinely flat grid — so on write, any `List` column is
//! flattened to a `Utf8` column holding one JSON array literal per cell.
//! This only happens on write: a CSV read back through [`decode`] with an
//! externally supplied schema that declares a list column gets a plain
//! string column, not a reconstructed list (spec.md §9: "list-column
//! JSON-cell encoding is one-directional").
//!
//! Zoned-timestamp columns are likewise not written as arrow's own
//! timestamp text rendering: spec.md §4.6.2/§4.7.2 specify the on-disk cell
//! value is the raw Unix-second integer, so every other store (including
//! archives this crate doesn't write) can read it without a timestamp
//! parser. [`encode`] casts timestamp columns down to `Int64` seconds before
//! handing the batch to arrow's writer; [`decode`] does the reverse after
//! arrow's reader parses the seconds as plain integers.

use std::io::Cursor;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, Float64Array, Int64Array, StringArray};
use arrow::compute::cast;
use arrow::csv::{ReaderBuilder, WriterBuilder};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::record_batch::RecordBatch;

use crate::error::ArchiveError;
use crate::table::Table;

pub fn encode(table: &Table) -> Result<Vec<u8>, ArchiveError> {
    let seconds = timestamps_to_unix_seconds(table)?;
    let flattened = flatten_list_columns(&seconds)?;
    let mut buf = Vec::new();
    {
        let mut writer = WriterBuilder::new().with_header(true).build(&mut buf);
        writer
            .write(&flattened)
            .map_err(|e| ArchiveError::Format(format!("writing CSV: {e}")))?;
    }
    Ok(buf)
}

pub fn decode(bytes: &[u8], schema: SchemaRef) -> Result<Table, ArchiveError> {
    let wire_schema = Arc::new(to_wire_schema(&schema));
    let mut reader = ReaderBuilder::new(wire_schema)
        .with_header(true)
        .build(Cursor::new(bytes))
        .map_err(|e| ArchiveError::Format(format!("opening CSV reader: {e}")))?;
    let mut batches = Vec::new();
    for batch in reader.by_ref() {
        batches.push(batch.map_err(|e| ArchiveError::Format(format!("reading CSV row group: {e}")))?);
    }
    if batches.is_empty() {
        return Err(ArchiveError::Format("CSV contained no row groups".into()));
    }
    let raw = crate::table::concat_tables(&batches)?;
    unix_seconds_to_timestamps(&raw, &schema)
}

/// Builds the schema arrow's CSV reader actually parses against: every
/// `Timestamp` field in `schema` is swapped for `Int64` (the wire cell holds
/// a plain Unix-second integer, not a parseable timestamp string), and every
/// `List`/`LargeList` field for `Utf8` (the wire cell holds a JSON array
/// literal per spec.md §4.1 — arrow's CSV reader has no list parser at all).
fn to_wire_schema(schema: &Schema) -> Schema {
    let fields: Vec<Field> = schema
        .fields()
        .iter()
        .map(|f| match f.data_type() {
            DataType::Timestamp(_, _) => Field::new(f.name(), DataType::Int64, f.is_nullable()),
            DataType::List(_) | DataType::LargeList(_) => Field::new(f.name(), DataType::Utf8, f.is_nullable()),
            _ => f.as_ref().clone(),
        })
        .collect();
    Schema::new(fields)
}

/// Casts every `Int64` column that `target_schema` declares as a timestamp
/// back to that timestamp type, interpreting the integer as Unix seconds.
/// `List`-declared columns are left as the raw JSON-text `Utf8` column arrow
/// just parsed — spec.md §4.1: list-column decoding is a post-processing
/// step belonging to the gather engine, not this codec.
fn unix_seconds_to_timestamps(table: &Table, target_schema: &SchemaRef) -> Result<Table, ArchiveError> {
    let mut fields = Vec::with_capacity(table.num_columns());
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(table.num_columns());
    for (i, field) in target_schema.fields().iter().enumerate() {
        let column = table.column(i);
        match field.data_type() {
            DataType::Timestamp(unit, tz) => {
                let as_seconds = cast(column, &DataType::Timestamp(TimeUnit::Second, tz.clone()))
                    .map_err(|e| ArchiveError::Format(format!("decoding Unix-second column '{}': {e}", field.name())))?;
                let as_unit = cast(&as_seconds, &DataType::Timestamp(*unit, tz.clone()))
                    .map_err(|e| ArchiveError::Format(format!("decoding Unix-second column '{}': {e}", field.name())))?;
                fields.push(field.as_ref().clone());
                columns.push(as_unit);
            }
            DataType::List(_) | DataType::LargeList(_) => {
                fields.push(Field::new(field.name(), DataType::Utf8, field.is_nullable()));
                columns.push(column.clone());
            }
            _ => {
                fields.push(field.as_ref().clone());
                columns.push(column.clone());
            }
        }
    }
    let schema = Arc::new(Schema::new(fields));
    RecordBatch::try_new(schema, columns).map_err(|e| ArchiveError::Format(format!("rebuilding decoded CSV batch: {e}")))
}

/// Casts every `Timestamp` column down to `Int64` Unix seconds before
/// handing the batch to arrow's CSV writer (spec.md §4.7.2 step 2).
fn timestamps_to_unix_seconds(table: &Table) -> Result<Table, ArchiveError> {
    let schema = table.schema();
    let mut has_timestamp = false;
    let mut fields = Vec::with_capacity(schema.fields().len());
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(schema.fields().len());

    for (i, field) in schema.fields().iter().enumerate() {
        let column = table.column(i);
        if let DataType::Timestamp(_, tz) = field.data_type() {
            has_timestamp = true;
            let as_seconds = cast(column, &DataType::Timestamp(TimeUnit::Second, tz.clone()))
                .map_err(|e| ArchiveError::Format(format!("encoding Unix-second column '{}': {e}", field.name())))?;
            let as_i64 = cast(&as_seconds, &DataType::Int64)
                .map_err(|e| ArchiveError::Format(format!("encoding Unix-second column '{}': {e}", field.name())))?;
            fields.push(Field::new(field.name(), DataType::Int64, field.is_nullable()));
            columns.push(as_i64);
        } else {
            fields.push(field.as_ref().clone());
            columns.push(column.clone());
        }
    }

    if !has_timestamp {
        return Ok(table.clone());
    }
    let new_schema = Arc::new(Schema::new(fields));
    RecordBatch::try_new(new_schema, columns)
        .map_err(|e| ArchiveError::Format(format!("flattening timestamp columns for CSV: {e}")))
}

/// Flattens `List`/`LargeList` columns to JSON-text `Utf8` columns. Exposed
/// beyond [`encode`] so the insert engine can bring a fresh partition's list
/// columns into the same on-wire shape as an existing CSV partition decoded
/// via [`decode`] before concatenating the two (spec.md §4.7.2 step 4).
pub(crate) fn flatten_list_columns(table: &Table) -> Result<Table, ArchiveError> {
    let schema = table.schema();
    let mut has_list = false;
    let mut fields = Vec::with_capacity(schema.fields().len());
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(schema.fields().len());

    for (i, field) in schema.fields().iter().enumerate() {
        let column = table.column(i);
        if matches!(field.data_type(), DataType::List(_) | DataType::LargeList(_)) {
            has_list = true;
            fields.push(Field::new(field.name(), DataType::Utf8, field.is_nullable()));
            columns.push(Arc::new(list_column_to_json_strings(column)?));
        } else {
            fields.push(field.as_ref().clone());
            columns.push(column.clone());
        }
    }

    if !has_list {
        return Ok(table.clone());
    }
    let new_schema = Arc::new(Schema::new(fields));
    RecordBatch::try_new(new_schema, columns)
        .map_err(|e| ArchiveError::Format(format!("flattening list columns for CSV: {e}")))
}

fn list_column_to_json_strings(column: &ArrayRef) -> Result<StringArray, ArchiveError> {
    let list = column
        .as_any()
        .downcast_ref::<arrow::array::ListArray>()
        .ok_or_else(|| ArchiveError::Format("unsupported list array layout".into()))?;

    let mut out = Vec::with_capacity(list.len());
    for i in 0..list.len() {
        if list.is_null(i) {
            out.push(None);
            continue;
        }
        let value = list.value(i);
        let json = cell_array_to_json(&value)?;
        out.push(Some(serde_json::to_string(&json).map_err(|e| ArchiveError::Format(e.to_string()))?));
    }
    Ok(StringArray::from(out))
}

fn cell_array_to_json(array: &ArrayRef) -> Result<serde_json::Value, ArchiveError> {
    if let Some(a) = array.as_any().downcast_ref::<Int64Array>() {
        return Ok(serde_json::Value::Array(
            a.iter().map(|v| v.map(Into::into).unwrap_or(serde_json::Value::Null)).collect(),
        ));
    }
    if let Some(a) = array.as_any().downcast_ref::<Float64Array>() {
        return Ok(serde_json::Value::Array(
            a.iter()
                .map(|v| {
                    v.and_then(serde_json::Number::from_f64)
                        .map(serde_json::Value::Number)
                        .unwrap_or(serde_json::Value::Null)
                })
                .collect(),
        ));
    }
    if let Some(a) = array.as_any().downcast_ref::<StringArray>() {
        return Ok(serde_json::Value::Array(
            a.iter()
                .map(|v| v.map(|s| serde_json::Value::String(s.to_string())).unwrap_or(serde_json::Value::Null))
                .collect(),
        ));
    }
    Err(ArchiveError::Format(format!(
        "unsupported list element type for CSV JSON-cell encoding: {:?}",
        array.data_type()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::TimestampMicrosecondArray;
    use arrow::datatypes::DataType;

    #[test]
    fn flat_table_round_trips_through_csv() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("a", DataType::Int64, false),
            Field::new("b", DataType::Utf8, false),
        ]));
        let table = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(Int64Array::from(vec![1, 2])),
                Arc::new(StringArray::from(vec!["x", "y"])),
            ],
        )
        .unwrap();
        let bytes = encode(&table).unwrap();
        let decoded = decode(&bytes, schema).unwrap();
        assert_eq!(decoded.num_rows(), 2);
    }

    #[test]
    fn timestamp_column_round_trips_as_unix_seconds_on_the_wire() {
        let schema = Arc::new(Schema::new(vec![Field::new(
            "ts",
            DataType::Timestamp(TimeUnit::Microsecond, None),
            false,
        )]));
        let table = RecordBatch::try_new(
            schema.clone(),
            vec![Arc::new(TimestampMicrosecondArray::from(vec![1_700_000_000_000_000]))],
        )
        .unwrap();

        let bytes = encode(&table).unwrap();
        // The cell on the wire is the plain Unix-second integer, not an
        // arrow-rendered timestamp string.
        assert!(std::str::from_utf8(&bytes).unwrap().contains("1700000000"));

        let decoded = decode(&bytes, schema).unwrap();
        let col = decoded
            .column(0)
            .as_any()
            .downcast_ref::<TimestampMicrosecondArray>()
            .unwrap();
        assert_eq!(col.value(0), 1_700_000_000_000_000);
    }
}
