//! The concrete tabular-data runtime this crate builds against.
//!
//! spec.md treats "the tabular-data runtime" as an external collaborator —
//! "whatever data-frame container the host language offers". In Rust that
//! container is [`arrow::record_batch::RecordBatch`]; this module re-exports
//! it as [`Table`] and supplies the handful of whole-table operations the
//! gather and insert engines need (concatenation, lexicographic sort,
//! adjacent-row dedup, column projection) using `arrow`'s compute kernels
//! rather than hand-rolled loops.

use std::sync::Arc;

use arrow::array::ArrayRef;
use arrow::compute::{concat_batches, lexsort_to_indices, take, SortColumn};
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use arrow::row::{RowConverter, SortField};

use crate::error::ArchiveError;

/// A single in-memory batch of rows with a fixed, typed schema.
pub type Table = RecordBatch;

/// Concatenates tables in the given order. All tables must share a schema.
/// Used by the gather engine to join fetched partitions (spec.md §4.6 step
/// 5) in ascending key order.
pub fn concat_tables(tables: &[Table]) -> Result<Table, ArchiveError> {
    if tables.is_empty() {
        return Err(ArchiveError::Schema("no tables to concatenate".into()));
    }
    let schema = tables[0].schema();
    concat_batches(&schema, tables)
        .map_err(|e| ArchiveError::Format(format!("concatenating batches: {e}")))
}

/// Returns a new table containing only `columns`, in the given order,
/// dropping any others. Used to strip helper columns and enforce
/// `column_order` before encoding (spec.md §4.2, §4.7.2).
pub fn project(table: &Table, columns: &[&str]) -> Result<Table, ArchiveError> {
    let schema = table.schema();
    let mut fields = Vec::with_capacity(columns.len());
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(columns.len());
    for name in columns {
        let idx = schema
            .index_of(name)
            .map_err(|_| ArchiveError::Schema(format!("column '{name}' not found")))?;
        fields.push(schema.field(idx).clone());
        arrays.push(table.column(idx).clone());
    }
    let new_schema = Arc::new(arrow::datatypes::Schema::new(fields));
    RecordBatch::try_new(new_schema, arrays)
        .map_err(|e| ArchiveError::Format(format!("projecting columns: {e}")))
}

/// Sorts ascending lexicographically on `columns` (in order) and drops exact
/// duplicate rows, comparing the full projected row (spec.md §4.7.2 step 5,
/// §8 invariant 6/7). Row comparison is done on serialized row bytes via
/// [`RowConverter`] so it stays O(n) rather than re-sorting after the fact.
pub fn sort_and_dedup(table: &Table, columns: &[&str]) -> Result<Table, ArchiveError> {
    if table.num_rows() == 0 {
        return Ok(table.clone());
    }
    let schema = table.schema();
    let sort_columns: Vec<SortColumn> = columns
        .iter()
        .map(|name| {
            let idx = schema
                .index_of(name)
                .map_err(|_| ArchiveError::Schema(format!("column '{name}' not found")))?;
            Ok(SortColumn {
                values: table.column(idx).clone(),
                options: None,
            })
        })
        .collect::<Result<_, ArchiveError>>()?;

    let sort_indices = lexsort_to_indices(&sort_columns, None)
        .map_err(|e| ArchiveError::Format(format!("sorting rows: {e}")))?;

    let sorted_columns: Vec<ArrayRef> = table
        .columns()
        .iter()
        .map(|c| take(c, &sort_indices, None))
        .collect::<Result<_, _>>()
        .map_err(|e| ArchiveError::Format(format!("reordering rows: {e}")))?;
    let sorted = RecordBatch::try_new(schema.clone(), sorted_columns)
        .map_err(|e| ArchiveError::Format(format!("rebuilding sorted batch: {e}")))?;

    dedup_adjacent(&sorted, columns)
}

/// Drops rows whose full `columns` projection is identical to the row
/// immediately before it. Assumes `table` is already sorted on `columns`.
fn dedup_adjacent(table: &Table, columns: &[&str]) -> Result<Table, ArchiveError> {
    let projected = project(table, columns)?;
    let fields: Vec<SortField> = projected
        .schema()
        .fields()
        .iter()
        .map(|f| SortField::new(f.data_type().clone()))
        .collect();
    let converter = RowConverter::new(fields)
        .map_err(|e| ArchiveError::Format(format!("building row converter: {e}")))?;
    let rows = converter
        .convert_columns(projected.columns())
        .map_err(|e| ArchiveError::Format(format!("converting rows: {e}")))?;

    let mut keep: Vec<u32> = Vec::with_capacity(table.num_rows());
    for i in 0..rows.num_rows() {
        if i == 0 || rows.row(i) != rows.row(i - 1) {
            keep.push(i as u32);
        }
    }

    let keep_indices = arrow::array::UInt32Array::from(keep);
    let columns: Vec<ArrayRef> = table
        .columns()
        .iter()
        .map(|c| take(c, &keep_indices, None))
        .collect::<Result<_, _>>()
        .map_err(|e| ArchiveError::Format(format!("dropping duplicate rows: {e}")))?;
    RecordBatch::try_new(table.schema(), columns)
        .map_err(|e| ArchiveError::Format(format!("rebuilding deduped batch: {e}")))
}

/// Returns the rows of `table` at `indices`, without copying columns that
/// aren't touched (`take` still allocates per-column, but no intermediate
/// per-group tables are ever materialized by callers of this function -
/// see spec.md §4.6.1's "should not allocate per-group intermediate
/// tables").
pub fn take_rows(table: &Table, indices: &[u32]) -> Result<Table, ArchiveError> {
    let idx_array = arrow::array::UInt32Array::from(indices.to_vec());
    let columns: Vec<ArrayRef> = table
        .columns()
        .iter()
        .map(|c| take(c, &idx_array, None))
        .collect::<Result<_, _>>()
        .map_err(|e| ArchiveError::Format(format!("extracting rows: {e}")))?;
    RecordBatch::try_new(table.schema(), columns)
        .map_err(|e| ArchiveError::Format(format!("rebuilding extracted batch: {e}")))
}

/// Returns an empty table with the same schema, containing zero rows.
pub fn empty_like(schema: SchemaRef) -> Table {
    RecordBatch::new_empty(schema)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int64Array;
    use arrow::datatypes::{DataType, Field, Schema};

    fn table_of(values: &[i64]) -> Table {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]));
        RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(values.to_vec()))]).unwrap()
    }

    #[test]
    fn sort_and_dedup_removes_exact_duplicates() {
        let t = table_of(&[3, 1, 2, 1]);
        let out = sort_and_dedup(&t, &["v"]).unwrap();
        let col = out
            .column(0)
            .as_any()
            .downcast_ref::<Int64Array>()
            .unwrap();
        assert_eq!(col.values(), &[1, 2, 3]);
    }

    #[test]
    fn concat_tables_preserves_order() {
        let a = table_of(&[1, 2]);
        let b = table_of(&[3, 4]);
        let out = concat_tables(&[a, b]).unwrap();
        let col = out
            .column(0)
            .as_any()
            .downcast_ref::<Int64Array>()
            .unwrap();
        assert_eq!(col.values(), &[1, 2, 3, 4]);
    }
}
