//! Arrow IPC (the "ARROW" file format in spec.md §3) encode/decode. Straight
//! pass-through to `arrow`'s own file-format reader/writer, since the wire
//! representation already matches this crate's in-memory [`Table`] exactly.

use std::io::Cursor;

use arrow::ipc::reader::FileReader;
use arrow::ipc::writer::FileWriter;

use crate::error::ArchiveError;
use crate::table::Table;

pub fn encode(table: &Table) -> Result<Vec<u8>, ArchiveError> {
    let mut buf = Vec::new();
    {
        let mut writer = FileWriter::try_new(&mut buf, &table.schema())
            .map_err(|e| ArchiveError::Format(format!("opening Arrow IPC writer: {e}")))?;
        writer
            .write(table)
            .map_err(|e| ArchiveError::Format(format!("writing Arrow IPC batch: {e}")))?;
        writer
            .finish()
            .map_err(|e| ArchiveError::Format(format!("finishing Arrow IPC file: {e}")))?;
    }
    Ok(buf)
}

pub fn decode(bytes: &[u8]) -> Result<Table, ArchiveError> {
    let reader = FileReader::try_new(Cursor::new(bytes), None)
        .map_err(|e| ArchiveError::Format(format!("opening Arrow IPC reader: {e}")))?;
    let mut batches = Vec::new();
    for batch in reader {
        batches.push(batch.map_err(|e| ArchiveError::Format(format!("reading Arrow IPC batch: {e}")))?);
    }
    if batches.is_empty() {
        return Err(ArchiveError::Format("Arrow IPC file contained no batches".into()));
    }
    crate::table::concat_tables(&batches)
}
