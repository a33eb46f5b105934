//! Append-log line codec.
//!
//! The append-log holds one JSON-encoded [`Record`] per line. Blank lines are
//! insignificant; every other line must decode on its own.

use crate::error::RecordError;
use crate::types::Record;

/// Decode one append-log line. Returns `Ok(None)` for blank lines.
///
/// `line_no` is 1-based and only used for error context.
pub fn decode_line(line: &str, line_no: usize) -> Result<Option<Record>, RecordError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(line)
        .map(Some)
        .map_err(|source| RecordError::Parse {
            line: line_no,
            source,
        })
}

/// Encode one record as a single JSON line, without the trailing newline.
pub fn encode_line(record: &Record) -> Result<String, RecordError> {
    serde_json::to_string(record).map_err(|source| RecordError::Encode {
        id: record.id.to_string(),
        source,
    })
}

/// Render a full append-log: every record on its own `\n`-terminated line.
pub fn encode_all<'a>(records: impl IntoIterator<Item = &'a Record>) -> Result<String, RecordError> {
    let mut out = String::new();
    for record in records {
        out.push_str(&encode_line(record)?);
        out.push('\n');
    }
    Ok(out)
}
