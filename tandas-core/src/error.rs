//! Error types for tandas-core.

use thiserror::Error;

/// Errors raised while decoding or encoding append-log lines.
#[derive(Debug, Error)]
pub enum RecordError {
    /// A non-blank line did not parse as a record.
    #[error("malformed record on line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    /// A record could not be rendered as a JSON line.
    #[error("failed to encode record {id}: {source}")]
    Encode {
        id: String,
        #[source]
        source: serde_json::Error,
    },
}
