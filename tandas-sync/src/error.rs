//! Error types for tandas-sync.

use std::path::PathBuf;

use thiserror::Error;

use tandas_core::RecordError;

/// Errors raised by the SQLite cache.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The database file could not be opened or created.
    #[error("failed to open store at {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    /// Schema creation or pragma setup failed.
    #[error("failed to ensure store schema: {0}")]
    Schema(#[source] rusqlite::Error),

    /// Any other SQLite failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A collection column could not be encoded as JSON.
    #[error("failed to encode column for {id}: {source}")]
    Encode {
        id: String,
        #[source]
        source: serde_json::Error,
    },
}

/// All errors that can arise from import/export operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// An error from the cache store.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A record could not be encoded for export.
    #[error("record error: {0}")]
    Record(#[from] RecordError),

    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Convenience constructor for [`SyncError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> SyncError {
    SyncError::Io {
        path: path.into(),
        source,
    }
}
