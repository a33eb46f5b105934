//! # tandas-sync
//!
//! SQLite cache and append-log synchronization.
//!
//! [`Store`] is the rebuildable query cache. [`Synchronizer`] is the only
//! bridge between it and the authoritative append-log: [`Synchronizer::import_from_log`]
//! rebuilds the cache from the file, [`Synchronizer::export_to_log`] atomically
//! rewrites the file from the cache.

pub mod error;
pub mod store;
pub mod syncer;

pub use error::{StoreError, SyncError};
pub use store::Store;
pub use syncer::{ExportReport, ImportReport, ImportWarning, Synchronizer};
