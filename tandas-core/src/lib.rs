//! Tandas core library: record types, derived stats, append-log line codec.
//!
//! - [`types`]: newtypes and the [`Record`] model
//! - [`jsonl`]: one-record-per-line encoding of the append-log
//! - [`error`]: [`RecordError`]

pub mod error;
pub mod jsonl;
pub mod types;

pub use error::RecordError;
pub use types::{
    Note, Record, RecordId, RecordStats, RecordStatus, RunOutcome, RunResult, FLAKINESS_WINDOW,
};
