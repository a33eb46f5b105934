//! Background daemon keeping the tandas cache and append-log in step.
//!
//! The daemon owns one [`tandas_sync::Synchronizer`], imports the append-log
//! when it changes on disk, exports the cache on a timer, records new trace
//! artifacts in the inbox, and answers `ping`/`sync`/`import`/`status`
//! requests on a Unix control socket.

pub mod config;
mod error;
pub mod inbox;
pub mod markers;
pub mod paths;
mod processor;
pub mod protocol;
mod runtime;
mod server;
pub mod watch;

pub use config::{format_duration, parse_duration, DaemonConfig};
pub use error::DaemonError;
pub use processor::{SyncOp, SyncOutcome};
pub use protocol::{
    request_import, request_ping, request_status, request_sync, DaemonClient, Request, Response,
};
pub use runtime::{init_tracing, start_blocking, Daemon, DaemonState, ShutdownHandle};
