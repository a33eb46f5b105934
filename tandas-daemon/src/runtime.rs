//! Daemon lifecycle: startup, task wiring, and ordered shutdown.
//!
//! ```text
//! Initializing ──► Running ──► ShuttingDown ──► Stopped
//! ```
//!
//! [`Daemon::initialize`] acquires every resource (store, socket, markers) or
//! releases what it already took and fails. [`Daemon::run`] starts the
//! watchers, the periodic sync timer, the accept loop and the signal
//! listener, waits for the shared shutdown signal, then tears everything
//! down in order.

use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use notify::RecursiveMode;
use tokio::net::UnixListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Semaphore;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use tandas_sync::{Store, Synchronizer};

use crate::config::{format_duration, resolve_dir, DaemonConfig};
use crate::error::{io_err, DaemonError};
use crate::inbox::TraceInbox;
use crate::markers::{self, remove_file_quietly, LockInfo};
use crate::paths::{database_path, log_path, project_root, socket_path, trace_inbox_path};
use crate::processor::{self, SyncHandle, SyncOp, SyncOutcome};
use crate::server::{self, ServerContext};
use crate::watch::{DirectoryWatcher, FileWatcher};

// ---------------------------------------------------------------------------
// State and shutdown signal
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Initializing,
    Running,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for DaemonState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DaemonState::Initializing => "initializing",
            DaemonState::Running => "running",
            DaemonState::ShuttingDown => "shutting_down",
            DaemonState::Stopped => "stopped",
        })
    }
}

fn enter(state: DaemonState) {
    tracing::info!(state = %state, "daemon state");
}

/// The single shutdown signal every loop observes. Triggering it more than
/// once is harmless.
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle {
    token: CancellationToken,
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        if !self.token.is_cancelled() {
            tracing::info!("shutdown requested");
        }
        self.token.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn triggered(&self) {
        self.token.cancelled().await;
    }

    fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

/// A fully initialized daemon, ready to [`run`](Daemon::run).
pub struct Daemon {
    config: DaemonConfig,
    synchronizer: Synchronizer,
    listener: UnixListener,
    shutdown: ShutdownHandle,
}

impl Daemon {
    /// Acquire the store, socket and markers for `config.dir`.
    ///
    /// Fails with [`DaemonError::AlreadyRunning`] before touching the
    /// filesystem if a live daemon answers on the socket. A socket nobody
    /// answers on is left over from a crash and is removed.
    pub async fn initialize(mut config: DaemonConfig) -> Result<Self, DaemonError> {
        enter(DaemonState::Initializing);
        config.validate()?;

        let socket = socket_path(&config.dir);
        reclaim_socket(&socket)?;

        fs::create_dir_all(&config.dir).map_err(|e| io_err(&config.dir, e))?;
        config.dir = resolve_dir(&config.dir);
        let dir = config.dir.clone();
        let socket = socket_path(&dir);

        let database = database_path(&dir);
        let store = Store::open(&database)?;
        let mut synchronizer = Synchronizer::new(store, log_path(&dir));
        match synchronizer.import_from_log() {
            Ok(report) if !report.warnings.is_empty() => tracing::warn!(
                imported = report.imported,
                warnings = report.warnings.len(),
                "startup import skipped some lines"
            ),
            Ok(_) => {}
            Err(err) => tracing::warn!(error = %err, "startup import failed"),
        }

        let listener = match UnixListener::bind(&socket) {
            Ok(listener) => listener,
            Err(err) => {
                close_store(synchronizer);
                return Err(io_err(&socket, err));
            }
        };

        let acquired = set_socket_permissions(&socket)
            .and_then(|()| markers::write(&dir, &LockInfo::current(&database)));
        if let Err(err) = acquired {
            drop(listener);
            remove_file_quietly(&socket);
            close_store(synchronizer);
            return Err(err);
        }

        Ok(Self {
            config,
            synchronizer,
            listener,
            shutdown: ShutdownHandle::default(),
        })
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    /// Handle for requesting shutdown from outside the daemon.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Serve until shutdown is triggered, then release every resource.
    pub async fn run(self) -> Result<(), DaemonError> {
        let Daemon {
            config,
            synchronizer,
            listener,
            shutdown,
        } = self;
        let dir = config.dir.clone();
        let token = shutdown.token();

        let (sync, processor_handle) = processor::spawn(synchronizer, token.clone());
        let file_watcher = start_file_watcher(&dir, config.debounce, sync.clone());
        let directory_watcher = start_directory_watcher(&config);

        let ticker_handle = tokio::spawn(ticker_task(sync.clone(), config.interval, token.clone()));

        let accept_handle = {
            let ctx = Arc::new(ServerContext {
                sync,
                pid: std::process::id(),
                interval: config.interval,
                idle_timeout: config.client_idle_timeout,
                connections: Arc::new(Semaphore::new(config.max_connections)),
                shutdown: token.clone(),
            });
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let result = server::accept_loop(listener, ctx).await;
                shutdown.trigger();
                result
            })
        };

        let signal_handle = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let result = signal_task(&shutdown).await;
                if result.is_err() {
                    shutdown.trigger();
                }
                result
            })
        };

        tracing::info!(
            pid = std::process::id(),
            interval = %format_duration(config.interval),
            socket = %socket_path(&dir).display(),
            "tandas daemon started"
        );
        enter(DaemonState::Running);

        shutdown.triggered().await;
        enter(DaemonState::ShuttingDown);

        if let Some(watcher) = file_watcher {
            watcher.stop().await;
        }
        if let Some(watcher) = directory_watcher {
            watcher.stop().await;
        }

        let mut first_error = None;
        keep_first(&mut first_error, handle_join("accept_loop", accept_handle.await));
        keep_first(&mut first_error, handle_join("sync_ticker", ticker_handle.await));
        keep_first(&mut first_error, handle_join("signal_handler", signal_handle.await));

        match processor_handle.await {
            Ok(Ok(synchronizer)) => close_store(synchronizer),
            Ok(Err(err)) => keep_first(&mut first_error, Err(err)),
            Err(err) => keep_first(
                &mut first_error,
                Err(DaemonError::Protocol(format!(
                    "sync_processor task join failure: {err}"
                ))),
            ),
        }

        remove_file_quietly(&socket_path(&dir));
        markers::remove(&dir);
        enter(DaemonState::Stopped);

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Initialize and run a daemon on a new multi-threaded runtime, blocking the
/// current thread until it stops.
pub fn start_blocking(config: DaemonConfig) -> Result<(), DaemonError> {
    init_tracing(config.json_logs);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(async move { Daemon::initialize(config).await?.run().await })
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

fn start_file_watcher(dir: &Path, debounce: Duration, sync: SyncHandle) -> Option<FileWatcher> {
    let result = FileWatcher::start(&log_path(dir), debounce, move || {
        let sync = sync.clone();
        tokio::spawn(async move {
            match sync.run(SyncOp::ImportIfChanged).await {
                Ok(SyncOutcome::Imported(report)) => tracing::info!(
                    imported = report.imported,
                    warnings = report.warnings.len(),
                    "watcher-triggered import completed"
                ),
                Ok(_) => tracing::debug!("log unchanged since last sync"),
                Err(DaemonError::ChannelClosed(_)) => {}
                Err(err) => tracing::error!(error = %err, "watcher-triggered import failed"),
            }
        });
    });
    match result {
        Ok(watcher) => Some(watcher),
        Err(err) => {
            tracing::warn!(error = %err, "file watcher unavailable");
            None
        }
    }
}

fn start_directory_watcher(config: &DaemonConfig) -> Option<DirectoryWatcher> {
    let trace_dir = config.trace_dir();
    if !trace_dir.is_dir() {
        tracing::debug!(path = %trace_dir.display(), "no trace directory, skipping trace watcher");
        return None;
    }
    let trace_dir = resolve_dir(&trace_dir);
    let inbox = TraceInbox::new(
        trace_inbox_path(&config.dir),
        resolve_dir(&project_root(&config.dir)),
    );
    let mode = if config.trace_recursive {
        RecursiveMode::Recursive
    } else {
        RecursiveMode::NonRecursive
    };
    match DirectoryWatcher::start(&trace_dir, mode, move |path| inbox.record(&path)) {
        Ok(watcher) => Some(watcher),
        Err(err) => {
            tracing::warn!(path = %trace_dir.display(), error = %err, "trace watcher unavailable");
            None
        }
    }
}

async fn ticker_task(
    sync: SyncHandle,
    interval: Duration,
    shutdown: CancellationToken,
) -> Result<(), DaemonError> {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => match sync.run(SyncOp::Periodic).await {
                Ok(SyncOutcome::Imported(report)) => tracing::info!(
                    imported = report.imported,
                    "log changed since last sync, imported instead of exporting"
                ),
                Ok(SyncOutcome::Exported(report)) if report.written => {
                    tracing::debug!(records = report.records, "periodic export written");
                }
                Ok(_) => {}
                Err(_) if shutdown.is_cancelled() => break,
                Err(err) => tracing::error!(error = %err, "periodic sync failed"),
            }
        }
    }
    Ok(())
}

async fn signal_task(shutdown: &ShutdownHandle) -> Result<(), DaemonError> {
    let mut terminate =
        signal(SignalKind::terminate()).map_err(|e| io_err("SIGTERM handler", e))?;
    let mut interrupt =
        signal(SignalKind::interrupt()).map_err(|e| io_err("SIGINT handler", e))?;

    tokio::select! {
        _ = shutdown.triggered() => {}
        _ = terminate.recv() => {
            tracing::info!("received SIGTERM, shutting down daemon");
            shutdown.trigger();
        }
        _ = interrupt.recv() => {
            tracing::info!("received SIGINT, shutting down daemon");
            shutdown.trigger();
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Refuse to start if a daemon answers on `socket`; remove it only if the
/// connection is refused. Any other connect error, e.g. another user's
/// socket, is returned untouched.
fn reclaim_socket(socket: &Path) -> Result<(), DaemonError> {
    match StdUnixStream::connect(socket) {
        Ok(_) => Err(DaemonError::AlreadyRunning {
            socket: socket.to_path_buf(),
        }),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) if err.kind() != ErrorKind::ConnectionRefused => Err(io_err(socket, err)),
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale daemon socket",
            );
            match fs::remove_file(socket) {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
                Err(err) => Err(io_err(socket, err)),
            }
        }
    }
}

fn close_store(synchronizer: Synchronizer) {
    if let Err(err) = synchronizer.into_store().close() {
        tracing::warn!(error = %err, "failed to close store");
    }
}

fn keep_first(slot: &mut Option<DaemonError>, result: Result<(), DaemonError>) {
    if let Err(err) = result {
        tracing::error!(error = %err, "daemon task failed");
        slot.get_or_insert(err);
    }
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

/// Install the global `tracing` subscriber. `RUST_LOG` overrides the
/// default `info` filter.
pub fn init_tracing(json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt().with_env_filter(filter).with_target(false);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}
