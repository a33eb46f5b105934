//! Filesystem watchers.
//!
//! [`FileWatcher`] follows one file and coalesces bursts of edits into a
//! single callback after a quiet period. [`DirectoryWatcher`] reports every
//! create-or-write event in a directory as it happens.
//!
//! Both watch a directory rather than a file: inotify and friends cannot
//! watch a file that does not exist yet, and editors often replace files by
//! renaming over them.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::event::{ModifyKind, RenameMode};
use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{io_err, DaemonError};

type EventRx = mpsc::UnboundedReceiver<notify::Result<Event>>;

// ---------------------------------------------------------------------------
// Shared plumbing
// ---------------------------------------------------------------------------

struct WatchHandle {
    watcher: RecommendedWatcher,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl WatchHandle {
    async fn stop(self, label: &'static str) {
        self.cancel.cancel();
        // Dropping the watcher closes the event channel.
        drop(self.watcher);
        if let Err(err) = self.task.await {
            tracing::warn!(watcher = label, error = %err, "watcher task failed");
        }
    }
}

fn watch_dir(dir: &Path, mode: RecursiveMode) -> Result<(RecommendedWatcher, EventRx), DaemonError> {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let mut watcher = recommended_watcher(move |event| {
        let _ = event_tx.send(event);
    })?;
    watcher.watch(dir, mode)?;
    Ok((watcher, event_rx))
}

fn is_create_or_write(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_)
            | EventKind::Modify(ModifyKind::Any)
            | EventKind::Modify(ModifyKind::Data(_))
            | EventKind::Modify(ModifyKind::Name(
                RenameMode::To | RenameMode::Both | RenameMode::Any
            ))
    )
}

// ---------------------------------------------------------------------------
// FileWatcher
// ---------------------------------------------------------------------------

/// Debounced watcher for a single file.
pub struct FileWatcher {
    handle: WatchHandle,
}

impl FileWatcher {
    /// Start watching `target`. Must be called from within a tokio runtime.
    ///
    /// `callback` runs on the watcher task; it should hand work off rather
    /// than block.
    pub fn start<F>(target: &Path, debounce: Duration, callback: F) -> Result<Self, DaemonError>
    where
        F: Fn() + Send + 'static,
    {
        let file_name = target
            .file_name()
            .map(|name| name.to_os_string())
            .ok_or_else(|| {
                io_err(
                    target,
                    std::io::Error::new(std::io::ErrorKind::InvalidInput, "no file name"),
                )
            })?;
        let dir = match target.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let (watcher, events) = watch_dir(&dir, RecursiveMode::NonRecursive)?;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(debounce_loop(
            events,
            file_name,
            debounce,
            callback,
            cancel.clone(),
        ));
        tracing::debug!(path = %target.display(), "watching file");
        Ok(Self {
            handle: WatchHandle {
                watcher,
                cancel,
                task,
            },
        })
    }

    /// Cancel any pending debounce timer and wait for the event loop to exit.
    pub async fn stop(self) {
        self.handle.stop("file").await;
    }
}

async fn debounce_loop<F>(
    mut events: EventRx,
    file_name: OsString,
    window: Duration,
    callback: F,
    cancel: CancellationToken,
) where
    F: Fn(),
{
    let timer = tokio::time::sleep(window);
    tokio::pin!(timer);
    let mut armed = false;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            () = &mut timer, if armed => {
                armed = false;
                callback();
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    Ok(event) if is_create_or_write(&event.kind)
                        && touches(&event, &file_name) =>
                    {
                        timer.as_mut().reset(Instant::now() + window);
                        armed = true;
                    }
                    Ok(_) => {}
                    Err(err) => tracing::warn!(error = %err, "file watcher error"),
                }
            }
        }
    }
}

fn touches(event: &Event, file_name: &OsString) -> bool {
    event
        .paths
        .iter()
        .any(|path| path.file_name() == Some(file_name.as_os_str()))
}

// ---------------------------------------------------------------------------
// DirectoryWatcher
// ---------------------------------------------------------------------------

/// Undebounced watcher reporting every created or written file in a directory.
pub struct DirectoryWatcher {
    handle: WatchHandle,
}

impl DirectoryWatcher {
    pub fn start<F>(dir: &Path, mode: RecursiveMode, callback: F) -> Result<Self, DaemonError>
    where
        F: Fn(PathBuf) + Send + 'static,
    {
        let (watcher, events) = watch_dir(dir, mode)?;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(forward_loop(events, callback, cancel.clone()));
        tracing::debug!(path = %dir.display(), recursive = matches!(mode, RecursiveMode::Recursive), "watching directory");
        Ok(Self {
            handle: WatchHandle {
                watcher,
                cancel,
                task,
            },
        })
    }

    pub async fn stop(self) {
        self.handle.stop("directory").await;
    }
}

async fn forward_loop<F>(mut events: EventRx, callback: F, cancel: CancellationToken)
where
    F: Fn(PathBuf),
{
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    Ok(event) if is_create_or_write(&event.kind) => {
                        for path in event.paths {
                            if !path.is_dir() {
                                callback(path);
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(err) => tracing::warn!(error = %err, "directory watcher error"),
                }
            }
        }
    }
}
