//! PID and lock markers written next to the socket while the daemon runs.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{io_err, DaemonError};
use crate::paths::{lock_path, pid_path};

/// Contents of the lock marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub parent_pid: u32,
    pub database: PathBuf,
    pub version: String,
    pub started_at: DateTime<Utc>,
}

impl LockInfo {
    pub fn current(database: impl Into<PathBuf>) -> Self {
        Self {
            pid: std::process::id(),
            parent_pid: parent_pid(),
            database: database.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            started_at: Utc::now(),
        }
    }
}

#[cfg(unix)]
fn parent_pid() -> u32 {
    std::os::unix::process::parent_id()
}

#[cfg(not(unix))]
fn parent_pid() -> u32 {
    0
}

/// Write the PID marker, then the lock marker. If the lock marker cannot be
/// written the PID marker is removed again.
pub fn write(dir: &Path, lock: &LockInfo) -> Result<(), DaemonError> {
    let pid_file = pid_path(dir);
    fs::write(&pid_file, lock.pid.to_string()).map_err(|e| io_err(&pid_file, e))?;

    let lock_file = lock_path(dir);
    let written = serde_json::to_string_pretty(lock)
        .map_err(DaemonError::from)
        .and_then(|body| fs::write(&lock_file, body).map_err(|e| io_err(&lock_file, e)));
    if let Err(err) = written {
        remove_file_quietly(&pid_file);
        return Err(err);
    }
    Ok(())
}

/// Remove both markers. Missing files are fine.
pub fn remove(dir: &Path) {
    remove_file_quietly(&pid_path(dir));
    remove_file_quietly(&lock_path(dir));
}

/// The PID recorded in the PID marker, if it exists.
pub fn read_pid(dir: &Path) -> Result<Option<u32>, DaemonError> {
    let path = pid_path(dir);
    let text = match fs::read_to_string(&path) {
        Ok(text) => text,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(io_err(&path, err)),
    };
    text.trim()
        .parse()
        .map(Some)
        .map_err(|_| DaemonError::Protocol(format!("invalid PID file {}", path.display())))
}

pub fn read_lock(dir: &Path) -> Result<Option<LockInfo>, DaemonError> {
    let path = lock_path(dir);
    match fs::read_to_string(&path) {
        Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(io_err(&path, err)),
    }
}

pub(crate) fn remove_file_quietly(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "failed to remove file");
        }
    }
}
