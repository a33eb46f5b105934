//! Pending-trace inbox: an append-only JSONL queue of trace artifacts
//! discovered by the directory watcher, awaiting manual linking.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{io_err, DaemonError};

pub const SOURCE_WATCHER: &str = "watcher";
pub const STATUS_PENDING: &str = "pending";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTrace {
    /// Artifact path relative to the project root when possible.
    pub path: String,
    /// UTC, RFC 3339, second precision.
    pub ts: String,
    pub source: String,
    pub status: String,
}

impl PendingTrace {
    pub fn discovered(project_root: &Path, artifact: &Path) -> Self {
        Self {
            path: relative_to(project_root, artifact),
            ts: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            source: SOURCE_WATCHER.to_string(),
            status: STATUS_PENDING.to_string(),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == STATUS_PENDING
    }
}

fn relative_to(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .into_owned()
}

/// Appends watcher discoveries to the inbox file.
#[derive(Debug, Clone)]
pub struct TraceInbox {
    path: PathBuf,
    project_root: PathBuf,
}

impl TraceInbox {
    pub fn new(path: impl Into<PathBuf>, project_root: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            project_root: project_root.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry. Failures are returned; [`TraceInbox::record`] is the
    /// best-effort wrapper the watcher uses.
    pub fn append(&self, artifact: &Path) -> Result<PendingTrace, DaemonError> {
        let entry = PendingTrace::discovered(&self.project_root, artifact);
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| io_err(&self.path, e))?;
        file.write_all(line.as_bytes())
            .map_err(|e| io_err(&self.path, e))?;
        Ok(entry)
    }

    /// Whether `artifact` lives beside the inbox. Recording those would feed
    /// the watcher its own writes.
    pub fn is_own_file(&self, artifact: &Path) -> bool {
        self.path
            .parent()
            .is_some_and(|dir| !dir.as_os_str().is_empty() && artifact.starts_with(dir))
    }

    /// Append one entry, logging instead of failing. Files in the inbox's own
    /// directory are ignored.
    pub fn record(&self, artifact: &Path) {
        if self.is_own_file(artifact) {
            tracing::trace!(artifact = %artifact.display(), "ignoring tandas-internal file");
            return;
        }
        match self.append(artifact) {
            Ok(entry) => tracing::info!(path = %entry.path, "queued trace for linking"),
            Err(err) => tracing::warn!(
                artifact = %artifact.display(),
                error = %err,
                "failed to append to trace inbox"
            ),
        }
    }
}

/// Every inbox entry in file order. Malformed lines are skipped with a warning.
pub fn read_all(path: &Path) -> Result<Vec<PendingTrace>, DaemonError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(io_err(path, err)),
    };

    let mut entries = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| io_err(path, e))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(entry) => entries.push(entry),
            Err(err) => {
                tracing::warn!(line = idx + 1, error = %err, "skipping malformed inbox entry");
            }
        }
    }
    Ok(entries)
}
