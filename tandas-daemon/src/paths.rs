use std::path::{Path, PathBuf};

pub const DEFAULT_DIR: &str = ".tandas";

pub const SOCKET_FILE: &str = "td.sock";
pub const PID_FILE: &str = "daemon.pid";
pub const LOCK_FILE: &str = "daemon.lock";
pub const DATABASE_FILE: &str = "db.sqlite";
pub const LOG_FILE: &str = "issues.jsonl";
pub const TRACE_INBOX_FILE: &str = "trace_inbox.jsonl";
pub const CONFIG_FILE: &str = "config.yaml";

/// Directory scanned for new trace artifacts, relative to the project root.
pub const TRACE_DIR: &str = "test-results";

pub fn socket_path(dir: &Path) -> PathBuf {
    dir.join(SOCKET_FILE)
}

pub fn pid_path(dir: &Path) -> PathBuf {
    dir.join(PID_FILE)
}

pub fn lock_path(dir: &Path) -> PathBuf {
    dir.join(LOCK_FILE)
}

pub fn database_path(dir: &Path) -> PathBuf {
    dir.join(DATABASE_FILE)
}

pub fn log_path(dir: &Path) -> PathBuf {
    dir.join(LOG_FILE)
}

pub fn trace_inbox_path(dir: &Path) -> PathBuf {
    dir.join(TRACE_INBOX_FILE)
}

pub fn config_path(dir: &Path) -> PathBuf {
    dir.join(CONFIG_FILE)
}

/// The project root is the parent of the tandas directory.
pub fn project_root(dir: &Path) -> PathBuf {
    match dir.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

pub fn default_trace_dir(dir: &Path) -> PathBuf {
    project_root(dir).join(TRACE_DIR)
}
