//! Daemon settings.
//!
//! Defaults can be overridden by an optional `daemon:` section of
//! `<dir>/config.yaml`. The file is shared with the rest of the project, so
//! every other top-level key is ignored. Durations use Go-style strings
//! (`"500ms"`, `"5s"`, `"1m30s"`).

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{io_err, DaemonError};
use crate::paths::{config_path, default_trace_dir, project_root, DEFAULT_DIR};

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);
pub const DEFAULT_MAX_CONNECTIONS: usize = 64;
pub const DEFAULT_CLIENT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq)]
pub struct DaemonConfig {
    /// The tandas directory holding the log, cache, socket and markers.
    pub dir: PathBuf,
    /// Period of the background sync tick.
    pub interval: Duration,
    /// Quiet period before a burst of log edits triggers one import.
    pub debounce: Duration,
    /// Trace artifact directory; `None` means `<project root>/test-results`.
    pub trace_dir: Option<PathBuf>,
    pub trace_recursive: bool,
    pub max_connections: usize,
    pub client_idle_timeout: Duration,
    pub json_logs: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self::for_dir(DEFAULT_DIR)
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    daemon: Option<DaemonSection>,
}

#[derive(Debug, Default, Deserialize)]
struct DaemonSection {
    interval: Option<String>,
    debounce: Option<String>,
    trace_dir: Option<PathBuf>,
    trace_recursive: Option<bool>,
    max_connections: Option<usize>,
    client_idle_timeout: Option<String>,
    json_logs: Option<bool>,
}

impl DaemonConfig {
    /// Built-in defaults for `dir`, without reading any file.
    pub fn for_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            interval: DEFAULT_INTERVAL,
            debounce: DEFAULT_DEBOUNCE,
            trace_dir: None,
            trace_recursive: false,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            client_idle_timeout: DEFAULT_CLIENT_IDLE_TIMEOUT,
            json_logs: false,
        }
    }

    /// Defaults for `dir`, overlaid with `<dir>/config.yaml` when present.
    pub fn load(dir: impl Into<PathBuf>) -> Result<Self, DaemonError> {
        let mut config = Self::for_dir(dir);
        let path = config_path(&config.dir);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(config),
            Err(err) => return Err(io_err(&path, err)),
        };
        if text.trim().is_empty() {
            return Ok(config);
        }

        let file: ConfigFile = serde_yaml::from_str(&text)?;
        if let Some(section) = file.daemon {
            config.apply(section)?;
        }
        config.validate()?;
        tracing::debug!(path = %path.display(), "loaded daemon config");
        Ok(config)
    }

    fn apply(&mut self, section: DaemonSection) -> Result<(), DaemonError> {
        if let Some(interval) = section.interval {
            self.interval = parse_duration(&interval)?;
        }
        if let Some(debounce) = section.debounce {
            self.debounce = parse_duration(&debounce)?;
        }
        if let Some(timeout) = section.client_idle_timeout {
            self.client_idle_timeout = parse_duration(&timeout)?;
        }
        if let Some(trace_dir) = section.trace_dir {
            self.trace_dir = Some(if trace_dir.is_relative() {
                project_root(&self.dir).join(trace_dir)
            } else {
                trace_dir
            });
        }
        if let Some(recursive) = section.trace_recursive {
            self.trace_recursive = recursive;
        }
        if let Some(max) = section.max_connections {
            self.max_connections = max;
        }
        if let Some(json_logs) = section.json_logs {
            self.json_logs = json_logs;
        }
        Ok(())
    }

    /// Reject values the runtime cannot honour.
    pub fn validate(&self) -> Result<(), DaemonError> {
        if self.interval.is_zero() {
            return Err(DaemonError::Config("interval must be positive".to_string()));
        }
        if self.debounce.is_zero() {
            return Err(DaemonError::Config("debounce must be positive".to_string()));
        }
        if self.max_connections == 0 {
            return Err(DaemonError::Config(
                "max_connections must be at least 1".to_string(),
            ));
        }
        if self.client_idle_timeout.is_zero() {
            return Err(DaemonError::Config(
                "client_idle_timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn trace_dir(&self) -> PathBuf {
        self.trace_dir
            .clone()
            .unwrap_or_else(|| default_trace_dir(&self.dir))
    }
}

// ---------------------------------------------------------------------------
// Durations
// ---------------------------------------------------------------------------

/// Parse a Go-style duration: one or more `<number><unit>` pairs with units
/// `ns`, `us`/`µs`, `ms`, `s`, `m`, `h`. A bare `0` is accepted.
pub fn parse_duration(text: &str) -> Result<Duration, DaemonError> {
    let input = text.trim();
    let invalid = |why: &str| DaemonError::Config(format!("invalid duration '{text}': {why}"));

    if input.is_empty() {
        return Err(invalid("empty"));
    }
    if input == "0" {
        return Ok(Duration::ZERO);
    }

    let mut nanos = 0f64;
    let mut rest = input;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_len == 0 {
            return Err(invalid("expected a number"));
        }
        let value: f64 = rest[..number_len]
            .parse()
            .map_err(|_| invalid("malformed number"))?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            "" => return Err(invalid("missing unit")),
            _ => return Err(invalid("unknown unit")),
        };
        nanos += value * scale;
        rest = &rest[unit_len..];
    }

    if !nanos.is_finite() || nanos > u64::MAX as f64 {
        return Err(invalid("out of range"));
    }
    Ok(Duration::from_nanos(nanos.round() as u64))
}

/// Render a duration the way Go's `time.Duration` prints it
/// (`500ms`, `5s`, `2m0s`, `1h30m0s`).
pub fn format_duration(duration: Duration) -> String {
    let nanos = duration.as_nanos();
    if nanos == 0 {
        return "0s".to_string();
    }
    if nanos < 1_000 {
        return format!("{nanos}ns");
    }
    if nanos < 1_000_000 {
        return format!("{}µs", decimal(nanos, 1_000));
    }
    if nanos < 1_000_000_000 {
        return format!("{}ms", decimal(nanos, 1_000_000));
    }

    let secs = duration.as_secs();
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let sub_minute = u128::from(secs % 60) * 1_000_000_000 + u128::from(duration.subsec_nanos());

    let mut out = String::new();
    if hours > 0 {
        let _ = write!(out, "{hours}h");
    }
    if hours > 0 || minutes > 0 {
        let _ = write!(out, "{minutes}m");
    }
    let _ = write!(out, "{}s", decimal(sub_minute, 1_000_000_000));
    out
}

fn decimal(value: u128, unit: u128) -> String {
    let whole = value / unit;
    let frac = value % unit;
    if frac == 0 {
        return whole.to_string();
    }
    let width = unit.to_string().len() - 1;
    let digits = format!("{frac:0width$}");
    format!("{whole}.{}", digits.trim_end_matches('0'))
}

pub(crate) fn resolve_dir(dir: &Path) -> PathBuf {
    std::fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf())
}
