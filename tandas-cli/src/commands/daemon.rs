//! `td-daemon start|stop|status|ping|sync|import`: daemon lifecycle and RPC.

use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde_json::{json, Value};

use tandas_daemon::paths::pid_path;
use tandas_daemon::{
    markers, parse_duration, request_import, request_ping, request_status, request_sync,
    start_blocking, DaemonConfig, DaemonError,
};

/// How long `stop` waits for the daemon to remove its markers.
const STOP_WAIT: Duration = Duration::from_secs(5);

#[derive(Args, Debug)]
pub struct StartArgs {
    /// Background sync period, e.g. `5s` or `1m30s`.
    #[arg(long, value_parser = duration_arg)]
    pub interval: Option<Duration>,

    /// Quiet period before a burst of log edits is imported, e.g. `500ms`.
    #[arg(long, value_parser = duration_arg)]
    pub debounce: Option<Duration>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub json_logs: bool,
}

impl StartArgs {
    pub fn run(self, dir: PathBuf) -> Result<()> {
        let mut config = DaemonConfig::load(&dir)
            .with_context(|| format!("failed to load daemon config for {}", dir.display()))?;
        if let Some(interval) = self.interval {
            config.interval = interval;
        }
        if let Some(debounce) = self.debounce {
            config.debounce = debounce;
        }
        config.json_logs |= self.json_logs;

        start_blocking(config).context("daemon exited with error")
    }
}

fn duration_arg(text: &str) -> Result<Duration, String> {
    parse_duration(text).map_err(|err| err.to_string())
}

pub fn stop(dir: &Path) -> Result<()> {
    let Some(pid) = markers::read_pid(dir).context("failed to read daemon PID marker")? else {
        println!("daemon is not running");
        return Ok(());
    };

    match kill(to_pid(pid)?, Signal::SIGTERM) {
        Ok(()) => {}
        Err(Errno::ESRCH) => {
            println!("daemon is not running (stale PID marker for {pid})");
            markers::remove(dir);
            return Ok(());
        }
        Err(err) => return Err(err).with_context(|| format!("failed to signal daemon pid {pid}")),
    }

    let deadline = Instant::now() + STOP_WAIT;
    while Instant::now() < deadline {
        if !pid_path(dir).exists() {
            println!("daemon stopped (pid {pid})");
            return Ok(());
        }
        sleep(Duration::from_millis(50));
    }
    println!("daemon stop requested (pid {pid})");
    Ok(())
}

pub fn status(dir: &Path) -> Result<()> {
    let payload = match request_status(dir) {
        Ok(status) => status,
        Err(DaemonError::DaemonNotRunning { socket }) => offline_status(dir, &socket)?,
        Err(err) => return Err(err).context("failed to query daemon status"),
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&payload).context("failed to render daemon status JSON")?
    );
    Ok(())
}

/// Status when nothing answers on the socket: a live PID from the marker
/// means the daemon is up but not serving.
fn offline_status(dir: &Path, socket: &Path) -> Result<Value> {
    let pid = markers::read_pid(dir).context("failed to read daemon PID marker")?;
    let alive = match pid {
        Some(pid) => process_alive(to_pid(pid)?),
        None => false,
    };
    let mut payload = json!({
        "running": alive,
        "socket": socket.display().to_string(),
    });
    if alive {
        payload["pid"] = json!(pid);
        payload["responding"] = json!(false);
    }
    Ok(payload)
}

fn process_alive(pid: Pid) -> bool {
    // EPERM: the process exists but belongs to someone else.
    matches!(kill(pid, None), Ok(()) | Err(Errno::EPERM))
}

fn to_pid(pid: u32) -> Result<Pid> {
    match i32::try_from(pid) {
        Ok(raw) if raw > 0 => Ok(Pid::from_raw(raw)),
        _ => bail!("invalid daemon pid {pid}"),
    }
}

pub fn ping(dir: &Path) -> Result<()> {
    let reply = request_ping(dir).context("ping failed")?;
    println!("{}", render(&reply).green());
    Ok(())
}

pub fn sync(dir: &Path) -> Result<()> {
    let reply = request_sync(dir).context("sync request failed")?;
    println!("{}", render(&reply));
    Ok(())
}

pub fn import(dir: &Path) -> Result<()> {
    let reply = request_import(dir).context("import request failed")?;
    println!("{}", render(&reply));
    Ok(())
}

fn render(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
