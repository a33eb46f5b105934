use std::fs;
use std::path::Path;
use std::process::Command;

use assert_cmd::prelude::*;
use predicates::prelude::*;
use predicates::str::contains;

use tandas_core::types::{Record, RecordStatus, RunOutcome, RunResult};
use tandas_daemon::paths::{database_path, pid_path, trace_inbox_path};
use tandas_sync::Store;
use tempfile::TempDir;

fn td(dir: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_td-daemon"));
    cmd.arg("--dir").arg(dir).env("NO_COLOR", "1");
    cmd
}

fn tandas_dir(root: &TempDir) -> std::path::PathBuf {
    let dir = root.path().join(".tandas");
    fs::create_dir_all(&dir).expect("create tandas dir");
    dir
}

fn run(ts: &str, result: RunOutcome) -> RunResult {
    RunResult {
        ts: ts.to_string(),
        result,
        duration: None,
        trace: None,
    }
}

#[test]
fn version_is_reported() {
    Command::new(env!("CARGO_BIN_EXE_td-daemon"))
        .arg("--version")
        .assert()
        .success()
        .stdout(contains("td-daemon 0.1.0"));
}

#[test]
fn status_reports_not_running() {
    let root = TempDir::new().expect("root");
    let dir = tandas_dir(&root);

    let output = td(&dir).arg("status").output().expect("run status");
    assert!(output.status.success());
    let payload: serde_json::Value = serde_json::from_slice(&output.stdout).expect("status JSON");
    assert_eq!(payload["running"], serde_json::json!(false));
    assert!(payload["socket"].as_str().unwrap().ends_with("td.sock"));
}

#[test]
fn ping_fails_without_daemon() {
    let root = TempDir::new().expect("root");
    let dir = tandas_dir(&root);

    td(&dir)
        .arg("ping")
        .assert()
        .failure()
        .stderr(contains("daemon is not running"));
}

#[test]
fn stop_without_daemon_is_a_no_op() {
    let root = TempDir::new().expect("root");
    let dir = tandas_dir(&root);

    td(&dir)
        .arg("stop")
        .assert()
        .success()
        .stdout(contains("daemon is not running"));
}

#[test]
fn stop_clears_stale_pid_marker() {
    let root = TempDir::new().expect("root");
    let dir = tandas_dir(&root);
    // Above any kernel pid_max, so no such process exists.
    fs::write(pid_path(&dir), "1073741823").unwrap();

    td(&dir)
        .arg("stop")
        .assert()
        .success()
        .stdout(contains("stale PID marker"));
    assert!(!pid_path(&dir).exists());
}

#[test]
fn start_rejects_invalid_interval() {
    let root = TempDir::new().expect("root");
    let dir = tandas_dir(&root);

    td(&dir)
        .args(["start", "--interval", "soon"])
        .assert()
        .failure()
        .stderr(contains("invalid value 'soon'"));
    assert!(!database_path(&dir).exists());
}

#[test]
fn inbox_lists_pending_entries() {
    let root = TempDir::new().expect("root");
    let dir = tandas_dir(&root);
    fs::write(
        trace_inbox_path(&dir),
        concat!(
            "{\"path\":\"test-results/a/trace.zip\",\"ts\":\"2026-01-02T03:04:05Z\",\"source\":\"watcher\",\"status\":\"pending\"}\n",
            "not json\n",
            "{\"path\":\"test-results/b/trace.zip\",\"ts\":\"2026-01-02T03:05:00Z\",\"source\":\"watcher\",\"status\":\"linked\"}\n",
        ),
    )
    .unwrap();

    td(&dir)
        .arg("inbox")
        .assert()
        .success()
        .stdout(contains("test-results/a/trace.zip"))
        .stdout(contains("test-results/b/trace.zip").not());

    td(&dir)
        .args(["inbox", "--all"])
        .assert()
        .success()
        .stdout(contains("test-results/b/trace.zip"));

    let output = td(&dir).args(["inbox", "--json"]).output().unwrap();
    assert!(output.status.success());
    let entries: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(entries.as_array().map(Vec::len), Some(1));
}

#[test]
fn empty_inbox_says_so() {
    let root = TempDir::new().expect("root");
    let dir = tandas_dir(&root);

    td(&dir)
        .arg("inbox")
        .assert()
        .success()
        .stdout(contains("No pending traces."));
}

#[test]
fn list_and_flaky_read_the_cache() {
    let root = TempDir::new().expect("root");
    let dir = tandas_dir(&root);
    {
        let store = Store::open(database_path(&dir)).unwrap();
        let mut stable = Record::new("td-stable", "always green");
        stable.run_history = vec![run("2026-01-01T09:00:00", RunOutcome::Pass)];
        let mut flaky = Record::new("td-flaky", "sometimes red");
        flaky.status = RecordStatus::Flaky;
        flaky.run_history = vec![
            run("2026-01-01T09:00:00", RunOutcome::Fail),
            run("2026-01-01T10:00:00", RunOutcome::Pass),
        ];
        store.upsert(&stable).unwrap();
        store.upsert(&flaky).unwrap();
        store.close().unwrap();
    }

    td(&dir)
        .arg("list")
        .assert()
        .success()
        .stdout(contains("td-stable"))
        .stdout(contains("td-flaky"));

    td(&dir)
        .args(["list", "--status", "flaky"])
        .assert()
        .success()
        .stdout(contains("td-flaky"))
        .stdout(contains("td-stable").not());

    let output = td(&dir).args(["flaky", "--json"]).output().unwrap();
    assert!(output.status.success());
    let flakiest: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(
        flakiest,
        serde_json::json!([{
            "id": "td-flaky",
            "flakiness_score": 0.5,
            "last_run_at": "2026-01-01T10:00:00",
            "last_run_result": "pass",
        }])
    );

    td(&dir)
        .args(["list", "--status", "retired"])
        .assert()
        .failure()
        .stderr(contains("unknown status 'retired'"));
}

#[test]
fn list_without_cache_fails() {
    let root = TempDir::new().expect("root");
    let dir = tandas_dir(&root);

    td(&dir)
        .arg("list")
        .assert()
        .failure()
        .stderr(contains("no cache"));
    assert!(!database_path(&dir).exists());
}
