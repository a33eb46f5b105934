//! `td-daemon list|flaky`: read-only views of the SQLite cache.
//!
//! The cache runs in WAL mode, so these commands can read it while the
//! daemon is running.

use std::path::Path;

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use tandas_core::types::{Record, RecordStats, RecordStatus};
use tandas_daemon::paths::database_path;
use tandas_sync::Store;

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Only records with this status (active, flaky, deprecated).
    #[arg(long)]
    pub status: Option<RecordStatus>,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct FlakyArgs {
    /// Maximum number of records to show.
    #[arg(long, default_value_t = 10)]
    pub limit: usize,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Tabled)]
struct RecordRow {
    #[tabled(rename = "id")]
    id: String,
    #[tabled(rename = "title")]
    title: String,
    #[tabled(rename = "status")]
    status: String,
    #[tabled(rename = "flakiness")]
    flakiness: String,
    #[tabled(rename = "last run")]
    last_run: String,
}

#[derive(Tabled)]
struct FlakyRow {
    #[tabled(rename = "id")]
    id: String,
    #[tabled(rename = "flakiness")]
    flakiness: String,
    #[tabled(rename = "last run")]
    last_run: String,
}

#[derive(Serialize)]
struct FlakyJson {
    id: String,
    flakiness_score: f64,
    last_run_at: Option<String>,
    last_run_result: Option<String>,
}

fn open_cache(dir: &Path) -> Result<Store> {
    let path = database_path(dir);
    if !path.exists() {
        bail!(
            "no cache at {}; start the daemon first (`td-daemon start`)",
            path.display()
        );
    }
    Store::open(&path).with_context(|| format!("failed to open cache {}", path.display()))
}

impl ListArgs {
    pub fn run(self, dir: &Path) -> Result<()> {
        let store = open_cache(dir)?;
        let records = match self.status {
            Some(status) => store.list_by_status(status),
            None => store.get_all(),
        }
        .context("failed to read records")?;

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&records).context("failed to serialize records")?
            );
            return Ok(());
        }

        if records.is_empty() {
            println!("No records.");
            return Ok(());
        }
        println!("{} record(s)", records.len().to_string().bold());
        let mut table = Table::new(records.iter().map(record_row).collect::<Vec<_>>());
        table.with(Style::rounded());
        println!("{table}");
        Ok(())
    }
}

impl FlakyArgs {
    pub fn run(self, dir: &Path) -> Result<()> {
        let store = open_cache(dir)?;
        let flakiest = store
            .flakiest(self.limit)
            .context("failed to read flakiness scores")?;

        if self.json {
            let payload: Vec<FlakyJson> = flakiest
                .into_iter()
                .map(|(id, stats)| FlakyJson {
                    id: id.0,
                    flakiness_score: stats.flakiness_score,
                    last_run_at: stats.last_run_at,
                    last_run_result: stats.last_run_result.map(String::from),
                })
                .collect();
            println!(
                "{}",
                serde_json::to_string_pretty(&payload).context("failed to serialize records")?
            );
            return Ok(());
        }

        if flakiest.is_empty() {
            println!("{}", "No flaky records.".green());
            return Ok(());
        }
        let rows: Vec<FlakyRow> = flakiest
            .into_iter()
            .map(|(id, stats)| FlakyRow {
                id: id.0,
                flakiness: format_score(stats.flakiness_score),
                last_run: last_run_label(&stats),
            })
            .collect();
        let mut table = Table::new(rows);
        table.with(Style::rounded());
        println!("{table}");
        Ok(())
    }
}

fn record_row(record: &Record) -> RecordRow {
    let stats = record.stats();
    RecordRow {
        id: record.id.to_string(),
        title: record.title.clone(),
        status: record.status.to_string(),
        flakiness: format_score(stats.flakiness_score),
        last_run: last_run_label(&stats),
    }
}

fn format_score(score: f64) -> String {
    format!("{:.0}%", score * 100.0)
}

fn last_run_label(stats: &RecordStats) -> String {
    match (&stats.last_run_result, &stats.last_run_at) {
        (Some(result), Some(at)) if !at.is_empty() => format!("{result} at {at}"),
        (Some(result), _) => result.to_string(),
        _ => "never".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandas_core::types::RunOutcome;

    #[test]
    fn scores_render_as_percentages() {
        assert_eq!(format_score(0.0), "0%");
        assert_eq!(format_score(0.5), "50%");
        assert_eq!(format_score(1.0), "100%");
    }

    #[test]
    fn last_run_labels() {
        let never = RecordStats {
            flakiness_score: 0.0,
            last_run_at: None,
            last_run_result: None,
        };
        assert_eq!(last_run_label(&never), "never");

        let failed = RecordStats {
            flakiness_score: 1.0,
            last_run_at: Some("2026-01-02T10:00:00".to_string()),
            last_run_result: Some(RunOutcome::Fail),
        };
        assert_eq!(last_run_label(&failed), "fail at 2026-01-02T10:00:00");
    }

    #[test]
    fn missing_cache_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = open_cache(dir.path()).unwrap_err();
        assert!(err.to_string().contains("no cache"));
    }
}
