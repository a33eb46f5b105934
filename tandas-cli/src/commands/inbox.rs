//! `td-daemon inbox`: trace artifacts awaiting linking.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use tandas_daemon::inbox::{self, PendingTrace};
use tandas_daemon::paths::trace_inbox_path;

#[derive(Args, Debug)]
pub struct InboxArgs {
    /// Include entries that are no longer pending.
    #[arg(long)]
    pub all: bool,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Tabled)]
struct InboxRow {
    #[tabled(rename = "trace")]
    path: String,
    #[tabled(rename = "discovered")]
    ts: String,
    #[tabled(rename = "age")]
    age: String,
    #[tabled(rename = "status")]
    status: String,
}

impl InboxArgs {
    pub fn run(self, dir: &Path) -> Result<()> {
        let path = trace_inbox_path(dir);
        let entries = select(
            inbox::read_all(&path)
                .with_context(|| format!("failed to read trace inbox {}", path.display()))?,
            self.all,
        );

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&entries).context("failed to serialize inbox JSON")?
            );
            return Ok(());
        }

        if entries.is_empty() {
            println!("No pending traces.");
            return Ok(());
        }
        println!("{} queued trace(s)", entries.len().to_string().bold());
        let rows: Vec<InboxRow> = entries
            .into_iter()
            .map(|entry| InboxRow {
                age: age(&entry.ts, Utc::now()),
                path: entry.path,
                ts: entry.ts,
                status: entry.status,
            })
            .collect();
        let mut table = Table::new(rows);
        table.with(Style::rounded());
        println!("{table}");
        Ok(())
    }
}

fn select(entries: Vec<PendingTrace>, all: bool) -> Vec<PendingTrace> {
    if all {
        entries
    } else {
        entries.into_iter().filter(PendingTrace::is_pending).collect()
    }
}

/// Coarse age of an RFC 3339 timestamp, `?` when it does not parse.
fn age(ts: &str, now: DateTime<Utc>) -> String {
    let Ok(at) = DateTime::parse_from_rfc3339(ts) else {
        return "?".to_string();
    };
    let seconds = now.signed_duration_since(at).num_seconds().max(0);
    match seconds {
        s if s < 60 => format!("{s}s"),
        s if s < 60 * 60 => format!("{}m", s / 60),
        s if s < 60 * 60 * 24 => format!("{}h", s / (60 * 60)),
        s => format!("{}d", s / (60 * 60 * 24)),
    }
}
