//! `td-daemon`: run and control the tandas sync daemon.
//!
//! # Usage
//!
//! ```text
//! td-daemon [--dir .tandas] start [--interval 5s] [--debounce 500ms] [--json-logs]
//! td-daemon [--dir .tandas] stop
//! td-daemon [--dir .tandas] status
//! td-daemon [--dir .tandas] ping|sync|import
//! td-daemon [--dir .tandas] inbox [--all] [--json]
//! td-daemon [--dir .tandas] list [--status active|flaky|deprecated] [--json]
//! td-daemon [--dir .tandas] flaky [--limit 10] [--json]
//! ```

mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    daemon::StartArgs,
    inbox::InboxArgs,
    records::{FlakyArgs, ListArgs},
};
use tandas_daemon::paths::DEFAULT_DIR;

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "td-daemon",
    version,
    about = "Keep the tandas SQLite cache and JSONL append-log in sync",
    long_about = None,
)]
struct Cli {
    /// The tandas directory (log, cache, socket and markers).
    #[arg(long, global = true, default_value = DEFAULT_DIR)]
    dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the daemon in the foreground until SIGINT/SIGTERM.
    Start(StartArgs),
    /// Send SIGTERM to the running daemon.
    Stop,
    /// Print daemon status as JSON.
    Status,
    /// Check that the daemon answers on its socket.
    Ping,
    /// Ask the daemon to export the cache to the append-log now.
    Sync,
    /// Ask the daemon to rebuild the cache from the append-log now.
    Import,
    /// List trace artifacts queued by the directory watcher.
    Inbox(InboxArgs),
    /// List cached records.
    List(ListArgs),
    /// Show the flakiest records.
    Flaky(FlakyArgs),
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    let dir = cli.dir;
    match cli.command {
        Commands::Start(args) => args.run(dir),
        Commands::Stop => commands::daemon::stop(&dir),
        Commands::Status => commands::daemon::status(&dir),
        Commands::Ping => commands::daemon::ping(&dir),
        Commands::Sync => commands::daemon::sync(&dir),
        Commands::Import => commands::daemon::import(&dir),
        Commands::Inbox(args) => args.run(&dir),
        Commands::List(args) => args.run(&dir),
        Commands::Flaky(args) => args.run(&dir),
    }
}
