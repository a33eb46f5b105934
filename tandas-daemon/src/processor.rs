//! The sync processor: the one task that owns the [`Synchronizer`].
//!
//! Every import and export, whatever triggered it, is queued here and runs to
//! completion before the next one starts.

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use tandas_sync::{ExportReport, ImportReport, SyncError, Synchronizer};

use crate::error::DaemonError;

pub(crate) const SYNC_QUEUE_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOp {
    /// Rebuild the cache from the append-log.
    Import,
    /// Rewrite the append-log from the cache.
    Export,
    /// Import only if the log changed since the last sync.
    ImportIfChanged,
    /// Background tick: import if the log changed, otherwise export.
    Periodic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Imported(ImportReport),
    Exported(ExportReport),
    Skipped,
}

struct SyncJob {
    op: SyncOp,
    respond_to: oneshot::Sender<Result<SyncOutcome, SyncError>>,
}

/// Cloneable handle for queueing work on the processor.
#[derive(Clone)]
pub(crate) struct SyncHandle {
    jobs: mpsc::Sender<SyncJob>,
}

impl SyncHandle {
    pub(crate) async fn run(&self, op: SyncOp) -> Result<SyncOutcome, DaemonError> {
        let (tx, rx) = oneshot::channel();
        self.jobs
            .send(SyncJob { op, respond_to: tx })
            .await
            .map_err(|_| DaemonError::ChannelClosed("sync queue"))?;
        let outcome = rx
            .await
            .map_err(|_| DaemonError::ChannelClosed("sync response"))?;
        Ok(outcome?)
    }
}

/// Spawn the processor. The task hands the synchronizer back when it stops,
/// and its stopping, for whatever reason, shuts the daemon down.
pub(crate) fn spawn(
    synchronizer: Synchronizer,
    shutdown: CancellationToken,
) -> (SyncHandle, JoinHandle<Result<Synchronizer, DaemonError>>) {
    let (tx, rx) = mpsc::channel(SYNC_QUEUE_DEPTH);
    let task = tokio::spawn(async move {
        let result = processor_task(synchronizer, rx, shutdown.clone()).await;
        if let Err(err) = &result {
            tracing::error!(error = %err, "sync processor stopped");
        }
        shutdown.cancel();
        result
    });
    (SyncHandle { jobs: tx }, task)
}

async fn processor_task(
    mut synchronizer: Synchronizer,
    mut jobs: mpsc::Receiver<SyncJob>,
    shutdown: CancellationToken,
) -> Result<Synchronizer, DaemonError> {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            job = jobs.recv() => {
                let Some(job) = job else { break };
                let op = job.op;
                let (returned, outcome) = tokio::task::spawn_blocking(move || {
                    let outcome = apply(&mut synchronizer, op);
                    (synchronizer, outcome)
                })
                .await
                .map_err(|err| DaemonError::Protocol(format!("sync task join error: {err}")))?;
                synchronizer = returned;

                if let Err(err) = &outcome {
                    tracing::warn!(op = ?op, error = %err, "sync operation failed");
                }
                let _ = job.respond_to.send(outcome);
            }
        }
    }
    Ok(synchronizer)
}

fn apply(synchronizer: &mut Synchronizer, op: SyncOp) -> Result<SyncOutcome, SyncError> {
    match op {
        SyncOp::Import => synchronizer.import_from_log().map(SyncOutcome::Imported),
        SyncOp::Export => synchronizer.export_to_log().map(SyncOutcome::Exported),
        SyncOp::ImportIfChanged if synchronizer.needs_sync() => {
            synchronizer.import_from_log().map(SyncOutcome::Imported)
        }
        SyncOp::ImportIfChanged => Ok(SyncOutcome::Skipped),
        // Never overwrite edits that have not been imported yet.
        SyncOp::Periodic if synchronizer.needs_sync() => {
            synchronizer.import_from_log().map(SyncOutcome::Imported)
        }
        SyncOp::Periodic => synchronizer.export_to_log().map(SyncOutcome::Exported),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandas_core::types::Record;
    use tandas_sync::Store;
    use tempfile::TempDir;

    fn synchronizer(dir: &TempDir) -> Synchronizer {
        let store = Store::open(dir.path().join("db.sqlite")).unwrap();
        Synchronizer::new(store, dir.path().join("issues.jsonl"))
    }

    #[tokio::test]
    async fn periodic_exports_when_log_is_current() {
        let dir = TempDir::new().unwrap();
        let sync = synchronizer(&dir);
        sync.store().upsert(&Record::new("td-1", "one")).unwrap();

        let shutdown = CancellationToken::new();
        let (handle, task) = spawn(sync, shutdown.clone());

        let outcome = handle.run(SyncOp::Periodic).await.unwrap();
        assert!(matches!(outcome, SyncOutcome::Exported(ExportReport { records: 1, written: true })));
        let outcome = handle.run(SyncOp::ImportIfChanged).await.unwrap();
        assert_eq!(outcome, SyncOutcome::Skipped, "own export must not re-import");

        shutdown.cancel();
        let sync = task.await.unwrap().unwrap();
        assert!(sync.log_path().exists());
    }

    #[tokio::test]
    async fn periodic_imports_external_edits_first() {
        let dir = TempDir::new().unwrap();
        let sync = synchronizer(&dir);
        sync.store().upsert(&Record::new("td-cached", "cached")).unwrap();
        std::fs::write(sync.log_path(), "{\"id\":\"td-edited\",\"title\":\"edited\"}\n").unwrap();

        let shutdown = CancellationToken::new();
        let (handle, task) = spawn(sync, shutdown.clone());
        let outcome = handle.run(SyncOp::Periodic).await.unwrap();
        match outcome {
            SyncOutcome::Imported(report) => assert_eq!(report.imported, 1),
            other => panic!("expected import, got {other:?}"),
        }

        shutdown.cancel();
        let sync = task.await.unwrap().unwrap();
        let text = std::fs::read_to_string(sync.log_path()).unwrap();
        assert!(text.contains("td-edited"), "edit must survive: {text}");
        assert_eq!(sync.store().count().unwrap(), 1);
    }

    #[tokio::test]
    async fn edit_in_the_export_mtime_tick_is_not_clobbered() {
        use filetime::{set_file_mtime, FileTime};

        let dir = TempDir::new().unwrap();
        let sync = synchronizer(&dir);
        sync.store().upsert(&Record::new("td-cached", "cached")).unwrap();
        let log = sync.log_path().to_path_buf();

        let shutdown = CancellationToken::new();
        let (handle, task) = spawn(sync, shutdown.clone());
        handle.run(SyncOp::Export).await.unwrap();

        let exported_at = FileTime::from_last_modification_time(&std::fs::metadata(&log).unwrap());
        let mut text = std::fs::read_to_string(&log).unwrap();
        text.push_str("{\"id\":\"td-edited\",\"title\":\"edited\"}\n");
        std::fs::write(&log, text).unwrap();
        set_file_mtime(&log, exported_at).unwrap();

        let outcome = handle.run(SyncOp::ImportIfChanged).await.unwrap();
        match outcome {
            SyncOutcome::Imported(report) => assert_eq!(report.imported, 2),
            other => panic!("expected import, got {other:?}"),
        }
        handle.run(SyncOp::Periodic).await.unwrap();

        shutdown.cancel();
        task.await.unwrap().unwrap();
        let text = std::fs::read_to_string(&log).unwrap();
        assert!(text.contains("td-edited"), "edit must survive the next tick: {text}");
        assert!(text.contains("td-cached"));
    }

    #[tokio::test]
    async fn errors_are_returned_to_the_caller() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("db.sqlite")).unwrap();
        // A directory in place of the log makes the import fail.
        let log = dir.path().join("issues.jsonl");
        std::fs::create_dir(&log).unwrap();
        let sync = Synchronizer::new(store, &log);

        let shutdown = CancellationToken::new();
        let (handle, task) = spawn(sync, shutdown.clone());
        let err = handle.run(SyncOp::Import).await.unwrap_err();
        assert!(matches!(err, DaemonError::Sync(_)), "got: {err}");

        // The processor keeps serving after a failure.
        let err = handle.run(SyncOp::Import).await.unwrap_err();
        assert!(matches!(err, DaemonError::Sync(_)), "got: {err}");

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn processor_exit_fires_shutdown() {
        let dir = TempDir::new().unwrap();
        let shutdown = CancellationToken::new();
        let (handle, task) = spawn(synchronizer(&dir), shutdown.clone());
        drop(handle);

        task.await.unwrap().unwrap();
        assert!(shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn queued_jobs_fail_cleanly_after_shutdown() {
        let dir = TempDir::new().unwrap();
        let shutdown = CancellationToken::new();
        let (handle, task) = spawn(synchronizer(&dir), shutdown.clone());
        shutdown.cancel();
        task.await.unwrap().unwrap();

        let err = handle.run(SyncOp::Export).await.unwrap_err();
        assert!(matches!(err, DaemonError::ChannelClosed(_)), "got: {err}");
    }
}
