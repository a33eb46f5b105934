//! Bridge between the append-log and the [`Store`].
//!
//! The append-log is authoritative. Import rebuilds the cache from it, export
//! atomically rewrites it from the cache, and `last_sync` remembers which
//! version of the file the two last agreed on: its mtime, length and SHA-256.

use std::fs::File;
use std::io::{BufRead, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use sha2::{Digest, Sha256};

use tandas_core::jsonl;
use tandas_core::types::RecordId;

use crate::error::{io_err, SyncError};
use crate::store::Store;

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// A line or record that was skipped during import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportWarning {
    /// 1-based line in the append-log, when the problem is tied to one.
    pub line: Option<usize>,
    pub id: Option<RecordId>,
    pub message: String,
}

/// Outcome of [`Synchronizer::import_from_log`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    /// Records successfully written to the cache.
    pub imported: usize,
    pub warnings: Vec<ImportWarning>,
    /// The append-log did not exist; nothing was touched.
    pub source_missing: bool,
}

/// Outcome of [`Synchronizer::export_to_log`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportReport {
    pub records: usize,
    /// `false` when the file already held exactly the rendered content.
    pub written: bool,
}

// ---------------------------------------------------------------------------
// Synchronizer
// ---------------------------------------------------------------------------

/// One version of the append-log. The mtime alone is too coarse: an edit can
/// land in the same timestamp tick as the daemon's own write.
#[derive(Debug, Clone, PartialEq, Eq)]
struct LogVersion {
    mtime: SystemTime,
    len: u64,
    sha256: String,
}

impl LogVersion {
    fn of(mtime: SystemTime, content: &[u8]) -> Self {
        Self {
            mtime,
            len: content.len() as u64,
            sha256: hash_content(content),
        }
    }
}

fn hash_content(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

pub struct Synchronizer {
    store: Store,
    log_path: PathBuf,
    last_sync: Option<LogVersion>,
}

impl Synchronizer {
    pub fn new(store: Store, log_path: impl Into<PathBuf>) -> Self {
        Self {
            store,
            log_path: log_path.into(),
            last_sync: None,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Modification time of the log version last imported or written.
    pub fn last_sync(&self) -> Option<SystemTime> {
        self.last_sync.as_ref().map(|version| version.mtime)
    }

    /// Give the store back, e.g. to close it on shutdown.
    pub fn into_store(self) -> Store {
        self.store
    }

    /// Rebuild the cache from the append-log.
    ///
    /// A missing log is a no-op. Malformed lines and failing upserts become
    /// warnings; only failing to read the log or to swap the cache contents
    /// aborts the import, in which case the previous cache is kept.
    pub fn import_from_log(&mut self) -> Result<ImportReport, SyncError> {
        let mut file = match File::open(&self.log_path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!(path = %self.log_path.display(), "append-log missing, nothing to import");
                return Ok(ImportReport {
                    source_missing: true,
                    ..ImportReport::default()
                });
            }
            Err(e) => return Err(io_err(&self.log_path, e)),
        };

        // Captured before reading so an edit racing this import still counts as newer.
        let mtime = file
            .metadata()
            .and_then(|meta| meta.modified())
            .map_err(|e| io_err(&self.log_path, e))?;
        let mut content = Vec::new();
        file.read_to_end(&mut content)
            .map_err(|e| io_err(&self.log_path, e))?;

        let mut records = Vec::new();
        let mut warnings = Vec::new();
        for (idx, line) in BufRead::split(content.as_slice(), b'\n').enumerate() {
            let line_no = idx + 1;
            let bytes = line.map_err(|e| io_err(&self.log_path, e))?;
            let text = match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(err) => {
                    tracing::warn!(line = line_no, error = %err, "skipping non-UTF-8 line");
                    warnings.push(ImportWarning {
                        line: Some(line_no),
                        id: None,
                        message: err.to_string(),
                    });
                    continue;
                }
            };
            match jsonl::decode_line(&text, line_no) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(line = line_no, error = %err, "skipping malformed record");
                    warnings.push(ImportWarning {
                        line: Some(line_no),
                        id: None,
                        message: err.to_string(),
                    });
                }
            }
        }

        let failures = self.store.replace_all(&records)?;
        for (id, err) in &failures {
            tracing::warn!(id = %id, error = %err, "failed to cache record");
            warnings.push(ImportWarning {
                line: None,
                id: Some(id.clone()),
                message: err.to_string(),
            });
        }

        self.last_sync = Some(LogVersion::of(mtime, &content));
        let imported = records.len() - failures.len();
        tracing::info!(
            path = %self.log_path.display(),
            imported,
            warnings = warnings.len(),
            "imported append-log"
        );
        Ok(ImportReport {
            imported,
            warnings,
            source_missing: false,
        })
    }

    /// Atomically rewrite the append-log from the cache.
    ///
    /// Content goes to a temp file beside the log, is flushed and synced, and
    /// then renamed over it. Any failure removes the temp file and leaves the
    /// log untouched.
    pub fn export_to_log(&mut self) -> Result<ExportReport, SyncError> {
        self.export_with_hook(|_| Ok(()))
    }

    fn export_with_hook<F>(&mut self, before_persist: F) -> Result<ExportReport, SyncError>
    where
        F: FnOnce(&Path) -> std::io::Result<()>,
    {
        let records = self.store.get_all()?;
        let rendered = jsonl::encode_all(&records)?;
        let path = self.log_path.clone();

        match std::fs::read(&path) {
            Ok(existing) if existing == rendered.as_bytes() => {
                tracing::debug!(path = %path.display(), "append-log unchanged");
                self.last_sync = Some(LogVersion::of(modified(&path)?, &existing));
                return Ok(ExportReport {
                    records: records.len(),
                    written: false,
                });
            }
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(io_err(&path, e)),
        }

        let dir = path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;

        let stem = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("issues");
        let prefix = format!("{stem}-");
        let mut tmp = tempfile::Builder::new()
            .prefix(&prefix)
            .suffix(".jsonl.tmp")
            .tempfile_in(dir)
            .map_err(|e| io_err(dir, e))?;

        {
            let mut writer = BufWriter::new(tmp.as_file_mut());
            writer
                .write_all(rendered.as_bytes())
                .and_then(|()| writer.flush())
                .map_err(|e| io_err(&path, e))?;
        }
        tmp.as_file().sync_all().map_err(|e| io_err(tmp.path(), e))?;
        if let Ok(meta) = std::fs::metadata(&path) {
            tmp.as_file()
                .set_permissions(meta.permissions())
                .map_err(|e| io_err(tmp.path(), e))?;
        }

        before_persist(tmp.path()).map_err(|e| io_err(tmp.path(), e))?;
        tmp.persist(&path).map_err(|e| io_err(&path, e.error))?;

        self.last_sync = Some(LogVersion::of(modified(&path)?, rendered.as_bytes()));
        tracing::info!(path = %path.display(), records = records.len(), "exported append-log");
        Ok(ExportReport {
            records: records.len(),
            written: true,
        })
    }

    /// Whether the log changed since the last import or export.
    ///
    /// A missing log never needs syncing; a present one that was never
    /// synced always does. A newer mtime or a different length is enough;
    /// otherwise the content hash decides.
    pub fn needs_sync(&self) -> bool {
        let Ok(meta) = std::fs::metadata(&self.log_path) else {
            return false;
        };
        let Some(last) = &self.last_sync else {
            return true;
        };
        match meta.modified() {
            Ok(mtime) if mtime > last.mtime => return true,
            Ok(_) => {}
            Err(_) => return false,
        }
        if meta.len() != last.len {
            return true;
        }
        match std::fs::read(&self.log_path) {
            Ok(content) => hash_content(&content) != last.sha256,
            Err(err) => {
                tracing::debug!(path = %self.log_path.display(), error = %err, "cannot hash append-log");
                false
            }
        }
    }
}

fn modified(path: &Path) -> Result<SystemTime, SyncError> {
    std::fs::metadata(path)
        .and_then(|meta| meta.modified())
        .map_err(|e| io_err(path, e))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tandas_core::types::Record;
    use tempfile::TempDir;

    fn synchronizer(dir: &TempDir) -> Synchronizer {
        let store = Store::open(dir.path().join("db.sqlite")).expect("open store");
        Synchronizer::new(store, dir.path().join("issues.jsonl"))
    }

    fn leftover_temp_files(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|name| name.ends_with(".jsonl.tmp"))
            .collect()
    }

    #[test]
    fn failure_before_rename_leaves_destination_intact() {
        let dir = TempDir::new().unwrap();
        let mut sync = synchronizer(&dir);
        let original = "{\"id\":\"td-old\",\"title\":\"old\"}\n";
        std::fs::write(sync.log_path(), original).unwrap();

        sync.store().upsert(&Record::new("td-new", "new")).unwrap();
        let mut seen_tmp = None;
        let err = sync
            .export_with_hook(|tmp| {
                seen_tmp = Some(tmp.to_path_buf());
                let staged = std::fs::read_to_string(tmp)?;
                assert!(staged.contains("td-new"), "temp file must hold new content");
                Err(std::io::Error::new(ErrorKind::Other, "simulated crash"))
            })
            .unwrap_err();

        assert!(matches!(err, SyncError::Io { .. }), "got: {err}");
        assert_eq!(std::fs::read_to_string(sync.log_path()).unwrap(), original);
        let tmp = seen_tmp.expect("hook must run");
        assert!(!tmp.exists(), "temp file must be removed");
        assert!(leftover_temp_files(dir.path()).is_empty());
        assert_eq!(sync.last_sync(), None);
    }

    #[test]
    fn temp_file_is_named_after_log() {
        let dir = TempDir::new().unwrap();
        let mut sync = synchronizer(&dir);
        sync.store().upsert(&Record::new("td-1", "a")).unwrap();
        let mut name = String::new();
        sync.export_with_hook(|tmp| {
            name = tmp.file_name().unwrap().to_string_lossy().into_owned();
            assert_eq!(tmp.parent(), Some(dir.path()));
            Ok(())
        })
        .unwrap();
        assert!(name.starts_with("issues-"), "got: {name}");
        assert!(name.ends_with(".jsonl.tmp"), "got: {name}");
        assert!(leftover_temp_files(dir.path()).is_empty());
    }

    #[test]
    fn export_sets_last_sync_to_file_mtime() {
        let dir = TempDir::new().unwrap();
        let mut sync = synchronizer(&dir);
        sync.store().upsert(&Record::new("td-1", "a")).unwrap();
        let report = sync.export_to_log().unwrap();
        assert_eq!(report, ExportReport { records: 1, written: true });
        let mtime = std::fs::metadata(sync.log_path()).unwrap().modified().unwrap();
        assert_eq!(sync.last_sync(), Some(mtime));
        assert!(!sync.needs_sync());
    }

    #[cfg(unix)]
    #[test]
    fn export_keeps_destination_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let mut sync = synchronizer(&dir);
        std::fs::write(sync.log_path(), "").unwrap();
        std::fs::set_permissions(sync.log_path(), std::fs::Permissions::from_mode(0o644)).unwrap();
        sync.store().upsert(&Record::new("td-1", "a")).unwrap();
        sync.export_to_log().unwrap();

        let mode = std::fs::metadata(sync.log_path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
    }
}
