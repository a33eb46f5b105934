//! SQLite-backed record cache.
//!
//! One `tandas` table mirrors the append-log. Collection fields are stored as
//! JSON text; `flakiness_score`, `last_run_at` and `last_run_result` are
//! derived columns recomputed on every upsert and never read back into a
//! [`Record`].
//!
//! The database runs in WAL mode, so readers proceed while a single writer
//! commits. The store adds no locking of its own.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;

use tandas_core::types::{Record, RecordId, RecordStats, RecordStatus, RunOutcome};

use crate::error::StoreError;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS tandas (
        id TEXT PRIMARY KEY,
        title TEXT NOT NULL,
        status TEXT DEFAULT 'active',
        file TEXT,
        covers TEXT,
        depends_on TEXT,
        notes TEXT,
        run_history TEXT,
        flakiness_score REAL DEFAULT 0.0,
        last_run_at TEXT,
        last_run_result TEXT,
        created_at TEXT,
        updated_at TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_status ON tandas(status);
    CREATE INDEX IF NOT EXISTS idx_file ON tandas(file);
    CREATE INDEX IF NOT EXISTS idx_flakiness ON tandas(flakiness_score);
    CREATE INDEX IF NOT EXISTS idx_last_run ON tandas(last_run_at);
";

const RECORD_COLUMNS: &str =
    "id, title, status, file, covers, depends_on, notes, run_history, created_at, updated_at";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// The relational cache of records.
#[derive(Debug)]
pub struct Store {
    conn: Connection,
    path: PathBuf,
}

impl Store {
    /// Open (creating if absent) the database at `path`, enable WAL and
    /// ensure the schema exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path).map_err(|source| StoreError::Open {
            path: path.clone(),
            source,
        })?;
        let store = Self { conn, path };
        store.init_schema()?;
        Ok(store)
    }

    /// An in-memory store with the same schema. WAL does not apply.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|source| StoreError::Open {
            path: PathBuf::from(":memory:"),
            source,
        })?;
        let store = Self {
            conn,
            path: PathBuf::from(":memory:"),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.conn
            .busy_timeout(BUSY_TIMEOUT)
            .map_err(StoreError::Schema)?;
        self.conn
            .execute_batch(
                "PRAGMA journal_mode=WAL;
                 PRAGMA synchronous=NORMAL;",
            )
            .map_err(StoreError::Schema)?;
        self.conn.execute_batch(SCHEMA).map_err(StoreError::Schema)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Insert or overwrite a record, recomputing its derived columns.
    ///
    /// `created_at` of an existing row is kept.
    pub fn upsert(&self, record: &Record) -> Result<(), StoreError> {
        upsert_with(&self.conn, record)
    }

    /// Every record, most recently updated first.
    pub fn get_all(&self) -> Result<Vec<Record>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM tandas ORDER BY updated_at DESC, id ASC"
        ))?;
        let rows = stmt.query_map([], map_record)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn get(&self, id: &RecordId) -> Result<Option<Record>, StoreError> {
        Ok(self
            .conn
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM tandas WHERE id = ?1"),
                params![id.as_str()],
                map_record,
            )
            .optional()?)
    }

    pub fn list_by_status(&self, status: RecordStatus) -> Result<Vec<Record>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM tandas WHERE status = ?1 \
             ORDER BY updated_at DESC, id ASC"
        ))?;
        let rows = stmt.query_map(params![status.as_str()], map_record)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Cached derived columns for one record.
    pub fn stats(&self, id: &RecordId) -> Result<Option<RecordStats>, StoreError> {
        Ok(self
            .conn
            .query_row(
                "SELECT flakiness_score, last_run_at, last_run_result FROM tandas WHERE id = ?1",
                params![id.as_str()],
                map_stats,
            )
            .optional()?)
    }

    /// Records with a non-zero flakiness score, flakiest first.
    pub fn flakiest(&self, limit: usize) -> Result<Vec<(RecordId, RecordStats)>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, flakiness_score, last_run_at, last_run_result FROM tandas
             WHERE flakiness_score > 0
             ORDER BY flakiness_score DESC, id ASC
             LIMIT ?1",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![limit], |row| {
            let id: String = row.get(0)?;
            let stats = RecordStats {
                flakiness_score: row.get::<_, Option<f64>>(1)?.unwrap_or(0.0),
                last_run_at: row.get(2)?,
                last_run_result: row.get::<_, Option<String>>(3)?.map(RunOutcome::from),
            };
            Ok((RecordId::from(id), stats))
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn count(&self) -> Result<usize, StoreError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM tandas", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    /// Remove one record. Returns whether a row was deleted.
    pub fn delete(&self, id: &RecordId) -> Result<bool, StoreError> {
        let removed = self
            .conn
            .execute("DELETE FROM tandas WHERE id = ?1", params![id.as_str()])?;
        Ok(removed > 0)
    }

    /// Remove every record. Returns the number of deleted rows.
    pub fn clear_all(&self) -> Result<usize, StoreError> {
        Ok(self.conn.execute("DELETE FROM tandas", [])?)
    }

    /// Clear the table and upsert `records` inside one transaction.
    ///
    /// A failing upsert does not abort the reload; it is returned alongside
    /// the record id. Failing to clear or to commit aborts and rolls back,
    /// leaving the previous contents in place.
    pub fn replace_all(
        &mut self,
        records: &[Record],
    ) -> Result<Vec<(RecordId, StoreError)>, StoreError> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM tandas", [])?;
        let mut failures = Vec::new();
        for record in records {
            if let Err(err) = upsert_with(&tx, record) {
                failures.push((record.id.clone(), err));
            }
        }
        tx.commit()?;
        Ok(failures)
    }

    /// Release the database handle.
    pub fn close(self) -> Result<(), StoreError> {
        self.conn.close().map_err(|(_, err)| StoreError::Sqlite(err))
    }
}

fn upsert_with(conn: &Connection, record: &Record) -> Result<(), StoreError> {
    let stats = record.stats();
    conn.execute(
        "INSERT INTO tandas (id, title, status, file, covers, depends_on, notes, run_history,
                             flakiness_score, last_run_at, last_run_result, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
         ON CONFLICT(id) DO UPDATE SET
             title = excluded.title,
             status = excluded.status,
             file = excluded.file,
             covers = excluded.covers,
             depends_on = excluded.depends_on,
             notes = excluded.notes,
             run_history = excluded.run_history,
             flakiness_score = excluded.flakiness_score,
             last_run_at = excluded.last_run_at,
             last_run_result = excluded.last_run_result,
             updated_at = excluded.updated_at",
        params![
            record.id.as_str(),
            record.title,
            record.status.as_str(),
            record.file.as_deref(),
            json_text(record, &record.covers)?,
            json_text(record, &record.depends_on)?,
            json_text(record, &record.notes)?,
            json_text(record, &record.run_history)?,
            stats.flakiness_score,
            stats.last_run_at,
            stats.last_run_result.as_ref().map(RunOutcome::as_str),
            record.created_at,
            record.updated_at,
        ],
    )?;
    Ok(())
}

fn json_text<T: serde::Serialize>(record: &Record, value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|source| StoreError::Encode {
        id: record.id.to_string(),
        source,
    })
}

fn map_record(row: &Row<'_>) -> rusqlite::Result<Record> {
    let status = match row.get::<_, Option<String>>(2)?.as_deref() {
        None | Some("") => RecordStatus::default(),
        Some(text) => text
            .parse()
            .map_err(|msg: String| conversion_err(2, msg.into()))?,
    };
    Ok(Record {
        id: RecordId::from(row.get::<_, String>(0)?),
        title: row.get(1)?,
        status,
        file: row
            .get::<_, Option<String>>(3)?
            .filter(|file| !file.is_empty()),
        covers: json_column(row, 4)?,
        depends_on: json_column(row, 5)?,
        notes: json_column(row, 6)?,
        run_history: json_column(row, 7)?,
        created_at: row.get::<_, Option<String>>(8)?.unwrap_or_default(),
        updated_at: row.get::<_, Option<String>>(9)?.unwrap_or_default(),
    })
}

fn map_stats(row: &Row<'_>) -> rusqlite::Result<RecordStats> {
    Ok(RecordStats {
        flakiness_score: row.get::<_, Option<f64>>(0)?.unwrap_or(0.0),
        last_run_at: row.get(1)?,
        last_run_result: row.get::<_, Option<String>>(2)?.map(RunOutcome::from),
    })
}

/// Decode a JSON collection column; `NULL`, empty text and `null` all read as empty.
fn json_column<T: DeserializeOwned + Default>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    match row.get::<_, Option<String>>(idx)?.as_deref() {
        None | Some("") => Ok(T::default()),
        Some(text) => serde_json::from_str::<Option<T>>(text)
            .map(Option::unwrap_or_default)
            .map_err(|err| conversion_err(idx, Box::new(err))),
    }
}

fn conversion_err(idx: usize, err: Box<dyn std::error::Error + Send + Sync>) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandas_core::types::{Note, RunResult};
    use tempfile::TempDir;

    fn record(id: &str, updated_at: &str) -> Record {
        Record {
            created_at: "2024-01-01T00:00:00".to_string(),
            updated_at: updated_at.to_string(),
            ..Record::new(id, format!("title of {id}"))
        }
    }

    fn runs(outcomes: &[&str]) -> Vec<RunResult> {
        outcomes
            .iter()
            .enumerate()
            .map(|(i, outcome)| RunResult {
                ts: format!("2024-02-01T00:00:{i:02}"),
                result: RunOutcome::from(*outcome),
                duration: None,
                trace: None,
            })
            .collect()
    }

    #[test]
    fn open_creates_file_and_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db.sqlite");
        let store = Store::open(&path).unwrap();
        store.upsert(&record("td-1", "2024-01-01T00:00:00")).unwrap();
        store.close().unwrap();
        assert!(path.exists());

        let reopened = Store::open(&path).unwrap();
        assert_eq!(reopened.count().unwrap(), 1, "reopen must keep rows");
    }

    #[test]
    fn open_uses_wal_journal() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("db.sqlite")).unwrap();
        let mode: String = store
            .conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_ascii_lowercase(), "wal");
    }

    #[test]
    fn open_fails_for_unopenable_path() {
        let dir = TempDir::new().unwrap();
        let err = Store::open(dir.path().join("missing").join("db.sqlite"))
            .err()
            .expect("missing parent directory must fail");
        assert!(matches!(err, StoreError::Open { .. }), "got: {err}");
    }

    #[test]
    fn upsert_overwrites_fields_and_derived_columns() {
        let store = Store::open_in_memory().unwrap();
        let mut rec = Record {
            run_history: runs(&["fail", "pass"]),
            ..record("td-1", "2024-01-01T00:00:00")
        };
        store.upsert(&rec).unwrap();
        assert_eq!(store.stats(&rec.id).unwrap().unwrap().flakiness_score, 0.5);

        rec.title = "renamed".to_string();
        rec.covers = vec!["auth".to_string()];
        rec.notes.push(Note {
            ts: "2024-02-02T00:00:00".to_string(),
            kind: "note".to_string(),
            text: "retitled".to_string(),
        });
        rec.run_history = runs(&["pass", "pass", "pass", "fail"]);
        rec.updated_at = "2024-02-02T00:00:00".to_string();
        store.upsert(&rec).unwrap();

        assert_eq!(store.count().unwrap(), 1);
        let stored = store.get(&rec.id).unwrap().expect("record");
        assert_eq!(stored, rec);

        let stats = store.stats(&rec.id).unwrap().expect("stats");
        assert_eq!(stats.flakiness_score, 0.25);
        assert_eq!(stats.last_run_at.as_deref(), Some("2024-02-01T00:00:03"));
        assert_eq!(stats.last_run_result, Some(RunOutcome::Fail));
    }

    #[test]
    fn upsert_keeps_original_created_at() {
        let store = Store::open_in_memory().unwrap();
        store.upsert(&record("td-1", "2024-01-01T00:00:00")).unwrap();
        let mut later = record("td-1", "2024-03-01T00:00:00");
        later.created_at = "2024-03-01T00:00:00".to_string();
        store.upsert(&later).unwrap();
        let stored = store.get(&later.id).unwrap().unwrap();
        assert_eq!(stored.created_at, "2024-01-01T00:00:00");
        assert_eq!(stored.updated_at, "2024-03-01T00:00:00");
    }

    #[test]
    fn empty_history_has_no_last_run() {
        let store = Store::open_in_memory().unwrap();
        let rec = record("td-1", "2024-01-01T00:00:00");
        store.upsert(&rec).unwrap();
        let stats = store.stats(&rec.id).unwrap().unwrap();
        assert_eq!(stats.flakiness_score, 0.0);
        assert_eq!(stats.last_run_at, None);
        assert_eq!(stats.last_run_result, None);
    }

    #[test]
    fn get_all_orders_by_updated_at_descending() {
        let store = Store::open_in_memory().unwrap();
        store.upsert(&record("td-old", "2024-01-01T00:00:00")).unwrap();
        store.upsert(&record("td-new", "2024-03-01T00:00:00")).unwrap();
        store.upsert(&record("td-mid", "2024-02-01T00:00:00")).unwrap();

        let ids: Vec<String> = store
            .get_all()
            .unwrap()
            .into_iter()
            .map(|r| r.id.0)
            .collect();
        assert_eq!(ids, ["td-new", "td-mid", "td-old"]);
    }

    #[test]
    fn delete_and_clear_all() {
        let store = Store::open_in_memory().unwrap();
        for id in ["td-a", "td-b", "td-c"] {
            store.upsert(&record(id, "2024-01-01T00:00:00")).unwrap();
        }
        assert!(store.delete(&RecordId::from("td-a")).unwrap());
        assert!(!store.delete(&RecordId::from("td-a")).unwrap());
        assert_eq!(store.count().unwrap(), 2);

        assert_eq!(store.clear_all().unwrap(), 2);
        assert!(store.get_all().unwrap().is_empty());
    }

    #[test]
    fn replace_all_swaps_contents() {
        let mut store = Store::open_in_memory().unwrap();
        store.upsert(&record("td-stale", "2024-01-01T00:00:00")).unwrap();

        let fresh = [
            record("td-1", "2024-01-02T00:00:00"),
            record("td-2", "2024-01-03T00:00:00"),
        ];
        let failures = store.replace_all(&fresh).unwrap();
        assert!(failures.is_empty());
        assert!(store.get(&RecordId::from("td-stale")).unwrap().is_none());
        assert_eq!(store.count().unwrap(), 2);
    }

    #[test]
    fn list_by_status_and_flakiest() {
        let store = Store::open_in_memory().unwrap();
        let flaky = Record {
            status: RecordStatus::Flaky,
            run_history: runs(&["fail", "fail", "pass"]),
            ..record("td-flaky", "2024-01-02T00:00:00")
        };
        let shaky = Record {
            run_history: runs(&["fail", "pass", "pass", "pass"]),
            ..record("td-shaky", "2024-01-03T00:00:00")
        };
        let steady = Record {
            run_history: runs(&["pass"]),
            ..record("td-steady", "2024-01-01T00:00:00")
        };
        for rec in [&flaky, &shaky, &steady] {
            store.upsert(rec).unwrap();
        }

        let flagged = store.list_by_status(RecordStatus::Flaky).unwrap();
        assert_eq!(flagged, vec![flaky.clone()]);

        let ranked: Vec<String> = store
            .flakiest(10)
            .unwrap()
            .into_iter()
            .map(|(id, _)| id.0)
            .collect();
        assert_eq!(ranked, ["td-flaky", "td-shaky"]);
        assert_eq!(store.flakiest(1).unwrap().len(), 1);
    }

    #[test]
    fn null_collection_columns_read_as_empty() {
        let store = Store::open_in_memory().unwrap();
        store
            .conn
            .execute(
                "INSERT INTO tandas (id, title, covers, depends_on, notes, run_history)
                 VALUES ('td-legacy', 'legacy row', NULL, 'null', '', NULL)",
                [],
            )
            .unwrap();
        let rec = store.get(&RecordId::from("td-legacy")).unwrap().unwrap();
        assert!(rec.covers.is_empty());
        assert!(rec.depends_on.is_empty());
        assert!(rec.notes.is_empty());
        assert!(rec.run_history.is_empty());
        assert_eq!(rec.status, RecordStatus::Active);
    }
}
