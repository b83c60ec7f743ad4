//! Watcher configurations and the captured-files ledger in `watchers.db`.

use crate::{StoreError, parse_json, parse_timestamp};
use chrono::Utc;
use inflow_types::{CapturedFile, JobId, NewWatcher, WatcherConfig, WatcherStatus};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::{Path, PathBuf};
use std::str::FromStr;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS watchers (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  watch_folder TEXT NOT NULL,
  file_patterns TEXT NOT NULL,
  job_type TEXT NOT NULL,
  job_demands TEXT NOT NULL,
  submitter TEXT NOT NULL,
  job_name TEXT NOT NULL,
  status TEXT NOT NULL,
  created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS captured_files (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  watcher_id INTEGER NOT NULL REFERENCES watchers(id),
  file_path TEXT NOT NULL,
  file_name TEXT NOT NULL,
  job_id TEXT,
  captured_at TEXT NOT NULL,
  UNIQUE (watcher_id, file_name)
);
CREATE INDEX IF NOT EXISTS idx_watchers_status ON watchers(status);
CREATE INDEX IF NOT EXISTS idx_captured_watcher ON captured_files(watcher_id);
";

/// Handle to the watcher database.
///
/// Holds only the file path; every operation opens its own connection.
#[derive(Debug, Clone)]
pub struct WatcherStore {
    db_path: PathBuf,
}

impl WatcherStore {
    /// Opens (and if necessary creates) the watcher database at `db_path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent directory cannot be created or the
    /// schema cannot be applied.
    pub fn open(db_path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let store = Self { db_path };
        store.connect()?.execute_batch(SCHEMA)?;
        Ok(store)
    }

    /// Returns the database file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn connect(&self) -> Result<Connection, StoreError> {
        let conn = Connection::open(&self.db_path).map_err(|source| StoreError::Open {
            path: self.db_path.clone(),
            source,
        })?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(conn)
    }

    /// Registers a new watcher in the `Monitoring` state and returns its id.
    ///
    /// # Errors
    ///
    /// Returns an error on database or encoding failure.
    pub fn insert(&self, new: &NewWatcher) -> Result<i64, StoreError> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO watchers (
               watch_folder, file_patterns, job_type, job_demands,
               submitter, job_name, status, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                new.watch_folder.to_string_lossy(),
                new.file_patterns,
                new.job_type,
                serde_json::to_string(&new.job_demands)?,
                new.submitter,
                new.job_name,
                WatcherStatus::Monitoring.as_str(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Fetches one watcher configuration by id.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn get(&self, watcher_id: i64) -> Result<Option<WatcherConfig>, StoreError> {
        let conn = self.connect()?;
        let config = conn
            .query_row(
                &format!("SELECT {WATCHER_COLUMNS} FROM watchers WHERE id = ?1"),
                params![watcher_id],
                read_watcher_row,
            )
            .optional()?;
        Ok(config)
    }

    /// Lists watcher configurations, optionally filtered by status.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn list(&self, status: Option<WatcherStatus>) -> Result<Vec<WatcherConfig>, StoreError> {
        let conn = self.connect()?;
        let configs = match status {
            Some(status) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {WATCHER_COLUMNS} FROM watchers WHERE status = ?1 ORDER BY id"
                ))?;
                let rows = stmt.query_map(params![status.as_str()], read_watcher_row)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let mut stmt =
                    conn.prepare(&format!("SELECT {WATCHER_COLUMNS} FROM watchers ORDER BY id"))?;
                let rows = stmt.query_map([], read_watcher_row)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        Ok(configs)
    }

    /// Updates a watcher's lifecycle status.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::WatcherNotFound`] if no row has the given id.
    pub fn update_status(&self, watcher_id: i64, status: WatcherStatus) -> Result<(), StoreError> {
        let conn = self.connect()?;
        let changed = conn.execute(
            "UPDATE watchers SET status = ?1 WHERE id = ?2",
            params![status.as_str(), watcher_id],
        )?;
        if changed == 0 {
            return Err(StoreError::WatcherNotFound(watcher_id));
        }
        Ok(())
    }

    /// Records a captured file for a watcher.
    ///
    /// Capture is idempotent per `(watcher_id, file_name)`; re-recording an
    /// already-captured name returns `Ok(None)` and leaves the ledger
    /// unchanged.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn record_capture(
        &self,
        watcher_id: i64,
        file_path: &Path,
        job_id: Option<&JobId>,
    ) -> Result<Option<i64>, StoreError> {
        let file_name = file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let conn = self.connect()?;
        let changed = conn.execute(
            "INSERT OR IGNORE INTO captured_files (
               watcher_id, file_path, file_name, job_id, captured_at
             ) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                watcher_id,
                file_path.to_string_lossy(),
                file_name,
                job_id.map(JobId::as_str),
                Utc::now().to_rfc3339(),
            ],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        Ok(Some(conn.last_insert_rowid()))
    }

    /// Returns true if the watcher has already captured `file_name`.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn is_captured(&self, watcher_id: i64, file_name: &str) -> Result<bool, StoreError> {
        let conn = self.connect()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM captured_files WHERE watcher_id = ?1 AND file_name = ?2",
            params![watcher_id, file_name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Links a captured file to the job that consumed or was spawned by it.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn link_capture_to_job(
        &self,
        watcher_id: i64,
        file_name: &str,
        job_id: &JobId,
    ) -> Result<(), StoreError> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE captured_files SET job_id = ?1 WHERE watcher_id = ?2 AND file_name = ?3",
            params![job_id.as_str(), watcher_id, file_name],
        )?;
        Ok(())
    }

    /// Lists the captured-files ledger for one watcher, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn captures(&self, watcher_id: i64) -> Result<Vec<CapturedFile>, StoreError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT id, watcher_id, file_path, file_name, job_id, captured_at
             FROM captured_files WHERE watcher_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![watcher_id], |row| {
            let captured_raw: String = row.get(5)?;
            Ok(CapturedFile {
                id: row.get(0)?,
                watcher_id: row.get(1)?,
                file_path: PathBuf::from(row.get::<_, String>(2)?),
                file_name: row.get(3)?,
                job_id: row.get::<_, Option<String>>(4)?.map(JobId::from),
                captured_at: parse_timestamp(5, &captured_raw)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

const WATCHER_COLUMNS: &str = "id, watch_folder, file_patterns, job_type, job_demands, \
     submitter, job_name, status, created_at";

fn read_watcher_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<WatcherConfig> {
    let demands_raw: String = row.get(4)?;
    let status_raw: String = row.get(7)?;
    let created_raw: String = row.get(8)?;
    let status = WatcherStatus::from_str(&status_raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(WatcherConfig {
        id: row.get(0)?,
        watch_folder: PathBuf::from(row.get::<_, String>(1)?),
        file_patterns: row.get(2)?,
        job_type: row.get(3)?,
        job_demands: parse_json(4, &demands_raw)?,
        submitter: row.get(5)?,
        job_name: row.get(6)?,
        status,
        created_at: parse_timestamp(8, &created_raw)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_store() -> (TempDir, WatcherStore) {
        let dir = TempDir::new().unwrap();
        let store = WatcherStore::open(dir.path().join("watchers.db")).unwrap();
        (dir, store)
    }

    fn test_watcher() -> NewWatcher {
        NewWatcher {
            watch_folder: "/data/incoming".into(),
            file_patterns: "a.raw;b.raw".to_string(),
            job_type: "maxquant".to_string(),
            job_demands: serde_json::json!({"threads": 2}),
            submitter: "tester".to_string(),
            job_name: "run".to_string(),
        }
    }

    #[test]
    fn test_insert_and_get() {
        let (_dir, store) = test_store();
        let id = store.insert(&test_watcher()).unwrap();

        let config = store.get(id).unwrap().unwrap();
        assert_eq!(config.status, WatcherStatus::Monitoring);
        assert_eq!(config.pattern_entries(), vec!["a.raw", "b.raw"]);
        assert!(store.get(id + 1).unwrap().is_none());
    }

    #[test]
    fn test_list_by_status() {
        let (_dir, store) = test_store();
        let a = store.insert(&test_watcher()).unwrap();
        let b = store.insert(&test_watcher()).unwrap();
        store.update_status(b, WatcherStatus::Completed).unwrap();

        let monitoring = store.list(Some(WatcherStatus::Monitoring)).unwrap();
        assert_eq!(monitoring.len(), 1);
        assert_eq!(monitoring[0].id, a);
        assert_eq!(store.list(None).unwrap().len(), 2);
    }

    #[test]
    fn test_update_missing_watcher_fails() {
        let (_dir, store) = test_store();
        let err = store
            .update_status(99, WatcherStatus::Cancelled)
            .unwrap_err();
        assert!(matches!(err, StoreError::WatcherNotFound(99)));
    }

    #[test]
    fn test_capture_is_idempotent() {
        let (_dir, store) = test_store();
        let id = store.insert(&test_watcher()).unwrap();

        let first = store
            .record_capture(id, Path::new("/data/incoming/a.raw"), None)
            .unwrap();
        assert!(first.is_some());
        let second = store
            .record_capture(id, Path::new("/data/incoming/a.raw"), None)
            .unwrap();
        assert!(second.is_none());

        assert!(store.is_captured(id, "a.raw").unwrap());
        assert!(!store.is_captured(id, "b.raw").unwrap());
        assert_eq!(store.captures(id).unwrap().len(), 1);
    }

    #[test]
    fn test_link_capture_to_job() {
        let (_dir, store) = test_store();
        let id = store.insert(&test_watcher()).unwrap();
        store
            .record_capture(id, Path::new("/data/incoming/a.raw"), None)
            .unwrap();

        let job_id = JobId::from("20260830120000_test");
        store.link_capture_to_job(id, "a.raw", &job_id).unwrap();

        let captures = store.captures(id).unwrap();
        assert_eq!(captures[0].job_id.as_ref().unwrap(), &job_id);
    }
}
