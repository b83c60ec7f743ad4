//! Write-through job projections in `jobs.db`.

use crate::{StoreError, parse_json, parse_timestamp};
use chrono::Utc;
use inflow_types::{JobId, JobRecord, JobStatus};
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS jobs (
  job_id TEXT PRIMARY KEY,
  job_name TEXT NOT NULL,
  job_submitter TEXT NOT NULL,
  job_type TEXT NOT NULL,
  job_demands TEXT NOT NULL,
  local_folder TEXT NOT NULL,
  watcher_id INTEGER,
  status TEXT NOT NULL,
  progress REAL NOT NULL DEFAULT 0.0,
  expected_files TEXT NOT NULL,
  original_expected_files TEXT NOT NULL,
  extras TEXT NOT NULL,
  created_at TEXT NOT NULL,
  completed_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
";

/// Handle to the job database.
///
/// Holds only the file path; every operation opens its own connection.
#[derive(Debug, Clone)]
pub struct JobStore {
    db_path: PathBuf,
}

impl JobStore {
    /// Opens (and if necessary creates) the job database at `db_path`.
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

    /// Inserts or replaces the full projection of a job.
    ///
    /// # Errors
    ///
    /// Returns an error on database or encoding failure.
    pub fn upsert(&self, record: &JobRecord) -> Result<(), StoreError> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT OR REPLACE INTO jobs (
               job_id, job_name, job_submitter, job_type, job_demands,
               local_folder, watcher_id, status, progress,
               expected_files, original_expected_files, extras,
               created_at, completed_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                record.job_id.as_str(),
                record.job_name,
                record.job_submitter,
                record.job_type,
                serde_json::to_string(&record.job_demands)?,
                record.local_folder.to_string_lossy(),
                record.watcher_id,
                record.status.as_str(),
                record.progress,
                serde_json::to_string(&record.expected_files)?,
                serde_json::to_string(&record.original_expected_files)?,
                serde_json::to_string(&record.extras)?,
                record.created_at.to_rfc3339(),
                record.completed_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    /// Updates a job's status, stamping `completed_at` in the same statement
    /// when the new status is terminal.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::JobNotFound`] if no row has the given id.
    pub fn update_status(&self, job_id: &JobId, status: JobStatus) -> Result<(), StoreError> {
        let completed_at = status.is_terminal().then(|| Utc::now().to_rfc3339());
        let conn = self.connect()?;
        let changed = conn.execute(
            "UPDATE jobs SET status = ?1, completed_at = COALESCE(?2, completed_at)
             WHERE job_id = ?3",
            params![status.as_str(), completed_at, job_id.as_str()],
        )?;
        if changed == 0 {
            return Err(StoreError::JobNotFound(job_id.clone()));
        }
        Ok(())
    }

    /// Updates a job's progress fraction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::JobNotFound`] if no row has the given id.
    pub fn update_progress(&self, job_id: &JobId, progress: f64) -> Result<(), StoreError> {
        let conn = self.connect()?;
        let changed = conn.execute(
            "UPDATE jobs SET progress = ?1 WHERE job_id = ?2",
            params![progress, job_id.as_str()],
        )?;
        if changed == 0 {
            return Err(StoreError::JobNotFound(job_id.clone()));
        }
        Ok(())
    }

    /// Replaces a job's still-expected file list.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::JobNotFound`] if no row has the given id.
    pub fn update_expected_files(
        &self,
        job_id: &JobId,
        expected_files: &[String],
    ) -> Result<(), StoreError> {
        let conn = self.connect()?;
        let changed = conn.execute(
            "UPDATE jobs SET expected_files = ?1 WHERE job_id = ?2",
            params![serde_json::to_string(expected_files)?, job_id.as_str()],
        )?;
        if changed == 0 {
            return Err(StoreError::JobNotFound(job_id.clone()));
        }
        Ok(())
    }

    /// Replaces a job's extras bag.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::JobNotFound`] if no row has the given id.
    pub fn update_extras(
        &self,
        job_id: &JobId,
        extras: &HashMap<String, String>,
    ) -> Result<(), StoreError> {
        let conn = self.connect()?;
        let changed = conn.execute(
            "UPDATE jobs SET extras = ?1 WHERE job_id = ?2",
            params![serde_json::to_string(extras)?, job_id.as_str()],
        )?;
        if changed == 0 {
            return Err(StoreError::JobNotFound(job_id.clone()));
        }
        Ok(())
    }

    /// Fetches one job projection by id.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn get(&self, job_id: &JobId) -> Result<Option<JobRecord>, StoreError> {
        let conn = self.connect()?;
        let record = conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = ?1"),
                params![job_id.as_str()],
                read_job_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Lists job projections, newest first, optionally filtered by status.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn list(&self, status: Option<JobStatus>) -> Result<Vec<JobRecord>, StoreError> {
        let conn = self.connect()?;
        let records = match status {
            Some(status) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {JOB_COLUMNS} FROM jobs WHERE status = ?1 ORDER BY job_id DESC"
                ))?;
                let rows = stmt.query_map(params![status.as_str()], read_job_row)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let mut stmt =
                    conn.prepare(&format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY job_id DESC"))?;
                let rows = stmt.query_map([], read_job_row)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        Ok(records)
    }

    /// Lists the jobs linked to one watcher, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn by_watcher(&self, watcher_id: i64) -> Result<Vec<JobRecord>, StoreError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE watcher_id = ?1 ORDER BY job_id"
        ))?;
        let rows = stmt.query_map(params![watcher_id], read_job_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Lists job projections whose status is any of `statuses`.
    ///
    /// Used by startup recovery to find jobs interrupted by a shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn with_status_in(&self, statuses: &[JobStatus]) -> Result<Vec<JobRecord>, StoreError> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.connect()?;
        let placeholders = (1..=statuses.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE status IN ({placeholders}) ORDER BY job_id"
        ))?;
        let rows = stmt.query_map(
            params_from_iter(statuses.iter().map(JobStatus::as_str)),
            read_job_row,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

const JOB_COLUMNS: &str = "job_id, job_name, job_submitter, job_type, job_demands, \
     local_folder, watcher_id, status, progress, expected_files, \
     original_expected_files, extras, created_at, completed_at";

fn read_job_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobRecord> {
    let status_raw: String = row.get(7)?;
    let status = JobStatus::from_str(&status_raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let demands_raw: String = row.get(4)?;
    let expected_raw: String = row.get(9)?;
    let original_raw: String = row.get(10)?;
    let extras_raw: String = row.get(11)?;
    let created_raw: String = row.get(12)?;
    let completed_raw: Option<String> = row.get(13)?;

    Ok(JobRecord {
        job_id: JobId::from(row.get::<_, String>(0)?),
        job_name: row.get(1)?,
        job_submitter: row.get(2)?,
        job_type: row.get(3)?,
        job_demands: parse_json(4, &demands_raw)?,
        local_folder: PathBuf::from(row.get::<_, String>(5)?),
        watcher_id: row.get(6)?,
        status,
        progress: row.get(8)?,
        expected_files: serde_json::from_str(&expected_raw).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(9, rusqlite::types::Type::Text, Box::new(e))
        })?,
        original_expected_files: serde_json::from_str(&original_raw).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(10, rusqlite::types::Type::Text, Box::new(e))
        })?,
        extras: serde_json::from_str(&extras_raw).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(11, rusqlite::types::Type::Text, Box::new(e))
        })?,
        created_at: parse_timestamp(12, &created_raw)?,
        completed_at: completed_raw
            .map(|raw| parse_timestamp(13, &raw))
            .transpose()?,
    })
}
