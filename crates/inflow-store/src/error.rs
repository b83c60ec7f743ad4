//! Persistence error type.

use inflow_types::JobId;
use std::path::PathBuf;
use thiserror::Error;

/// Errors from the job and watcher stores.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Could not create the directory holding a database file.
    #[error("failed to create data directory {path}")]
    CreateDir {
        /// Directory that could not be created.
        path: PathBuf,
        /// Underlying io error.
        source: std::io::Error,
    },

    /// Could not open a database file.
    #[error("failed to open database {path}")]
    Open {
        /// Database file path.
        path: PathBuf,
        /// Underlying sqlite error.
        source: rusqlite::Error,
    },

    /// A statement or query failed.
    #[error("database operation failed")]
    Sql(#[from] rusqlite::Error),

    /// A stored JSON column could not be serialized or parsed.
    #[error("failed to encode record field as JSON")]
    Encode(#[from] serde_json::Error),

    /// No job row with the given id.
    #[error("job not found: {0}")]
    JobNotFound(JobId),

    /// No watcher row with the given id.
    #[error("watcher not found: {0}")]
    WatcherNotFound(i64),
}
