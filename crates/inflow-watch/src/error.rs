//! Watcher error type.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from watcher configuration and operation.
#[derive(Error, Debug)]
pub enum WatchError {
    /// The pattern list was empty after splitting.
    #[error("watcher pattern list is empty")]
    EmptyPattern,

    /// A wildcard entry did not compile as a glob.
    #[error("invalid file pattern: {pattern}")]
    Pattern {
        /// The offending entry.
        pattern: String,
        /// Compilation error from the glob crate.
        source: glob::PatternError,
    },

    /// The watch folder does not exist or is not a directory.
    #[error("watch folder is unusable: {path}")]
    FolderUnusable {
        /// The configured folder.
        path: PathBuf,
    },

    /// The filesystem notification backend failed.
    #[error("filesystem watch failed")]
    Notify(#[from] notify::Error),

    /// A persistence operation failed.
    #[error("persistence failed")]
    Store(#[from] inflow_store::StoreError),

    /// Job creation through the queue manager failed.
    #[error("job creation failed")]
    Engine(#[from] inflow_engine::EngineError),

    /// The watcher id has no running task.
    #[error("watcher is not running: {0}")]
    NotRunning(i64),

    /// The watcher id is unknown to the store.
    #[error("watcher not found: {0}")]
    NotFound(i64),
}
