//! Watcher configuration and the captured-files ledger.

use crate::error::JobError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

/// Lifecycle state of a folder watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WatcherStatus {
    /// Actively watching for file arrivals.
    #[default]
    Monitoring,
    /// All expected files arrived; the watcher is done.
    Completed,
    /// Stopped by explicit request before completion.
    Cancelled,
    /// Temporarily suspended; events are ignored but state is kept.
    Paused,
}

impl WatcherStatus {
    /// Returns the status as a string identifier.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Monitoring => "monitoring",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Paused => "paused",
        }
    }

    /// Returns true if the watcher will never capture another file.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

impl std::fmt::Display for WatcherStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for WatcherStatus {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "monitoring" => Ok(Self::Monitoring),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            "paused" => Ok(Self::Paused),
            other => Err(JobError::UnknownStatus(other.to_string())),
        }
    }
}

/// Parameters for registering a new folder watcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewWatcher {
    /// Folder to watch for file arrivals.
    pub watch_folder: PathBuf,
    /// Semicolon-separated file patterns (literal names or globs).
    pub file_patterns: String,
    /// Handler registry key for jobs this watcher spawns.
    pub job_type: String,
    /// Opaque handler parameters forwarded to spawned jobs.
    pub job_demands: serde_json::Value,
    /// Who registered the watcher.
    pub submitter: String,
    /// Human-readable name for spawned jobs.
    pub job_name: String,
}

/// A persisted folder-watch configuration.
///
/// The `id` is assigned by the watcher store on insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    /// Store-assigned watcher id.
    pub id: i64,
    /// Folder being watched.
    pub watch_folder: PathBuf,
    /// Semicolon-separated file patterns.
    pub file_patterns: String,
    /// Handler registry key for spawned jobs.
    pub job_type: String,
    /// Opaque handler parameters.
    pub job_demands: serde_json::Value,
    /// Who registered the watcher.
    pub submitter: String,
    /// Human-readable name for spawned jobs.
    pub job_name: String,
    /// Current lifecycle state.
    pub status: WatcherStatus,
    /// Registration timestamp.
    pub created_at: DateTime<Utc>,
}

impl WatcherConfig {
    /// Splits the pattern string into its individual entries.
    ///
    /// Empty segments from stray separators are dropped.
    #[must_use]
    pub fn pattern_entries(&self) -> Vec<&str> {
        self.file_patterns
            .split(';')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect()
    }
}

/// One row of the captured-files ledger.
///
/// Every file a watcher accepts is recorded here, linked to the job that
/// consumed it (batch mode) or the job it spawned (per-file mode).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapturedFile {
    /// Store-assigned row id.
    pub id: i64,
    /// The watcher that captured the file.
    pub watcher_id: i64,
    /// Absolute path of the captured file.
    pub file_path: PathBuf,
    /// Bare file name, as matched against the pattern entries.
    pub file_name: String,
    /// The job this capture fed or spawned, if one exists yet.
    pub job_id: Option<crate::JobId>,
    /// Capture timestamp.
    pub captured_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(patterns: &str) -> WatcherConfig {
        WatcherConfig {
            id: 1,
            watch_folder: PathBuf::from("/data/incoming"),
            file_patterns: patterns.to_string(),
            job_type: "maxquant".to_string(),
            job_demands: serde_json::json!({}),
            submitter: "tester".to_string(),
            job_name: "run".to_string(),
            status: WatcherStatus::Monitoring,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_pattern_entries_split_and_trim() {
        let config = test_config("a.raw; b.raw;*.mzML;;");
        assert_eq!(config.pattern_entries(), vec!["a.raw", "b.raw", "*.mzML"]);
    }

    #[test]
    fn test_watcher_status_round_trip() {
        for status in [
            WatcherStatus::Monitoring,
            WatcherStatus::Completed,
            WatcherStatus::Cancelled,
            WatcherStatus::Paused,
        ] {
            assert_eq!(status.as_str().parse::<WatcherStatus>().unwrap(), status);
        }
        assert!("stopped".parse::<WatcherStatus>().is_err());
    }

    #[test]
    fn test_terminal_watcher_states() {
        assert!(!WatcherStatus::Monitoring.is_terminal());
        assert!(!WatcherStatus::Paused.is_terminal());
        assert!(WatcherStatus::Completed.is_terminal());
        assert!(WatcherStatus::Cancelled.is_terminal());
    }
}
