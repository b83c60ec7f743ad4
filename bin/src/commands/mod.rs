//! CLI command implementations.

pub(crate) mod jobs;
pub(crate) mod recovery;
pub(crate) mod run;
pub(crate) mod watcher;

use anyhow::{Context, Result};
use directories::{BaseDirs, ProjectDirs};
use inflow_engine::{HandlerRegistry, JobQueueManager, ProbeConfig};
use inflow_events::EventBus;
use inflow_store::{JobStore, WatcherStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Resolves the data directory: explicit flag, then the platform data dir,
/// then `~/.inflow`.
pub(crate) fn resolve_data_dir(explicit: Option<PathBuf>) -> PathBuf {
    if let Some(dir) = explicit {
        return dir;
    }
    if let Some(dirs) = ProjectDirs::from("", "", "inflow") {
        return dirs.data_dir().to_path_buf();
    }
    BaseDirs::new()
        .map(|dirs| dirs.home_dir().join(".inflow"))
        .unwrap_or_else(|| PathBuf::from(".inflow"))
}

pub(crate) fn open_job_store(data_dir: &Path) -> Result<JobStore> {
    JobStore::open(data_dir.join("jobs.db")).context("Failed to open job store")
}

pub(crate) fn open_watcher_store(data_dir: &Path) -> Result<WatcherStore> {
    WatcherStore::open(data_dir.join("watchers.db")).context("Failed to open watcher store")
}

/// Builds a queue manager for short-lived commands that update stored jobs
/// through the same code paths the daemon uses. No dispatcher is started;
/// jobs touched here only change in the store.
pub(crate) fn ephemeral_queue(
    job_store: JobStore,
    bus: &Arc<EventBus>,
) -> Arc<JobQueueManager> {
    JobQueueManager::new(
        job_store,
        Arc::clone(bus),
        HandlerRegistry::new(),
        ProbeConfig::default(),
    )
}
