//! Watcher management commands.

use anyhow::{Context, Result, bail};
use inflow_events::EventBus;
use inflow_types::{NewWatcher, WatcherStatus};
use inflow_watch::{CompiledPatterns, WatcherManager, WatcherSettings};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Registers a new watcher. The daemon picks it up at its next start; a
/// running daemon also watches it after a restart.
pub(crate) fn add(
    data_dir: &Path,
    folder: PathBuf,
    patterns: &str,
    job_type: String,
    demands: &str,
    job_name: String,
    submitter: String,
) -> Result<()> {
    if !folder.is_dir() {
        bail!("watch folder is not a directory: {}", folder.display());
    }
    CompiledPatterns::parse(patterns).context("Invalid pattern list")?;
    let job_demands: serde_json::Value =
        serde_json::from_str(demands).context("Demands must be a JSON object")?;

    let store = crate::commands::open_watcher_store(data_dir)?;
    let watcher_id = store.insert(&NewWatcher {
        watch_folder: folder.clone(),
        file_patterns: patterns.to_string(),
        job_type,
        job_demands,
        submitter,
        job_name,
    })?;
    println!("Watcher {watcher_id} registered for {}", folder.display());
    Ok(())
}

/// Lists watchers, optionally filtered by status.
pub(crate) fn list(data_dir: &Path, status: Option<&str>) -> Result<()> {
    let filter = status
        .map(str::parse::<WatcherStatus>)
        .transpose()
        .context("Unknown watcher status")?;
    let store = crate::commands::open_watcher_store(data_dir)?;
    let configs = store.list(filter)?;
    if configs.is_empty() {
        println!("No watchers");
        return Ok(());
    }
    for config in configs {
        println!(
            "{:>4}  {:<10}  {}  [{}]",
            config.id,
            config.status,
            config.watch_folder.display(),
            config.file_patterns,
        );
    }
    Ok(())
}

/// Cancels a watcher.
pub(crate) fn stop(data_dir: &Path, watcher_id: i64) -> Result<()> {
    let store = crate::commands::open_watcher_store(data_dir)?;
    let config = store
        .get(watcher_id)?
        .with_context(|| format!("Watcher {watcher_id} not found"))?;
    if config.status.is_terminal() {
        println!("Watcher {watcher_id} is already {}", config.status);
        return Ok(());
    }
    store.update_status(watcher_id, WatcherStatus::Cancelled)?;
    println!("Watcher {watcher_id} cancelled");
    Ok(())
}

/// Walks a watcher's folder once, capturing files that already qualify.
///
/// Runs the watcher task briefly in this process; captured files and any
/// jobs they produce are persisted for the daemon.
pub(crate) async fn rescan(data_dir: &Path, watcher_id: i64, settle: u64) -> Result<()> {
    let watcher_store = crate::commands::open_watcher_store(data_dir)?;
    let job_store = crate::commands::open_job_store(data_dir)?;
    watcher_store
        .get(watcher_id)?
        .with_context(|| format!("Watcher {watcher_id} not found"))?;

    let bus = Arc::new(EventBus::new());
    let queue = crate::commands::ephemeral_queue(job_store, &bus);
    let manager = WatcherManager::new(
        watcher_store.clone(),
        queue,
        Arc::clone(&bus),
        WatcherSettings {
            settle: Duration::from_secs(settle),
        },
    );
    manager
        .ensure_running(watcher_id)
        .context("Failed to start watcher for rescan")?;
    // The task rescans on startup; give it the settle window plus slack.
    tokio::time::sleep(Duration::from_secs(settle) * 2 + Duration::from_secs(1)).await;
    manager.shutdown().await;
    bus.shutdown(Duration::from_secs(2)).await;

    let captured = watcher_store.captures(watcher_id)?.len();
    println!("Watcher {watcher_id} has {captured} captured file(s)");
    Ok(())
}
