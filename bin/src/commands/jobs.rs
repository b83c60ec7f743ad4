//! Job listing and management commands.

use anyhow::{Context, Result};
use inflow_engine::JobStatusManager;
use inflow_events::EventBus;
use inflow_recovery::RecoveryManager;
use inflow_types::{JobId, JobStatus};
use inflow_watch::{WatcherManager, WatcherSettings};
use std::path::Path;
use std::sync::Arc;

/// Lists jobs, optionally filtered by status.
pub(crate) fn list(data_dir: &Path, status: Option<&str>) -> Result<()> {
    let filter = status
        .map(str::parse::<JobStatus>)
        .transpose()
        .context("Unknown job status")?;
    let store = crate::commands::open_job_store(data_dir)?;
    let records = store.list(filter)?;
    if records.is_empty() {
        println!("No jobs");
        return Ok(());
    }
    for record in records {
        println!(
            "{}  {:<10}  {:>5.1}%  {}  ({})",
            record.job_id,
            record.status,
            record.progress * 100.0,
            record.job_name,
            record.job_type,
        );
    }
    Ok(())
}

/// Shows one job's status, progress and timestamps.
pub(crate) fn status(data_dir: &Path, job_id: &str) -> Result<()> {
    let store = crate::commands::open_job_store(data_dir)?;
    let record = store
        .get(&JobId::from(job_id))?
        .with_context(|| format!("Job {job_id} not found"))?;

    println!("Job: {}", record.job_id);
    println!("Name: {}", record.job_name);
    println!("Type: {}", record.job_type);
    println!("Submitter: {}", record.job_submitter);
    println!("Status: {}", record.status);
    println!("Progress: {:.1}%", record.progress * 100.0);
    println!("Created: {}", record.created_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(completed) = record.completed_at {
        println!("Completed: {}", completed.format("%Y-%m-%d %H:%M:%S"));
    }
    if !record.expected_files.is_empty() {
        println!("Still expecting: {}", record.expected_files.join(", "));
    }
    if let Some(error) = record.extras.get("error") {
        println!("Error: {error}");
    }
    Ok(())
}

/// Cancels a job through the status manager's store-backed path.
pub(crate) fn cancel(data_dir: &Path, job_id: &str) -> Result<()> {
    let store = crate::commands::open_job_store(data_dir)?;
    let bus = Arc::new(EventBus::new());
    let queue = crate::commands::ephemeral_queue(store.clone(), &bus);
    let manager = JobStatusManager::new(queue, store, bus);
    manager
        .cancel_job(&JobId::from(job_id))
        .with_context(|| format!("Failed to cancel job {job_id}"))?;
    println!("Job {job_id} cancelled");
    Ok(())
}

/// Restarts an errored or cancelled job.
pub(crate) fn restart(data_dir: &Path, job_id: &str) -> Result<()> {
    let job_store = crate::commands::open_job_store(data_dir)?;
    let watcher_store = crate::commands::open_watcher_store(data_dir)?;
    let bus = Arc::new(EventBus::new());
    let queue = crate::commands::ephemeral_queue(job_store.clone(), &bus);
    let watchers = Arc::new(WatcherManager::new(
        watcher_store.clone(),
        Arc::clone(&queue),
        Arc::clone(&bus),
        WatcherSettings::default(),
    ));
    let recovery = RecoveryManager::new(job_store, watcher_store, queue, watchers, bus);
    recovery
        .restart_job(&JobId::from(job_id))
        .with_context(|| format!("Failed to restart job {job_id}"))?;
    println!("Job {job_id} reset to waiting");
    Ok(())
}
