//! Stored-state reconciliation command.

use anyhow::{Context, Result};
use inflow_events::EventBus;
use inflow_recovery::RecoveryManager;
use inflow_types::{JobStatus, WatcherStatus};
use inflow_watch::{WatcherManager, WatcherSettings};
use std::path::Path;
use std::sync::Arc;

/// Reports (or, with `run`, reconciles) state left behind by an unclean
/// shutdown. The daemon performs the same pass automatically at startup.
pub(crate) fn recovery(data_dir: &Path, run: bool) -> Result<()> {
    let job_store = crate::commands::open_job_store(data_dir)?;
    let watcher_store = crate::commands::open_watcher_store(data_dir)?;

    if !run {
        let interrupted = job_store.with_status_in(&[JobStatus::Queued, JobStatus::Running])?;
        let monitoring = watcher_store.list(Some(WatcherStatus::Monitoring))?;
        println!("Interrupted jobs (queued/running): {}", interrupted.len());
        for record in &interrupted {
            println!("  {}  {:<8}  {}", record.job_id, record.status, record.job_name);
        }
        println!("Monitoring watchers: {}", monitoring.len());
        if !interrupted.is_empty() {
            println!("Run `inflow recovery --run` (or start the daemon) to reconcile");
        }
        return Ok(());
    }

    let bus = Arc::new(EventBus::new());
    let queue = crate::commands::ephemeral_queue(job_store.clone(), &bus);
    let watchers = Arc::new(WatcherManager::new(
        watcher_store.clone(),
        Arc::clone(&queue),
        Arc::clone(&bus),
        WatcherSettings::default(),
    ));
    let manager = RecoveryManager::new(job_store, watcher_store, queue, watchers, bus);
    let summary = manager.run_recovery().context("Recovery pass failed")?;
    println!(
        "Recovery finished: {} job(s) marked errored, {} watcher(s) closed",
        summary.jobs_failed, summary.watchers_completed
    );
    Ok(())
}
