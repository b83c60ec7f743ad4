//! The daemon run loop: composition root for the whole system.

use crate::handlers;
use anyhow::{Context, Result, anyhow};
use inflow_engine::{HandlerRegistry, JobQueueManager, JobStatusManager, ProbeConfig};
use inflow_events::EventBus;
use inflow_recovery::RecoveryManager;
use inflow_watch::{WatcherManager, WatcherSettings};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{info, warn};

/// One status manager per process; construction happens here and nowhere
/// else.
static STATUS_MANAGER: OnceLock<Arc<JobStatusManager>> = OnceLock::new();

/// Executes the run command.
pub(crate) async fn run(
    data_dir: PathBuf,
    probe_interval: u64,
    probe_timeout: u64,
    settle: u64,
) -> Result<()> {
    let job_store = crate::commands::open_job_store(&data_dir)?;
    let watcher_store = crate::commands::open_watcher_store(&data_dir)?;
    info!(data_dir = %data_dir.display(), "starting inflow daemon");

    let bus = Arc::new(EventBus::new());
    let registry = HandlerRegistry::new();
    handlers::register_builtin(&registry);

    let probe = ProbeConfig {
        interval: Duration::from_secs(probe_interval),
        timeout: Duration::from_secs(probe_timeout),
    };
    let queue = JobQueueManager::new(job_store.clone(), Arc::clone(&bus), registry, probe);

    let status_manager = Arc::new(JobStatusManager::new(
        Arc::clone(&queue),
        job_store.clone(),
        Arc::clone(&bus),
    ));
    STATUS_MANAGER
        .set(status_manager)
        .map_err(|_| anyhow!("status manager already initialized"))?;

    let watchers = Arc::new(WatcherManager::new(
        watcher_store.clone(),
        Arc::clone(&queue),
        Arc::clone(&bus),
        WatcherSettings {
            settle: Duration::from_secs(settle),
        },
    ));

    let recovery = RecoveryManager::new(
        job_store,
        watcher_store,
        Arc::clone(&queue),
        Arc::clone(&watchers),
        Arc::clone(&bus),
    );
    tokio::spawn(async move {
        match recovery.run_recovery() {
            Ok(summary) => info!(
                jobs_failed = summary.jobs_failed,
                watchers_completed = summary.watchers_completed,
                "startup recovery finished"
            ),
            Err(e) => warn!(error = %e, "startup recovery failed"),
        }
    });

    let started = watchers
        .start_stored()
        .context("Failed to start stored watchers")?;
    info!(watchers = started, "stored watchers started");
    queue.run_dispatcher();
    queue.run_cancel_sweep(Duration::from_secs(2));

    info!("daemon running; press ctrl-c to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!("shutting down");
    watchers.shutdown().await;
    bus.shutdown(Duration::from_secs(5)).await;
    Ok(())
}
