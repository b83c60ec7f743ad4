//! Startup reconciliation and manual restart.
//!
//! A restart leaves the stores describing a world that no longer exists:
//! jobs marked `queued` or `running` whose work died with the process, and
//! watchers still `monitoring` folders whose batches already finished.
//! [`RecoveryManager`] reconciles that state exactly once per process
//! lifetime. Interrupted external work is never resumed; it is
//! deterministically marked failed, and only the explicit
//! [`RecoveryManager::restart_job`] brings a job back.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use inflow_engine::JobQueueManager;
use inflow_events::{Event, EventBus, EventType};
use inflow_store::{JobStore, WatcherStore};
use inflow_types::{Job, JobId, JobStatus, WatcherStatus};
use inflow_watch::WatcherManager;
use serde_json::json;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::{info, warn};

/// Errors from recovery and restart.
#[derive(Error, Debug)]
pub enum RecoveryError {
    /// A persistence operation failed.
    #[error("persistence failed")]
    Store(#[from] inflow_store::StoreError),

    /// Watcher management failed during a restart.
    #[error("watcher restart failed")]
    Watch(#[from] inflow_watch::WatchError),

    /// Recovery already ran (or is running) in this process.
    #[error("recovery has already run in this process")]
    AlreadyRan,

    /// No stored job with the given id.
    #[error("job not found: {0}")]
    JobNotFound(JobId),

    /// Restart requested from a status that does not allow it.
    #[error("job cannot be restarted from status {0}")]
    RestartNotAllowed(JobStatus),
}

/// What a recovery pass changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoverySummary {
    /// Interrupted jobs marked `errored`.
    pub jobs_failed: usize,
    /// Orphaned watchers marked `completed`.
    pub watchers_completed: usize,
}

/// Progress of the once-per-process recovery pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryStatus {
    /// A pass is currently executing.
    pub in_progress: bool,
    /// A pass has finished in this process.
    pub completed: bool,
}

#[derive(Default)]
struct Flags {
    in_progress: bool,
    completed: bool,
}

/// One-shot startup reconciliation plus the manual restart operation.
pub struct RecoveryManager {
    job_store: JobStore,
    watcher_store: WatcherStore,
    queue: Arc<JobQueueManager>,
    watchers: Arc<WatcherManager>,
    bus: Arc<EventBus>,
    flags: Mutex<Flags>,
}

impl std::fmt::Debug for RecoveryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryManager")
            .field("status", &self.recovery_status())
            .finish_non_exhaustive()
    }
}

impl RecoveryManager {
    /// Creates the manager.
    #[must_use]
    pub fn new(
        job_store: JobStore,
        watcher_store: WatcherStore,
        queue: Arc<JobQueueManager>,
        watchers: Arc<WatcherManager>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            job_store,
            watcher_store,
            queue,
            watchers,
            bus,
            flags: Mutex::new(Flags::default()),
        }
    }

    /// Reconciles stored state with the fresh process, once.
    ///
    /// Stored `queued` and `running` jobs are marked `errored` with an
    /// explanatory message; their transitions bypass the live lifecycle
    /// table because these jobs are store-only. `waiting` jobs keep
    /// waiting. Monitoring watchers with no non-terminal linked jobs are
    /// marked `completed`, including watchers that never produced a job; a
    /// watcher still collecting toward a batch keeps monitoring through its
    /// preserved `waiting` job.
    ///
    /// # Errors
    ///
    /// Returns [`RecoveryError::AlreadyRan`] on a second invocation, or a
    /// store error from the pass itself.
    pub fn run_recovery(&self) -> Result<RecoverySummary, RecoveryError> {
        {
            let mut flags = self.lock_flags();
            if flags.in_progress || flags.completed {
                return Err(RecoveryError::AlreadyRan);
            }
            flags.in_progress = true;
        }
        self.bus.publish(Event::new(
            EventType::SystemRecovery,
            json!({"phase": "started"}),
        ));

        let result = self.recovery_pass();
        {
            let mut flags = self.lock_flags();
            flags.in_progress = false;
            flags.completed = true;
        }
        match &result {
            Ok(summary) => {
                info!(
                    jobs_failed = summary.jobs_failed,
                    watchers_completed = summary.watchers_completed,
                    "recovery finished"
                );
                self.bus.publish(Event::new(
                    EventType::SystemRecovery,
                    json!({
                        "phase": "completed",
                        "jobs_failed": summary.jobs_failed,
                        "watchers_completed": summary.watchers_completed,
                    }),
                ));
            }
            Err(e) => {
                warn!(error = %e, "recovery failed");
                self.bus.publish(Event::new(
                    EventType::SystemRecovery,
                    json!({"phase": "error", "message": e.to_string()}),
                ));
            }
        }
        result
    }

    fn recovery_pass(&self) -> Result<RecoverySummary, RecoveryError> {
        let mut summary = RecoverySummary::default();

        let interrupted = self
            .job_store
            .with_status_in(&[JobStatus::Queued, JobStatus::Running])?;
        for record in interrupted {
            let message = format!(
                "Job was {} when system was shut down. Marked as failed on restart.",
                record.status
            );
            warn!(job_id = %record.job_id, message = %message, "failing interrupted job");
            self.job_store
                .update_status(&record.job_id, JobStatus::Errored)?;
            let mut extras = record.extras.clone();
            extras.insert("error".to_string(), message.clone());
            self.job_store.update_extras(&record.job_id, &extras)?;
            self.bus.publish(Event::for_job(
                EventType::JobStatusChanged,
                record.job_id.clone(),
                json!({"from": record.status.as_str(), "to": JobStatus::Errored.as_str()}),
            ));
            self.bus.publish(Event::for_job(
                EventType::JobError,
                record.job_id,
                json!({"message": message}),
            ));
            summary.jobs_failed += 1;
        }

        for config in self
            .watcher_store
            .list(Some(WatcherStatus::Monitoring))?
        {
            let jobs = self.job_store.by_watcher(config.id)?;
            if jobs.iter().any(|j| !j.status.is_terminal()) {
                continue;
            }
            info!(watcher_id = config.id, "closing orphaned watcher");
            self.watcher_store
                .update_status(config.id, WatcherStatus::Completed)?;
            self.bus.publish(Event::for_watcher(
                EventType::WatcherStatusChanged,
                config.id,
                json!({"status": WatcherStatus::Completed.as_str()}),
            ));
            summary.watchers_completed += 1;
        }

        Ok(summary)
    }

    /// Reports whether recovery is running or has run.
    #[must_use]
    pub fn recovery_status(&self) -> RecoveryStatus {
        let flags = self.lock_flags();
        RecoveryStatus {
            in_progress: flags.in_progress,
            completed: flags.completed,
        }
    }

    /// Brings an `errored` or `cancelled` job back to `Waiting`.
    ///
    /// The stored record is reset (full expected set, zero progress, no
    /// completion time), a live job is reconstructed into the waiting
    /// collection with a fresh readiness probe, and the linked watcher, if
    /// any, is brought back to monitoring.
    ///
    /// # Errors
    ///
    /// Returns [`RecoveryError::RestartNotAllowed`] unless the job is
    /// `errored` or `cancelled`, or [`RecoveryError::JobNotFound`] for an
    /// unknown id.
    pub fn restart_job(&self, job_id: &JobId) -> Result<(), RecoveryError> {
        let mut record = self
            .job_store
            .get(job_id)?
            .ok_or_else(|| RecoveryError::JobNotFound(job_id.clone()))?;
        if !matches!(record.status, JobStatus::Errored | JobStatus::Cancelled) {
            return Err(RecoveryError::RestartNotAllowed(record.status));
        }

        let from = record.status;
        record.status = JobStatus::Waiting;
        record.progress = 0.0;
        record.expected_files = record.original_expected_files.clone();
        record.completed_at = None;
        record.extras.remove("error");
        self.job_store.upsert(&record)?;

        let job = Arc::new(Job::from_record(&record));
        self.queue.adopt_job(job);
        info!(job_id = %job_id, "job restarted");
        self.bus.publish(Event::for_job(
            EventType::JobStatusChanged,
            job_id.clone(),
            json!({"from": from.as_str(), "to": JobStatus::Waiting.as_str()}),
        ));

        if let Some(watcher_id) = record.watcher_id {
            if let Err(e) = self.watchers.ensure_running(watcher_id) {
                warn!(watcher_id, error = %e, "linked watcher could not be restarted");
            }
        }
        Ok(())
    }

    fn lock_flags(&self) -> std::sync::MutexGuard<'_, Flags> {
        self.flags.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
