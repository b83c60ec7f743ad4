//! Validated status and progress updates from any caller.

use crate::EngineError;
use crate::queue::JobQueueManager;
use inflow_events::{Event, EventBus, EventType};
use inflow_store::JobStore;
use inflow_types::{Job, JobId, JobStatus};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Point-in-time view of one job, for status queries.
#[derive(Debug, Clone)]
pub struct JobStatusSnapshot {
    /// Job id.
    pub job_id: JobId,
    /// Human-readable name.
    pub job_name: String,
    /// Handler registry key.
    pub job_type: String,
    /// Lifecycle status.
    pub status: JobStatus,
    /// Progress fraction in [0, 1].
    pub progress: f64,
}

/// Coordinates status changes between callers, the live collections, the
/// store and the event bus.
///
/// One instance serves the whole process; the composition root guards
/// construction. Jobs that are no longer resident after a restart are
/// reconstructed from their stored record and re-entered into the live
/// collections on their next update.
pub struct JobStatusManager {
    queue: Arc<JobQueueManager>,
    store: JobStore,
    bus: Arc<EventBus>,
}

impl std::fmt::Debug for JobStatusManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobStatusManager").finish_non_exhaustive()
    }
}

impl JobStatusManager {
    /// Creates the manager and subscribes its store-writing handlers, so
    /// status and progress events published by other components are
    /// persisted on the bus dispatch task.
    #[must_use]
    pub fn new(queue: Arc<JobQueueManager>, store: JobStore, bus: Arc<EventBus>) -> Self {
        let status_store = store.clone();
        bus.subscribe(EventType::JobStatusChanged, move |event| {
            let Some(job_id) = event.job_id.as_ref() else {
                return;
            };
            let Some(to) = event
                .payload
                .get("to")
                .and_then(serde_json::Value::as_str)
                .and_then(|s| s.parse::<JobStatus>().ok())
            else {
                return;
            };
            if let Err(e) = status_store.update_status(job_id, to) {
                debug!(job_id = %job_id, error = %e, "status event not persisted");
            }
        });
        let progress_store = store.clone();
        bus.subscribe(EventType::JobProgressUpdated, move |event| {
            let Some(job_id) = event.job_id.as_ref() else {
                return;
            };
            let Some(progress) = event
                .payload
                .get("progress")
                .and_then(serde_json::Value::as_f64)
            else {
                return;
            };
            if let Err(e) = progress_store.update_progress(job_id, progress) {
                debug!(job_id = %job_id, error = %e, "progress event not persisted");
            }
        });

        Self { queue, store, bus }
    }

    /// Applies a status (and optionally an absolute progress fraction) to a
    /// job, live or stored.
    ///
    /// A live job is updated in place and relocated between collections. A
    /// job known only to the store is reconstructed into the live
    /// collections first, which is how interrupted jobs re-enter the system
    /// after a restart. A repeat of the current status is a no-op for the
    /// status while progress is still applied.
    ///
    /// Cancellation additionally pushes a stop token to the handler and
    /// kills any registered external process tree.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::JobNotFound`] for an unknown id, or a
    /// transition error from the lifecycle table.
    pub fn update_job_status(
        &self,
        job_id: &JobId,
        status: JobStatus,
        progress: Option<f64>,
    ) -> Result<(), EngineError> {
        let (job, resident) = match self.queue.find_by_id(job_id) {
            Some(job) => (job, true),
            None => {
                let record = self
                    .store
                    .get(job_id)?
                    .ok_or_else(|| EngineError::JobNotFound(job_id.clone()))?;
                debug!(job_id = %job_id, "reconstructing job from store");
                (Arc::new(Job::from_record(&record)), false)
            }
        };

        if let Some(progress) = progress {
            self.apply_progress(&job, progress);
        }

        let current = job.status();
        if status == current {
            if !resident {
                self.queue.relocate(&job);
                if status == JobStatus::Queued {
                    self.queue.enqueue_for_dispatch(job_id);
                }
            }
            return Ok(());
        }

        if status == JobStatus::Cancelled {
            let stopped = self.queue.request_stop(job_id);
            let killed = self.queue.kill_job_processes(job_id);
            info!(job_id = %job_id, stopped, killed, "cancellation requested");
        }

        let from = job.set_status(status)?;
        self.queue.relocate(&job);
        if status == JobStatus::Queued {
            self.queue.enqueue_for_dispatch(job_id);
        }
        self.store.update_status(job_id, status)?;
        self.bus.publish(Event::for_job(
            EventType::JobStatusChanged,
            job_id.clone(),
            json!({"from": from.as_str(), "to": status.as_str()}),
        ));
        Ok(())
    }

    /// Applies each update independently; returns the ids that succeeded
    /// and the ids that failed.
    pub fn bulk_update_jobs(
        &self,
        updates: &[(JobId, JobStatus, Option<f64>)],
    ) -> (Vec<JobId>, Vec<JobId>) {
        let mut succeeded = Vec::new();
        let mut failed = Vec::new();
        for (job_id, status, progress) in updates {
            match self.update_job_status(job_id, *status, *progress) {
                Ok(()) => succeeded.push(job_id.clone()),
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "bulk update entry failed");
                    failed.push(job_id.clone());
                }
            }
        }
        (succeeded, failed)
    }

    /// Snapshots a job's status from memory, falling back to the store.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::JobNotFound`] for an unknown id.
    pub fn get_job_status(&self, job_id: &JobId) -> Result<JobStatusSnapshot, EngineError> {
        if let Some(job) = self.queue.find_by_id(job_id) {
            return Ok(JobStatusSnapshot {
                job_id: job.id().clone(),
                job_name: job.job_name().to_string(),
                job_type: job.job_type().to_string(),
                status: job.status(),
                progress: job.progress(),
            });
        }
        let record = self
            .store
            .get(job_id)?
            .ok_or_else(|| EngineError::JobNotFound(job_id.clone()))?;
        Ok(JobStatusSnapshot {
            job_id: record.job_id,
            job_name: record.job_name,
            job_type: record.job_type,
            status: record.status,
            progress: record.progress,
        })
    }

    /// Cancels a job from any non-terminal state.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown id or an already-terminal job.
    pub fn cancel_job(&self, job_id: &JobId) -> Result<(), EngineError> {
        self.update_job_status(job_id, JobStatus::Cancelled, None)
    }

    /// Converts an absolute progress fraction into an increment on the live
    /// job, falling back to a clamped direct set when the increment would
    /// breach bounds.
    fn apply_progress(&self, job: &Arc<Job>, absolute: f64) {
        let delta = absolute - job.progress();
        let applied = match job.update_progress(delta) {
            Ok(p) => p,
            Err(_) => {
                let clamped = absolute.clamp(0.0, 1.0);
                if job.set_progress(clamped).is_err() {
                    return;
                }
                clamped
            }
        };
        if let Err(e) = self.store.update_progress(job.id(), applied) {
            debug!(job_id = %job.id(), error = %e, "progress not persisted");
        }
        self.bus.publish(Event::for_job(
            EventType::JobProgressUpdated,
            job.id().clone(),
            json!({"progress": applied}),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{HandlerContext, HandlerError, HandlerRegistry, JobHandler};
    use crate::queue::ProbeConfig;
    use inflow_types::JobSpec;
    use std::time::Duration;
    use tempfile::TempDir;

    struct InstantHandler;

    impl JobHandler for InstantHandler {
        fn run(&self, _ctx: &mut HandlerContext) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    async fn wait_for_status(job: &Arc<Job>, status: JobStatus) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while job.status() != status {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {status}"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn setup(dir: &std::path::Path) -> (Arc<JobQueueManager>, JobStatusManager, JobStore) {
        let store = JobStore::open(dir.join("jobs.db")).unwrap();
        let bus = Arc::new(EventBus::new());
        let probe = ProbeConfig {
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(120),
        };
        let queue = JobQueueManager::new(store.clone(), Arc::clone(&bus), HandlerRegistry::new(), probe);
        let manager = JobStatusManager::new(Arc::clone(&queue), store.clone(), bus);
        (queue, manager, store)
    }

    fn gated_spec(dir: &std::path::Path) -> JobSpec {
        JobSpec {
            submitter: "tester".to_string(),
            job_type: "scripted".to_string(),
            job_demands: serde_json::json!({}),
            expected_files: vec!["gate.raw".to_string()],
            local_folder: dir.to_path_buf(),
            job_name: "run".to_string(),
            watcher_id: None,
        }
    }

    #[tokio::test]
    async fn test_live_update_relocates() {
        let dir = TempDir::new().unwrap();
        let (queue, manager, store) = setup(dir.path());
        let job = queue.add_job(gated_spec(dir.path())).unwrap();

        manager
            .update_job_status(job.id(), JobStatus::Queued, None)
            .unwrap();
        assert_eq!(job.status(), JobStatus::Queued);
        assert_eq!(queue.depths().queued, 1);
        assert_eq!(queue.depths().waiting, 0);
        assert_eq!(
            store.get(job.id()).unwrap().unwrap().status,
            JobStatus::Queued
        );
    }

    #[tokio::test]
    async fn test_invalid_transition_is_rejected() {
        let dir = TempDir::new().unwrap();
        let (queue, manager, _store) = setup(dir.path());
        let job = queue.add_job(gated_spec(dir.path())).unwrap();

        let err = manager
            .update_job_status(job.id(), JobStatus::Running, None)
            .unwrap_err();
        assert!(matches!(err, EngineError::Job(_)));
        assert_eq!(job.status(), JobStatus::Waiting);
    }

    #[tokio::test]
    async fn test_repeat_status_applies_progress_only() {
        let dir = TempDir::new().unwrap();
        let (queue, manager, _store) = setup(dir.path());
        let job = queue.add_job(gated_spec(dir.path())).unwrap();
        manager
            .update_job_status(job.id(), JobStatus::Queued, None)
            .unwrap();

        manager
            .update_job_status(job.id(), JobStatus::Queued, Some(0.4))
            .unwrap();
        assert!((job.progress() - 0.4).abs() < 1e-9);
        assert_eq!(job.status(), JobStatus::Queued);
    }

    #[tokio::test]
    async fn test_out_of_range_progress_clamps() {
        let dir = TempDir::new().unwrap();
        let (queue, manager, _store) = setup(dir.path());
        let job = queue.add_job(gated_spec(dir.path())).unwrap();

        manager
            .update_job_status(job.id(), JobStatus::Waiting, Some(1.7))
            .unwrap();
        assert!((job.progress() - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_non_resident_job_is_reconstructed() {
        let dir = TempDir::new().unwrap();
        let (queue, manager, store) = setup(dir.path());

        // Stored but not live, as after a process restart.
        let record = Job::new(gated_spec(dir.path())).to_record();
        store.upsert(&record).unwrap();
        assert!(queue.find_by_id(&record.job_id).is_none());

        manager
            .update_job_status(&record.job_id, JobStatus::Queued, None)
            .unwrap();
        let revived = queue.find_by_id(&record.job_id).unwrap();
        assert_eq!(revived.status(), JobStatus::Queued);
        assert_eq!(queue.depths().queued, 1);
    }

    #[tokio::test]
    async fn test_unknown_job_fails() {
        let dir = TempDir::new().unwrap();
        let (_queue, manager, _store) = setup(dir.path());
        let err = manager
            .update_job_status(&JobId::from("missing"), JobStatus::Queued, None)
            .unwrap_err();
        assert!(matches!(err, EngineError::JobNotFound(_)));
    }

    #[tokio::test]
    async fn test_cancel_waiting_job() {
        let dir = TempDir::new().unwrap();
        let (queue, manager, store) = setup(dir.path());
        let job = queue.add_job(gated_spec(dir.path())).unwrap();

        manager.cancel_job(job.id()).unwrap();
        assert_eq!(job.status(), JobStatus::Cancelled);
        assert_eq!(queue.depths().completed, 1);
        let stored = store.get(job.id()).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Cancelled);
        assert!(stored.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_bulk_update_partitions_results() {
        let dir = TempDir::new().unwrap();
        let (queue, manager, _store) = setup(dir.path());
        let job = queue.add_job(gated_spec(dir.path())).unwrap();

        let (succeeded, failed) = manager.bulk_update_jobs(&[
            (job.id().clone(), JobStatus::Queued, None),
            (JobId::from("missing"), JobStatus::Queued, None),
        ]);
        assert_eq!(succeeded, vec![job.id().clone()]);
        assert_eq!(failed, vec![JobId::from("missing")]);
    }

    #[tokio::test]
    async fn test_get_job_status_falls_back_to_store() {
        let dir = TempDir::new().unwrap();
        let (queue, manager, store) = setup(dir.path());

        let record = Job::new(gated_spec(dir.path())).to_record();
        store.upsert(&record).unwrap();
        assert!(queue.find_by_id(&record.job_id).is_none());

        let snapshot = manager.get_job_status(&record.job_id).unwrap();
        assert_eq!(snapshot.status, JobStatus::Waiting);
        assert_eq!(snapshot.job_name, "run");
        assert!(manager.get_job_status(&JobId::from("missing")).is_err());
    }

    #[tokio::test]
    async fn test_repeat_queued_update_revives_dispatch() {
        let dir = TempDir::new().unwrap();
        let store = JobStore::open(dir.path().join("jobs.db")).unwrap();
        let bus = Arc::new(EventBus::new());
        let registry = HandlerRegistry::new();
        registry.register("scripted", || Box::new(InstantHandler));
        let probe = ProbeConfig {
            interval: Duration::from_millis(30),
            timeout: Duration::from_secs(5),
        };
        let queue = JobQueueManager::new(store.clone(), Arc::clone(&bus), registry, probe);
        let manager = JobStatusManager::new(Arc::clone(&queue), store.clone(), bus);
        queue.run_dispatcher();

        // Stored as queued before the restart; nothing live yet.
        let mut record = Job::new(gated_spec(dir.path())).to_record();
        record.expected_files.clear();
        record.status = JobStatus::Queued;
        store.upsert(&record).unwrap();

        // Re-announcing the stored status must still hand the revived job
        // to the dispatcher.
        manager
            .update_job_status(&record.job_id, JobStatus::Queued, None)
            .unwrap();
        let job = queue.find_by_id(&record.job_id).unwrap();
        wait_for_status(&job, JobStatus::Completed).await;
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread")]
    async fn test_cancel_running_job_kills_process_tree() {
        use crate::process::{is_process_running, spawn_managed};
        use std::sync::mpsc;

        struct SleeperHandler {
            pid_tx: mpsc::Sender<u32>,
        }

        impl JobHandler for SleeperHandler {
            fn run(&self, ctx: &mut HandlerContext) -> Result<(), HandlerError> {
                let mut child = spawn_managed(
                    std::process::Command::new("sleep").arg("30"),
                    ctx.process_handle(),
                )?;
                let _ = self.pid_tx.send(child.id());
                loop {
                    if ctx.should_stop() {
                        ctx.process_handle().kill_tree();
                        return Err(HandlerError::Stopped);
                    }
                    if child.try_wait()?.is_some() {
                        return Ok(());
                    }
                    std::thread::sleep(Duration::from_millis(25));
                }
            }
        }

        let dir = TempDir::new().unwrap();
        let store = JobStore::open(dir.path().join("jobs.db")).unwrap();
        let bus = Arc::new(EventBus::new());
        let registry = HandlerRegistry::new();
        let (pid_tx, pid_rx) = mpsc::channel();
        registry.register("scripted", move || {
            Box::new(SleeperHandler {
                pid_tx: pid_tx.clone(),
            })
        });
        let probe = ProbeConfig {
            interval: Duration::from_millis(30),
            timeout: Duration::from_secs(5),
        };
        let queue = JobQueueManager::new(store.clone(), Arc::clone(&bus), registry, probe);
        let manager = JobStatusManager::new(Arc::clone(&queue), store.clone(), bus);
        queue.run_dispatcher();

        let mut spec = gated_spec(dir.path());
        spec.expected_files.clear();
        let job = queue.add_job(spec).unwrap();
        let pid = pid_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(is_process_running(pid));

        manager.cancel_job(job.id()).unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while job.status() != JobStatus::Cancelled || is_process_running(pid) {
            assert!(
                tokio::time::Instant::now() < deadline,
                "cancellation did not stop the external process"
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert_eq!(
            store.get(job.id()).unwrap().unwrap().status,
            JobStatus::Cancelled
        );
    }
}
