//! The job queue manager: lifecycle collections, readiness probing and
//! dispatch.

use crate::EngineError;
use crate::handler::{COMPLETED_TOKEN, ERROR_PREFIX, HandlerContext, HandlerRegistry};
use crate::process::ProcessHandle;
use inflow_events::{Event, EventBus, EventType};
use inflow_store::JobStore;
use inflow_types::{Job, JobId, JobSpec, JobStatus};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Tuning for the expected-file readiness probe.
#[derive(Debug, Clone, Copy)]
pub struct ProbeConfig {
    /// Delay between probe passes.
    pub interval: Duration,
    /// Hard cap on total probe time; exceeding it leaves the job `Waiting`.
    pub timeout: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(300),
        }
    }
}

/// Sizes of the four lifecycle collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueDepths {
    /// Jobs still waiting on expected files.
    pub waiting: usize,
    /// Jobs queued for dispatch.
    pub queued: usize,
    /// Jobs whose handler is executing.
    pub running: usize,
    /// Jobs in a terminal state.
    pub completed: usize,
}

type JobMap = Mutex<HashMap<JobId, Arc<Job>>>;

#[derive(Default)]
struct HandlerOutcome {
    status: Option<JobStatus>,
    message: Option<String>,
}

/// Owner of the live job collections and the dispatch pipeline.
///
/// Jobs move `waiting -> queued -> running -> completed` across four
/// independently locked maps; the canonical `Arc<Job>` travels with them.
/// Moving between maps is not atomic across their locks; queries across the
/// collections are best-effort snapshots.
pub struct JobQueueManager {
    waiting: JobMap,
    queued: JobMap,
    running: JobMap,
    completed: JobMap,
    dispatch_tx: mpsc::UnboundedSender<JobId>,
    dispatch_rx: Mutex<Option<mpsc::UnboundedReceiver<JobId>>>,
    stop_channels: Mutex<HashMap<JobId, mpsc::UnboundedSender<()>>>,
    process_handles: Mutex<HashMap<JobId, ProcessHandle>>,
    store: JobStore,
    bus: Arc<EventBus>,
    registry: HandlerRegistry,
    probe: ProbeConfig,
}

impl std::fmt::Debug for JobQueueManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueueManager")
            .field("depths", &self.depths())
            .finish_non_exhaustive()
    }
}

impl JobQueueManager {
    /// Creates the manager. Call [`JobQueueManager::run_dispatcher`] once to
    /// start draining the dispatch queue.
    #[must_use]
    pub fn new(
        store: JobStore,
        bus: Arc<EventBus>,
        registry: HandlerRegistry,
        probe: ProbeConfig,
    ) -> Arc<Self> {
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            waiting: Mutex::new(HashMap::new()),
            queued: Mutex::new(HashMap::new()),
            running: Mutex::new(HashMap::new()),
            completed: Mutex::new(HashMap::new()),
            dispatch_tx,
            dispatch_rx: Mutex::new(Some(dispatch_rx)),
            stop_channels: Mutex::new(HashMap::new()),
            process_handles: Mutex::new(HashMap::new()),
            store,
            bus,
            registry,
            probe,
        })
    }

    /// Creates a job from `spec`, persists it, and starts its readiness
    /// probe. Returns the live job.
    ///
    /// The job enters `Waiting`; once every expected file is present and
    /// stable it is promoted to `Queued` and enqueued for dispatch. Jobs
    /// with no expected files are promoted on the probe's first pass.
    ///
    /// # Errors
    ///
    /// Returns an error if the job cannot be persisted.
    pub fn add_job(self: &Arc<Self>, spec: JobSpec) -> Result<Arc<Job>, EngineError> {
        let job = Arc::new(Job::new(spec));
        self.store.upsert(&job.to_record())?;
        lock(&self.waiting).insert(job.id().clone(), Arc::clone(&job));
        info!(job_id = %job.id(), job_type = job.job_type(), "job added");

        let mut event = Event::for_job(
            EventType::JobCreated,
            job.id().clone(),
            json!({
                "job_name": job.job_name(),
                "job_type": job.job_type(),
                "expected_files": job.expected_files(),
            }),
        );
        if let Some(watcher_id) = job.watcher_id() {
            event = event.with_watcher(watcher_id);
        }
        self.bus.publish(event);

        let manager = Arc::clone(self);
        let probe_job = Arc::clone(&job);
        tokio::spawn(async move {
            manager.probe_readiness(probe_job).await;
        });
        Ok(job)
    }

    /// Re-enters an already-constructed job into the live collections.
    ///
    /// Used when a stored job is revived, e.g. by a manual restart. The job
    /// lands in the collection matching its current status; a `Waiting` job
    /// additionally gets a fresh readiness probe and a `Queued` job goes
    /// back on the dispatch queue.
    pub fn adopt_job(self: &Arc<Self>, job: Arc<Job>) {
        self.relocate(&job);
        match job.status() {
            JobStatus::Waiting => {
                let manager = Arc::clone(self);
                let probe_job = Arc::clone(&job);
                tokio::spawn(async move {
                    manager.probe_readiness(probe_job).await;
                });
            }
            JobStatus::Queued => self.enqueue_for_dispatch(job.id()),
            _ => {}
        }
    }

    /// Polls the job's expected files until all are present with a stable
    /// size, then promotes the job to `Queued`.
    ///
    /// A file counts as arrived when its size is unchanged across one probe
    /// interval. Exceeding the configured cap leaves the job `Waiting`.
    async fn probe_readiness(&self, job: Arc<Job>) {
        let deadline = Instant::now() + self.probe.timeout;
        let mut last_sizes: HashMap<String, u64> = HashMap::new();

        loop {
            if job.status() != JobStatus::Waiting {
                return;
            }
            for name in job.expected_files() {
                let path = job.local_folder().join(&name);
                match tokio::fs::metadata(&path).await {
                    Ok(meta) => {
                        let size = meta.len();
                        if last_sizes.get(&name) == Some(&size) {
                            job.remove_expected_file(&name);
                            let remaining: Vec<String> =
                                job.expected_files().into_iter().collect();
                            if let Err(e) = self.store.update_expected_files(job.id(), &remaining) {
                                warn!(job_id = %job.id(), error = %e, "failed to persist expected files");
                            }
                            debug!(job_id = %job.id(), file = %name, "expected file arrived");
                        } else {
                            last_sizes.insert(name.clone(), size);
                        }
                    }
                    Err(_) => {
                        // Not there yet, or vanished again after a partial copy.
                        last_sizes.remove(&name);
                    }
                }
            }
            if job.is_ready() {
                self.promote_to_queued(&job);
                return;
            }
            if Instant::now() >= deadline {
                warn!(
                    job_id = %job.id(),
                    missing = ?job.expected_files(),
                    "readiness probe timed out; job stays waiting"
                );
                return;
            }
            tokio::time::sleep(self.probe.interval).await;
        }
    }

    /// Moves a waiting job to `Queued` and enqueues it for dispatch.
    fn promote_to_queued(&self, job: &Arc<Job>) {
        let from = match job.set_status(JobStatus::Queued) {
            Ok(from) => from,
            Err(e) => {
                debug!(job_id = %job.id(), error = %e, "skipping promotion");
                return;
            }
        };
        lock(&self.waiting).remove(job.id());
        lock(&self.queued).insert(job.id().clone(), Arc::clone(job));
        if let Err(e) = self.store.update_status(job.id(), JobStatus::Queued) {
            warn!(job_id = %job.id(), error = %e, "failed to persist queued status");
        }
        self.publish_status_change(job, from, JobStatus::Queued);
        self.enqueue_for_dispatch(job.id());
    }

    /// Pushes a job id onto the dispatch queue.
    pub fn enqueue_for_dispatch(&self, job_id: &JobId) {
        if self.dispatch_tx.send(job_id.clone()).is_err() {
            warn!(job_id = %job_id, "dispatch queue is closed");
        }
    }

    /// Starts the dispatcher loop on a background task.
    ///
    /// Each dequeued job still in `Queued` is executed on its own task;
    /// anything else is skipped. Calling this twice is a no-op.
    pub fn run_dispatcher(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let rx = lock(&manager.dispatch_rx).take();
            let Some(mut rx) = rx else {
                warn!("dispatcher already running");
                return;
            };
            while let Some(job_id) = rx.recv().await {
                let Some(job) = manager.find_by_id(&job_id) else {
                    debug!(job_id = %job_id, "dispatched job is gone");
                    continue;
                };
                if job.status() != JobStatus::Queued {
                    debug!(job_id = %job_id, status = %job.status(), "skipping non-queued job");
                    continue;
                }
                let executor = Arc::clone(&manager);
                tokio::spawn(async move {
                    executor.execute(job).await;
                });
            }
            debug!("dispatcher stopped");
        })
    }

    /// Runs one queued job to a terminal state.
    async fn execute(self: Arc<Self>, job: Arc<Job>) {
        if self.cancelled_in_store(&job) {
            self.apply_external_cancel(&job);
            return;
        }
        let from = match job.set_status(JobStatus::Running) {
            Ok(from) => from,
            Err(e) => {
                debug!(job_id = %job.id(), error = %e, "job left queued state before execution");
                self.relocate(&job);
                return;
            }
        };
        lock(&self.queued).remove(job.id());
        lock(&self.running).insert(job.id().clone(), Arc::clone(&job));
        if let Err(e) = self.store.update_status(job.id(), JobStatus::Running) {
            warn!(job_id = %job.id(), error = %e, "failed to persist running status");
        }
        self.publish_status_change(&job, from, JobStatus::Running);
        info!(job_id = %job.id(), job_type = job.job_type(), "job started");

        let Some(handler) = self.registry.create(job.job_type()) else {
            error!(job_id = %job.id(), job_type = job.job_type(), "no handler registered");
            self.finish(
                &job,
                JobStatus::Errored,
                Some(format!("no handler registered for {}", job.job_type())),
            );
            return;
        };

        let (stop_tx, stop_rx) = mpsc::unbounded_channel();
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        let process = ProcessHandle::new();
        lock(&self.stop_channels).insert(job.id().clone(), stop_tx);
        lock(&self.process_handles).insert(job.id().clone(), process.clone());

        let outcome = Arc::new(Mutex::new(HandlerOutcome::default()));
        let consumer = tokio::spawn(Arc::clone(&self).consume_progress(
            Arc::clone(&job),
            progress_rx,
            Arc::clone(&outcome),
        ));

        let mut ctx = HandlerContext::new(
            job.id().clone(),
            job.job_demands().clone(),
            job.local_folder().to_path_buf(),
            job.extras(),
            stop_rx,
            progress_tx,
            process.clone(),
        );
        let run = tokio::task::spawn_blocking(move || handler.run(&mut ctx));
        let run_result = run.await;
        // The context (and with it the progress sender) is gone once the
        // blocking task returns, so the consumer drains and exits.
        let _ = consumer.await;

        let token = {
            let outcome = lock_plain(&outcome);
            (outcome.status, outcome.message.clone())
        };
        let (status, message) = match (token, run_result) {
            ((Some(status), message), _) => (status, message),
            ((None, _), Ok(Ok(()))) => (JobStatus::Completed, None),
            ((None, _), Ok(Err(e))) => {
                error!(job_id = %job.id(), error = %e, "handler failed");
                (JobStatus::Errored, Some(e.to_string()))
            }
            ((None, _), Err(e)) => {
                error!(job_id = %job.id(), "handler panicked: {e}");
                (JobStatus::Errored, Some("handler panicked".to_string()))
            }
        };
        self.finish(&job, status, message);
    }

    /// Drains the progress channel of one running job.
    async fn consume_progress(
        self: Arc<Self>,
        job: Arc<Job>,
        mut rx: mpsc::UnboundedReceiver<String>,
        outcome: Arc<Mutex<HandlerOutcome>>,
    ) {
        while let Some(message) = rx.recv().await {
            let message = message.trim().to_string();
            if message == COMPLETED_TOKEN {
                lock_plain(&outcome).status = Some(JobStatus::Completed);
            } else if let Some(detail) = message.strip_prefix(ERROR_PREFIX) {
                let detail = detail.trim().to_string();
                {
                    let mut outcome = lock_plain(&outcome);
                    outcome.status = Some(JobStatus::Errored);
                    outcome.message = Some(detail.clone());
                }
                self.bus.publish(Event::for_job(
                    EventType::JobError,
                    job.id().clone(),
                    json!({"message": detail}),
                ));
            } else if let Ok(delta) = message.parse::<f64>() {
                match job.update_progress(delta) {
                    Ok(progress) => {
                        if let Err(e) = self.store.update_progress(job.id(), progress) {
                            warn!(job_id = %job.id(), error = %e, "failed to persist progress");
                        }
                        self.bus.publish(Event::for_job(
                            EventType::JobProgressUpdated,
                            job.id().clone(),
                            json!({"progress": progress}),
                        ));
                    }
                    Err(e) => warn!(job_id = %job.id(), error = %e, "progress update rejected"),
                }
            } else {
                debug!(job_id = %job.id(), message = %message, "unrecognized progress message");
            }
        }
    }

    /// Moves a job out of `running` into its terminal resting place,
    /// killing any external process still alive. A cancellation another
    /// process wrote to the store overrides the requested status.
    fn finish(&self, job: &Arc<Job>, status: JobStatus, message: Option<String>) {
        let status = if status != JobStatus::Cancelled && self.cancelled_in_store(job) {
            info!(job_id = %job.id(), "job was cancelled externally");
            JobStatus::Cancelled
        } else {
            status
        };
        match job.set_status(status) {
            Ok(from) => {
                if let Err(e) = self.store.update_status(job.id(), status) {
                    warn!(job_id = %job.id(), error = %e, "failed to persist terminal status");
                }
                self.publish_status_change(job, from, status);
                match status {
                    JobStatus::Completed => {
                        info!(job_id = %job.id(), "job completed");
                        self.bus.publish(Event::for_job(
                            EventType::JobCompleted,
                            job.id().clone(),
                            json!({"job_name": job.job_name()}),
                        ));
                    }
                    JobStatus::Errored => {
                        let message = message.unwrap_or_default();
                        warn!(job_id = %job.id(), message = %message, "job errored");
                        self.bus.publish(Event::for_job(
                            EventType::JobError,
                            job.id().clone(),
                            json!({"message": message}),
                        ));
                    }
                    _ => {}
                }
            }
            // Typically already cancelled through the status manager.
            Err(e) => debug!(job_id = %job.id(), error = %e, "terminal status already set"),
        }

        if let Some(process) = lock(&self.process_handles).remove(job.id()) {
            if process.is_running() {
                warn!(job_id = %job.id(), "external process outlived handler; killing tree");
                process.kill_tree();
            }
        }
        lock(&self.stop_channels).remove(job.id());
        self.relocate(job);
    }

    /// Best-effort lookup across the four collections.
    #[must_use]
    pub fn find_by_id(&self, job_id: &JobId) -> Option<Arc<Job>> {
        for map in [&self.waiting, &self.queued, &self.running, &self.completed] {
            if let Some(job) = lock(map).get(job_id) {
                return Some(Arc::clone(job));
            }
        }
        None
    }

    /// Places a job into the collection matching its current status,
    /// removing it from the others.
    pub fn relocate(&self, job: &Arc<Job>) {
        let target = match job.status() {
            JobStatus::Waiting => &self.waiting,
            JobStatus::Queued => &self.queued,
            JobStatus::Running => &self.running,
            JobStatus::Completed | JobStatus::Errored | JobStatus::Cancelled => &self.completed,
        };
        for map in [&self.waiting, &self.queued, &self.running, &self.completed] {
            if !std::ptr::eq(map, target) {
                lock(map).remove(job.id());
            }
        }
        lock(target).insert(job.id().clone(), Arc::clone(job));
    }

    /// Starts a periodic sweep that applies cancellations written to the
    /// store by other processes to the corresponding live jobs.
    pub fn run_cancel_sweep(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                manager.sweep_external_cancels();
            }
        })
    }

    fn sweep_external_cancels(&self) {
        let live: Vec<Arc<Job>> = [&self.waiting, &self.queued, &self.running]
            .into_iter()
            .flat_map(|map| lock(map).values().cloned().collect::<Vec<_>>())
            .collect();
        for job in live {
            if self.cancelled_in_store(&job) {
                self.request_stop(job.id());
                self.kill_job_processes(job.id());
                self.apply_external_cancel(&job);
            }
        }
    }

    /// True when another process marked the job `cancelled` in the store
    /// while the live job is still active.
    fn cancelled_in_store(&self, job: &Arc<Job>) -> bool {
        job.status() != JobStatus::Cancelled
            && matches!(
                self.store.get(job.id()),
                Ok(Some(record)) if record.status == JobStatus::Cancelled
            )
    }

    fn apply_external_cancel(&self, job: &Arc<Job>) {
        match job.set_status(JobStatus::Cancelled) {
            Ok(from) => {
                info!(job_id = %job.id(), "job cancelled by another process");
                self.publish_status_change(job, from, JobStatus::Cancelled);
            }
            Err(e) => debug!(job_id = %job.id(), error = %e, "job already terminal"),
        }
        self.relocate(job);
    }

    /// Sends a stop token to a running job's handler. Returns true if the
    /// job had a live stop channel.
    pub fn request_stop(&self, job_id: &JobId) -> bool {
        lock(&self.stop_channels)
            .get(job_id)
            .is_some_and(|tx| tx.send(()).is_ok())
    }

    /// Kills the external process tree of a running job, if one is
    /// registered. Returns true if a kill was attempted.
    pub fn kill_job_processes(&self, job_id: &JobId) -> bool {
        lock(&self.process_handles)
            .get(job_id)
            .is_some_and(ProcessHandle::kill_tree)
    }

    /// Current sizes of the lifecycle collections.
    #[must_use]
    pub fn depths(&self) -> QueueDepths {
        QueueDepths {
            waiting: lock(&self.waiting).len(),
            queued: lock(&self.queued).len(),
            running: lock(&self.running).len(),
            completed: lock(&self.completed).len(),
        }
    }

    fn publish_status_change(&self, job: &Arc<Job>, from: JobStatus, to: JobStatus) {
        let mut event = Event::for_job(
            EventType::JobStatusChanged,
            job.id().clone(),
            json!({"from": from.as_str(), "to": to.as_str()}),
        );
        if let Some(watcher_id) = job.watcher_id() {
            event = event.with_watcher(watcher_id);
        }
        self.bus.publish(event);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn lock_plain<T>(mutex: &Arc<Mutex<T>>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{HandlerError, JobHandler};
    use std::path::Path;
    use tempfile::TempDir;

    struct ScriptedHandler {
        progress_steps: Vec<f64>,
        finale: Finale,
    }

    enum Finale {
        Ok,
        Fail(&'static str),
        Panic,
        Token(&'static str),
    }

    impl JobHandler for ScriptedHandler {
        fn run(&self, ctx: &mut HandlerContext) -> Result<(), HandlerError> {
            for step in &self.progress_steps {
                if ctx.should_stop() {
                    return Err(HandlerError::Stopped);
                }
                ctx.report_progress(*step);
            }
            match self.finale {
                Finale::Ok => Ok(()),
                Finale::Fail(message) => Err(HandlerError::Process(message.to_string())),
                Finale::Panic => panic!("scripted panic"),
                Finale::Token(token) => {
                    if let Some(detail) = token.strip_prefix(ERROR_PREFIX) {
                        ctx.report_error(detail.trim());
                    } else {
                        ctx.report_completed();
                    }
                    Ok(())
                }
            }
        }
    }

    struct DawdlingHandler {
        delay: Duration,
    }

    impl JobHandler for DawdlingHandler {
        fn run(&self, _ctx: &mut HandlerContext) -> Result<(), HandlerError> {
            std::thread::sleep(self.delay);
            Ok(())
        }
    }

    struct PatientHandler;

    impl JobHandler for PatientHandler {
        fn run(&self, ctx: &mut HandlerContext) -> Result<(), HandlerError> {
            for _ in 0..400 {
                if ctx.should_stop() {
                    return Err(HandlerError::Stopped);
                }
                std::thread::sleep(Duration::from_millis(25));
            }
            Ok(())
        }
    }

    fn test_probe() -> ProbeConfig {
        ProbeConfig {
            interval: Duration::from_millis(30),
            timeout: Duration::from_secs(5),
        }
    }

    fn test_manager(dir: &Path, probe: ProbeConfig) -> (Arc<JobQueueManager>, HandlerRegistry) {
        let store = JobStore::open(dir.join("jobs.db")).unwrap();
        let bus = Arc::new(EventBus::new());
        let registry = HandlerRegistry::new();
        let manager = JobQueueManager::new(store, bus, registry.clone(), probe);
        (manager, registry)
    }

    fn test_spec(dir: &Path, expected: &[&str]) -> JobSpec {
        JobSpec {
            submitter: "tester".to_string(),
            job_type: "scripted".to_string(),
            job_demands: serde_json::json!({}),
            expected_files: expected.iter().map(|s| (*s).to_string()).collect(),
            local_folder: dir.to_path_buf(),
            job_name: "run".to_string(),
            watcher_id: None,
        }
    }

    async fn wait_for_status(job: &Arc<Job>, status: JobStatus) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while job.status() != status {
            assert!(Instant::now() < deadline, "timed out waiting for {status}");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_job_without_expected_files_runs_to_completion() {
        let dir = TempDir::new().unwrap();
        let (manager, registry) = test_manager(dir.path(), test_probe());
        registry.register("scripted", || {
            Box::new(ScriptedHandler {
                progress_steps: vec![0.5, 0.5],
                finale: Finale::Ok,
            })
        });
        manager.run_dispatcher();

        let job = manager.add_job(test_spec(dir.path(), &[])).unwrap();
        wait_for_status(&job, JobStatus::Completed).await;
        assert!((job.progress() - 1.0).abs() < 1e-6);
        assert_eq!(manager.depths().completed, 1);
        assert_eq!(manager.depths().running, 0);
    }

    #[tokio::test]
    async fn test_job_waits_for_stable_expected_file() {
        let dir = TempDir::new().unwrap();
        let (manager, registry) = test_manager(dir.path(), test_probe());
        registry.register("scripted", || {
            Box::new(ScriptedHandler {
                progress_steps: vec![],
                finale: Finale::Ok,
            })
        });
        manager.run_dispatcher();

        let job = manager.add_job(test_spec(dir.path(), &["input.raw"])).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(job.status(), JobStatus::Waiting);

        std::fs::write(dir.path().join("input.raw"), b"payload").unwrap();
        wait_for_status(&job, JobStatus::Completed).await;
        assert!(job.is_ready());
    }

    #[tokio::test]
    async fn test_probe_timeout_leaves_job_waiting() {
        let dir = TempDir::new().unwrap();
        let probe = ProbeConfig {
            interval: Duration::from_millis(20),
            timeout: Duration::from_millis(80),
        };
        let (manager, _registry) = test_manager(dir.path(), probe);

        let job = manager.add_job(test_spec(dir.path(), &["never.raw"])).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(job.status(), JobStatus::Waiting);
        assert_eq!(manager.depths().waiting, 1);
    }

    #[tokio::test]
    async fn test_handler_failure_marks_job_errored() {
        let dir = TempDir::new().unwrap();
        let (manager, registry) = test_manager(dir.path(), test_probe());
        registry.register("scripted", || {
            Box::new(ScriptedHandler {
                progress_steps: vec![0.2],
                finale: Finale::Fail("tool exited 2"),
            })
        });
        manager.run_dispatcher();

        let job = manager.add_job(test_spec(dir.path(), &[])).unwrap();
        wait_for_status(&job, JobStatus::Errored).await;
        assert_eq!(manager.depths().completed, 1);
    }

    #[tokio::test]
    async fn test_handler_panic_marks_job_errored() {
        let dir = TempDir::new().unwrap();
        let (manager, registry) = test_manager(dir.path(), test_probe());
        registry.register("scripted", || {
            Box::new(ScriptedHandler {
                progress_steps: vec![],
                finale: Finale::Panic,
            })
        });
        manager.run_dispatcher();

        let job = manager.add_job(test_spec(dir.path(), &[])).unwrap();
        wait_for_status(&job, JobStatus::Errored).await;
    }

    #[tokio::test]
    async fn test_error_token_wins_over_ok_return() {
        let dir = TempDir::new().unwrap();
        let (manager, registry) = test_manager(dir.path(), test_probe());
        registry.register("scripted", || {
            Box::new(ScriptedHandler {
                progress_steps: vec![],
                finale: Finale::Token("ERROR search failed"),
            })
        });
        manager.run_dispatcher();

        let job = manager.add_job(test_spec(dir.path(), &[])).unwrap();
        wait_for_status(&job, JobStatus::Errored).await;
    }

    #[tokio::test]
    async fn test_unknown_job_type_errors() {
        let dir = TempDir::new().unwrap();
        let (manager, _registry) = test_manager(dir.path(), test_probe());
        manager.run_dispatcher();

        let job = manager.add_job(test_spec(dir.path(), &[])).unwrap();
        wait_for_status(&job, JobStatus::Errored).await;
    }

    #[tokio::test]
    async fn test_find_by_id_and_relocate() {
        let dir = TempDir::new().unwrap();
        let (manager, _registry) = test_manager(dir.path(), test_probe());

        let job = manager
            .add_job(test_spec(dir.path(), &["gate.raw"]))
            .unwrap();
        assert!(manager.find_by_id(job.id()).is_some());
        assert!(manager.find_by_id(&JobId::from("missing")).is_none());

        job.set_status(JobStatus::Cancelled).unwrap();
        manager.relocate(&job);
        assert_eq!(manager.depths().waiting, 0);
        assert_eq!(manager.depths().completed, 1);
        assert!(manager.find_by_id(job.id()).is_some());
    }

    #[tokio::test]
    async fn test_dispatcher_skips_cancelled_job() {
        let dir = TempDir::new().unwrap();
        let (manager, registry) = test_manager(dir.path(), test_probe());
        registry.register("scripted", || {
            Box::new(ScriptedHandler {
                progress_steps: vec![],
                finale: Finale::Ok,
            })
        });

        let job = manager.add_job(test_spec(dir.path(), &[])).unwrap();
        wait_for_status(&job, JobStatus::Queued).await;
        job.set_status(JobStatus::Cancelled).unwrap();
        manager.relocate(&job);

        manager.run_dispatcher();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(job.status(), JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_store_cancellation_skips_queued_job() {
        let dir = TempDir::new().unwrap();
        let store = JobStore::open(dir.path().join("jobs.db")).unwrap();
        let bus = Arc::new(EventBus::new());
        let registry = HandlerRegistry::new();
        registry.register("scripted", || {
            Box::new(ScriptedHandler {
                progress_steps: vec![],
                finale: Finale::Ok,
            })
        });
        let manager = JobQueueManager::new(store.clone(), bus, registry, test_probe());

        let job = manager.add_job(test_spec(dir.path(), &[])).unwrap();
        wait_for_status(&job, JobStatus::Queued).await;
        store.update_status(job.id(), JobStatus::Cancelled).unwrap();

        manager.run_dispatcher();
        wait_for_status(&job, JobStatus::Cancelled).await;
        assert_eq!(
            store.get(job.id()).unwrap().unwrap().status,
            JobStatus::Cancelled
        );
        assert_eq!(manager.depths().completed, 1);
    }

    #[tokio::test]
    async fn test_store_cancellation_overrides_handler_success() {
        let dir = TempDir::new().unwrap();
        let store = JobStore::open(dir.path().join("jobs.db")).unwrap();
        let bus = Arc::new(EventBus::new());
        let registry = HandlerRegistry::new();
        registry.register("scripted", || {
            Box::new(DawdlingHandler {
                delay: Duration::from_millis(400),
            })
        });
        let manager = JobQueueManager::new(store.clone(), bus, registry, test_probe());
        manager.run_dispatcher();

        let job = manager.add_job(test_spec(dir.path(), &[])).unwrap();
        wait_for_status(&job, JobStatus::Running).await;
        store.update_status(job.id(), JobStatus::Cancelled).unwrap();

        wait_for_status(&job, JobStatus::Cancelled).await;
        assert_eq!(
            store.get(job.id()).unwrap().unwrap().status,
            JobStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_cancel_sweep_stops_running_job() {
        let dir = TempDir::new().unwrap();
        let store = JobStore::open(dir.path().join("jobs.db")).unwrap();
        let bus = Arc::new(EventBus::new());
        let registry = HandlerRegistry::new();
        registry.register("scripted", || Box::new(PatientHandler));
        let manager = JobQueueManager::new(store.clone(), bus, registry, test_probe());
        manager.run_dispatcher();
        manager.run_cancel_sweep(Duration::from_millis(50));

        let job = manager.add_job(test_spec(dir.path(), &[])).unwrap();
        wait_for_status(&job, JobStatus::Running).await;
        store.update_status(job.id(), JobStatus::Cancelled).unwrap();

        wait_for_status(&job, JobStatus::Cancelled).await;
        assert_eq!(
            store.get(job.id()).unwrap().unwrap().status,
            JobStatus::Cancelled
        );
        assert_eq!(manager.depths().running, 0);
    }
}
