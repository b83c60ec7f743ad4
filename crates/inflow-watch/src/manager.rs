//! Lifecycle management for watcher tasks.

use crate::WatchError;
use crate::pattern::CompiledPatterns;
use crate::watcher::{WatcherSettings, WatcherTask};
use inflow_engine::JobQueueManager;
use inflow_events::{Event, EventBus, EventType};
use inflow_store::WatcherStore;
use inflow_types::{NewWatcher, WatcherConfig, WatcherStatus};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

struct TaskHandle {
    stop: watch::Sender<bool>,
    rescan: mpsc::UnboundedSender<()>,
    task: JoinHandle<()>,
}

/// Starts, stops and rescans watcher tasks.
///
/// One task runs per active watcher config; each owns its filesystem
/// subscription and stops either on request or when its batch completes.
pub struct WatcherManager {
    store: WatcherStore,
    queue: Arc<JobQueueManager>,
    bus: Arc<EventBus>,
    settings: WatcherSettings,
    tasks: Mutex<HashMap<i64, TaskHandle>>,
}

impl std::fmt::Debug for WatcherManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatcherManager")
            .field("running", &self.running_ids())
            .finish_non_exhaustive()
    }
}

impl WatcherManager {
    /// Creates the manager. Call [`WatcherManager::start_stored`] to bring
    /// up tasks for configs persisted by earlier runs.
    #[must_use]
    pub fn new(
        store: WatcherStore,
        queue: Arc<JobQueueManager>,
        bus: Arc<EventBus>,
        settings: WatcherSettings,
    ) -> Self {
        Self {
            store,
            queue,
            bus,
            settings,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Validates and registers a new watcher, then starts its task.
    ///
    /// # Errors
    ///
    /// Returns an error for an unusable folder, a bad pattern list, or a
    /// persistence failure. Configuration errors surface here, before
    /// anything is stored.
    pub fn create_watcher(&self, new: NewWatcher) -> Result<i64, WatchError> {
        if !new.watch_folder.is_dir() {
            return Err(WatchError::FolderUnusable {
                path: new.watch_folder.clone(),
            });
        }
        let patterns = CompiledPatterns::parse(&new.file_patterns)?;

        let watcher_id = self.store.insert(&new)?;
        info!(watcher_id, folder = %new.watch_folder.display(), "watcher registered");
        self.bus.publish(Event::for_watcher(
            EventType::WatcherCreated,
            watcher_id,
            json!({
                "folder": new.watch_folder.to_string_lossy(),
                "patterns": new.file_patterns,
                "job_type": new.job_type,
            }),
        ));

        let config = self
            .store
            .get(watcher_id)?
            .ok_or(WatchError::NotFound(watcher_id))?;
        self.spawn(config, patterns);
        Ok(watcher_id)
    }

    /// Starts a task for every stored watcher still `monitoring`. Returns
    /// how many were started.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read; individual configs
    /// with bad patterns are skipped with a warning.
    pub fn start_stored(&self) -> Result<usize, WatchError> {
        let configs = self.store.list(Some(WatcherStatus::Monitoring))?;
        let mut started = 0;
        for config in configs {
            match CompiledPatterns::parse(&config.file_patterns) {
                Ok(patterns) => {
                    self.spawn(config, patterns);
                    started += 1;
                }
                Err(e) => {
                    warn!(watcher_id = config.id, error = %e, "stored watcher has bad patterns");
                }
            }
        }
        Ok(started)
    }

    fn spawn(&self, config: WatcherConfig, patterns: CompiledPatterns) {
        let mut tasks = self.lock_tasks();
        if let Some(existing) = tasks.get(&config.id) {
            if !existing.task.is_finished() {
                return;
            }
        }
        let watcher_id = config.id;
        let (stop_tx, stop_rx) = watch::channel(false);
        let (rescan_tx, rescan_rx) = mpsc::unbounded_channel();
        let task = WatcherTask {
            config,
            patterns,
            store: self.store.clone(),
            queue: Arc::clone(&self.queue),
            bus: Arc::clone(&self.bus),
            settings: self.settings,
        };
        let handle = tokio::spawn(task.run(stop_rx, rescan_rx));
        tasks.insert(
            watcher_id,
            TaskHandle {
                stop: stop_tx,
                rescan: rescan_tx,
                task: handle,
            },
        );
    }

    /// Cancels a watcher: marks it `cancelled` in the store and stops its
    /// task.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::NotFound`] for an unknown id.
    pub fn stop_watcher(&self, watcher_id: i64) -> Result<(), WatchError> {
        let config = self
            .store
            .get(watcher_id)?
            .ok_or(WatchError::NotFound(watcher_id))?;
        if !config.status.is_terminal() {
            self.store
                .update_status(watcher_id, WatcherStatus::Cancelled)?;
            self.bus.publish(Event::for_watcher(
                EventType::WatcherStatusChanged,
                watcher_id,
                json!({"status": WatcherStatus::Cancelled.as_str()}),
            ));
        }
        if let Some(handle) = self.lock_tasks().remove(&watcher_id) {
            let _ = handle.stop.send(true);
        }
        info!(watcher_id, "watcher stopped");
        Ok(())
    }

    /// Forces a full folder rescan on a running watcher.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::NotRunning`] if the watcher has no live task.
    pub fn rescan(&self, watcher_id: i64) -> Result<(), WatchError> {
        let tasks = self.lock_tasks();
        let handle = tasks
            .get(&watcher_id)
            .filter(|h| !h.task.is_finished())
            .ok_or(WatchError::NotRunning(watcher_id))?;
        handle
            .rescan
            .send(())
            .map_err(|_| WatchError::NotRunning(watcher_id))
    }

    /// Brings a watcher back to `monitoring` with a running task, used when
    /// a linked job is restarted.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::NotFound`] for an unknown id, or pattern and
    /// store errors.
    pub fn ensure_running(&self, watcher_id: i64) -> Result<(), WatchError> {
        if self.is_running(watcher_id) {
            return Ok(());
        }
        let mut config = self
            .store
            .get(watcher_id)?
            .ok_or(WatchError::NotFound(watcher_id))?;
        let patterns = CompiledPatterns::parse(&config.file_patterns)?;
        if config.status != WatcherStatus::Monitoring {
            self.store
                .update_status(watcher_id, WatcherStatus::Monitoring)?;
            config.status = WatcherStatus::Monitoring;
            self.bus.publish(Event::for_watcher(
                EventType::WatcherStatusChanged,
                watcher_id,
                json!({"status": WatcherStatus::Monitoring.as_str()}),
            ));
        }
        self.spawn(config, patterns);
        Ok(())
    }

    /// Returns true if the watcher has a live task.
    #[must_use]
    pub fn is_running(&self, watcher_id: i64) -> bool {
        self.lock_tasks()
            .get(&watcher_id)
            .is_some_and(|h| !h.task.is_finished())
    }

    /// Ids of watchers with live tasks.
    #[must_use]
    pub fn running_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .lock_tasks()
            .iter()
            .filter(|(_, h)| !h.task.is_finished())
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Stops every task and waits for them to finish.
    pub async fn shutdown(&self) {
        let handles: Vec<TaskHandle> = self.lock_tasks().drain().map(|(_, h)| h).collect();
        for handle in &handles {
            let _ = handle.stop.send(true);
        }
        for handle in handles {
            let _ = handle.task.await;
        }
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, HashMap<i64, TaskHandle>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inflow_engine::{HandlerRegistry, ProbeConfig};
    use inflow_store::JobStore;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::time::Instant;

    fn setup(dir: &Path) -> (WatcherManager, JobStore, WatcherStore) {
        let job_store = JobStore::open(dir.join("jobs.db")).unwrap();
        let watcher_store = WatcherStore::open(dir.join("watchers.db")).unwrap();
        let bus = Arc::new(EventBus::new());
        let probe = ProbeConfig {
            interval: Duration::from_millis(30),
            timeout: Duration::from_secs(5),
        };
        let queue = JobQueueManager::new(
            job_store.clone(),
            Arc::clone(&bus),
            HandlerRegistry::new(),
            probe,
        );
        let settings = WatcherSettings {
            settle: Duration::from_millis(40),
        };
        let manager = WatcherManager::new(watcher_store.clone(), queue, bus, settings);
        (manager, job_store, watcher_store)
    }

    fn new_watcher(folder: &Path, patterns: &str) -> NewWatcher {
        NewWatcher {
            watch_folder: folder.to_path_buf(),
            file_patterns: patterns.to_string(),
            job_type: "maxquant".to_string(),
            job_demands: serde_json::json!({}),
            submitter: "tester".to_string(),
            job_name: "run".to_string(),
        }
    }

    async fn wait_until(mut cond: impl FnMut() -> bool, what: &str) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unusable_folder_is_rejected() {
        let dir = TempDir::new().unwrap();
        let (manager, _jobs, _watchers) = setup(dir.path());
        let err = manager
            .create_watcher(new_watcher(&dir.path().join("missing"), "*.raw"))
            .unwrap_err();
        assert!(matches!(err, WatchError::FolderUnusable { .. }));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_blank_pattern_is_rejected() {
        let dir = TempDir::new().unwrap();
        let (manager, _jobs, _watchers) = setup(dir.path());
        let err = manager
            .create_watcher(new_watcher(dir.path(), " ; "))
            .unwrap_err();
        assert!(matches!(err, WatchError::EmptyPattern));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_per_file_mode_spawns_job_per_file() {
        let dir = TempDir::new().unwrap();
        let watch_dir = dir.path().join("incoming");
        std::fs::create_dir(&watch_dir).unwrap();
        let (manager, jobs, watchers) = setup(dir.path());

        let id = manager
            .create_watcher(new_watcher(&watch_dir, "*.raw"))
            .unwrap();
        assert!(manager.is_running(id));

        std::fs::write(watch_dir.join("run_1.raw"), b"data").unwrap();
        wait_until(|| watchers.captures(id).unwrap().len() == 1, "first capture").await;
        wait_until(|| jobs.list(None).unwrap().len() == 1, "first job").await;

        std::fs::write(watch_dir.join("run_2.raw"), b"data").unwrap();
        wait_until(|| jobs.list(None).unwrap().len() == 2, "second job").await;

        // Ledger rows are linked to their jobs at capture time.
        for capture in watchers.captures(id).unwrap() {
            assert!(capture.job_id.is_some());
        }
        // Per-file watchers keep monitoring.
        assert_eq!(
            watchers.get(id).unwrap().unwrap().status,
            WatcherStatus::Monitoring
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_batch_mode_waits_for_full_expected_set() {
        let dir = TempDir::new().unwrap();
        let watch_dir = dir.path().join("incoming");
        std::fs::create_dir(&watch_dir).unwrap();
        let (manager, jobs, watchers) = setup(dir.path());

        let id = manager
            .create_watcher(new_watcher(&watch_dir, "a.raw;b.raw"))
            .unwrap();

        std::fs::write(watch_dir.join("a.raw"), b"data").unwrap();
        wait_until(|| watchers.captures(id).unwrap().len() == 1, "first capture").await;
        assert!(jobs.list(None).unwrap().is_empty());

        std::fs::write(watch_dir.join("b.raw"), b"data").unwrap();
        wait_until(|| jobs.list(None).unwrap().len() == 1, "batch job").await;
        wait_until(
            || watchers.get(id).unwrap().unwrap().status == WatcherStatus::Completed,
            "watcher completed",
        )
        .await;

        let job = &jobs.list(None).unwrap()[0];
        assert_eq!(job.original_expected_files.len(), 2);
        assert_eq!(job.watcher_id, Some(id));
        for capture in watchers.captures(id).unwrap() {
            assert_eq!(capture.job_id.as_ref(), Some(&job.job_id));
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_rescan_picks_up_preexisting_files() {
        let dir = TempDir::new().unwrap();
        let watch_dir = dir.path().join("incoming");
        std::fs::create_dir(&watch_dir).unwrap();
        // File exists before the watcher does.
        std::fs::write(watch_dir.join("old.raw"), b"data").unwrap();
        let (manager, jobs, _watchers) = setup(dir.path());

        manager
            .create_watcher(new_watcher(&watch_dir, "*.raw"))
            .unwrap();
        wait_until(|| jobs.list(None).unwrap().len() == 1, "startup rescan job").await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_completed_watcher_creates_no_second_job() {
        let dir = TempDir::new().unwrap();
        let watch_dir = dir.path().join("incoming");
        std::fs::create_dir(&watch_dir).unwrap();
        std::fs::write(watch_dir.join("a.raw"), b"data").unwrap();
        let (manager, jobs, watchers) = setup(dir.path());

        let id = manager
            .create_watcher(new_watcher(&watch_dir, "a.raw"))
            .unwrap();
        wait_until(
            || watchers.get(id).unwrap().unwrap().status == WatcherStatus::Completed,
            "watcher completed",
        )
        .await;
        assert_eq!(jobs.list(None).unwrap().len(), 1);

        // The task ended with the batch; a forced rescan is rejected and
        // nothing new is created.
        wait_until(|| !manager.is_running(id), "task finished").await;
        assert!(matches!(
            manager.rescan(id),
            Err(WatchError::NotRunning(_))
        ));
        assert_eq!(jobs.list(None).unwrap().len(), 1);
        assert_eq!(watchers.captures(id).unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stop_watcher_cancels() {
        let dir = TempDir::new().unwrap();
        let watch_dir = dir.path().join("incoming");
        std::fs::create_dir(&watch_dir).unwrap();
        let (manager, _jobs, watchers) = setup(dir.path());

        let id = manager
            .create_watcher(new_watcher(&watch_dir, "*.raw"))
            .unwrap();
        manager.stop_watcher(id).unwrap();
        assert_eq!(
            watchers.get(id).unwrap().unwrap().status,
            WatcherStatus::Cancelled
        );
        wait_until(|| !manager.is_running(id), "task stopped").await;

        assert!(matches!(
            manager.stop_watcher(999),
            Err(WatchError::NotFound(999))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_start_stored_resumes_monitoring_watchers() {
        let dir = TempDir::new().unwrap();
        let watch_dir = dir.path().join("incoming");
        std::fs::create_dir(&watch_dir).unwrap();
        let (manager, _jobs, watchers) = setup(dir.path());

        let a = watchers.insert(&new_watcher(&watch_dir, "*.raw")).unwrap();
        let b = watchers.insert(&new_watcher(&watch_dir, "*.mzML")).unwrap();
        watchers.update_status(b, WatcherStatus::Cancelled).unwrap();

        assert_eq!(manager.start_stored().unwrap(), 1);
        assert!(manager.is_running(a));
        assert!(!manager.is_running(b));

        manager.ensure_running(b).unwrap();
        assert!(manager.is_running(b));
        assert_eq!(
            watchers.get(b).unwrap().unwrap().status,
            WatcherStatus::Monitoring
        );
        manager.shutdown().await;
    }
}
