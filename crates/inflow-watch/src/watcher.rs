//! The per-config watcher task.

use crate::pattern::CompiledPatterns;
use inflow_engine::JobQueueManager;
use inflow_events::{Event, EventBus, EventType};
use inflow_store::WatcherStore;
use inflow_types::{JobSpec, WatcherConfig, WatcherStatus};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde_json::json;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Tuning for watcher tasks.
#[derive(Debug, Clone, Copy)]
pub struct WatcherSettings {
    /// Window a file's size must stay unchanged before it counts as
    /// arrived.
    pub settle: Duration,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            settle: Duration::from_secs(2),
        }
    }
}

/// One running watcher: filesystem events in, ledger rows and jobs out.
pub(crate) struct WatcherTask {
    pub(crate) config: WatcherConfig,
    pub(crate) patterns: CompiledPatterns,
    pub(crate) store: WatcherStore,
    pub(crate) queue: Arc<JobQueueManager>,
    pub(crate) bus: Arc<EventBus>,
    pub(crate) settings: WatcherSettings,
}

impl WatcherTask {
    /// Runs until stopped or, in batch mode, until the expected set is
    /// complete.
    pub(crate) async fn run(
        self,
        mut stop: watch::Receiver<bool>,
        mut rescan: mpsc::UnboundedReceiver<()>,
    ) {
        let watcher_id = self.config.id;
        let (fs_tx, mut fs_rx) = mpsc::unbounded_channel();
        let mut fs_watcher = match RecommendedWatcher::new(
            move |result: notify::Result<notify::Event>| {
                let _ = fs_tx.send(result);
            },
            notify::Config::default(),
        ) {
            Ok(w) => w,
            Err(e) => {
                error!(watcher_id, error = %e, "failed to create filesystem watcher");
                return;
            }
        };
        if let Err(e) = fs_watcher.watch(&self.config.watch_folder, RecursiveMode::Recursive) {
            error!(watcher_id, error = %e, folder = %self.config.watch_folder.display(),
                "failed to watch folder");
            return;
        }
        info!(watcher_id, folder = %self.config.watch_folder.display(), "watcher started");

        // Catch files that arrived before the watch was in place.
        if self.rescan_folder().await {
            return;
        }

        loop {
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        debug!(watcher_id, "watcher stopping");
                        return;
                    }
                }
                rescan_request = rescan.recv() => {
                    match rescan_request {
                        Some(()) => {
                            info!(watcher_id, "forced rescan");
                            if self.rescan_folder().await {
                                return;
                            }
                        }
                        None => return,
                    }
                }
                event = fs_rx.recv() => {
                    let Some(event) = event else { return };
                    match event {
                        Ok(event) if is_relevant(&event.kind) => {
                            for path in event.paths {
                                if self.handle_candidate(&path).await {
                                    return;
                                }
                            }
                        }
                        Ok(_) => {}
                        Err(e) => warn!(watcher_id, error = %e, "filesystem watch error"),
                    }
                }
            }
        }
    }

    /// Walks the folder once, feeding existing files through the normal
    /// capture path. Returns true when the watcher completed.
    async fn rescan_folder(&self) -> bool {
        let mut pending = vec![self.config.watch_folder.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(watcher_id = self.config.id, error = %e,
                        folder = %dir.display(), "rescan cannot read folder");
                    continue;
                }
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                if path.is_dir() {
                    pending.push(path);
                } else if self.handle_candidate(&path).await {
                    return true;
                }
            }
        }
        false
    }

    /// Runs one path through match, settle and capture. Returns true when
    /// the capture completed the watcher.
    async fn handle_candidate(&self, path: &Path) -> bool {
        let Some(file_name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            return false;
        };
        if !self.patterns.matches(&file_name) {
            return false;
        }
        if !self.is_stable(path).await {
            // Still being written; the next modify event retries.
            debug!(watcher_id = self.config.id, file = %file_name, "file not yet stable");
            return false;
        }
        self.capture(path, &file_name).await
    }

    /// A file is stable when its size is unchanged across the settle
    /// window.
    async fn is_stable(&self, path: &Path) -> bool {
        let Ok(before) = tokio::fs::metadata(path).await else {
            return false;
        };
        tokio::time::sleep(self.settings.settle).await;
        match tokio::fs::metadata(path).await {
            Ok(after) => after.len() == before.len(),
            Err(_) => false,
        }
    }

    /// Records a stable matching file and re-runs the completion check.
    /// Returns true when the watcher completed.
    async fn capture(&self, path: &Path, file_name: &str) -> bool {
        let watcher_id = self.config.id;
        match self.store.is_captured(watcher_id, file_name) {
            Ok(true) => return self.completion_check(),
            Ok(false) => {}
            Err(e) => {
                warn!(watcher_id, error = %e, "ledger lookup failed");
                return false;
            }
        }

        let job_id = if self.patterns.is_batch() {
            None
        } else {
            // Per-file mode: every qualifying file is its own job.
            match self.queue.add_job(self.job_spec(vec![file_name.to_string()], file_name)) {
                Ok(job) => Some(job.id().clone()),
                Err(e) => {
                    error!(watcher_id, file = %file_name, error = %e, "failed to create job");
                    return false;
                }
            }
        };

        match self.store.record_capture(watcher_id, path, job_id.as_ref()) {
            Ok(Some(_)) => {
                info!(watcher_id, file = %file_name, "file captured");
                self.bus.publish(Event::for_watcher(
                    EventType::FileCaptured,
                    watcher_id,
                    json!({"file_name": file_name, "file_path": path.to_string_lossy()}),
                ));
            }
            Ok(None) => return self.completion_check(),
            Err(e) => {
                warn!(watcher_id, error = %e, "failed to record capture");
                return false;
            }
        }
        self.completion_check()
    }

    /// Batch mode only: once the captured names cover the expected set,
    /// creates the single batch job, links the ledger rows to it and marks
    /// the watcher completed. Idempotent: a completed or cancelled watcher
    /// only reports that it should stop.
    fn completion_check(&self) -> bool {
        if !self.patterns.is_batch() {
            return false;
        }
        let watcher_id = self.config.id;
        let status = match self.store.get(watcher_id) {
            Ok(Some(config)) => config.status,
            Ok(None) => {
                warn!(watcher_id, "watcher vanished from store");
                return true;
            }
            Err(e) => {
                warn!(watcher_id, error = %e, "status lookup failed");
                return false;
            }
        };
        if status.is_terminal() {
            return true;
        }

        let captured: BTreeSet<String> = match self.store.captures(watcher_id) {
            Ok(rows) => rows.into_iter().map(|row| row.file_name).collect(),
            Err(e) => {
                warn!(watcher_id, error = %e, "ledger read failed");
                return false;
            }
        };
        if !self.patterns.expected().is_subset(&captured) {
            return false;
        }

        let expected: Vec<String> = self.patterns.expected().iter().cloned().collect();
        let job = match self
            .queue
            .add_job(self.job_spec(expected.clone(), &self.config.job_name))
        {
            Ok(job) => job,
            Err(e) => {
                error!(watcher_id, error = %e, "failed to create batch job");
                return false;
            }
        };
        for name in &expected {
            if let Err(e) = self.store.link_capture_to_job(watcher_id, name, job.id()) {
                warn!(watcher_id, file = %name, error = %e, "failed to link capture");
            }
        }
        if let Err(e) = self.store.update_status(watcher_id, WatcherStatus::Completed) {
            warn!(watcher_id, error = %e, "failed to mark watcher completed");
        }
        info!(watcher_id, job_id = %job.id(), "expected set complete; watcher done");
        self.bus.publish(Event::for_watcher(
            EventType::WatcherStatusChanged,
            watcher_id,
            json!({"status": WatcherStatus::Completed.as_str()}),
        ));
        true
    }

    fn job_spec(&self, expected_files: Vec<String>, name_suffix: &str) -> JobSpec {
        let job_name = if name_suffix == self.config.job_name {
            self.config.job_name.clone()
        } else {
            format!("{}-{}", self.config.job_name, name_suffix)
        };
        JobSpec {
            submitter: self.config.submitter.clone(),
            job_type: self.config.job_type.clone(),
            job_demands: self.config.job_demands.clone(),
            expected_files,
            local_folder: self.config.watch_folder.clone(),
            job_name,
            watcher_id: Some(self.config.id),
        }
    }
}

/// Only creations, writes and renames can make a file arrive.
fn is_relevant(kind: &EventKind) -> bool {
    matches!(kind, EventKind::Create(_) | EventKind::Modify(_))
}
