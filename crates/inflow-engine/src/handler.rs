//! The contract external job implementations plug into.
//!
//! A handler wraps one external analysis tool. The dispatcher runs it on a
//! blocking task, feeding it a [`HandlerContext`] with a stop channel to
//! poll, a progress channel to report through, and a [`ProcessHandle`] on
//! which any spawned PID must be registered so cancellation can reach the
//! process tree.

use crate::process::ProcessHandle;
use inflow_types::JobId;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tokio::sync::mpsc;

/// Progress-channel token announcing successful completion.
pub const COMPLETED_TOKEN: &str = "COMPLETED";

/// Progress-channel prefix announcing a handler error.
pub const ERROR_PREFIX: &str = "ERROR";

/// Errors a handler may return.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// The external process could not be launched or waited on.
    #[error("external process io failure")]
    Io(#[from] std::io::Error),

    /// The external process ran but reported failure.
    #[error("external process failed: {0}")]
    Process(String),

    /// The job demands were missing a required field or malformed.
    #[error("invalid job demands: {0}")]
    InvalidDemands(String),

    /// The handler observed a stop request and aborted.
    #[error("stopped by cancellation request")]
    Stopped,
}

/// Everything a handler needs while running one job.
pub struct HandlerContext {
    job_id: JobId,
    job_demands: serde_json::Value,
    local_folder: PathBuf,
    extras: HashMap<String, String>,
    stop: mpsc::UnboundedReceiver<()>,
    progress: mpsc::UnboundedSender<String>,
    process: ProcessHandle,
}

impl std::fmt::Debug for HandlerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerContext")
            .field("job_id", &self.job_id)
            .finish_non_exhaustive()
    }
}

impl HandlerContext {
    pub(crate) fn new(
        job_id: JobId,
        job_demands: serde_json::Value,
        local_folder: PathBuf,
        extras: HashMap<String, String>,
        stop: mpsc::UnboundedReceiver<()>,
        progress: mpsc::UnboundedSender<String>,
        process: ProcessHandle,
    ) -> Self {
        Self {
            job_id,
            job_demands,
            local_folder,
            extras,
            stop,
            progress,
            process,
        }
    }

    /// The id of the job being executed.
    #[must_use]
    pub const fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// The opaque parameters this job was submitted with.
    #[must_use]
    pub const fn job_demands(&self) -> &serde_json::Value {
        &self.job_demands
    }

    /// The folder holding the job's input files.
    #[must_use]
    pub fn local_folder(&self) -> &Path {
        &self.local_folder
    }

    /// Free-form extras captured on the job.
    #[must_use]
    pub const fn extras(&self) -> &HashMap<String, String> {
        &self.extras
    }

    /// The handle any spawned external PID must be registered on.
    #[must_use]
    pub const fn process_handle(&self) -> &ProcessHandle {
        &self.process
    }

    /// Polls the stop channel. Handlers should check this between units of
    /// work and abort with [`HandlerError::Stopped`] when it returns true.
    ///
    /// A disconnected channel counts as a stop request: the coordinator is
    /// gone and the work is orphaned.
    pub fn should_stop(&mut self) -> bool {
        !matches!(self.stop.try_recv(), Err(mpsc::error::TryRecvError::Empty))
    }

    /// Reports a progress increment as a fraction of total work.
    pub fn report_progress(&self, delta: f64) {
        self.send(format!("{delta}"));
    }

    /// Reports successful completion through the progress channel.
    pub fn report_completed(&self) {
        self.send(COMPLETED_TOKEN.to_string());
    }

    /// Reports a handler error through the progress channel.
    pub fn report_error(&self, message: &str) {
        self.send(format!("{ERROR_PREFIX} {message}"));
    }

    fn send(&self, message: String) {
        // The consumer only goes away when the job is being torn down.
        let _ = self.progress.send(message);
    }
}

/// One external job implementation.
///
/// `run` executes on a blocking task; it may block freely but must poll
/// [`HandlerContext::should_stop`] between units of work.
pub trait JobHandler: Send + Sync {
    /// Executes the job to completion or failure.
    ///
    /// # Errors
    ///
    /// Any error marks the job `Errored`.
    fn run(&self, ctx: &mut HandlerContext) -> Result<(), HandlerError>;
}

type HandlerFactory = Arc<dyn Fn() -> Box<dyn JobHandler> + Send + Sync>;

/// Maps `job_type` strings to handler factories.
///
/// Supporting a new tool means registering one more entry; nothing in the
/// engine changes.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    factories: Arc<RwLock<HashMap<String, HandlerFactory>>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}

impl HandlerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory for `job_type`, replacing any previous entry.
    pub fn register(
        &self,
        job_type: impl Into<String>,
        factory: impl Fn() -> Box<dyn JobHandler> + Send + Sync + 'static,
    ) {
        self.factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job_type.into(), Arc::new(factory));
    }

    /// Builds a fresh handler for `job_type`.
    #[must_use]
    pub fn create(&self, job_type: &str) -> Option<Box<dyn JobHandler>> {
        let factory = self
            .factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job_type)
            .cloned();
        factory.map(|f| f())
    }

    /// Returns true if a handler is registered for `job_type`.
    #[must_use]
    pub fn contains(&self, job_type: &str) -> bool {
        self.factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(job_type)
    }

    /// Lists the registered job types, sorted.
    #[must_use]
    pub fn job_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        types.sort();
        types
    }
}
