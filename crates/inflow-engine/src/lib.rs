//! Job queue, dispatch and status management.
//!
//! The engine owns the live state of every job:
//!
//! - [`JobQueueManager`] - the four lifecycle collections, the readiness
//!   probe for expected input files, and the dispatcher that hands queued
//!   jobs to their handlers
//! - [`JobStatusManager`] - validated status/progress updates from any
//!   caller, including jobs that are no longer resident after a restart
//! - [`JobHandler`] / [`HandlerRegistry`] - the contract external job
//!   implementations plug into
//! - [`ProcessHandle`] - cancellation hook for externally spawned process
//!   trees

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod handler;
mod process;
mod queue;
mod status;

pub use error::EngineError;
pub use handler::{
    COMPLETED_TOKEN, ERROR_PREFIX, HandlerContext, HandlerError, HandlerRegistry, JobHandler,
};
pub use process::{ProcessHandle, spawn_managed};
pub use queue::{JobQueueManager, ProbeConfig, QueueDepths};
pub use status::{JobStatusManager, JobStatusSnapshot};
