//! Core types for the inflow job coordinator.
//!
//! This crate defines the shared vocabulary of the system:
//!
//! - [`JobId`] - Time-ordered unique identifier for jobs
//! - [`JobStatus`] - Lifecycle state with a validated transition table
//! - [`Job`] - In-memory unit of work with independently locked fields
//! - [`JobRecord`] - Serializable projection of a job for persistence
//! - [`WatcherConfig`] / [`WatcherStatus`] - Persisted folder-watch configuration
//! - [`CapturedFile`] - One row of the captured-files ledger

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod job;
mod status;
mod watcher;

pub use error::JobError;
pub use job::{Job, JobId, JobRecord, JobSpec};
pub use status::JobStatus;
pub use watcher::{CapturedFile, NewWatcher, WatcherConfig, WatcherStatus};
