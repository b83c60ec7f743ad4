//! Error types for job state manipulation.

use crate::status::JobStatus;
use thiserror::Error;

/// Errors that can occur when mutating a job.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum JobError {
    /// The requested status transition is not in the lifecycle table.
    #[error("invalid job status transition: {from} -> {to}")]
    InvalidTransition {
        /// The status the job was in.
        from: JobStatus,
        /// The status that was requested.
        to: JobStatus,
    },

    /// A progress update would leave the [0, 1] range.
    #[error("progress increment {delta} from {current} leaves [0, 1]")]
    ProgressOutOfRange {
        /// Progress before the rejected update.
        current: f64,
        /// The rejected increment.
        delta: f64,
    },

    /// An absolute progress value outside [0, 1].
    #[error("progress value {0} is outside [0, 1]")]
    InvalidProgress(f64),

    /// A status string that does not name a known status.
    #[error("unknown job status: {0}")]
    UnknownStatus(String),
}
