//! Engine error type.

use inflow_types::JobId;
use thiserror::Error;

/// Errors from queue and status operations.
#[derive(Error, Debug)]
pub enum EngineError {
    /// A persistence operation failed.
    #[error("persistence failed")]
    Store(#[from] inflow_store::StoreError),

    /// A job-level mutation was rejected.
    #[error("job update rejected")]
    Job(#[from] inflow_types::JobError),

    /// No live or stored job has the given id.
    #[error("job not found: {0}")]
    JobNotFound(JobId),
}
