//! Job lifecycle status and its transition table.

use crate::error::JobError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Lifecycle state of a job.
///
/// Jobs move `Waiting -> Queued -> Running -> {Completed | Errored |
/// Cancelled}`. Any non-terminal state may be cancelled; every other
/// transition is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Expected input files have not all arrived yet.
    #[default]
    Waiting,
    /// All inputs are present; the job sits in the dispatch queue.
    Queued,
    /// The external handler is executing.
    Running,
    /// The handler reported success.
    Completed,
    /// The handler failed, panicked, or the job was interrupted by a restart.
    Errored,
    /// The job was stopped by explicit request.
    Cancelled,
}

impl JobStatus {
    /// Returns true if the job can never leave this state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Errored | Self::Cancelled)
    }

    /// Returns true if `to` is a legal next state from `self`.
    #[must_use]
    pub const fn can_transition_to(&self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Waiting, Self::Queued)
                | (Self::Queued, Self::Running)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Errored)
                | (Self::Waiting, Self::Cancelled)
                | (Self::Queued, Self::Cancelled)
                | (Self::Running, Self::Cancelled)
        )
    }

    /// Returns the status as a string identifier.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Errored => "errored",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "errored" => Ok(Self::Errored),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(JobError::UnknownStatus(other.to_string())),
        }
    }
}
