//! Event kinds and the event envelope.

use chrono::{DateTime, Utc};
use inflow_types::JobId;
use serde::{Deserialize, Serialize};

/// The kinds of events the system publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A job was created and entered the waiting collection.
    JobCreated,
    /// A job moved to a new lifecycle status.
    JobStatusChanged,
    /// A job's progress fraction changed.
    JobProgressUpdated,
    /// A job's handler reported an error.
    JobError,
    /// A job reached the completed status.
    JobCompleted,
    /// A folder watcher was registered.
    WatcherCreated,
    /// A watcher moved to a new lifecycle status.
    WatcherStatusChanged,
    /// A watcher accepted a file into its ledger.
    FileCaptured,
    /// Startup recovery started, finished, or failed.
    SystemRecovery,
}

/// An immutable event envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// What happened.
    pub event_type: EventType,
    /// The job this event concerns, if any.
    pub job_id: Option<JobId>,
    /// The watcher this event concerns, if any.
    pub watcher_id: Option<i64>,
    /// Event-specific details.
    pub payload: serde_json::Value,
    /// When the event was published.
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Creates an event with no job or watcher association.
    #[must_use]
    pub fn new(event_type: EventType, payload: serde_json::Value) -> Self {
        Self {
            event_type,
            job_id: None,
            watcher_id: None,
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Creates an event tied to a job.
    #[must_use]
    pub fn for_job(event_type: EventType, job_id: JobId, payload: serde_json::Value) -> Self {
        Self {
            job_id: Some(job_id),
            ..Self::new(event_type, payload)
        }
    }

    /// Creates an event tied to a watcher.
    #[must_use]
    pub fn for_watcher(event_type: EventType, watcher_id: i64, payload: serde_json::Value) -> Self {
        Self {
            watcher_id: Some(watcher_id),
            ..Self::new(event_type, payload)
        }
    }

    /// Attaches a watcher id to an existing event.
    #[must_use]
    pub fn with_watcher(mut self, watcher_id: i64) -> Self {
        self.watcher_id = Some(watcher_id);
        self
    }
}
