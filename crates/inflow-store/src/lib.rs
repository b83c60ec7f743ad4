//! SQLite persistence for the inflow job coordinator.
//!
//! Two stores back the system, each in its own database file:
//!
//! - [`JobStore`] (`jobs.db`) - write-through projections of every job
//! - [`WatcherStore`] (`watchers.db`) - watcher configurations and the
//!   captured-files ledger
//!
//! Both stores keep only a path and open a fresh connection per operation,
//! so handles are cheap to clone and safe to use from blocking and async
//! contexts alike. The in-memory queue manager remains authoritative while
//! the process is up; the stored copy becomes authoritative only during
//! startup recovery.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod jobs;
mod watchers;

pub use error::StoreError;
pub use jobs::JobStore;
pub use watchers::WatcherStore;

use chrono::{DateTime, Utc};

/// Parses an RFC 3339 timestamp stored in a TEXT column.
fn parse_timestamp(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

/// Parses a JSON value stored in a TEXT column.
fn parse_json(idx: usize, raw: &str) -> rusqlite::Result<serde_json::Value> {
    serde_json::from_str(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}
