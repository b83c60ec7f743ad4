//! Folder watching: turning file arrivals into jobs.
//!
//! A watcher is a persisted configuration (folder plus a `;`-delimited
//! pattern list) that the [`WatcherManager`] runs as a background task.
//! Arriving files that match are settled for size stability, recorded in
//! the captured-files ledger, and either collected toward one batch job or
//! turned into a job each, depending on the pattern list.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod manager;
mod pattern;
mod watcher;

pub use error::WatchError;
pub use manager::WatcherManager;
pub use pattern::CompiledPatterns;
pub use watcher::WatcherSettings;
