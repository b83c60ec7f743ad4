//! Publish/subscribe event bus for the inflow job coordinator.
//!
//! Components communicate through [`EventBus`] rather than calling each
//! other directly. Publishing is a synchronous enqueue so it is usable from
//! filesystem-notification callbacks and blocking handler threads; delivery
//! happens on a single background dispatch task, preserving publish order
//! per publisher. Events are transient and never persisted.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod bus;
mod event;

pub use bus::{EventBus, SubscriptionId};
pub use event::{Event, EventType};
