//! The bus itself: subscriber registry plus background dispatch task.

use crate::{Event, EventType};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Handle returned by [`EventBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Subscriber = Arc<dyn Fn(&Event) + Send + Sync + 'static>;

#[derive(Default)]
struct Registry {
    subscribers: Mutex<HashMap<EventType, Vec<(SubscriptionId, Subscriber)>>>,
    next_id: AtomicU64,
}

impl Registry {
    fn dispatch(&self, event: &Event) {
        // Snapshot under the lock, invoke outside it, so a subscriber may
        // subscribe or unsubscribe from within its own callback.
        let snapshot: Vec<(SubscriptionId, Subscriber)> = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event.event_type)
            .cloned()
            .unwrap_or_default();

        for (id, subscriber) in snapshot {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| subscriber(event)));
            if result.is_err() {
                error!(
                    event_type = ?event.event_type,
                    subscription = id.0,
                    "event subscriber panicked; continuing delivery"
                );
            }
        }
    }
}

/// Thread-safe publish/subscribe bus with asynchronous delivery.
///
/// Must be created inside a tokio runtime; [`EventBus::new`] spawns the
/// dispatch task.
pub struct EventBus {
    registry: Arc<Registry>,
    tx: Mutex<Option<mpsc::UnboundedSender<Event>>>,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus").finish_non_exhaustive()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Creates the bus and spawns its dispatch task.
    #[must_use]
    pub fn new() -> Self {
        let registry = Arc::new(Registry::default());
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        let dispatch_registry = Arc::clone(&registry);
        let dispatch_task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                dispatch_registry.dispatch(&event);
            }
            debug!("event bus dispatch task stopped");
        });
        Self {
            registry,
            tx: Mutex::new(Some(tx)),
            dispatch_task: Mutex::new(Some(dispatch_task)),
        }
    }

    /// Registers `subscriber` for all events of `event_type`.
    pub fn subscribe(
        &self,
        event_type: EventType,
        subscriber: impl Fn(&Event) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.registry.next_id.fetch_add(1, Ordering::Relaxed));
        self.registry
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(event_type)
            .or_default()
            .push((id, Arc::new(subscriber)));
        id
    }

    /// Removes a subscription; returns true if it was still registered.
    pub fn unsubscribe(&self, event_type: EventType, id: SubscriptionId) -> bool {
        let mut subscribers = self
            .registry
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(list) = subscribers.get_mut(&event_type) else {
            return false;
        };
        let before = list.len();
        list.retain(|(existing, _)| *existing != id);
        before != list.len()
    }

    /// Enqueues an event for delivery on the dispatch task.
    ///
    /// Callable from any thread, including non-async callbacks. After
    /// shutdown the event is dropped with a warning.
    pub fn publish(&self, event: Event) {
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        match tx.as_ref() {
            Some(tx) => {
                if tx.send(event).is_err() {
                    warn!("event bus dispatch task is gone; dropping event");
                }
            }
            None => warn!("event bus is shut down; dropping event"),
        }
    }

    /// Delivers an event inline on the calling thread.
    ///
    /// Strictly ordered with respect to the caller, bypassing the queue.
    pub fn publish_sync(&self, event: &Event) {
        self.registry.dispatch(event);
    }

    /// Stops accepting events and waits for the queue to drain.
    ///
    /// Events still queued when `timeout` expires are dropped.
    pub async fn shutdown(&self, timeout: Duration) {
        drop(
            self.tx
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        let task = self
            .dispatch_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if tokio::time::timeout(timeout, task).await.is_err() {
                warn!("event bus did not drain within {timeout:?}; dropping queued events");
            }
        }
    }
}
