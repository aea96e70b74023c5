//! Event Bus
//!
//! Synchronous publish/subscribe hub. Publication walks the subscription
//! table in order under a shared lock; replacing the table takes the
//! exclusive lock, so a swap never interleaves with an in-flight dispatch.

use super::event::{Event, EventFilter};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

// =============================================================================
// Handlers
// =============================================================================

/// Receiver of published events
///
/// Handlers run on the publisher's thread and must return quickly; anything
/// slow belongs on a task the handler spawns or a queue it feeds.
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: &Event);
}

/// Adapter turning a closure into an [`EventHandler`]
pub struct HandlerFn<F>(pub F);

impl<F> EventHandler for HandlerFn<F>
where
    F: Fn(&Event) + Send + Sync,
{
    fn on_event(&self, event: &Event) {
        (self.0)(event)
    }
}

/// Wrap a closure as a shareable handler
pub fn handler_fn<F>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(&Event) + Send + Sync + 'static,
{
    Arc::new(HandlerFn(f))
}

/// Handler logging every event on the host it was raised on
#[derive(Debug, Default)]
pub struct EventLogger;

impl EventHandler for EventLogger {
    fn on_event(&self, event: &Event) {
        if event.is_state_change() {
            warn!(event_id = %event.id, rank = ?event.rank, "{}", event);
        } else {
            info!(event_id = %event.id, "{}", event);
        }
    }
}

// =============================================================================
// Subscription Table
// =============================================================================

/// Ordered list of (filter, handler) pairs
#[derive(Default, Clone)]
pub struct SubscriptionTable {
    entries: Vec<(EventFilter, Arc<dyn EventHandler>)>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a subscription; builder style
    pub fn with(mut self, filter: EventFilter, handler: Arc<dyn EventHandler>) -> Self {
        self.entries.push((filter, handler));
        self
    }

    pub fn push(&mut self, filter: EventFilter, handler: Arc<dyn EventHandler>) {
        self.entries.push((filter, handler));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// =============================================================================
// PubSub
// =============================================================================

/// Node-local event bus
pub struct PubSub {
    table: RwLock<SubscriptionTable>,
    published: AtomicU64,
}

impl PubSub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            table: RwLock::new(SubscriptionTable::new()),
            published: AtomicU64::new(0),
        })
    }

    /// Add a handler for events matching `filter`
    pub fn subscribe(&self, filter: EventFilter, handler: Arc<dyn EventHandler>) {
        self.table.write().push(filter, handler);
    }

    /// Drop every subscription
    pub fn reset(&self) {
        *self.table.write() = SubscriptionTable::new();
    }

    /// Atomically replace the whole subscription table
    pub fn replace(&self, table: SubscriptionTable) {
        let mut guard = self.table.write();
        debug!(
            old = guard.len(),
            new = table.len(),
            "replacing event subscriptions"
        );
        *guard = table;
    }

    /// Deliver an event to every matching handler, in subscription order
    pub fn publish(&self, event: Event) {
        self.published.fetch_add(1, Ordering::Relaxed);

        // Recursive read so a handler may publish follow-up events.
        let table = self.table.read_recursive();
        if table.is_empty() {
            error!("event published with no subscribers: {}", event);
            return;
        }
        for (filter, handler) in table.entries.iter() {
            if filter.matches(event.event_type) {
                handler.on_event(&event);
            }
        }
    }

    /// Number of subscriptions currently registered
    pub fn subscription_count(&self) -> usize {
        self.table.read().len()
    }

    /// Total number of events published
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for PubSub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSub")
            .field("subscriptions", &self.subscription_count())
            .field("published", &self.published_count())
            .finish()
    }
}
