//! Typed fan-out of channel events.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::error;

use super::events::{ChannelEvent, EventKind};

type Callback = Arc<dyn Fn(&ChannelEvent) + Send + Sync>;

/// Handle returned by [`EventDispatcher::on`]; pass it to
/// [`EventDispatcher::off`] to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription(u64);

struct Listener {
    id: u64,
    filter: Option<EventKind>,
    callback: Callback,
}

/// Registered subscribers of one channel.
#[derive(Default)]
pub struct EventDispatcher {
    listeners: RwLock<Vec<Listener>>,
    next_id: AtomicU64,
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}

impl EventDispatcher {
    /// Create a dispatcher with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events of `kind`.
    pub fn on<F>(&self, kind: EventKind, callback: F) -> Subscription
    where
        F: Fn(&ChannelEvent) + Send + Sync + 'static,
    {
        self.register(Some(kind), Arc::new(callback))
    }

    /// Subscribe to every event.
    pub fn on_any<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ChannelEvent) + Send + Sync + 'static,
    {
        self.register(None, Arc::new(callback))
    }

    /// Remove a subscription. Returns `false` if it was already gone.
    pub fn off(&self, subscription: Subscription) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| l.id != subscription.0);
        listeners.len() != before
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Deliver `event` to every matching subscriber, in subscription order.
    ///
    /// Callbacks run without the listener lock held, so they may subscribe
    /// or unsubscribe. A panicking callback is logged and skipped.
    pub(crate) fn emit(&self, event: &ChannelEvent) {
        let targets: Vec<(u64, Callback)> = self
            .listeners
            .read()
            .iter()
            .filter(|l| l.filter.as_ref().is_none_or(|kind| kind.matches(event)))
            .map(|l| (l.id, Arc::clone(&l.callback)))
            .collect();

        for (id, callback) in targets {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                error!(subscription = id, event = ?event.kind(), "event subscriber panicked");
            }
        }
    }

    fn register(&self, filter: Option<EventKind>, callback: Callback) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.write().push(Listener {
            id,
            filter,
            callback,
        });
        Subscription(id)
    }
}
