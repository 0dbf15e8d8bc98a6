//! Outbound buffering while the session is not attached.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde_json::Value;

/// A message accepted from the caller but not yet written to a transport.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    /// Normalized frame body.
    pub payload: Value,
    /// When the caller handed it over.
    pub enqueued_at: DateTime<Utc>,
}

impl QueuedMessage {
    /// Stamp `payload` with the current time.
    #[must_use]
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            enqueued_at: Utc::now(),
        }
    }
}

/// Strict FIFO of pending messages. Unbounded, no deduplication.
#[derive(Debug, Default)]
pub(crate) struct OutboundQueue {
    items: VecDeque<QueuedMessage>,
}

impl OutboundQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn enqueue(&mut self, message: QueuedMessage) {
        self.items.push_back(message);
    }

    /// Put a message back at the head, ahead of everything queued later.
    pub(crate) fn push_front(&mut self, message: QueuedMessage) {
        self.items.push_front(message);
    }

    /// Take everything, oldest first.
    pub(crate) fn drain(&mut self) -> Vec<QueuedMessage> {
        self.items.drain(..).collect()
    }

    pub(crate) fn clear(&mut self) {
        self.items.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
