//! Event bus implementation using tokio broadcast channels

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::{Stream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::types::{Event, EventEnvelope};

/// Capacity for the broadcast channel
const DEFAULT_CAPACITY: usize = 1000;

/// Event bus for publishing and subscribing to lifecycle events
///
/// Every published event is wrapped in an [`EventEnvelope`] carrying a
/// bus-wide sequence number, so subscribers can detect lagged gaps.
/// Slow subscribers lag and lose the oldest envelopes instead of
/// blocking publishers.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EventEnvelope>,
    sequence: Arc<AtomicU64>,
}

impl EventBus {
    /// Create a new event bus with default capacity
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a new event bus with specified capacity
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publish an event to all subscribers
    ///
    /// Returns the number of subscribers that received the event.
    /// If there are no subscribers, returns 0 (the event is dropped, but
    /// still consumes a sequence number).
    pub fn publish(&self, event: Event) -> usize {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        self.sender
            .send(EventEnvelope::new(sequence, event))
            .unwrap_or(0)
    }

    /// Subscribe to events
    ///
    /// Events published before subscribing will not be received.
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }

    /// Subscribe as a stream, silently skipping over lagged envelopes
    pub fn stream(&self) -> impl Stream<Item = EventEnvelope> + Send + 'static {
        BroadcastStream::new(self.subscribe()).filter_map(|res| async move { res.ok() })
    }

    /// Get the number of current subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Get the total number of events published
    pub fn event_count(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .field("event_count", &self.event_count())
            .finish()
    }
}
