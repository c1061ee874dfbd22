//! Per-observer bounded queues and their deferred delivery tasks.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::frame::StreamFrame;

pub(crate) type FrameCallback = Arc<dyn Fn(StreamFrame) + Send + Sync>;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Replay stored frames with `sequence >= from_sequence` (default 1)
    pub from_sequence: Option<u64>,
    /// Overrides the service's default queue size; clamped to at least 1
    pub max_queue_size: Option<usize>,
}

impl SubscribeOptions {
    pub fn from_sequence(mut self, sequence: u64) -> Self {
        self.from_sequence = Some(sequence);
        self
    }

    pub fn with_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = Some(size);
        self
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
pub struct ObserverStats {
    pub delivered: u64,
    pub dropped: u64,
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<StreamFrame>,
    delivered: u64,
    dropped: u64,
    /// Unsubscribed; pending frames are discarded
    closed: bool,
    /// No more frames will arrive; pending frames are still delivered
    finished: bool,
}

pub(crate) struct ObserverChannel {
    handle_id: String,
    observer_id: String,
    max_queue_size: usize,
    state: Mutex<QueueState>,
    ready: Notify,
}

impl ObserverChannel {
    pub(crate) fn new(handle_id: &str, observer_id: &str, max_queue_size: usize) -> Self {
        Self {
            handle_id: handle_id.to_string(),
            observer_id: observer_id.to_string(),
            max_queue_size: max_queue_size.max(1),
            state: Mutex::new(QueueState::default()),
            ready: Notify::new(),
        }
    }

    pub(crate) fn observer_id(&self) -> &str {
        &self.observer_id
    }

    /// Queue a frame for deferred delivery, evicting the oldest queued
    /// frame when the queue is full.
    pub(crate) fn enqueue(&self, frame: StreamFrame) {
        {
            let mut state = self.state();
            if state.closed || state.finished {
                return;
            }
            if state.queue.len() >= self.max_queue_size {
                if let Some(evicted) = state.queue.pop_front() {
                    state.dropped += 1;
                    warn!(
                        handle_id = %self.handle_id,
                        observer_id = %self.observer_id,
                        sequence = evicted.sequence,
                        dropped = state.dropped,
                        "Observer queue full, dropped oldest frame"
                    );
                }
            }
            state.queue.push_back(frame);
        }
        self.ready.notify_one();
    }

    pub(crate) fn stats(&self) -> ObserverStats {
        let state = self.state();
        ObserverStats {
            delivered: state.delivered,
            dropped: state.dropped,
        }
    }

    pub(crate) fn close(&self) {
        {
            let mut state = self.state();
            state.closed = true;
            state.queue.clear();
        }
        self.ready.notify_one();
    }

    pub(crate) fn finish(&self) {
        self.state().finished = true;
        self.ready.notify_one();
    }

    /// Pop the oldest queued frame, counting it as delivered.
    fn next(&self) -> Option<StreamFrame> {
        let mut state = self.state();
        let frame = state.queue.pop_front()?;
        state.delivered += 1;
        Some(frame)
    }

    fn is_done(&self) -> bool {
        let state = self.state();
        state.closed || (state.finished && state.queue.is_empty())
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Drain the channel into `callback` on a separate task, batch by batch,
/// until the channel is closed or finished and empty.
pub(crate) fn spawn_delivery(channel: Arc<ObserverChannel>, callback: FrameCallback) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            while let Some(frame) = channel.next() {
                let sequence = frame.sequence;
                let result = catch_unwind(AssertUnwindSafe(|| callback(frame)));
                if result.is_err() {
                    warn!(
                        handle_id = %channel.handle_id,
                        observer_id = %channel.observer_id,
                        sequence,
                        "Observer callback panicked"
                    );
                }
            }
            if channel.is_done() {
                break;
            }
            channel.ready.notified().await;
        }
        debug!(
            handle_id = %channel.handle_id,
            observer_id = %channel.observer_id,
            "Observer delivery stopped"
        );
    })
}

/// Pull frames straight off the channel. Frames stay in the bounded queue
/// until the consumer polls, so a stalled consumer sees drops, not growth.
pub(crate) fn frames(channel: Arc<ObserverChannel>) -> impl Stream<Item = StreamFrame> + Send {
    stream::unfold(channel, |channel| async move {
        loop {
            if let Some(frame) = channel.next() {
                return Some((frame, channel));
            }
            if channel.is_done() {
                return None;
            }
            channel.ready.notified().await;
        }
    })
}
