//! The handle distribution service.
//!
//! Every handle owns a worker task fed by an unbounded queue. Sequence
//! numbers are assigned synchronously when an event is submitted; the worker
//! then guards, stores and fans out frames strictly in submission order, so
//! delivery order always matches sequence order even when the guard's
//! latency varies.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use futures::Stream;
use runtime_core::ExecEvent;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Result, StreamError};
use crate::frame::{HandleDescriptor, HandleStatus, StreamFrame};
use crate::guard::{DecisionRecord, GuardContext, GuardOutcome, StreamFrameGuard};
use crate::observer::{self, spawn_delivery, ObserverChannel, ObserverStats, SubscribeOptions};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HandleServiceConfig {
    /// Per-handle cap on stored frames; the oldest are trimmed first
    pub max_stored_frames: usize,
    /// Observer queue size when a subscription does not set one
    pub default_queue_size: usize,
}

impl Default for HandleServiceConfig {
    fn default() -> Self {
        Self {
            max_stored_frames: 500,
            default_queue_size: 32,
        }
    }
}

type SharedGuard = Arc<RwLock<Option<Arc<dyn StreamFrameGuard>>>>;

struct AppendCommand {
    frame: StreamFrame,
    ack: Option<oneshot::Sender<()>>,
}

struct HandleState {
    status: HandleStatus,
    next_sequence: u64,
    sender: Option<mpsc::UnboundedSender<AppendCommand>>,
    /// Set once the worker has processed everything submitted before close
    drained: bool,
    frames: VecDeque<StreamFrame>,
    decisions: Vec<DecisionRecord>,
    observers: HashMap<String, Arc<ObserverChannel>>,
}

struct HandleEntry {
    id: String,
    correlation_id: String,
    created_at: DateTime<Utc>,
    max_stored_frames: usize,
    state: Mutex<HandleState>,
}

impl HandleEntry {
    fn state(&self) -> MutexGuard<'_, HandleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn descriptor(&self) -> HandleDescriptor {
        let state = self.state();
        HandleDescriptor {
            id: self.id.clone(),
            correlation_id: self.correlation_id.clone(),
            created_at: self.created_at,
            frame_count: state.frames.len(),
            status: state.status,
            latest_sequence: state.next_sequence - 1,
        }
    }

    fn commit(&self, sequence: u64, outcome: GuardOutcome) {
        let mut state = self.state();
        state
            .decisions
            .push(DecisionRecord::new(&self.id, sequence, &outcome.decision));

        let Some(frame) = outcome.frame else {
            debug!(handle_id = %self.id, sequence, "Frame dropped by guard");
            return;
        };

        state.frames.push_back(frame.clone());
        while state.frames.len() > self.max_stored_frames {
            state.frames.pop_front();
        }
        for observer in state.observers.values() {
            observer.enqueue(frame.clone());
        }
    }

    fn finish(&self) {
        let mut state = self.state();
        state.drained = true;
        for observer in state.observers.values() {
            observer.finish();
        }
        debug!(handle_id = %self.id, "Handle drained");
    }
}

async fn run_worker(
    entry: Weak<HandleEntry>,
    guard: SharedGuard,
    mut commands: mpsc::UnboundedReceiver<AppendCommand>,
) {
    while let Some(AppendCommand { frame, ack }) = commands.recv().await {
        let Some(handle) = entry.upgrade() else {
            return;
        };
        let sequence = frame.sequence;
        let current = guard
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let outcome = match current {
            Some(guard) => {
                let context = GuardContext {
                    handle_id: handle.id.clone(),
                };
                guard.process(frame, &context).await
            }
            None => GuardOutcome::allow(frame),
        };
        handle.commit(sequence, outcome);
        if let Some(ack) = ack {
            let _ = ack.send(());
        }
    }

    if let Some(handle) = entry.upgrade() {
        handle.finish();
    }
}

struct ServiceInner {
    config: HandleServiceConfig,
    handles: RwLock<HashMap<String, Arc<HandleEntry>>>,
    guard: SharedGuard,
}

/// Issues handles and distributes their frames to observers.
///
/// Cheap to clone; clones share the same handles and guard. Must be used
/// from within a Tokio runtime since handles and subscriptions spawn tasks.
#[derive(Clone)]
pub struct HandleService {
    inner: Arc<ServiceInner>,
}

impl HandleService {
    pub fn new(config: HandleServiceConfig) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                config,
                handles: RwLock::new(HashMap::new()),
                guard: Arc::new(RwLock::new(None)),
            }),
        }
    }

    pub fn with_guard(self, guard: Arc<dyn StreamFrameGuard>) -> Self {
        self.set_guard(Some(guard));
        self
    }

    /// Replace the guard applied to frames processed from now on.
    pub fn set_guard(&self, guard: Option<Arc<dyn StreamFrameGuard>>) {
        *self
            .inner
            .guard
            .write()
            .unwrap_or_else(PoisonError::into_inner) = guard;
    }

    pub fn config(&self) -> &HandleServiceConfig {
        &self.inner.config
    }

    pub fn issue_handle(&self, correlation_id: impl Into<String>) -> HandleDescriptor {
        let (sender, receiver) = mpsc::unbounded_channel();
        let entry = Arc::new(HandleEntry {
            id: Uuid::new_v4().to_string(),
            correlation_id: correlation_id.into(),
            created_at: Utc::now(),
            max_stored_frames: self.inner.config.max_stored_frames,
            state: Mutex::new(HandleState {
                status: HandleStatus::Open,
                next_sequence: 1,
                sender: Some(sender),
                drained: false,
                frames: VecDeque::new(),
                decisions: Vec::new(),
                observers: HashMap::new(),
            }),
        });

        tokio::spawn(run_worker(
            Arc::downgrade(&entry),
            Arc::clone(&self.inner.guard),
            receiver,
        ));

        let descriptor = entry.descriptor();
        self.inner
            .handles
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entry.id.clone(), entry);
        info!(
            handle_id = %descriptor.id,
            correlation_id = %descriptor.correlation_id,
            "Issued handle"
        );
        descriptor
    }

    /// Queue `event` on the handle without waiting for it to be processed.
    ///
    /// Returns the assigned sequence, or `None` if the handle is closed.
    pub fn publish(&self, handle_id: &str, event: ExecEvent) -> Result<Option<u64>> {
        self.submit(handle_id, event, None)
    }

    /// Queue `event` and wait until it has been guarded, stored and handed
    /// to every observer's queue.
    ///
    /// The sequence is assigned when this is called, not when the returned
    /// future is first polled.
    pub fn append(
        &self,
        handle_id: &str,
        event: ExecEvent,
    ) -> impl Future<Output = Result<Option<u64>>> + Send + 'static {
        let (ack, processed) = oneshot::channel();
        let submitted = self.submit(handle_id, event, Some(ack));
        async move {
            let sequence = submitted?;
            if sequence.is_some() {
                let _ = processed.await;
            }
            Ok(sequence)
        }
    }

    fn submit(
        &self,
        handle_id: &str,
        event: ExecEvent,
        ack: Option<oneshot::Sender<()>>,
    ) -> Result<Option<u64>> {
        let entry = self.entry(handle_id)?;
        let mut state = entry.state();
        if state.status == HandleStatus::Closed {
            debug!(handle_id = %handle_id, "Ignoring append on closed handle");
            return Ok(None);
        }
        let Some(sender) = state.sender.clone() else {
            return Ok(None);
        };

        let sequence = state.next_sequence;
        state.next_sequence += 1;
        let command = AppendCommand {
            frame: StreamFrame::new(sequence, event),
            ack,
        };
        if sender.send(command).is_err() {
            return Ok(None);
        }
        Ok(Some(sequence))
    }

    /// Stop accepting events. Frames submitted earlier are still processed;
    /// observers finish once they have received them.
    pub fn close(&self, handle_id: &str) -> Result<()> {
        let entry = self.entry(handle_id)?;
        let mut state = entry.state();
        if state.status == HandleStatus::Closed {
            return Ok(());
        }
        state.status = HandleStatus::Closed;
        state.sender = None;
        info!(
            handle_id = %handle_id,
            latest_sequence = state.next_sequence - 1,
            "Closed handle"
        );
        Ok(())
    }

    /// Register `on_frame` as observer `observer_id`.
    ///
    /// Stored frames at or after `from_sequence` are replayed through the
    /// observer's queue first, followed by live frames. Registering an id
    /// that is already subscribed replaces the earlier subscription.
    pub fn subscribe<F>(
        &self,
        handle_id: &str,
        observer_id: &str,
        options: SubscribeOptions,
        on_frame: F,
    ) -> Result<Subscription>
    where
        F: Fn(StreamFrame) + Send + Sync + 'static,
    {
        let subscription = self.register(handle_id, observer_id, options)?;
        spawn_delivery(Arc::clone(&subscription.channel), Arc::new(on_frame));
        Ok(subscription)
    }

    /// Subscribe and receive frames as a [`Stream`]. The stream ends after
    /// the handle is closed and every frame has been delivered.
    ///
    /// Frames wait in the observer's bounded queue until polled; a consumer
    /// that stops polling loses the oldest frames rather than buffering more.
    pub fn stream(
        &self,
        handle_id: &str,
        observer_id: &str,
        options: SubscribeOptions,
    ) -> Result<FrameStream> {
        let subscription = self.register(handle_id, observer_id, options)?;
        Ok(FrameStream {
            frames: Box::pin(observer::frames(Arc::clone(&subscription.channel))),
            subscription,
        })
    }

    fn register(
        &self,
        handle_id: &str,
        observer_id: &str,
        options: SubscribeOptions,
    ) -> Result<Subscription> {
        let entry = self.entry(handle_id)?;
        let queue_size = options
            .max_queue_size
            .unwrap_or(self.inner.config.default_queue_size);
        let from_sequence = options.from_sequence.unwrap_or(1);
        let channel = Arc::new(ObserverChannel::new(handle_id, observer_id, queue_size));

        {
            let mut state = entry.state();
            for frame in state.frames.iter().filter(|f| f.sequence >= from_sequence) {
                channel.enqueue(frame.clone());
            }
            if state.drained {
                channel.finish();
            }
            if let Some(previous) = state
                .observers
                .insert(observer_id.to_string(), Arc::clone(&channel))
            {
                previous.close();
            }
        }

        debug!(
            handle_id = %handle_id,
            observer_id = %observer_id,
            from_sequence,
            queue_size,
            "Observer subscribed"
        );
        Ok(Subscription {
            entry: Arc::downgrade(&entry),
            channel,
        })
    }

    /// Stored frames with `sequence >= from_sequence` (default 1).
    pub fn get_snapshot(&self, handle_id: &str, from_sequence: Option<u64>) -> Result<Vec<StreamFrame>> {
        let entry = self.entry(handle_id)?;
        let from_sequence = from_sequence.unwrap_or(1);
        let state = entry.state();
        Ok(state
            .frames
            .iter()
            .filter(|f| f.sequence >= from_sequence)
            .cloned()
            .collect())
    }

    pub fn get_descriptor(&self, handle_id: &str) -> Result<HandleDescriptor> {
        Ok(self.entry(handle_id)?.descriptor())
    }

    /// Every guard decision recorded for the handle, including blocked frames.
    pub fn get_decisions(&self, handle_id: &str) -> Result<Vec<DecisionRecord>> {
        Ok(self.entry(handle_id)?.state().decisions.clone())
    }

    pub fn handle_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .handles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    fn entry(&self, handle_id: &str) -> Result<Arc<HandleEntry>> {
        self.inner
            .handles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(handle_id)
            .cloned()
            .ok_or_else(|| StreamError::HandleNotFound(handle_id.to_string()))
    }
}

impl Default for HandleService {
    fn default() -> Self {
        Self::new(HandleServiceConfig::default())
    }
}

/// A registered observer. Dropping it unsubscribes.
#[must_use = "dropping a subscription unsubscribes the observer"]
pub struct Subscription {
    entry: Weak<HandleEntry>,
    channel: Arc<ObserverChannel>,
}

impl Subscription {
    pub fn observer_id(&self) -> &str {
        self.channel.observer_id()
    }

    pub fn stats(&self) -> ObserverStats {
        self.channel.stats()
    }

    pub fn unsubscribe(self) -> ObserverStats {
        self.stats()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.upgrade() {
            let mut state = entry.state();
            let observer_id = self.channel.observer_id();
            let is_current = state
                .observers
                .get(observer_id)
                .is_some_and(|channel| Arc::ptr_eq(channel, &self.channel));
            if is_current {
                state.observers.remove(observer_id);
            }
        }
        self.channel.close();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("observer_id", &self.observer_id())
            .field("stats", &self.stats())
            .finish()
    }
}

/// Frames of one subscription as a [`Stream`].
pub struct FrameStream {
    frames: Pin<Box<dyn Stream<Item = StreamFrame> + Send>>,
    subscription: Subscription,
}

impl FrameStream {
    pub fn stats(&self) -> ObserverStats {
        self.subscription.stats()
    }
}

impl Stream for FrameStream {
    type Item = StreamFrame;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.frames.as_mut().poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runtime_core::{ExecChunk, ExecEventPayload, StdioStream};

    fn chunk(data: &str) -> ExecEvent {
        ExecEvent::new(
            "corr-1",
            1,
            ExecEventPayload::Chunk(ExecChunk {
                stream: StdioStream::Stdout,
                sequence: 0,
                bytes: data.len(),
                data: data.to_string(),
            }),
        )
    }

    #[tokio::test]
    async fn test_issue_handle_descriptor() {
        let service = HandleService::default();
        let descriptor = service.issue_handle("corr-1");

        assert_eq!(descriptor.correlation_id, "corr-1");
        assert_eq!(descriptor.status, HandleStatus::Open);
        assert_eq!(descriptor.frame_count, 0);
        assert_eq!(descriptor.latest_sequence, 0);
        assert_eq!(service.handle_ids(), vec![descriptor.id]);
    }

    #[tokio::test]
    async fn test_append_assigns_sequences_and_stores() {
        let service = HandleService::default();
        let handle = service.issue_handle("corr-1").id;

        let first = service.append(&handle, chunk("a"));
        let second = service.append(&handle, chunk("b"));
        assert_eq!(second.await.unwrap(), Some(2));
        assert_eq!(first.await.unwrap(), Some(1));

        let snapshot = service.get_snapshot(&handle, None).unwrap();
        let sequences: Vec<u64> = snapshot.iter().map(|f| f.sequence).collect();
        assert_eq!(sequences, vec![1, 2]);
        assert_eq!(service.get_snapshot(&handle, Some(2)).unwrap().len(), 1);

        let descriptor = service.get_descriptor(&handle).unwrap();
        assert_eq!(descriptor.frame_count, 2);
        assert_eq!(descriptor.latest_sequence, 2);

        let decisions = service.get_decisions(&handle).unwrap();
        assert_eq!(decisions.len(), 2);
        assert!(decisions.iter().all(|d| d.handle_id == handle));
    }

    #[tokio::test]
    async fn test_stored_frames_are_trimmed() {
        let service = HandleService::new(HandleServiceConfig {
            max_stored_frames: 3,
            ..Default::default()
        });
        let handle = service.issue_handle("corr-1").id;
        for i in 0..4 {
            service.publish(&handle, chunk(&i.to_string())).unwrap();
        }
        service.append(&handle, chunk("4")).await.unwrap();

        let sequences: Vec<u64> = service
            .get_snapshot(&handle, None)
            .unwrap()
            .iter()
            .map(|f| f.sequence)
            .collect();
        assert_eq!(sequences, vec![3, 4, 5]);
        assert_eq!(service.get_descriptor(&handle).unwrap().latest_sequence, 5);
    }

    #[tokio::test]
    async fn test_closed_handle_ignores_appends() {
        let service = HandleService::default();
        let handle = service.issue_handle("corr-1").id;
        service.append(&handle, chunk("a")).await.unwrap();
        service.close(&handle).unwrap();

        assert_eq!(service.append(&handle, chunk("b")).await.unwrap(), None);
        assert_eq!(service.publish(&handle, chunk("c")).unwrap(), None);
        let descriptor = service.get_descriptor(&handle).unwrap();
        assert_eq!(descriptor.status, HandleStatus::Closed);
        assert_eq!(descriptor.frame_count, 1);
    }

    #[tokio::test]
    async fn test_unknown_handle() {
        let service = HandleService::default();
        let expected = StreamError::HandleNotFound("missing".to_string());

        assert_eq!(service.publish("missing", chunk("a")).unwrap_err(), expected);
        assert_eq!(service.append("missing", chunk("a")).await.unwrap_err(), expected);
        assert_eq!(service.close("missing").unwrap_err(), expected);
        assert_eq!(service.get_snapshot("missing", None).unwrap_err(), expected);
        assert_eq!(service.get_descriptor("missing").unwrap_err(), expected);
        assert_eq!(service.get_decisions("missing").unwrap_err(), expected);
        assert!(service
            .subscribe("missing", "obs", SubscribeOptions::default(), |_| {})
            .is_err());
    }

    #[tokio::test]
    async fn test_subscribe_replays_from_sequence() {
        let service = HandleService::default();
        let handle = service.issue_handle("corr-1").id;
        for data in ["a", "b", "c"] {
            service.append(&handle, chunk(data)).await.unwrap();
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let subscription = {
            let seen = seen.clone();
            service
                .subscribe(
                    &handle,
                    "obs",
                    SubscribeOptions::default().from_sequence(2),
                    move |frame| seen.lock().unwrap().push(frame.sequence),
                )
                .unwrap()
        };
        service.append(&handle, chunk("d")).await.unwrap();

        while subscription.stats().delivered < 3 {
            tokio::task::yield_now().await;
        }
        assert_eq!(*seen.lock().unwrap(), vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let service = HandleService::default();
        let handle = service.issue_handle("corr-1").id;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let subscription = {
            let seen = seen.clone();
            service
                .subscribe(&handle, "obs", SubscribeOptions::default(), move |frame| {
                    seen.lock().unwrap().push(frame.sequence)
                })
                .unwrap()
        };
        service.append(&handle, chunk("a")).await.unwrap();
        while subscription.stats().delivered < 1 {
            tokio::task::yield_now().await;
        }

        let stats = subscription.unsubscribe();
        assert_eq!(stats.delivered, 1);
        service.append(&handle, chunk("b")).await.unwrap();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(*seen.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_stream_ends_after_close() {
        use futures::StreamExt;

        let service = HandleService::default();
        let handle = service.issue_handle("corr-1").id;
        service.publish(&handle, chunk("a")).unwrap();
        service.publish(&handle, chunk("b")).unwrap();
        service.close(&handle).unwrap();

        let stream = service
            .stream(&handle, "obs", SubscribeOptions::default())
            .unwrap();
        let frames: Vec<StreamFrame> = stream.collect().await;
        let sequences: Vec<u64> = frames.iter().map(|f| f.sequence).collect();
        assert_eq!(sequences, vec![1, 2]);
    }
}
