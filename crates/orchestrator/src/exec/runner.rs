//! Runs one command through one session, driven by the tool orchestrator.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Instant;

use events::{Event, EventBus};
use runtime_core::{
    ExecBegin, ExecChunk, ExecEnd, ExecEvent, ExecEventPayload, ExecRecordMetadata, ExecRetry,
    SandboxState, StdioStream, ToolRunRecord, ToolRunStatus,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::executor::{CommandExecutor, ExecCommandRequest, OutputSink};
use super::stdio::{SequencedChunk, StdioTracker, DEFAULT_MAX_BUFFER_BYTES};
use crate::error::{OrchestratorError, Result, ToolError};
use crate::invocation::{
    InvocationResult, RetryContext, SandboxOptions, ToolAttemptContext, ToolInvocation,
    ToolOrchestrator,
};
use crate::session::{AcquireOptions, EnvOverrides, ExecSessionManager, SessionHandle, SessionLease};

const DEFAULT_TOOL_ID: &str = "exec";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecConfig {
    /// Per-stream cap on buffered stdout/stderr
    pub max_buffer_bytes: usize,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            max_buffer_bytes: DEFAULT_MAX_BUFFER_BYTES,
        }
    }
}

/// Receives every exec event synchronously as it is emitted.
pub trait ExecEventListener: Send + Sync {
    fn on_event(&self, event: &ExecEvent);
}

impl<F> ExecEventListener for F
where
    F: Fn(&ExecEvent) + Send + Sync,
{
    fn on_event(&self, event: &ExecEvent) {
        self(event)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Debug, Default)]
pub struct ExecRequest {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<String>,
    pub env: Option<EnvOverrides>,
    pub session_id: Option<String>,
    pub reuse_session: Option<bool>,
    pub persist_session: Option<bool>,
    pub approval_required: bool,
    pub approval_key: Option<String>,
    /// Defaults to `exec`
    pub tool_id: Option<String>,
    pub description: Option<String>,
    pub invocation_id: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub sandbox: SandboxOptions,
    /// Overrides [`ExecConfig::max_buffer_bytes`]
    pub max_buffer_bytes: Option<usize>,
    /// Caps chunk events kept in the returned event list; listeners still
    /// see every chunk
    pub max_captured_chunks: Option<usize>,
}

impl ExecRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn in_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn require_approval(mut self, key: impl Into<String>) -> Self {
        self.approval_required = true;
        self.approval_key = Some(key.into());
        self
    }

    pub fn with_sandbox(mut self, sandbox: SandboxOptions) -> Self {
        self.sandbox = sandbox;
        self
    }
}

#[derive(Debug, Clone)]
pub struct ExecRunResult {
    pub correlation_id: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
    pub duration_ms: u64,
    pub status: ToolRunStatus,
    pub sandbox_state: SandboxState,
    pub record: ToolRunRecord,
    pub events: Vec<ExecEvent>,
}

/// Result of one attempt, returned to the orchestrator.
#[derive(Debug, Clone)]
struct AttemptSummary {
    exit_code: Option<i32>,
    signal: Option<String>,
    stdout: String,
    stderr: String,
    duration_ms: u64,
    status: ToolRunStatus,
    sandbox_state: SandboxState,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct RecorderState {
    events: Vec<ExecEvent>,
    captured_chunks: usize,
}

/// Stamps, fans out and records the events of one run.
struct EventRecorder {
    correlation_id: String,
    listeners: Vec<Arc<dyn ExecEventListener>>,
    event_bus: Option<EventBus>,
    max_captured_chunks: Option<usize>,
    chunk_sequence: AtomicU64,
    state: Mutex<RecorderState>,
}

impl EventRecorder {
    fn emit(&self, attempt: u32, payload: ExecEventPayload) {
        let event = ExecEvent::new(self.correlation_id.clone(), attempt, payload);
        {
            let mut state = lock(&self.state);
            let keep = match (&event.payload, self.max_captured_chunks) {
                (ExecEventPayload::Chunk(_), Some(max)) => {
                    let keep = state.captured_chunks < max;
                    if keep {
                        state.captured_chunks += 1;
                    }
                    keep
                }
                (ExecEventPayload::Chunk(_), None) => {
                    state.captured_chunks += 1;
                    true
                }
                _ => true,
            };
            if keep {
                state.events.push(event.clone());
            }
        }

        for listener in &self.listeners {
            listener.on_event(&event);
        }
        if let Some(bus) = &self.event_bus {
            bus.publish(Event::Exec { event });
        }
    }

    fn emit_chunk(&self, attempt: u32, chunk: SequencedChunk) {
        self.chunk_sequence.store(chunk.sequence, Ordering::SeqCst);
        self.emit(
            attempt,
            ExecEventPayload::Chunk(ExecChunk {
                stream: chunk.stream,
                sequence: chunk.sequence,
                bytes: chunk.bytes,
                data: chunk.data,
            }),
        );
    }

    fn take_events(&self) -> Vec<ExecEvent> {
        std::mem::take(&mut lock(&self.state).events)
    }
}

/// Per-run inputs shared by every attempt.
struct AttemptRunner<'a, H: SessionHandle> {
    command: &'a str,
    args: &'a [String],
    cwd: Option<&'a str>,
    lease: &'a SessionLease<H>,
    executor: &'a dyn CommandExecutor<H>,
    recorder: Arc<EventRecorder>,
    max_buffer_bytes: usize,
}

impl<H: SessionHandle> AttemptRunner<'_, H> {
    async fn attempt(&self, ctx: ToolAttemptContext) -> std::result::Result<AttemptSummary, ToolError> {
        let started = Instant::now();
        let session_id = self.lease.id().to_string();

        self.recorder.emit(
            ctx.attempt,
            ExecEventPayload::Begin(ExecBegin {
                command: self.command.to_string(),
                args: self.args.to_vec(),
                cwd: self.cwd.map(str::to_string),
                session_id: session_id.clone(),
                sandbox_state: ctx.sandbox_state,
                persisted: self.lease.is_persisted(),
            }),
        );

        let tracker = Arc::new(Mutex::new(StdioTracker::starting_at(
            self.max_buffer_bytes,
            self.recorder.chunk_sequence.load(Ordering::SeqCst),
        )));
        let output = {
            let tracker = Arc::clone(&tracker);
            let recorder = Arc::clone(&self.recorder);
            let attempt = ctx.attempt;
            OutputSink::new(move |stream: StdioStream, data: &[u8]| {
                // Held while emitting so chunk order matches sequence order
                let mut tracker = lock(&tracker);
                let chunk = tracker.push(stream, data);
                recorder.emit_chunk(attempt, chunk);
            })
        };

        let outcome = self
            .executor
            .execute(ExecCommandRequest {
                command: self.command.to_string(),
                args: self.args.to_vec(),
                cwd: self.cwd.map(str::to_string),
                env: self.lease.env_snapshot().clone(),
                attempt: ctx.attempt,
                sandbox_state: ctx.sandbox_state,
                session_id: session_id.clone(),
                session: Arc::clone(self.lease.handle()),
                output,
            })
            .await;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let (stdout, stderr) = {
            let tracker = lock(&tracker);
            (
                tracker.buffered(StdioStream::Stdout),
                tracker.buffered(StdioStream::Stderr),
            )
        };

        let mut summary = AttemptSummary {
            exit_code: None,
            signal: None,
            stdout,
            stderr,
            duration_ms: elapsed_ms,
            status: ToolRunStatus::Failed,
            sandbox_state: ctx.sandbox_state,
        };
        if let Ok(outcome) = &outcome {
            summary.exit_code = outcome.exit_code;
            summary.signal = outcome.signal.clone();
            if outcome.exit_code == Some(0) {
                summary.status = ToolRunStatus::Succeeded;
            }
            if let Some(duration_ms) = outcome.duration_ms.filter(|ms| *ms > 0) {
                summary.duration_ms = duration_ms;
            }
        }

        self.recorder.emit(
            ctx.attempt,
            ExecEventPayload::End(ExecEnd {
                exit_code: summary.exit_code,
                signal: summary.signal.clone(),
                duration_ms: summary.duration_ms,
                stdout: summary.stdout.clone(),
                stderr: summary.stderr.clone(),
                sandbox_state: summary.sandbox_state,
                session_id,
                status: summary.status,
            }),
        );

        outcome.map(|_| summary)
    }
}

/// Runs commands through sessions with sequenced exec events.
pub struct ExecRunner<H: SessionHandle> {
    orchestrator: ToolOrchestrator,
    sessions: Arc<ExecSessionManager<H>>,
    executor: Arc<dyn CommandExecutor<H>>,
    config: ExecConfig,
    listeners: RwLock<Vec<(ListenerId, Arc<dyn ExecEventListener>)>>,
    next_listener_id: AtomicU64,
    event_bus: Option<EventBus>,
}

impl<H: SessionHandle> ExecRunner<H> {
    pub fn new(
        orchestrator: ToolOrchestrator,
        sessions: Arc<ExecSessionManager<H>>,
        executor: Arc<dyn CommandExecutor<H>>,
        config: ExecConfig,
    ) -> Self {
        Self {
            orchestrator,
            sessions,
            executor,
            config,
            listeners: RwLock::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
            event_bus: None,
        }
    }

    /// Republish every exec event on `event_bus` as `Event::Exec`.
    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn sessions(&self) -> &Arc<ExecSessionManager<H>> {
        &self.sessions
    }

    pub fn add_listener(&self, listener: Arc<dyn ExecEventListener>) -> ListenerId {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::SeqCst));
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Run `request` to completion.
    ///
    /// On `ToolInvocationFailed` the carried record still holds the exec
    /// metadata and every event emitted up to the failure.
    pub async fn run(&self, request: ExecRequest) -> Result<ExecRunResult> {
        let ExecRequest {
            command,
            args,
            cwd,
            env,
            session_id,
            reuse_session,
            persist_session,
            approval_required,
            approval_key,
            tool_id,
            description,
            invocation_id,
            metadata,
            sandbox,
            max_buffer_bytes,
            max_captured_chunks,
        } = request;

        let invocation_id = invocation_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let correlation_id = Uuid::new_v4().to_string();
        let reuse = reuse_session.unwrap_or(session_id.is_some());
        let lease = self
            .sessions
            .acquire(AcquireOptions {
                id: session_id,
                reuse: Some(reuse),
                persist: persist_session,
                env,
            })
            .await?;

        info!(
            invocation_id = %invocation_id,
            correlation_id = %correlation_id,
            command = %command,
            session_id = %lease.id(),
            "Running command"
        );

        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        let recorder = Arc::new(EventRecorder {
            correlation_id: correlation_id.clone(),
            listeners,
            event_bus: self.event_bus.clone(),
            max_captured_chunks,
            chunk_sequence: AtomicU64::new(0),
            state: Mutex::new(RecorderState::default()),
        });

        let sandbox = Self::decorate_sandbox(sandbox, Arc::clone(&recorder));
        let attempt_runner = AttemptRunner {
            command: &command,
            args: &args,
            cwd: cwd.as_deref(),
            lease: &lease,
            executor: self.executor.as_ref(),
            recorder: Arc::clone(&recorder),
            max_buffer_bytes: max_buffer_bytes.unwrap_or(self.config.max_buffer_bytes),
        };
        let runner = &attempt_runner;

        let mut invocation = ToolInvocation::new(
            invocation_id,
            tool_id.unwrap_or_else(|| DEFAULT_TOOL_ID.to_string()),
            move |ctx: ToolAttemptContext| runner.attempt(ctx),
        )
        .with_sandbox(sandbox)
        .defer_completion();
        invocation.description = description;
        invocation.approval_required = approval_required;
        invocation.approval_key = approval_key;
        invocation.metadata = metadata;

        let outcome = self.orchestrator.invoke(invocation).await;

        let exec_metadata = |summary: Option<&AttemptSummary>| ExecRecordMetadata {
            command: command.clone(),
            args: args.clone(),
            cwd: cwd.clone(),
            session_id: lease.id().to_string(),
            persisted: lease.is_persisted(),
            correlation_id: correlation_id.clone(),
            exit_code: summary.and_then(|s| s.exit_code),
            signal: summary.and_then(|s| s.signal.clone()),
        };

        let result = match outcome {
            Ok(InvocationResult {
                output: summary,
                mut record,
            }) => {
                record.exec = Some(exec_metadata(Some(&summary)));
                record.status = summary.status;
                record.sandbox_state = summary.sandbox_state;
                record.events = recorder.take_events();
                self.orchestrator.publish_completed(&record);
                info!(
                    correlation_id = %correlation_id,
                    exit_code = ?summary.exit_code,
                    status = summary.status.as_str(),
                    "Command finished"
                );
                Ok(ExecRunResult {
                    correlation_id: correlation_id.clone(),
                    stdout: summary.stdout,
                    stderr: summary.stderr,
                    exit_code: summary.exit_code,
                    signal: summary.signal,
                    duration_ms: summary.duration_ms,
                    status: summary.status,
                    sandbox_state: summary.sandbox_state,
                    events: record.events.clone(),
                    record,
                })
            }
            Err(OrchestratorError::ToolInvocationFailed(mut failure)) => {
                failure.record.exec = Some(exec_metadata(None));
                failure.record.status = ToolRunStatus::Failed;
                failure.record.events = recorder.take_events();
                self.orchestrator.publish_completed(&failure.record);
                Err(OrchestratorError::ToolInvocationFailed(failure))
            }
            Err(other) => Err(other),
        };

        drop(attempt_runner);
        let session_id = lease.id().to_string();
        if let Err(e) = lease.release().await {
            warn!(session_id = %session_id, error = %e, "Failed to release session lease");
        }
        result
    }

    /// Emit an `exec:retry` event before handing off to the caller's hook.
    fn decorate_sandbox(sandbox: SandboxOptions, recorder: Arc<EventRecorder>) -> SandboxOptions {
        let SandboxOptions {
            initial_state,
            classifier,
            on_retry,
        } = sandbox;

        SandboxOptions {
            initial_state,
            classifier,
            on_retry: Some(Box::new(move |ctx: &RetryContext| {
                debug!(
                    correlation_id = %recorder.correlation_id,
                    attempt = ctx.attempt,
                    "Emitting retry event"
                );
                recorder.emit(
                    ctx.attempt,
                    ExecEventPayload::Retry(ExecRetry {
                        delay_ms: ctx.delay.as_millis() as u64,
                        sandbox_state: ctx.sandbox_state,
                        error_message: ctx.error_message.clone(),
                    }),
                );
                if let Some(hook) = &on_retry {
                    hook(ctx);
                }
            })),
        }
    }
}
