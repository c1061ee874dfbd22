//! Approval-gated, sandbox-retrying tool invocation.
//!
//! [`ToolOrchestrator::invoke`] resolves approval once, then drives the
//! attempt body through an explicit retry loop:
//!
//! ```text
//! attempt 1 ──ok──► Succeeded
//!     │
//!     └─err─► classify ──not retryable / out of attempts──► ToolInvocationFailed
//!                 │
//!                 └─retry─► sleep(backoff) ─► on_retry ─► attempt + 1
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use events::{Event, EventBus};
use runtime_core::{
    ApprovalPolicy, ApprovalSource, SandboxState, ToolRunRecord, ToolRunStatus,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::approval::{ApprovalCache, ApprovalContext, ApprovalPrompter, InMemoryApprovalCache};
use crate::error::{OrchestratorError, Result, ToolError, ToolInvocationFailure};

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_INITIAL_BACKOFF_MS: u64 = 250;
const DEFAULT_MAX_BACKOFF_MS: u64 = 30_000;

/// Configuration for the tool orchestrator
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub approval_policy: ApprovalPolicy,
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            approval_policy: ApprovalPolicy::default(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff_ms: DEFAULT_INITIAL_BACKOFF_MS,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
        }
    }
}

impl OrchestratorConfig {
    /// Delay before the attempt following `attempt`: `initial * 2^(attempt-1)`, capped.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        let ms = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

/// Waits out the backoff between attempts.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Passed to every attempt of the invocation body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolAttemptContext {
    pub attempt: u32,
    pub sandbox_state: SandboxState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SandboxRetryDecision {
    pub retry: bool,
    pub next_state: Option<SandboxState>,
}

/// Handed to the retry hook before the next attempt starts.
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// The attempt that just failed
    pub attempt: u32,
    pub delay: Duration,
    /// State the failed attempt ran under
    pub sandbox_state: SandboxState,
    pub error_message: String,
}

pub type ErrorClassifier = Box<dyn Fn(&ToolError) -> Option<SandboxRetryDecision> + Send + Sync>;
pub type RetryHook = Box<dyn Fn(&RetryContext) + Send + Sync>;

#[derive(Default)]
pub struct SandboxOptions {
    pub initial_state: SandboxState,
    /// Overrides the default classification when it returns `Some`
    pub classifier: Option<ErrorClassifier>,
    pub on_retry: Option<RetryHook>,
}

impl SandboxOptions {
    pub fn with_initial_state(mut self, state: SandboxState) -> Self {
        self.initial_state = state;
        self
    }

    pub fn with_classifier<F>(mut self, classifier: F) -> Self
    where
        F: Fn(&ToolError) -> Option<SandboxRetryDecision> + Send + Sync + 'static,
    {
        self.classifier = Some(Box::new(classifier));
        self
    }

    pub fn on_retry<F>(mut self, hook: F) -> Self
    where
        F: Fn(&RetryContext) + Send + Sync + 'static,
    {
        self.on_retry = Some(Box::new(hook));
        self
    }

    fn classify(&self, error: &ToolError) -> SandboxRetryDecision {
        if let Some(decision) = self.classifier.as_ref().and_then(|classify| classify(error)) {
            return decision;
        }
        match error {
            ToolError::SandboxRetryable { next_state, .. } => SandboxRetryDecision {
                retry: true,
                next_state: *next_state,
            },
            _ => SandboxRetryDecision {
                retry: false,
                next_state: None,
            },
        }
    }
}

impl std::fmt::Debug for SandboxOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxOptions")
            .field("initial_state", &self.initial_state)
            .field("classifier", &self.classifier.is_some())
            .field("on_retry", &self.on_retry.is_some())
            .finish()
    }
}

/// One logical tool call. `run` is invoked once per attempt.
pub struct ToolInvocation<F> {
    pub id: String,
    pub tool: String,
    pub description: Option<String>,
    pub approval_required: bool,
    pub approval_key: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub sandbox: SandboxOptions,
    /// The caller settles the record and publishes `tool.completed` itself
    pub defer_completion: bool,
    pub run: F,
}

impl<F> ToolInvocation<F> {
    pub fn new<Fut>(id: impl Into<String>, tool: impl Into<String>, run: F) -> Self
    where
        F: FnMut(ToolAttemptContext) -> Fut,
    {
        Self {
            id: id.into(),
            tool: tool.into(),
            description: None,
            approval_required: false,
            approval_key: None,
            metadata: None,
            sandbox: SandboxOptions::default(),
            defer_completion: false,
            run,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn require_approval(mut self, key: impl Into<String>) -> Self {
        self.approval_required = true;
        self.approval_key = Some(key.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_sandbox(mut self, sandbox: SandboxOptions) -> Self {
        self.sandbox = sandbox;
        self
    }

    /// Leave `tool.completed` to the caller, for callers that adjust the
    /// record after `invoke` returns. See [`ToolOrchestrator::publish_completed`].
    pub fn defer_completion(mut self) -> Self {
        self.defer_completion = true;
        self
    }
}

#[derive(Debug)]
pub struct InvocationResult<T> {
    pub output: T,
    pub record: ToolRunRecord,
}

/// Fields of the record that are fixed before the first attempt.
struct RecordDraft {
    id: String,
    tool: String,
    description: Option<String>,
    approval_source: ApprovalSource,
    metadata: Option<serde_json::Value>,
    started_at: DateTime<Utc>,
}

impl RecordDraft {
    fn finish(
        &self,
        sandbox_state: SandboxState,
        attempt_count: u32,
        status: ToolRunStatus,
    ) -> ToolRunRecord {
        ToolRunRecord {
            id: self.id.clone(),
            tool: self.tool.clone(),
            description: self.description.clone(),
            approval_source: self.approval_source,
            retry_count: attempt_count.saturating_sub(1),
            attempt_count,
            sandbox_state,
            status,
            started_at: self.started_at,
            completed_at: Utc::now(),
            metadata: self.metadata.clone(),
            exec: None,
            events: Vec::new(),
        }
    }
}

/// Runs tool invocations with approval gating and sandbox retry.
#[derive(Clone)]
pub struct ToolOrchestrator {
    config: OrchestratorConfig,
    approval_cache: Arc<dyn ApprovalCache>,
    prompter: Option<Arc<dyn ApprovalPrompter>>,
    sleeper: Arc<dyn Sleeper>,
    event_bus: Option<EventBus>,
}

impl ToolOrchestrator {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            approval_cache: Arc::new(InMemoryApprovalCache::new()),
            prompter: None,
            sleeper: Arc::new(TokioSleeper),
            event_bus: None,
        }
    }

    pub fn with_approval_cache(mut self, cache: Arc<dyn ApprovalCache>) -> Self {
        self.approval_cache = cache;
        self
    }

    pub fn with_prompter(mut self, prompter: Arc<dyn ApprovalPrompter>) -> Self {
        self.prompter = Some(prompter);
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn approval_cache(&self) -> &Arc<dyn ApprovalCache> {
        &self.approval_cache
    }

    /// Run `invocation` to completion.
    ///
    /// Returns the output of the first successful attempt, or
    /// `ToolInvocationFailed` carrying the full record once the error is
    /// not retryable or attempts are exhausted.
    pub async fn invoke<F, Fut, T>(&self, invocation: ToolInvocation<F>) -> Result<InvocationResult<T>>
    where
        F: FnMut(ToolAttemptContext) -> Fut + Send,
        Fut: Future<Output = std::result::Result<T, ToolError>> + Send,
        T: Send,
    {
        if invocation.id.is_empty() {
            return Err(OrchestratorError::InvalidInvocation(
                "invocation id is required".to_string(),
            ));
        }
        if invocation.tool.is_empty() {
            return Err(OrchestratorError::InvalidInvocation(
                "tool name is required".to_string(),
            ));
        }

        let ToolInvocation {
            id,
            tool,
            description,
            approval_required,
            approval_key,
            metadata,
            sandbox,
            defer_completion,
            mut run,
        } = invocation;

        let approval_source = if approval_required {
            let key = approval_key.ok_or_else(|| {
                OrchestratorError::InvalidInvocation(format!(
                    "invocation {id} requires an approval key"
                ))
            })?;
            self.resolve_approval(&tool, &key, description.as_deref())
                .await?
        } else {
            ApprovalSource::NotRequired
        };

        let draft = RecordDraft {
            id,
            tool,
            description,
            approval_source,
            metadata,
            started_at: Utc::now(),
        };
        let max_attempts = self.config.max_attempts.max(1);
        let mut sandbox_state = sandbox.initial_state;
        let mut attempt = 1;

        loop {
            debug!(
                invocation_id = %draft.id,
                tool = %draft.tool,
                attempt = attempt,
                sandbox_state = %sandbox_state,
                "Starting tool attempt"
            );

            let error = match run(ToolAttemptContext {
                attempt,
                sandbox_state,
            })
            .await
            {
                Ok(output) => {
                    let record = draft.finish(sandbox_state, attempt, ToolRunStatus::Succeeded);
                    info!(
                        invocation_id = %record.id,
                        tool = %record.tool,
                        attempts = attempt,
                        "Tool invocation succeeded"
                    );
                    if !defer_completion {
                        self.publish_completed(&record);
                    }
                    return Ok(InvocationResult { output, record });
                }
                Err(error) => error,
            };

            let decision = sandbox.classify(&error);
            if !decision.retry || attempt >= max_attempts {
                let final_state = decision.next_state.unwrap_or(sandbox_state);
                let record = draft.finish(final_state, attempt, ToolRunStatus::Failed);
                warn!(
                    invocation_id = %record.id,
                    tool = %record.tool,
                    attempts = attempt,
                    error = %error,
                    "Tool invocation failed"
                );
                if !defer_completion {
                    self.publish_completed(&record);
                }
                let plural = if attempt == 1 { "" } else { "s" };
                return Err(OrchestratorError::ToolInvocationFailed(Box::new(
                    ToolInvocationFailure {
                        message: format!(
                            "Tool invocation {} failed after {} attempt{}",
                            record.id, attempt, plural
                        ),
                        record,
                        cause: error,
                    },
                )));
            }

            let delay = self.config.backoff_delay(attempt);
            warn!(
                invocation_id = %draft.id,
                tool = %draft.tool,
                attempt = attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Sandbox-retryable failure, backing off"
            );
            self.sleeper.sleep(delay).await;

            if let Some(hook) = &sandbox.on_retry {
                hook(&RetryContext {
                    attempt,
                    delay,
                    sandbox_state,
                    error_message: error.to_string(),
                });
            }

            sandbox_state = decision.next_state.unwrap_or(sandbox_state);
            attempt += 1;
        }
    }

    async fn resolve_approval(
        &self,
        tool: &str,
        key: &str,
        description: Option<&str>,
    ) -> Result<ApprovalSource> {
        if self.approval_cache.get(key).is_some_and(|grant| grant.granted) {
            debug!(tool = %tool, key = %key, "Using cached approval");
            return Ok(ApprovalSource::Cache);
        }

        let policy = self.config.approval_policy;
        let prompter = match &self.prompter {
            Some(prompter) if policy.allows_prompt() => prompter,
            _ => {
                return Err(OrchestratorError::ApprovalRequired {
                    tool: tool.to_string(),
                    key: key.to_string(),
                    policy,
                })
            }
        };

        let context = ApprovalContext {
            tool: tool.to_string(),
            key: key.to_string(),
            description: description.map(str::to_string),
        };
        let mut grant = prompter.request_approval(&context).await;
        if !grant.granted {
            info!(tool = %tool, key = %key, "Approval denied");
            return Err(OrchestratorError::ApprovalDenied {
                tool: tool.to_string(),
                key: key.to_string(),
            });
        }

        grant.timestamp.get_or_insert_with(Utc::now);
        self.approval_cache.set(key, grant);
        info!(tool = %tool, key = %key, "Approval granted and cached");
        Ok(ApprovalSource::Prompt)
    }

    /// Publish `tool.completed` for a settled record.
    pub fn publish_completed(&self, record: &ToolRunRecord) {
        if let Some(bus) = &self.event_bus {
            bus.publish(Event::ToolCompleted {
                invocation_id: record.id.clone(),
                tool: record.tool.clone(),
                status: record.status,
                attempt_count: record.attempt_count,
            });
        }
    }
}

impl Default for ToolOrchestrator {
    fn default() -> Self {
        Self::new(OrchestratorConfig::default())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::approval::ApprovalGrant;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Records requested delays without waiting.
    #[derive(Default)]
    pub(crate) struct RecordingSleeper {
        pub delays: Mutex<Vec<Duration>>,
    }

    #[async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, duration: Duration) {
            self.delays.lock().unwrap().push(duration);
        }
    }

    struct CountingPrompter {
        calls: AtomicU32,
        grant: bool,
    }

    impl CountingPrompter {
        fn new(grant: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                grant,
            })
        }
    }

    #[async_trait]
    impl ApprovalPrompter for CountingPrompter {
        async fn request_approval(&self, _context: &ApprovalContext) -> ApprovalGrant {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.grant {
                ApprovalGrant::granted()
            } else {
                ApprovalGrant::denied("no")
            }
        }
    }

    fn orchestrator(sleeper: Arc<RecordingSleeper>) -> ToolOrchestrator {
        ToolOrchestrator::default().with_sleeper(sleeper)
    }

    #[test]
    fn test_backoff_delay() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.backoff_delay(1), Duration::from_millis(250));
        assert_eq!(config.backoff_delay(2), Duration::from_millis(500));
        assert_eq!(config.backoff_delay(3), Duration::from_millis(1000));
        assert_eq!(config.backoff_delay(40), Duration::from_millis(30_000));
    }

    #[tokio::test]
    async fn test_success_first_attempt() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let result = orchestrator(sleeper.clone())
            .invoke(ToolInvocation::new("inv-1", "exec", |_ctx| async {
                Ok::<_, ToolError>(42)
            }))
            .await
            .unwrap();

        assert_eq!(result.output, 42);
        assert_eq!(result.record.attempt_count, 1);
        assert_eq!(result.record.retry_count, 0);
        assert_eq!(result.record.approval_source, ApprovalSource::NotRequired);
        assert_eq!(result.record.sandbox_state, SandboxState::Sandboxed);
        assert!(result.record.is_succeeded());
        assert!(sleeper.delays.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retry_accounting() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let hook_attempts = Arc::new(Mutex::new(Vec::new()));
        let seen = hook_attempts.clone();

        let invocation = ToolInvocation::new("inv-2", "exec", |ctx: ToolAttemptContext| async move {
            if ctx.attempt < 3 {
                Err(ToolError::sandbox_retryable(
                    "sandbox denied",
                    Some(SandboxState::Escalated),
                ))
            } else {
                Ok(ctx.sandbox_state)
            }
        })
        .with_sandbox(SandboxOptions::default().on_retry(move |ctx| {
            seen.lock().unwrap().push(ctx.attempt);
        }));

        let result = orchestrator(sleeper.clone()).invoke(invocation).await.unwrap();

        assert_eq!(result.output, SandboxState::Escalated);
        assert_eq!(result.record.retry_count, 2);
        assert_eq!(result.record.attempt_count, 3);
        assert_eq!(result.record.sandbox_state, SandboxState::Escalated);
        assert_eq!(
            *sleeper.delays.lock().unwrap(),
            vec![Duration::from_millis(250), Duration::from_millis(500)]
        );
        assert_eq!(*hook_attempts.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_attempts_exhausted() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let invocation = ToolInvocation::new("inv-3", "exec", |_ctx| async {
            Err::<(), _>(ToolError::sandbox_retryable("denied", None))
        });

        let error = orchestrator(sleeper.clone())
            .invoke(invocation)
            .await
            .unwrap_err();

        let record = error.record().unwrap();
        assert_eq!(record.status, ToolRunStatus::Failed);
        assert_eq!(record.attempt_count, 3);
        assert_eq!(record.retry_count, 2);
        assert!(matches!(
            error.tool_cause(),
            Some(ToolError::SandboxRetryable { .. })
        ));
        assert_eq!(sleeper.delays.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_error_stops_immediately() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let invocation = ToolInvocation::new("inv-4", "exec", move |_ctx| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(ToolError::failed("boom")) }
        });

        let error = orchestrator(sleeper.clone())
            .invoke(invocation)
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(error.record().unwrap().attempt_count, 1);
        assert_eq!(error.record().unwrap().retry_count, 0);
        assert!(error.to_string().contains("boom"));
        assert!(sleeper.delays.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_classifier_overrides_default() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let invocation = ToolInvocation::new("inv-5", "exec", |ctx: ToolAttemptContext| async move {
            if ctx.attempt == 1 {
                Err(ToolError::failed("EPERM"))
            } else {
                Ok(())
            }
        })
        .with_sandbox(SandboxOptions::default().with_classifier(|error| match error {
            ToolError::Failed(message) if message == "EPERM" => Some(SandboxRetryDecision {
                retry: true,
                next_state: Some(SandboxState::Escalated),
            }),
            _ => None,
        }));

        let result = orchestrator(sleeper).invoke(invocation).await.unwrap();
        assert_eq!(result.record.attempt_count, 2);
        assert_eq!(result.record.sandbox_state, SandboxState::Escalated);
    }

    #[tokio::test]
    async fn test_approval_cached_after_prompt() {
        let prompter = CountingPrompter::new(true);
        let orchestrator = ToolOrchestrator::default().with_prompter(prompter.clone());

        let first = orchestrator
            .invoke(
                ToolInvocation::new("inv-a", "exec", |_ctx| async { Ok::<_, ToolError>(()) })
                    .require_approval("exec:ls"),
            )
            .await
            .unwrap();
        let second = orchestrator
            .invoke(
                ToolInvocation::new("inv-b", "exec", |_ctx| async { Ok::<_, ToolError>(()) })
                    .require_approval("exec:ls"),
            )
            .await
            .unwrap();

        assert_eq!(prompter.calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.record.approval_source, ApprovalSource::Prompt);
        assert_eq!(second.record.approval_source, ApprovalSource::Cache);
        let grant = orchestrator.approval_cache().get("exec:ls").unwrap();
        assert!(grant.timestamp.is_some());
    }

    #[tokio::test]
    async fn test_never_policy_does_not_prompt() {
        let prompter = CountingPrompter::new(true);
        let orchestrator = ToolOrchestrator::new(OrchestratorConfig {
            approval_policy: ApprovalPolicy::Never,
            ..Default::default()
        })
        .with_prompter(prompter.clone());

        let ran = Arc::new(AtomicU32::new(0));
        let counter = ran.clone();
        let error = orchestrator
            .invoke(
                ToolInvocation::new("inv-c", "exec", move |_ctx| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Ok::<_, ToolError>(()) }
                })
                .require_approval("exec:rm"),
            )
            .await
            .unwrap_err();

        assert!(matches!(error, OrchestratorError::ApprovalRequired { .. }));
        assert_eq!(prompter.calls.load(Ordering::SeqCst), 0);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_never_policy_uses_cached_grant() {
        let orchestrator = ToolOrchestrator::new(OrchestratorConfig {
            approval_policy: ApprovalPolicy::Never,
            ..Default::default()
        });
        orchestrator
            .approval_cache()
            .set("exec:ls", ApprovalGrant::granted());

        let result = orchestrator
            .invoke(
                ToolInvocation::new("inv-d", "exec", |_ctx| async { Ok::<_, ToolError>(()) })
                    .require_approval("exec:ls"),
            )
            .await
            .unwrap();
        assert_eq!(result.record.approval_source, ApprovalSource::Cache);
    }

    #[tokio::test]
    async fn test_denied_approval() {
        let prompter = CountingPrompter::new(false);
        let orchestrator = ToolOrchestrator::default().with_prompter(prompter.clone());

        let error = orchestrator
            .invoke(
                ToolInvocation::new("inv-e", "exec", |_ctx| async { Ok::<_, ToolError>(()) })
                    .require_approval("exec:rm"),
            )
            .await
            .unwrap_err();

        assert!(matches!(error, OrchestratorError::ApprovalDenied { .. }));
        assert!(error.record().is_none());
        assert!(orchestrator.approval_cache().get("exec:rm").is_none());
    }

    #[tokio::test]
    async fn test_missing_prompter_requires_approval() {
        let error = ToolOrchestrator::default()
            .invoke(
                ToolInvocation::new("inv-f", "exec", |_ctx| async { Ok::<_, ToolError>(()) })
                    .require_approval("exec:ls"),
            )
            .await
            .unwrap_err();
        assert!(matches!(error, OrchestratorError::ApprovalRequired { .. }));
    }

    #[tokio::test]
    async fn test_invalid_invocation() {
        let mut invocation =
            ToolInvocation::new("inv-g", "exec", |_ctx| async { Ok::<_, ToolError>(()) });
        invocation.approval_required = true;

        let error = ToolOrchestrator::default()
            .invoke(invocation)
            .await
            .unwrap_err();
        assert!(matches!(error, OrchestratorError::InvalidInvocation(_)));

        let error = ToolOrchestrator::default()
            .invoke(ToolInvocation::new("", "exec", |_ctx| async {
                Ok::<_, ToolError>(())
            }))
            .await
            .unwrap_err();
        assert!(matches!(error, OrchestratorError::InvalidInvocation(_)));
    }

    #[tokio::test]
    async fn test_publishes_completion() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        ToolOrchestrator::default()
            .with_event_bus(bus)
            .invoke(ToolInvocation::new("inv-h", "exec", |_ctx| async {
                Ok::<_, ToolError>(())
            }))
            .await
            .unwrap();

        let envelope = rx.recv().await.unwrap();
        match envelope.event {
            Event::ToolCompleted {
                invocation_id,
                status,
                ..
            } => {
                assert_eq!(invocation_id, "inv-h");
                assert_eq!(status, ToolRunStatus::Succeeded);
            }
            other => panic!("Unexpected event: {other:?}"),
        }
    }
}
