//! Execution core: approval-gated retrying invocations, reusable sessions
//! and the exec runner that ties them together.

pub mod approval;
pub mod error;
pub mod exec;
pub mod invocation;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

pub use approval::{
    ApprovalCache, ApprovalContext, ApprovalGrant, ApprovalPrompter, InMemoryApprovalCache,
};
pub use error::{OrchestratorError, Result, ToolError, ToolInvocationFailure};
pub use exec::{
    CommandExecutor, ExecCommandRequest, ExecConfig, ExecEventListener, ExecOutcome, ExecRequest,
    ExecRunResult, ExecRunner, OutputSink, ProcessExecutor,
};
pub use invocation::{
    InvocationResult, OrchestratorConfig, RetryContext, SandboxOptions, SandboxRetryDecision,
    Sleeper, TokioSleeper, ToolAttemptContext, ToolInvocation, ToolOrchestrator,
};
pub use session::{
    AcquireOptions, EnvOverrides, EnvSnapshot, ExecSessionManager, SessionCreateContext,
    SessionFactory, SessionHandle, SessionLease,
};
