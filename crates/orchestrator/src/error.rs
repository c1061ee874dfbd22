use runtime_core::{ApprovalPolicy, SandboxState, ToolRunRecord};
use thiserror::Error;

/// Failure reported by one attempt of a tool invocation.
#[derive(Debug, Error)]
pub enum ToolError {
    /// The sandbox refused the operation; the orchestrator may retry,
    /// optionally under a different sandbox state.
    #[error("{message}")]
    SandboxRetryable {
        message: String,
        next_state: Option<SandboxState>,
    },

    #[error("Failed to launch command: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("{0}")]
    Failed(String),
}

impl ToolError {
    /// Create a sandbox-retryable error.
    pub fn sandbox_retryable(message: impl Into<String>, next_state: Option<SandboxState>) -> Self {
        Self::SandboxRetryable {
            message: message.into(),
            next_state,
        }
    }

    /// Create a plain, non-retryable failure.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Terminal failure of an invocation, carrying everything that happened.
#[derive(Debug)]
pub struct ToolInvocationFailure {
    pub message: String,
    pub record: ToolRunRecord,
    pub cause: ToolError,
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Approval required for {tool} ({key}) but approval policy {policy} forbids prompting")]
    ApprovalRequired {
        tool: String,
        key: String,
        policy: ApprovalPolicy,
    },

    #[error("Approval denied for {tool} ({key})")]
    ApprovalDenied { tool: String, key: String },

    #[error("{}: {}", .0.message, .0.cause)]
    ToolInvocationFailed(Box<ToolInvocationFailure>),

    #[error("Invalid invocation: {0}")]
    InvalidInvocation(String),

    #[error("Session factory failed for {id}: {reason}")]
    SessionFactory { id: String, reason: String },

    #[error("Session {id} failed to dispose: {reason}")]
    SessionDispose { id: String, reason: String },
}

impl OrchestratorError {
    /// The invocation record, if the tool actually ran.
    pub fn record(&self) -> Option<&ToolRunRecord> {
        match self {
            Self::ToolInvocationFailed(failure) => Some(&failure.record),
            _ => None,
        }
    }

    /// The attempt error behind a terminal invocation failure.
    pub fn tool_cause(&self) -> Option<&ToolError> {
        match self {
            Self::ToolInvocationFailed(failure) => Some(&failure.cause),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = OrchestratorError::ApprovalRequired {
            tool: "exec".to_string(),
            key: "exec:rm".to_string(),
            policy: ApprovalPolicy::Never,
        };
        let message = error.to_string();
        assert!(message.contains("exec:rm"));
        assert!(message.contains("never"));
        assert!(error.record().is_none());
    }

    #[test]
    fn test_retryable_constructor() {
        let error = ToolError::sandbox_retryable("blocked", Some(SandboxState::Escalated));
        match error {
            ToolError::SandboxRetryable { next_state, .. } => {
                assert_eq!(next_state, Some(SandboxState::Escalated));
            }
            _ => panic!("Expected SandboxRetryable"),
        }
    }
}
