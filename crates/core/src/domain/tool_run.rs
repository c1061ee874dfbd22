use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::exec_event::ExecEvent;
use crate::error::CoreError;

/// Isolation level a tool invocation ran under.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, Hash)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    #[default]
    Sandboxed,
    Escalated,
    Failed,
}

impl SandboxState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sandboxed => "sandboxed",
            Self::Escalated => "escalated",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sandboxed" => Some(Self::Sandboxed),
            "escalated" => Some(Self::Escalated),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
#[serde(rename_all = "snake_case")]
pub enum ToolRunStatus {
    Succeeded,
    Failed,
}

impl ToolRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

/// Where the approval used by an invocation came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalSource {
    NotRequired,
    Cache,
    Prompt,
}

impl ApprovalSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotRequired => "not-required",
            Self::Cache => "cache",
            Self::Prompt => "prompt",
        }
    }
}

/// Whether the orchestrator may prompt for approvals it has not cached.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalPolicy {
    /// Never prompt; uncached approvals fail with `ApprovalRequired`.
    Never,
    #[default]
    OnRequest,
    Auto,
}

impl ApprovalPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Never => "never",
            Self::OnRequest => "on-request",
            Self::Auto => "auto",
        }
    }

    pub fn allows_prompt(&self) -> bool {
        !matches!(self, Self::Never)
    }
}

impl fmt::Display for ApprovalPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApprovalPolicy {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "never" => Ok(Self::Never),
            "on-request" => Ok(Self::OnRequest),
            "auto" => Ok(Self::Auto),
            other => Err(CoreError::unknown("approval policy", other)),
        }
    }
}

/// Exec-specific details attached to a tool-run record by the exec runner.
///
/// Deliberately excludes the session environment snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
pub struct ExecRecordMetadata {
    pub command: String,
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    pub session_id: String,
    pub persisted: bool,
    pub correlation_id: String,
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
}

/// One logical tool call, across all of its attempts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
pub struct ToolRunRecord {
    pub id: String,
    pub tool: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub approval_source: ApprovalSource,
    /// Always `attempt_count - 1`.
    pub retry_count: u32,
    pub attempt_count: u32,
    pub sandbox_state: SandboxState,
    pub status: ToolRunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[cfg_attr(feature = "typescript", ts(type = "Record<string, unknown> | null"))]
    pub metadata: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exec: Option<ExecRecordMetadata>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<ExecEvent>,
}

impl ToolRunRecord {
    pub fn is_succeeded(&self) -> bool {
        self.status == ToolRunStatus::Succeeded
    }
}
