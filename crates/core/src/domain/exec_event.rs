use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::tool_run::{SandboxState, ToolRunStatus};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
#[serde(rename_all = "snake_case")]
pub enum StdioStream {
    Stdout,
    Stderr,
}

impl StdioStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// One point in a single command's timeline.
///
/// Serialized as `{correlation_id, attempt, timestamp, type, payload}` where
/// `type` is one of `exec:begin`, `exec:chunk`, `exec:retry`, `exec:end`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
pub struct ExecEvent {
    pub correlation_id: String,
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: ExecEventPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
#[serde(tag = "type", content = "payload")]
pub enum ExecEventPayload {
    #[serde(rename = "exec:begin")]
    Begin(ExecBegin),
    #[serde(rename = "exec:chunk")]
    Chunk(ExecChunk),
    #[serde(rename = "exec:retry")]
    Retry(ExecRetry),
    #[serde(rename = "exec:end")]
    End(ExecEnd),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
pub struct ExecBegin {
    pub command: String,
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    pub session_id: String,
    pub sandbox_state: SandboxState,
    pub persisted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
pub struct ExecChunk {
    pub stream: StdioStream,
    /// Per-run sequence shared by stdout and stderr, starting at 1.
    pub sequence: u64,
    /// Encoded length of `data` in bytes.
    pub bytes: usize,
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
pub struct ExecRetry {
    pub delay_ms: u64,
    pub sandbox_state: SandboxState,
    pub error_message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
pub struct ExecEnd {
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
    pub duration_ms: u64,
    pub stdout: String,
    pub stderr: String,
    pub sandbox_state: SandboxState,
    pub session_id: String,
    pub status: ToolRunStatus,
}

impl ExecEvent {
    /// Create an event stamped with the current time.
    pub fn new(correlation_id: impl Into<String>, attempt: u32, payload: ExecEventPayload) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            attempt,
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Wire name of the event type, e.g. `exec:chunk`.
    pub fn kind(&self) -> &'static str {
        match self.payload {
            ExecEventPayload::Begin(_) => "exec:begin",
            ExecEventPayload::Chunk(_) => "exec:chunk",
            ExecEventPayload::Retry(_) => "exec:retry",
            ExecEventPayload::End(_) => "exec:end",
        }
    }

    pub fn is_begin(&self) -> bool {
        matches!(self.payload, ExecEventPayload::Begin(_))
    }

    pub fn is_chunk(&self) -> bool {
        matches!(self.payload, ExecEventPayload::Chunk(_))
    }

    pub fn is_retry(&self) -> bool {
        matches!(self.payload, ExecEventPayload::Retry(_))
    }

    pub fn is_end(&self) -> bool {
        matches!(self.payload, ExecEventPayload::End(_))
    }

    pub fn as_chunk(&self) -> Option<&ExecChunk> {
        match &self.payload {
            ExecEventPayload::Chunk(chunk) => Some(chunk),
            _ => None,
        }
    }

    pub fn as_chunk_mut(&mut self) -> Option<&mut ExecChunk> {
        match &mut self.payload {
            ExecEventPayload::Chunk(chunk) => Some(chunk),
            _ => None,
        }
    }

    pub fn as_end(&self) -> Option<&ExecEnd> {
        match &self.payload {
            ExecEventPayload::End(end) => Some(end),
            _ => None,
        }
    }
}
