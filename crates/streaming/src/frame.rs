use chrono::{DateTime, Utc};
use runtime_core::ExecEvent;
use serde::{Deserialize, Serialize};

/// One sequenced, guard-processed event on a handle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
pub struct StreamFrame {
    pub sequence: u64,
    pub event: ExecEvent,
    pub timestamp: DateTime<Utc>,
}

impl StreamFrame {
    pub fn new(sequence: u64, event: ExecEvent) -> Self {
        Self {
            sequence,
            timestamp: event.timestamp,
            event,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
#[serde(rename_all = "snake_case")]
pub enum HandleStatus {
    Open,
    Closed,
}

impl HandleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
pub struct HandleDescriptor {
    pub id: String,
    pub correlation_id: String,
    pub created_at: DateTime<Utc>,
    /// Frames currently stored, not frames ever appended
    pub frame_count: usize,
    pub status: HandleStatus,
    /// Last assigned sequence, 0 before the first append
    pub latest_sequence: u64,
}
