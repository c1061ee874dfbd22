//! Event types for the runtime event system

use chrono::{DateTime, Utc};
use runtime_core::{ExecEvent, ToolRunStatus};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Envelope wrapping all events with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
pub struct EventEnvelope {
    /// Unique event ID
    pub id: Uuid,
    /// Bus-wide publish order, starting at 1
    pub sequence: u64,
    /// When the event was published
    pub timestamp: DateTime<Utc>,
    /// The actual event
    pub event: Event,
}

impl EventEnvelope {
    /// Create an envelope with auto-generated ID and timestamp
    pub fn new(sequence: u64, event: Event) -> Self {
        Self {
            id: Uuid::new_v4(),
            sequence,
            timestamp: Utc::now(),
            event,
        }
    }
}

/// All lifecycle notifications published by the runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A session was created by the session factory
    #[serde(rename = "session.created")]
    SessionCreated { session_id: String, persisted: bool },

    /// A session's resource was torn down
    #[serde(rename = "session.disposed")]
    SessionDisposed {
        session_id: String,
        persisted: bool,
        /// Set when the handle failed to dispose cleanly
        error: Option<String>,
    },

    /// An exec runner event, republished as emitted
    #[serde(rename = "exec.event")]
    Exec { event: ExecEvent },

    /// A tool invocation reached a terminal state
    #[serde(rename = "tool.completed")]
    ToolCompleted {
        invocation_id: String,
        tool: String,
        status: ToolRunStatus,
        attempt_count: u32,
    },
}

impl Event {
    /// Wire name of the event type
    pub fn kind(&self) -> &'static str {
        match self {
            Event::SessionCreated { .. } => "session.created",
            Event::SessionDisposed { .. } => "session.disposed",
            Event::Exec { .. } => "exec.event",
            Event::ToolCompleted { .. } => "tool.completed",
        }
    }

    /// Get the session ID associated with this event, if any
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Event::SessionCreated { session_id, .. } => Some(session_id),
            Event::SessionDisposed { session_id, .. } => Some(session_id),
            Event::Exec { event } => match &event.payload {
                runtime_core::ExecEventPayload::Begin(begin) => Some(&begin.session_id),
                runtime_core::ExecEventPayload::End(end) => Some(&end.session_id),
                _ => None,
            },
            Event::ToolCompleted { .. } => None,
        }
    }
}
