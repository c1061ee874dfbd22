//! Content guards applied to every frame before it is stored or delivered.

mod privacy;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::frame::StreamFrame;

pub use privacy::{GuardMode, PrivacyGuard, PrivacyGuardConfig, PrivacyMetrics};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
#[serde(rename_all = "snake_case")]
pub enum GuardAction {
    Allow,
    Redact,
    Block,
}

impl GuardAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Redact => "redact",
            Self::Block => "block",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
pub struct GuardDecision {
    pub action: GuardAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl GuardDecision {
    pub fn allow() -> Self {
        Self {
            action: GuardAction::Allow,
            rule: None,
            reason: None,
        }
    }
}

/// Guard verdict for one frame. `frame` is `None` when the frame is blocked.
#[derive(Debug, Clone)]
pub struct GuardOutcome {
    pub frame: Option<StreamFrame>,
    pub decision: GuardDecision,
}

impl GuardOutcome {
    pub fn allow(frame: StreamFrame) -> Self {
        Self {
            frame: Some(frame),
            decision: GuardDecision::allow(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GuardContext {
    pub handle_id: String,
}

/// Audit entry for one frame's classification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
pub struct DecisionRecord {
    pub handle_id: String,
    pub sequence: u64,
    pub action: GuardAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl DecisionRecord {
    pub fn new(handle_id: impl Into<String>, sequence: u64, decision: &GuardDecision) -> Self {
        Self {
            handle_id: handle_id.into(),
            sequence,
            action: decision.action,
            rule: decision.rule.clone(),
            reason: decision.reason.clone(),
            timestamp: Utc::now(),
        }
    }
}

/// Classifies and optionally transforms a single frame.
///
/// Implementations resolve to a decision rather than failing; a guard that
/// cannot inspect a frame should allow or block it explicitly.
#[async_trait]
pub trait StreamFrameGuard: Send + Sync {
    async fn process(&self, frame: StreamFrame, context: &GuardContext) -> GuardOutcome;
}
