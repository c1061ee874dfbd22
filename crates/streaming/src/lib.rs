//! Multi-observer distribution of exec events.
//!
//! A [`HandleService`] issues one handle per correlation id, sequences every
//! event appended to it, runs the configured [`StreamFrameGuard`] over the
//! resulting frame and fans surviving frames out to independent observers,
//! each with its own bounded queue.

pub mod error;
pub mod forwarder;
pub mod frame;
pub mod guard;
pub mod observer;
pub mod service;

pub use error::{Result, StreamError};
pub use forwarder::HandleForwarder;
pub use frame::{HandleDescriptor, HandleStatus, StreamFrame};
pub use guard::{
    DecisionRecord, GuardAction, GuardContext, GuardDecision, GuardMode, GuardOutcome,
    PrivacyGuard, PrivacyGuardConfig, PrivacyMetrics, StreamFrameGuard,
};
pub use observer::{ObserverStats, SubscribeOptions};
pub use service::{FrameStream, HandleService, HandleServiceConfig, Subscription};
