//! Lifecycle event bus for the execution runtime
//!
//! This crate provides the process-local bus that session, invocation
//! and exec lifecycle notifications are published on for observability.

mod bus;
mod types;

pub use bus::EventBus;
pub use types::*;
