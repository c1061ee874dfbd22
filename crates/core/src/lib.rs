//! Shared domain types for the execution runtime.
//!
//! Exec events, tool-run records and the small vocabulary types
//! (sandbox state, approval source/policy) that every other crate
//! in the workspace exchanges.

pub mod domain;
pub mod error;

pub use domain::*;
pub use error::{CoreError, Result};
