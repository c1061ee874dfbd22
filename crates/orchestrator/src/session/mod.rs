//! Reusable exec sessions.

mod lease;
mod manager;

pub use lease::SessionLease;
pub use manager::{
    AcquireOptions, EnvOverrides, EnvSnapshot, ExecSessionManager, SessionCreateContext,
    SessionFactory, SessionHandle,
};
