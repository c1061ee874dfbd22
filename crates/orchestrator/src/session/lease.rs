//! Leases handed out by the session manager.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use events::EventBus;
use tracing::{debug, warn};

use super::manager::{EnvSnapshot, ManagedSession, SessionHandle};
use crate::error::Result;

/// Borrowed use of one session.
///
/// Call [`release`](Self::release) when done. A non-persisted lease that is
/// dropped without being released schedules disposal of its session on the
/// current tokio runtime instead.
pub struct SessionLease<H: SessionHandle> {
    session: Arc<ManagedSession<H>>,
    env_snapshot: EnvSnapshot,
    last_used_at: DateTime<Utc>,
    persisted: bool,
    reused: bool,
    event_bus: Option<EventBus>,
    released: bool,
}

impl<H: SessionHandle> SessionLease<H> {
    pub(crate) fn new(
        session: Arc<ManagedSession<H>>,
        reused: bool,
        persisted: bool,
        event_bus: Option<EventBus>,
    ) -> Self {
        Self {
            env_snapshot: session.env_snapshot(),
            last_used_at: session.last_used_at(),
            session,
            persisted,
            reused,
            event_bus,
            released: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.session.id
    }

    pub fn handle(&self) -> &Arc<H> {
        &self.session.handle
    }

    /// Environment captured when the lease was taken.
    pub fn env_snapshot(&self) -> &EnvSnapshot {
        &self.env_snapshot
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.session.created_at
    }

    pub fn last_used_at(&self) -> DateTime<Utc> {
        self.last_used_at
    }

    pub fn is_persisted(&self) -> bool {
        self.persisted
    }

    pub fn is_reused(&self) -> bool {
        self.reused
    }

    /// Give the session back. Non-persisted sessions are disposed;
    /// persisted ones stay registered and only have their use time refreshed.
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        if self.persisted {
            self.session.touch();
            debug!(session_id = %self.session.id, "Persisted lease released");
            Ok(())
        } else {
            self.session.teardown(self.event_bus.as_ref()).await
        }
    }
}

impl<H: SessionHandle> Drop for SessionLease<H> {
    fn drop(&mut self) {
        if self.released || self.persisted {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                session_id = %self.session.id,
                "Lease dropped outside a runtime, session not disposed"
            );
            return;
        };

        debug!(session_id = %self.session.id, "Spawning session cleanup task");
        let session = Arc::clone(&self.session);
        let event_bus = self.event_bus.take();
        runtime.spawn(async move {
            // Failures are already logged by teardown
            let _ = session.teardown(event_bus.as_ref()).await;
        });
    }
}

impl<H: SessionHandle> std::fmt::Debug for SessionLease<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLease")
            .field("id", &self.session.id)
            .field("persisted", &self.persisted)
            .field("reused", &self.reused)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{AcquireOptions, ExecSessionManager};
    use crate::testing::{base_env, MemoryFactory};

    #[tokio::test]
    async fn test_dropped_ephemeral_lease_is_disposed() {
        let factory = MemoryFactory::new();
        let manager = ExecSessionManager::new(factory.clone()).with_base_env(base_env());

        let lease = manager.acquire(AcquireOptions::ephemeral()).await.unwrap();
        let handle = lease.handle().clone();
        drop(lease);

        for _ in 0..10 {
            if handle.is_disposed() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(handle.is_disposed());
    }

    #[tokio::test]
    async fn test_dropped_persisted_lease_is_kept() {
        let factory = MemoryFactory::new();
        let manager = ExecSessionManager::new(factory.clone()).with_base_env(base_env());

        let lease = manager.acquire(AcquireOptions::named("shell")).await.unwrap();
        let handle = lease.handle().clone();
        drop(lease);
        tokio::task::yield_now().await;

        assert!(!handle.is_disposed());
        assert_eq!(manager.len(), 1);
    }
}
