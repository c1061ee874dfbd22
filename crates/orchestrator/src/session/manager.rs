use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use events::{Event, EventBus};
use futures::future::join_all;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::lease::SessionLease;
use crate::error::Result;

pub type EnvSnapshot = HashMap<String, String>;

/// Environment overrides for one acquire. A `None` value removes the key.
pub type EnvOverrides = HashMap<String, Option<String>>;

/// The external resource a session owns, e.g. a persistent shell.
#[async_trait]
pub trait SessionHandle: Send + Sync + 'static {
    async fn dispose(&self) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct SessionCreateContext {
    pub id: String,
    pub env: EnvSnapshot,
    pub persisted: bool,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait SessionFactory: Send + Sync {
    type Handle: SessionHandle;

    async fn create(&self, context: &SessionCreateContext) -> Result<Self::Handle>;
}

#[derive(Debug, Clone, Default)]
pub struct AcquireOptions {
    /// Reusable session id; omitted means a fresh ephemeral session
    pub id: Option<String>,
    /// Defaults to `true` when `id` is set
    pub reuse: Option<bool>,
    /// Defaults to `true` when `id` is set
    pub persist: Option<bool>,
    pub env: Option<EnvOverrides>,
}

impl AcquireOptions {
    pub fn ephemeral() -> Self {
        Self::default()
    }

    pub fn named(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Default::default()
        }
    }

    pub fn with_reuse(mut self, reuse: bool) -> Self {
        self.reuse = Some(reuse);
        self
    }

    pub fn with_persist(mut self, persist: bool) -> Self {
        self.persist = Some(persist);
        self
    }

    pub fn with_env(mut self, env: EnvOverrides) -> Self {
        self.env = Some(env);
        self
    }
}

struct SessionState {
    env_snapshot: EnvSnapshot,
    last_used_at: DateTime<Utc>,
}

/// A session as tracked by the manager, shared with its leases.
pub(crate) struct ManagedSession<H> {
    pub(crate) id: String,
    pub(crate) handle: Arc<H>,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) persisted: bool,
    state: Mutex<SessionState>,
}

impl<H: SessionHandle> ManagedSession<H> {
    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn touch(&self) -> DateTime<Utc> {
        let now = Utc::now();
        self.state().last_used_at = now;
        now
    }

    pub(crate) fn env_snapshot(&self) -> EnvSnapshot {
        self.state().env_snapshot.clone()
    }

    pub(crate) fn last_used_at(&self) -> DateTime<Utc> {
        self.state().last_used_at
    }

    fn replace_env(&self, env_snapshot: EnvSnapshot) {
        self.state().env_snapshot = env_snapshot;
    }

    /// Dispose the handle. The disposal notification is published even
    /// when the handle fails to dispose.
    pub(crate) async fn teardown(&self, event_bus: Option<&EventBus>) -> Result<()> {
        let result = self.handle.dispose().await;
        self.touch();

        let error = result.as_ref().err().map(|e| e.to_string());
        match &error {
            Some(error) => warn!(session_id = %self.id, error = %error, "Session failed to dispose"),
            None => info!(session_id = %self.id, persisted = self.persisted, "Session disposed"),
        }
        if let Some(bus) = event_bus {
            bus.publish(Event::SessionDisposed {
                session_id: self.id.clone(),
                persisted: self.persisted,
                error,
            });
        }
        result
    }
}

/// Keyed registry of reusable exec sessions.
///
/// Sessions are created lazily through the injected [`SessionFactory`].
/// Persisted sessions stay registered until [`dispose`](Self::dispose) or
/// [`dispose_all`](Self::dispose_all); ephemeral ones are torn down when
/// their lease is released.
pub struct ExecSessionManager<H: SessionHandle> {
    factory: Arc<dyn SessionFactory<Handle = H>>,
    base_env: EnvSnapshot,
    event_bus: Option<EventBus>,
    sessions: Mutex<HashMap<String, Arc<ManagedSession<H>>>>,
    /// Serializes lookup-then-create for persisted ids
    creation: tokio::sync::Mutex<()>,
}

impl<H: SessionHandle> ExecSessionManager<H> {
    /// Create a manager whose base environment is the current process env.
    pub fn new(factory: Arc<dyn SessionFactory<Handle = H>>) -> Self {
        Self {
            factory,
            base_env: std::env::vars().collect(),
            event_bus: None,
            sessions: Mutex::new(HashMap::new()),
            creation: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_base_env(mut self, base_env: EnvSnapshot) -> Self {
        self.base_env = base_env;
        self
    }

    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, Arc<ManagedSession<H>>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn acquire(&self, options: AcquireOptions) -> Result<SessionLease<H>> {
        let named = options.id.is_some();
        let reuse = options.reuse.unwrap_or(named);
        let persist = options.persist.unwrap_or(named);
        let id = options
            .id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let env_snapshot = self.snapshot_env(options.env.as_ref());

        let _creating = if persist {
            Some(self.creation.lock().await)
        } else {
            None
        };

        if persist && reuse {
            let existing = self.sessions().get(&id).cloned();
            if let Some(existing) = existing {
                existing.touch();
                if options.env.is_some() {
                    existing.replace_env(env_snapshot);
                }
                debug!(session_id = %id, "Reusing registered session");
                return Ok(SessionLease::new(existing, true, persist, self.event_bus.clone()));
            }
        }

        if persist && !reuse {
            self.dispose(&id).await?;
        }

        let managed = Arc::new(self.create_session(id, env_snapshot, persist).await?);
        if persist {
            self.sessions()
                .insert(managed.id.clone(), Arc::clone(&managed));
        }
        Ok(SessionLease::new(managed, false, persist, self.event_bus.clone()))
    }

    /// Unregister and tear down the session under `id`, if any.
    pub async fn dispose(&self, id: &str) -> Result<()> {
        let session = self.sessions().remove(id);
        match session {
            Some(session) => session.teardown(self.event_bus.as_ref()).await,
            None => Ok(()),
        }
    }

    /// Tear down every registered session. All are attempted; the first
    /// failure is returned.
    pub async fn dispose_all(&self) -> Result<()> {
        let sessions: Vec<_> = self.sessions().drain().map(|(_, s)| s).collect();
        let results = join_all(
            sessions
                .iter()
                .map(|session| session.teardown(self.event_bus.as_ref())),
        )
        .await;
        results.into_iter().collect()
    }

    /// Copy of a registered session's environment snapshot.
    pub fn get_snapshot(&self, id: &str) -> Option<EnvSnapshot> {
        self.sessions().get(id).map(|session| session.env_snapshot())
    }

    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn create_session(
        &self,
        id: String,
        env_snapshot: EnvSnapshot,
        persisted: bool,
    ) -> Result<ManagedSession<H>> {
        let created_at = Utc::now();
        let context = SessionCreateContext {
            id: id.clone(),
            env: env_snapshot.clone(),
            persisted,
            created_at,
        };
        let handle = self.factory.create(&context).await?;

        info!(session_id = %id, persisted = persisted, "Session created");
        if let Some(bus) = &self.event_bus {
            bus.publish(Event::SessionCreated {
                session_id: id.clone(),
                persisted,
            });
        }

        Ok(ManagedSession {
            id,
            handle: Arc::new(handle),
            created_at,
            persisted,
            state: Mutex::new(SessionState {
                env_snapshot,
                last_used_at: created_at,
            }),
        })
    }

    fn snapshot_env(&self, overrides: Option<&EnvOverrides>) -> EnvSnapshot {
        let mut snapshot = self.base_env.clone();
        for (key, value) in overrides.into_iter().flatten() {
            match value {
                Some(value) => {
                    snapshot.insert(key.clone(), value.clone());
                }
                None => {
                    snapshot.remove(key);
                }
            }
        }
        snapshot
    }
}
