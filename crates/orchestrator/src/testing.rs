//! In-memory session doubles shared by unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::{OrchestratorError, Result};
use crate::session::{EnvSnapshot, SessionCreateContext, SessionFactory, SessionHandle};

pub(crate) fn base_env() -> EnvSnapshot {
    EnvSnapshot::from([
        ("PATH".to_string(), "/usr/bin".to_string()),
        ("HOME".to_string(), "/root".to_string()),
    ])
}

pub(crate) struct MemoryHandle {
    id: String,
    disposed: AtomicBool,
    fail_dispose: bool,
}

impl MemoryHandle {
    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionHandle for MemoryHandle {
    async fn dispose(&self) -> Result<()> {
        self.disposed.store(true, Ordering::SeqCst);
        if self.fail_dispose {
            return Err(OrchestratorError::SessionDispose {
                id: self.id.clone(),
                reason: "handle already gone".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct MemoryFactory {
    created: AtomicUsize,
    last_env: Mutex<EnvSnapshot>,
    fail_create: bool,
    fail_dispose: bool,
}

impl MemoryFactory {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn failing_dispose() -> Arc<Self> {
        Arc::new(Self {
            fail_dispose: true,
            ..Default::default()
        })
    }

    pub(crate) fn failing_create() -> Arc<Self> {
        Arc::new(Self {
            fail_create: true,
            ..Default::default()
        })
    }

    pub(crate) fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub(crate) fn last_env(&self) -> EnvSnapshot {
        self.last_env.lock().unwrap().clone()
    }
}

#[async_trait]
impl SessionFactory for MemoryFactory {
    type Handle = MemoryHandle;

    async fn create(&self, context: &SessionCreateContext) -> Result<MemoryHandle> {
        if self.fail_create {
            return Err(OrchestratorError::SessionFactory {
                id: context.id.clone(),
                reason: "no shells left".to_string(),
            });
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        *self.last_env.lock().unwrap() = context.env.clone();
        Ok(MemoryHandle {
            id: context.id.clone(),
            disposed: AtomicBool::new(false),
            fail_dispose: self.fail_dispose,
        })
    }
}
