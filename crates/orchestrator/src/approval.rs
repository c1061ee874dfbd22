//! Approval grants, the cache they live in, and the prompter contract.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A yes/no decision for one approval key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalGrant {
    pub granted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl ApprovalGrant {
    pub fn granted() -> Self {
        Self {
            granted: true,
            reason: None,
            timestamp: None,
        }
    }

    pub fn denied(reason: impl Into<String>) -> Self {
        Self {
            granted: false,
            reason: Some(reason.into()),
            timestamp: None,
        }
    }
}

/// What the prompter is told about the invocation awaiting approval.
#[derive(Debug, Clone)]
pub struct ApprovalContext {
    pub tool: String,
    pub key: String,
    pub description: Option<String>,
}

/// Keyed store of approval grants, shared across invocations.
pub trait ApprovalCache: Send + Sync {
    fn get(&self, key: &str) -> Option<ApprovalGrant>;
    fn set(&self, key: &str, grant: ApprovalGrant);
}

/// Process-lifetime approval cache. Grants never expire.
#[derive(Debug, Default)]
pub struct InMemoryApprovalCache {
    grants: RwLock<HashMap<String, ApprovalGrant>>,
}

impl InMemoryApprovalCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, ApprovalGrant>> {
        self.grants.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, ApprovalGrant>> {
        self.grants.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ApprovalCache for InMemoryApprovalCache {
    fn get(&self, key: &str) -> Option<ApprovalGrant> {
        self.read().get(key).cloned()
    }

    fn set(&self, key: &str, grant: ApprovalGrant) {
        self.write().insert(key.to_string(), grant);
    }
}

/// Asks someone (a user, a policy service) whether an invocation may run.
#[async_trait]
pub trait ApprovalPrompter: Send + Sync {
    async fn request_approval(&self, context: &ApprovalContext) -> ApprovalGrant;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_get_set() {
        let cache = InMemoryApprovalCache::new();
        assert!(cache.is_empty());
        assert!(cache.get("exec:ls").is_none());

        cache.set("exec:ls", ApprovalGrant::granted());
        assert_eq!(cache.len(), 1);
        assert!(cache.get("exec:ls").unwrap().granted);
    }

    #[test]
    fn test_cache_overwrites_grant() {
        let cache = InMemoryApprovalCache::new();
        cache.set("exec:rm", ApprovalGrant::denied("too risky"));
        cache.set("exec:rm", ApprovalGrant::granted());

        let grant = cache.get("exec:rm").unwrap();
        assert!(grant.granted);
        assert!(grant.reason.is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_cache_survives_poisoned_lock() {
        let cache = std::sync::Arc::new(InMemoryApprovalCache::new());
        cache.set("exec:ls", ApprovalGrant::granted());

        let holder = std::sync::Arc::clone(&cache);
        let _ = std::thread::spawn(move || {
            let _grants = holder.grants.write().unwrap();
            panic!("writer failed while holding the lock");
        })
        .join();
        assert!(cache.grants.is_poisoned());

        assert!(cache.get("exec:ls").unwrap().granted);
        cache.set("exec:rm", ApprovalGrant::granted());
        assert!(cache.get("exec:rm").is_some());
        assert_eq!(cache.len(), 2);
    }
}
