//! In-memory registry of delegated session-key authorizations.
//!
//! The Store holds the rows; this registry is a derived cache refreshed at
//! startup and written through on explicit registration. It is an explicit
//! collaborator handed to the admission controller, not process-global
//! state.

use std::collections::HashMap;

use tokio::sync::RwLock;
use tracing::debug;

use crate::error::StoreError;
use crate::store::Store;
use crate::types::{now_ts, SessionKeyPolicy};

#[derive(Default)]
pub struct SessionPolicyRegistry {
    policies: RwLock<HashMap<String, SessionKeyPolicy>>,
}

impl SessionPolicyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the cache with the Store's current policy set. Part of the
    /// engine startup sequence.
    pub async fn refresh(&self, store: &Store) -> Result<usize, StoreError> {
        let loaded = store.load_policies().await?;
        let mut map = HashMap::with_capacity(loaded.len());
        for policy in loaded {
            map.insert(policy.session_pubkey.clone(), policy);
        }
        let count = map.len();
        *self.policies.write().await = map;
        debug!(count, "session policy registry refreshed");
        Ok(count)
    }

    /// Persist a policy and publish it to the cache.
    pub async fn register(
        &self,
        store: &Store,
        policy: SessionKeyPolicy,
    ) -> Result<(), StoreError> {
        store.upsert_policy(&policy).await?;
        self.policies
            .write()
            .await
            .insert(policy.session_pubkey.clone(), policy);
        Ok(())
    }

    /// O(1) lookup. An expired policy is never returned.
    pub async fn lookup(&self, session_pubkey: &str) -> Option<SessionKeyPolicy> {
        let policies = self.policies.read().await;
        let policy = policies.get(session_pubkey)?;
        if policy.is_expired(now_ts()) {
            return None;
        }
        Some(policy.clone())
    }

    /// Cache-only insert, used by tests that bypass the Store.
    #[cfg(test)]
    pub async fn insert_unchecked(&self, policy: SessionKeyPolicy) {
        self.policies
            .write()
            .await
            .insert(policy.session_pubkey.clone(), policy);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IntentType;

    fn policy(session: &str, expires_at: i64) -> SessionKeyPolicy {
        SessionKeyPolicy {
            owner_pubkey: "alice".into(),
            session_pubkey: session.into(),
            max_volume_lamports: 1_000_000,
            expires_at,
            created_at: 0,
            allowed_actions: vec![IntentType::Trade],
        }
    }

    #[tokio::test]
    async fn lookup_hides_expired_policies() {
        let registry = SessionPolicyRegistry::new();
        registry.insert_unchecked(policy("live", now_ts() + 3_600)).await;
        registry.insert_unchecked(policy("stale", now_ts() - 1)).await;

        assert!(registry.lookup("live").await.is_some());
        assert!(registry.lookup("stale").await.is_none());
        assert!(registry.lookup("unknown").await.is_none());
    }

    #[tokio::test]
    async fn register_writes_through_and_refresh_reloads() {
        let store = Store::open_in_memory().await.unwrap();
        let registry = SessionPolicyRegistry::new();
        registry
            .register(&store, policy("s1", now_ts() + 3_600))
            .await
            .unwrap();
        assert!(registry.lookup("s1").await.is_some());

        // A second registry sees the policy only after a refresh.
        let other = SessionPolicyRegistry::new();
        assert!(other.lookup("s1").await.is_none());
        assert_eq!(other.refresh(&store).await.unwrap(), 1);
        assert!(other.lookup("s1").await.is_some());
    }
}
