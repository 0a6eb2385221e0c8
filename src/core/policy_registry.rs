//! Named rate-limit templates shared across the fleet.
use std::{collections::BTreeMap, sync::Arc, time::Duration};

use arc_swap::ArcSwap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    core::{
        rate_limiter::{BucketPolicy, RateLimitError},
        sync::{SharedDocument, SyncSettings, Versioned, spawn_follower},
    },
    ports::coordination_store::CoordinationStore,
};

const POLICIES_DOCUMENT: &str = "rate-limits";

pub type PolicyMap = BTreeMap<String, BucketPolicy>;

/// Hot-reloadable map of policy name to [`BucketPolicy`].
pub struct PolicyRegistry {
    current: ArcSwap<Versioned<PolicyMap>>,
    document: Arc<SharedDocument<PolicyMap>>,
}

impl PolicyRegistry {
    /// `initial` serves lookups until the shared document is loaded.
    pub fn new(store: Arc<dyn CoordinationStore>, op_timeout: Duration, initial: PolicyMap) -> Self {
        Self {
            current: ArcSwap::from_pointee(Versioned {
                version: 0,
                data: initial,
            }),
            document: Arc::new(SharedDocument::new(store, POLICIES_DOCUMENT, op_timeout)),
        }
    }

    pub fn get(&self, name: &str) -> Option<BucketPolicy> {
        self.current.load().data.get(name).cloned()
    }

    pub fn list(&self) -> PolicyMap {
        self.current.load().data.clone()
    }

    pub fn version(&self) -> u64 {
        self.current.load().version
    }

    /// Create or replace a template.
    pub async fn put(&self, name: &str, policy: BucketPolicy) -> Result<(), RateLimitError> {
        if name.trim().is_empty() {
            return Err(RateLimitError::InvalidRequest("policy name must not be empty".into()));
        }
        policy.validate()?;
        let doc = self
            .document
            .update(|policies| {
                policies.insert(name.to_string(), policy.clone());
                Ok::<_, RateLimitError>(())
            })
            .await?;
        tracing::info!(policy = %name, "Rate limit policy stored");
        self.install(doc);
        Ok(())
    }

    /// Remove a template. Returns `false` when no such template existed.
    pub async fn remove(&self, name: &str) -> Result<bool, RateLimitError> {
        let mut removed = false;
        let doc = self
            .document
            .update(|policies| {
                removed = policies.remove(name).is_some();
                Ok::<_, RateLimitError>(())
            })
            .await?;
        self.install(doc);
        Ok(removed)
    }

    pub async fn seed_if_empty(&self, policies: PolicyMap) -> Result<bool, RateLimitError> {
        for policy in policies.values() {
            policy.validate()?;
        }
        Ok(self.document.seed_if_absent(policies).await?)
    }

    pub fn start_sync(self: &Arc<Self>, settings: SyncSettings, cancel: CancellationToken) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        spawn_follower(self.document.clone(), settings, cancel, move |doc| {
            registry.install(doc)
        })
    }

    fn install(&self, doc: Versioned<PolicyMap>) {
        let version = doc.version;
        let candidate = Arc::new(doc);
        let previous = self.current.rcu(|current| {
            if current.version >= version {
                Arc::clone(current)
            } else {
                Arc::clone(&candidate)
            }
        });
        if previous.version < version {
            tracing::info!(version, policies = candidate.data.len(), "Rate limit policies installed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory_store::MemoryCoordinationStore;

    #[tokio::test]
    async fn test_put_get_remove() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryCoordinationStore::new());
        let registry = PolicyRegistry::new(store, Duration::from_secs(1), PolicyMap::new());

        registry.put("burst", BucketPolicy::per_second(5)).await.unwrap();
        assert_eq!(registry.get("burst"), Some(BucketPolicy::per_second(5)));
        assert_eq!(registry.version(), 1);

        assert!(registry.remove("burst").await.unwrap());
        assert!(!registry.remove("burst").await.unwrap());
        assert!(registry.get("burst").is_none());
    }

    #[tokio::test]
    async fn test_invalid_policy_rejected() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryCoordinationStore::new());
        let registry = PolicyRegistry::new(store, Duration::from_secs(1), PolicyMap::new());
        assert!(matches!(
            registry.put("zero", BucketPolicy::per_second(0)).await,
            Err(RateLimitError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_initial_map_served_until_sync() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryCoordinationStore::new());
        let initial = PolicyMap::from([("local".to_string(), BucketPolicy::per_minute(10))]);
        let registry = Arc::new(PolicyRegistry::new(store.clone(), Duration::from_secs(1), initial.clone()));
        assert!(registry.get("local").is_some());

        let other = PolicyRegistry::new(store, Duration::from_secs(1), PolicyMap::new());
        assert!(other.seed_if_empty(initial).await.unwrap());

        let cancel = CancellationToken::new();
        let _sync = registry.start_sync(SyncSettings::default(), cancel.clone());
        for _ in 0..50 {
            if registry.version() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(registry.version(), 1);
        cancel.cancel();
    }
}
