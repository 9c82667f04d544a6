//! Tenant scoping
//!
//! Tracks which tenant was last active so a switch can be detected even
//! across restarts, and decides what happens to the previous tenant's
//! offline state when it is.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use storage::{PersistentStore, StoreError};

/// Key of the "last active tenant" marker
pub const LAST_TENANT_KEY: &str = "sync:last_tenant";

/// Who the application is currently acting for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantContext {
    /// Tenant (customer organization) id
    pub tenant_id: String,
    /// Signed-in user id
    pub user_id: String,
}

impl TenantContext {
    /// Create a tenant context
    pub fn new(tenant_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self { tenant_id: tenant_id.into(), user_id: user_id.into() }
    }
}

/// What to do with the previous tenant's offline queue on a switch
///
/// The previous tenant's cache is always cleared.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TenantSwitchPolicy {
    /// Keep queued mutations; they sync once that tenant is active again
    #[default]
    Retain,

    /// Drop queued mutations along with the cache
    Purge,
}

/// Persisted marker of the last active tenant
pub struct TenantTracker {
    store: Arc<dyn PersistentStore>,
}

impl TenantTracker {
    /// Create a tracker over the shared store
    pub fn new(store: Arc<dyn PersistentStore>) -> Self {
        Self { store }
    }

    /// Tenant recorded by the last [`observe`](Self::observe)
    pub async fn last_tenant(&self) -> Result<Option<String>, StoreError> {
        match self.store.get(LAST_TENANT_KEY).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Record `tenant_id` as active
    ///
    /// Returns the previously recorded tenant when it differs.
    pub async fn observe(&self, tenant_id: &str) -> Result<Option<String>, StoreError> {
        let previous = self.last_tenant().await?;
        if previous.as_deref() == Some(tenant_id) {
            return Ok(None);
        }

        self.store
            .set(LAST_TENANT_KEY, serde_json::to_string(tenant_id)?)
            .await?;
        Ok(previous)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage::MemoryStore;

    #[tokio::test]
    async fn test_first_observation_is_not_a_switch() {
        let tracker = TenantTracker::new(Arc::new(MemoryStore::new()));

        assert_eq!(tracker.observe("t1").await.unwrap(), None);
        assert_eq!(tracker.last_tenant().await.unwrap(), Some("t1".to_string()));
    }

    #[tokio::test]
    async fn test_switch_reports_previous_tenant() {
        let tracker = TenantTracker::new(Arc::new(MemoryStore::new()));

        tracker.observe("t1").await.unwrap();
        assert_eq!(tracker.observe("t1").await.unwrap(), None);
        assert_eq!(tracker.observe("t2").await.unwrap(), Some("t1".to_string()));
        assert_eq!(tracker.last_tenant().await.unwrap(), Some("t2".to_string()));
    }

    #[tokio::test]
    async fn test_marker_survives_new_tracker() {
        let store: Arc<dyn PersistentStore> = Arc::new(MemoryStore::new());

        TenantTracker::new(store.clone()).observe("t1").await.unwrap();
        let previous = TenantTracker::new(store).observe("t2").await.unwrap();

        assert_eq!(previous, Some("t1".to_string()));
    }

    #[test]
    fn test_default_policy_retains_queue() {
        assert_eq!(TenantSwitchPolicy::default(), TenantSwitchPolicy::Retain);
    }
}
