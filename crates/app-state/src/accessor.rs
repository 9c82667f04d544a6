//! Stale-while-revalidate reads for one resource
//!
//! A [`CachedDataAccessor`] pairs a [`RequestKey`] with an application-owned
//! [`Fetcher`]. Cached values are returned immediately; a background refresh
//! can be requested per call. Offline reads with nothing cached fail with
//! [`AccessError::OfflineUnavailable`] so the UI can say "not available
//! offline" instead of reporting a network error.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use storage::RequestKey;
use thiserror::Error;

use crate::sync::SyncOrchestrator;

/// Errors surfaced by accessor reads
#[derive(Debug, Error)]
pub enum AccessError {
    /// Offline and nothing usable is cached
    #[error("{resource} is not available offline")]
    OfflineUnavailable {
        /// Requested resource
        resource: String,
    },

    /// Online fetch failed and nothing usable is cached
    #[error("Failed to fetch {resource}: {message}")]
    Fetch {
        /// Requested resource
        resource: String,
        /// Fetcher error
        message: String,
    },
}

/// Result type for accessor operations
pub type Result<T> = std::result::Result<T, AccessError>;

/// Application-supplied loader for one resource
#[async_trait]
pub trait Fetcher<T: Send + 'static>: Send + Sync {
    /// Load the current representation from the origin
    async fn fetch(&self) -> anyhow::Result<T>;
}

/// Accessor configuration
#[derive(Debug, Clone)]
pub struct AccessorConfig {
    /// TTL for values written after a fetch
    pub default_ttl: Duration,
}

impl Default for AccessorConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(5 * 60),
        }
    }
}

impl AccessorConfig {
    /// Create a new configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the write-through TTL
    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }
}

/// Per-read options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccessOptions {
    /// Refresh in the background when serving from cache while online
    pub revalidate: bool,
    /// TTL for the refreshed value; the accessor default applies when `None`
    pub ttl: Option<Duration>,
}

impl AccessOptions {
    /// Create default options
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a background refresh on cache hits
    pub fn revalidate(mut self) -> Self {
        self.revalidate = true;
        self
    }

    /// Override the write-through TTL
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// Where a value came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSource {
    /// Served from the local cache
    Cache,
    /// Fetched from the origin during this call
    Network,
}

/// A value and its origin
#[derive(Debug, Clone, PartialEq)]
pub struct Access<T> {
    /// The value
    pub data: T,
    /// Where it came from
    pub source: DataSource,
}

/// Stale-while-revalidate reader for one resource
pub struct CachedDataAccessor<T: Send + 'static> {
    orchestrator: SyncOrchestrator,
    key: RequestKey,
    fetcher: Arc<dyn Fetcher<T>>,
    config: AccessorConfig,
    refreshing: Arc<AtomicBool>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Send + 'static> Clone for CachedDataAccessor<T> {
    fn clone(&self) -> Self {
        Self {
            orchestrator: self.orchestrator.clone(),
            key: self.key.clone(),
            fetcher: Arc::clone(&self.fetcher),
            config: self.config.clone(),
            refreshing: Arc::clone(&self.refreshing),
            _marker: PhantomData,
        }
    }
}

/// Clears the refresh flag when a background refresh ends
struct RefreshGuard(Arc<AtomicBool>);

impl Drop for RefreshGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<T> CachedDataAccessor<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Create an accessor for `key`
    pub fn new(
        orchestrator: SyncOrchestrator,
        key: RequestKey,
        fetcher: Arc<dyn Fetcher<T>>,
        config: AccessorConfig,
    ) -> Self {
        Self {
            orchestrator,
            key,
            fetcher,
            config,
            refreshing: Arc::new(AtomicBool::new(false)),
            _marker: PhantomData,
        }
    }

    /// Key this accessor reads and writes
    pub fn key(&self) -> &RequestKey {
        &self.key
    }

    /// Whether a background refresh is in flight
    pub fn is_refreshing(&self) -> bool {
        self.refreshing.load(Ordering::Acquire)
    }

    /// Read the resource
    ///
    /// A fresh cached value is returned as-is, and refreshed in the
    /// background when `options.revalidate` is set and the device is online.
    /// On a miss the origin is fetched while online.
    pub async fn get(&self, options: AccessOptions) -> Result<Access<T>> {
        if let Some(data) = self.orchestrator.read::<T>(&self.key).await {
            if options.revalidate && self.orchestrator.is_online() {
                self.spawn_refresh(options.ttl);
            }
            tracing::debug!(key = %self.key, "served from cache");
            return Ok(Access { data, source: DataSource::Cache });
        }

        if !self.orchestrator.is_online() {
            return Err(AccessError::OfflineUnavailable {
                resource: self.key.resource.clone(),
            });
        }

        let data = self.fetch_and_store(options.ttl).await?;
        Ok(Access { data, source: DataSource::Network })
    }

    /// Fetch from the origin now, bypassing the cache
    pub async fn refresh(&self) -> Result<T> {
        if !self.orchestrator.is_online() {
            return Err(AccessError::OfflineUnavailable {
                resource: self.key.resource.clone(),
            });
        }
        self.fetch_and_store(None).await
    }

    /// Drop the cached value
    pub async fn invalidate(&self) {
        self.orchestrator.invalidate(&self.key).await
    }

    async fn fetch_and_store(&self, ttl: Option<Duration>) -> Result<T> {
        let tenant_id = self.orchestrator.tenant().tenant_id;
        let data = self.fetcher.fetch().await.map_err(|e| AccessError::Fetch {
            resource: self.key.resource.clone(),
            message: format!("{:#}", e),
        })?;

        store_for_tenant(&self.orchestrator, &self.key, &data, self.ttl_or_default(ttl), &tenant_id)
            .await;
        Ok(data)
    }

    fn ttl_or_default(&self, ttl: Option<Duration>) -> Duration {
        ttl.unwrap_or(self.config.default_ttl)
    }

    fn spawn_refresh(&self, ttl: Option<Duration>) {
        if self
            .refreshing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let guard = RefreshGuard(Arc::clone(&self.refreshing));
        let orchestrator = self.orchestrator.clone();
        let key = self.key.clone();
        let fetcher = Arc::clone(&self.fetcher);
        let ttl = self.ttl_or_default(ttl);

        tokio::spawn(async move {
            let _guard = guard;
            let tenant_id = orchestrator.tenant().tenant_id;

            match fetcher.fetch().await {
                Ok(data) => {
                    store_for_tenant(&orchestrator, &key, &data, ttl, &tenant_id).await;
                    tracing::debug!(key = %key, "background refresh stored");
                }
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "background refresh failed");
                }
            }
        });
    }
}

/// Write through unless the active tenant changed during the fetch
async fn store_for_tenant<T: Serialize>(
    orchestrator: &SyncOrchestrator,
    key: &RequestKey,
    data: &T,
    ttl: Duration,
    tenant_id: &str,
) {
    if orchestrator.tenant().tenant_id != tenant_id {
        tracing::debug!(key = %key, tenant_id, "tenant changed during fetch, not caching");
        return;
    }
    orchestrator.cache().set(key, data, Some(ttl), tenant_id).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tenant::TenantContext;
    use crate::test_utils::{ScriptedSubmitter, StaticFetcher};
    use networking::{NetworkMonitor, NetworkState};
    use serde_json::{json, Value};
    use storage::{ManualClock, MemoryStore};

    async fn setup(
        online: bool,
        clock: ManualClock,
    ) -> (SyncOrchestrator, NetworkMonitor, Arc<StaticFetcher>, CachedDataAccessor<Value>) {
        let monitor = NetworkMonitor::new(NetworkState::from_online(online));
        let orchestrator = SyncOrchestrator::builder(
            Arc::new(MemoryStore::new()),
            monitor.clone(),
            ScriptedSubmitter::new(),
        )
        .clock(Arc::new(clock))
        .build(TenantContext::new("t1", "u1"))
        .await
        .unwrap();

        let fetcher = StaticFetcher::new(json!({"v": 1}));
        let accessor = CachedDataAccessor::new(
            orchestrator.clone(),
            RequestKey::new("/customers"),
            fetcher.clone(),
            AccessorConfig::new().default_ttl(Duration::from_secs(60)),
        );
        (orchestrator, monitor, fetcher, accessor)
    }

    async fn settle<T>(accessor: &CachedDataAccessor<T>, fetcher: &StaticFetcher, calls: usize)
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        for _ in 0..100 {
            if fetcher.call_count() >= calls && !accessor.is_refreshing() {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("background refresh did not finish");
    }

    #[tokio::test]
    async fn test_miss_fetches_and_writes_through() {
        let (orch, _monitor, fetcher, accessor) = setup(true, ManualClock::new(0)).await;

        let first = accessor.get(AccessOptions::new()).await.unwrap();
        assert_eq!(first.source, DataSource::Network);
        assert_eq!(first.data, json!({"v": 1}));

        let second = accessor.get(AccessOptions::new()).await.unwrap();
        assert_eq!(second.source, DataSource::Cache);
        assert_eq!(fetcher.call_count(), 1);
        assert_eq!(orch.read::<Value>(accessor.key()).await, Some(json!({"v": 1})));
    }

    #[tokio::test]
    async fn test_offline_miss_is_unavailable_offline() {
        let (_orch, _monitor, fetcher, accessor) = setup(false, ManualClock::new(0)).await;

        let err = accessor.get(AccessOptions::new()).await.unwrap_err();
        assert!(matches!(err, AccessError::OfflineUnavailable { ref resource } if resource == "/customers"));
        assert_eq!(fetcher.call_count(), 0);
    }

    #[tokio::test]
    async fn test_offline_hit_serves_cache() {
        let (orch, monitor, fetcher, accessor) = setup(true, ManualClock::new(0)).await;
        orch.write(accessor.key(), &json!({"v": 0}), None).await;
        monitor.report(false);

        let access = accessor.get(AccessOptions::new().revalidate()).await.unwrap();
        assert_eq!(access.data, json!({"v": 0}));
        assert_eq!(access.source, DataSource::Cache);
        assert_eq!(fetcher.call_count(), 0);
    }

    #[tokio::test]
    async fn test_online_fetch_failure_is_distinct() {
        let (_orch, _monitor, fetcher, accessor) = setup(true, ManualClock::new(0)).await;
        fetcher.set_failing(true);

        let err = accessor.get(AccessOptions::new()).await.unwrap_err();
        assert!(matches!(err, AccessError::Fetch { .. }));
    }

    #[tokio::test]
    async fn test_revalidate_refreshes_in_background() {
        let (orch, _monitor, fetcher, accessor) = setup(true, ManualClock::new(0)).await;
        orch.write(accessor.key(), &json!({"v": 0}), None).await;
        fetcher.set_value(json!({"v": 2}));

        let access = accessor.get(AccessOptions::new().revalidate()).await.unwrap();
        assert_eq!(access.data, json!({"v": 0}));

        settle(&accessor, &fetcher, 1).await;
        let next = accessor.get(AccessOptions::new()).await.unwrap();
        assert_eq!(next.data, json!({"v": 2}));
    }

    #[tokio::test]
    async fn test_single_background_refresh_in_flight() {
        let (orch, _monitor, fetcher, accessor) = setup(true, ManualClock::new(0)).await;
        orch.write(accessor.key(), &json!({"v": 0}), None).await;

        accessor.get(AccessOptions::new().revalidate()).await.unwrap();
        accessor.get(AccessOptions::new().revalidate()).await.unwrap();
        settle(&accessor, &fetcher, 1).await;

        assert_eq!(fetcher.call_count(), 1);
    }

    #[tokio::test]
    async fn test_refresh_uses_caller_ttl() {
        let clock = ManualClock::new(0);
        let (_orch, _monitor, fetcher, accessor) = setup(true, clock.clone()).await;

        accessor
            .get(AccessOptions::new().ttl(Duration::from_secs(1)))
            .await
            .unwrap();
        clock.advance(Duration::from_millis(1_500));

        let access = accessor.get(AccessOptions::new()).await.unwrap();
        assert_eq!(access.source, DataSource::Network);
        assert_eq!(fetcher.call_count(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_forces_fetch() {
        let (_orch, _monitor, fetcher, accessor) = setup(true, ManualClock::new(0)).await;

        accessor.get(AccessOptions::new()).await.unwrap();
        accessor.invalidate().await;
        accessor.get(AccessOptions::new()).await.unwrap();

        assert_eq!(fetcher.call_count(), 2);
    }

    #[tokio::test]
    async fn test_refresh_requires_network() {
        let (_orch, _monitor, _fetcher, accessor) = setup(false, ManualClock::new(0)).await;
        assert!(matches!(
            accessor.refresh().await,
            Err(AccessError::OfflineUnavailable { .. })
        ));
    }
}
