//! Tenant-scoped response cache
//!
//! This module provides a read-through cache for idempotent read results with
//! per-entry TTLs, tenant isolation and a metadata index used for bulk
//! tenant-scoped eviction.
//!
//! The cache is a pure performance optimization. Every storage or
//! serialization fault is logged, counted and absorbed as a miss or no-op.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::clock::Clock;
use crate::store::{PersistentStore, StoreError};

/// Prefix shared by every key in the cache namespace
pub const CACHE_PREFIX: &str = "cache:";

/// Key of the metadata index entry
pub const INDEX_KEY: &str = "cache:__index";

/// Method used when a request key does not set one
pub const DEFAULT_METHOD: &str = "GET";

/// Faults absorbed by the cache
///
/// These never reach callers; they are logged and counted in [`CacheStats`].
#[derive(Debug, Error)]
pub enum CacheFault {
    /// Underlying store failed
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Stored payload could not be decoded
    #[error("Corrupt cache payload at {key}: {source}")]
    Corrupt {
        /// Storage key of the bad payload
        key: String,
        /// Decode error
        source: serde_json::Error,
    },

    /// Value could not be encoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Identity of a cached read: method, resource path and parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestKey {
    /// HTTP-like method
    pub method: String,

    /// Resource path (e.g. "/customers")
    pub resource: String,

    /// Request parameters
    pub params: HashMap<String, Value>,
}

impl RequestKey {
    /// Create a `GET` key for a resource with no parameters
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            method: DEFAULT_METHOD.to_string(),
            resource: resource.into(),
            params: HashMap::new(),
        }
    }

    /// Override the method
    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    /// Add a parameter
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Take parameters from a JSON object; anything else is ignored
    pub fn with_params(mut self, params: &Value) -> Self {
        if let Value::Object(map) = params {
            for (k, v) in map {
                self.params.insert(k.clone(), v.clone());
            }
        }
        self
    }

    /// Parameters rendered as JSON with every object's keys sorted
    pub fn canonical_params(&self) -> String {
        let mut keys: Vec<&String> = self.params.keys().collect();
        keys.sort();

        let mut out = String::from("{");
        for (i, k) in keys.into_iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            write_canonical(&Value::String(k.clone()), &mut out);
            out.push(':');
            write_canonical(&self.params[k], &mut out);
        }
        out.push('}');
        out
    }

    /// Storage key: `cache:{METHOD}:{resource}:{md5(canonical params)}`
    pub fn storage_key(&self) -> String {
        let digest = md5::compute(self.canonical_params().as_bytes());
        format!(
            "{}{}:{}:{:x}",
            CACHE_PREFIX,
            self.method.to_ascii_uppercase(),
            self.resource,
            digest
        )
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method.to_ascii_uppercase(), self.resource)?;
        if !self.params.is_empty() {
            write!(f, " {}", self.canonical_params())?;
        }
        Ok(())
    }
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (k, v)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(&Value::String(k.clone()), out);
                out.push(':');
                write_canonical(v, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        // Scalars have a single JSON rendering
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Cached value with its write time, TTL, owner and validators
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheEntry<T> {
    /// The cached value
    pub data: T,

    /// Write time in epoch milliseconds
    pub timestamp: u64,

    /// Time-to-live in milliseconds
    pub ttl_ms: u64,

    /// Tenant that owns the entry
    pub tenant_id: String,

    /// Optional entity tag from the origin
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,

    /// Optional origin version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
}

impl<T> CacheEntry<T> {
    /// Time-to-live as a duration
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    /// Visible iff `now <= timestamp + ttl`
    pub fn is_fresh(&self, now_millis: u64) -> bool {
        now_millis <= self.timestamp.saturating_add(self.ttl_ms)
    }
}

/// Optional origin validators stored with an entry
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Validators {
    /// Entity tag
    pub etag: Option<String>,
    /// Version number
    pub version: Option<u64>,
}

/// Metadata index record for one live cache key
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexRecord {
    /// Resource path of the entry
    pub resource: String,
    /// Owning tenant
    pub tenant_id: String,
    /// Write time in epoch milliseconds
    pub timestamp: u64,
    /// Time-to-live in milliseconds
    pub ttl_ms: u64,
}

type CacheIndex = BTreeMap<String, IndexRecord>;

/// Cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// TTL applied when a write does not specify one
    pub default_ttl: Duration,
    /// Maximum number of live entries; oldest entries are evicted past this
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(300), // 5 minutes
            max_entries: 1000,
        }
    }
}

impl CacheConfig {
    /// Create a new cache configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set default TTL
    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Set maximum entries
    pub fn max_entries(mut self, max: usize) -> Self {
        self.max_entries = max;
        self
    }
}

/// Snapshot of cache diagnostic counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Reads served from cache
    pub hits: u64,
    /// Reads with no entry
    pub misses: u64,
    /// Reads that found an expired entry (and removed it)
    pub expired: u64,
    /// Reads that found another tenant's entry
    pub tenant_mismatches: u64,
    /// Absorbed storage or serialization faults
    pub faults: u64,
    /// Entries evicted by the capacity bound
    pub evictions: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    expired: AtomicU64,
    tenant_mismatches: AtomicU64,
    faults: AtomicU64,
    evictions: AtomicU64,
}

/// Tenant-scoped TTL cache over a [`PersistentStore`]
pub struct CacheManager {
    store: Arc<dyn PersistentStore>,
    clock: Arc<dyn Clock>,
    config: CacheConfig,
    // Serializes read-modify-write of the metadata index
    index_lock: Mutex<()>,
    counters: Counters,
}

impl CacheManager {
    /// Create a cache manager
    ///
    /// # Arguments
    ///
    /// * `store` - Durable store shared with the offline queue
    /// * `clock` - Source of entry timestamps and expiry checks
    /// * `config` - Default TTL and capacity
    ///
    /// # Returns
    ///
    /// A new `CacheManager` over the existing cache namespace of `store`
    pub fn new(store: Arc<dyn PersistentStore>, clock: Arc<dyn Clock>, config: CacheConfig) -> Self {
        Self {
            store,
            clock,
            config,
            index_lock: Mutex::new(()),
            counters: Counters::default(),
        }
    }

    /// Cache configuration
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Read a cached value for `tenant_id`
    ///
    /// Returns `None` on a miss, a tenant mismatch, an expired entry (which is
    /// removed first) or any absorbed fault.
    pub async fn get<T: DeserializeOwned>(&self, key: &RequestKey, tenant_id: &str) -> Option<T> {
        self.get_entry(key, tenant_id).await.map(|entry| entry.data)
    }

    /// Like [`get`](Self::get) but returns the whole entry with its metadata
    pub async fn get_entry<T: DeserializeOwned>(
        &self,
        key: &RequestKey,
        tenant_id: &str,
    ) -> Option<CacheEntry<T>> {
        let storage_key = key.storage_key();

        let raw = match self.store.get(&storage_key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key = %key, "cache miss");
                return None;
            }
            Err(e) => {
                self.record_fault(CacheFault::Store(e));
                return None;
            }
        };

        let entry: CacheEntry<Value> = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(source) => {
                self.record_fault(CacheFault::Corrupt { key: storage_key, source });
                return None;
            }
        };

        if entry.tenant_id != tenant_id {
            self.counters.tenant_mismatches.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(key = %key, "cache entry belongs to another tenant");
            return None;
        }

        if !entry.is_fresh(self.clock.now_millis()) {
            self.counters.expired.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(key = %key, "cache entry expired");
            self.remove_key(&storage_key).await;
            return None;
        }

        match serde_json::from_value::<T>(entry.data) {
            Ok(data) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key = %key, "cache hit");
                Some(CacheEntry {
                    data,
                    timestamp: entry.timestamp,
                    ttl_ms: entry.ttl_ms,
                    tenant_id: entry.tenant_id,
                    etag: entry.etag,
                    version: entry.version,
                })
            }
            Err(source) => {
                self.record_fault(CacheFault::Corrupt { key: storage_key, source });
                None
            }
        }
    }

    /// Write a value, replacing any existing entry for the key
    pub async fn set<T: Serialize>(
        &self,
        key: &RequestKey,
        data: &T,
        ttl: Option<Duration>,
        tenant_id: &str,
    ) {
        self.set_with(key, data, ttl, tenant_id, Validators::default())
            .await
    }

    /// Write a value together with origin validators
    pub async fn set_with<T: Serialize>(
        &self,
        key: &RequestKey,
        data: &T,
        ttl: Option<Duration>,
        tenant_id: &str,
        validators: Validators,
    ) {
        let data = match serde_json::to_value(data) {
            Ok(data) => data,
            Err(e) => {
                self.record_fault(CacheFault::Serialization(e));
                return;
            }
        };

        let ttl = ttl.unwrap_or(self.config.default_ttl);
        let entry = CacheEntry {
            data,
            timestamp: self.clock.now_millis(),
            ttl_ms: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
            tenant_id: tenant_id.to_string(),
            etag: validators.etag,
            version: validators.version,
        };

        let storage_key = key.storage_key();
        let encoded = match serde_json::to_string(&entry) {
            Ok(encoded) => encoded,
            Err(e) => {
                self.record_fault(CacheFault::Serialization(e));
                return;
            }
        };

        if let Err(e) = self.store.set(&storage_key, encoded).await {
            self.record_fault(CacheFault::Store(e));
            return;
        }

        let _guard = self.index_lock.lock().await;
        let mut index = self.load_index().await;
        index.insert(
            storage_key.clone(),
            IndexRecord {
                resource: key.resource.clone(),
                tenant_id: entry.tenant_id,
                timestamp: entry.timestamp,
                ttl_ms: entry.ttl_ms,
            },
        );
        self.enforce_capacity(&mut index, &storage_key).await;
        self.save_index(&index).await;
    }

    /// Remove the entry for a key
    pub async fn delete(&self, key: &RequestKey) {
        self.remove_key(&key.storage_key()).await;
    }

    /// Remove every cached variant of `resource`, optionally for one tenant only
    ///
    /// Returns the number of entries removed.
    pub async fn invalidate_resource(&self, resource: &str, tenant_id: Option<&str>) -> usize {
        self.remove_matching(|record| {
            record.resource == resource && tenant_id.map_or(true, |t| record.tenant_id == t)
        })
        .await
    }

    /// Remove entries for `tenant_id`, or everything when `None`
    pub async fn clear(&self, tenant_id: Option<&str>) {
        match tenant_id {
            Some(tenant_id) => {
                let removed = self.remove_matching(|record| record.tenant_id == tenant_id).await;
                tracing::info!(tenant_id, removed, "cleared tenant cache");
            }
            None => {
                let _guard = self.index_lock.lock().await;
                let keys = match self.store.keys_with_prefix(CACHE_PREFIX).await {
                    Ok(keys) => keys,
                    Err(e) => {
                        self.record_fault(CacheFault::Store(e));
                        // Fall back to what the index knows about
                        let mut keys: Vec<String> = self.load_index().await.into_keys().collect();
                        keys.push(INDEX_KEY.to_string());
                        keys
                    }
                };
                for key in &keys {
                    if let Err(e) = self.store.delete(key).await {
                        self.record_fault(CacheFault::Store(e));
                    }
                }
                tracing::info!(removed = keys.len(), "cleared entire cache");
            }
        }
    }

    /// Drop every expired entry; returns how many were removed
    pub async fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        self.remove_matching(|record| now > record.timestamp.saturating_add(record.ttl_ms))
            .await
    }

    /// Number of entries tracked by the metadata index
    pub async fn len(&self) -> usize {
        self.load_index().await.len()
    }

    /// Check if the index tracks no entries
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Index records for one tenant, keyed by storage key
    pub async fn tenant_keys(&self, tenant_id: &str) -> Vec<String> {
        self.load_index()
            .await
            .into_iter()
            .filter(|(_, record)| record.tenant_id == tenant_id)
            .map(|(key, _)| key)
            .collect()
    }

    /// Snapshot of diagnostic counters
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            expired: self.counters.expired.load(Ordering::Relaxed),
            tenant_mismatches: self.counters.tenant_mismatches.load(Ordering::Relaxed),
            faults: self.counters.faults.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
        }
    }

    async fn remove_key(&self, storage_key: &str) {
        if let Err(e) = self.store.delete(storage_key).await {
            self.record_fault(CacheFault::Store(e));
        }

        let _guard = self.index_lock.lock().await;
        let mut index = self.load_index().await;
        if index.remove(storage_key).is_some() {
            self.save_index(&index).await;
        }
    }

    async fn remove_matching<F>(&self, predicate: F) -> usize
    where
        F: Fn(&IndexRecord) -> bool,
    {
        let _guard = self.index_lock.lock().await;
        let mut index = self.load_index().await;

        let doomed: Vec<String> = index
            .iter()
            .filter(|(_, record)| predicate(record))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &doomed {
            if let Err(e) = self.store.delete(key).await {
                self.record_fault(CacheFault::Store(e));
            }
            index.remove(key);
        }

        if !doomed.is_empty() {
            self.save_index(&index).await;
        }
        doomed.len()
    }

    async fn enforce_capacity(&self, index: &mut CacheIndex, keep: &str) {
        while index.len() > self.config.max_entries.max(1) {
            let oldest = index
                .iter()
                .filter(|(key, _)| key.as_str() != keep)
                .min_by_key(|(_, record)| record.timestamp)
                .map(|(key, _)| key.clone());

            let Some(oldest) = oldest else { break };
            if let Err(e) = self.store.delete(&oldest).await {
                self.record_fault(CacheFault::Store(e));
            }
            index.remove(&oldest);
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(key = %oldest, "evicted cache entry over capacity");
        }
    }

    async fn load_index(&self) -> CacheIndex {
        match self.store.get(INDEX_KEY).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(index) => index,
                Err(source) => {
                    self.record_fault(CacheFault::Corrupt { key: INDEX_KEY.to_string(), source });
                    CacheIndex::new()
                }
            },
            Ok(None) => CacheIndex::new(),
            Err(e) => {
                self.record_fault(CacheFault::Store(e));
                CacheIndex::new()
            }
        }
    }

    async fn save_index(&self, index: &CacheIndex) {
        let encoded = match serde_json::to_string(index) {
            Ok(encoded) => encoded,
            Err(e) => {
                self.record_fault(CacheFault::Serialization(e));
                return;
            }
        };
        if let Err(e) = self.store.set(INDEX_KEY, encoded).await {
            self.record_fault(CacheFault::Store(e));
        }
    }

    fn record_fault(&self, fault: CacheFault) {
        self.counters.faults.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(error = %fault, "cache fault absorbed");
    }
}
