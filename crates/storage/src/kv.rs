//! Embedded durable store
//!
//! This module provides a [`PersistentStore`] backed by sled, the default
//! on-disk store for offline state.

use async_trait::async_trait;
use sled::Db;
use std::sync::Arc;

use crate::store::{PersistentStore, Result, StoreError};

/// Sled store configuration
#[derive(Debug, Clone)]
pub struct KvConfig {
    /// Database path
    pub path: String,
    /// Cache capacity in bytes
    pub cache_capacity: u64,
    /// Enable compression
    pub use_compression: bool,
    /// Flush interval in milliseconds (None for flush on every write)
    pub flush_every_ms: Option<u64>,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            path: "offline_sync.db".to_string(),
            cache_capacity: 16 * 1024 * 1024, // 16MB
            use_compression: true,
            flush_every_ms: Some(500),
        }
    }
}

impl KvConfig {
    /// Create a new configuration with a custom path
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into(), ..Default::default() }
    }

    /// Set cache capacity in bytes
    pub fn cache_capacity(mut self, bytes: u64) -> Self {
        self.cache_capacity = bytes;
        self
    }

    /// Enable or disable compression
    pub fn use_compression(mut self, enabled: bool) -> Self {
        self.use_compression = enabled;
        self
    }

    /// Set flush interval in milliseconds
    pub fn flush_every_ms(mut self, ms: Option<u64>) -> Self {
        self.flush_every_ms = ms;
        self
    }
}

/// Durable store implementation on top of sled
#[derive(Clone)]
pub struct SledStore {
    db: Arc<Db>,
    flush_on_write: bool,
}

impl SledStore {
    /// Open (or create) a store with configuration
    pub fn open(config: KvConfig) -> Result<Self> {
        let db = sled::Config::new()
            .path(&config.path)
            .cache_capacity(config.cache_capacity)
            .use_compression(config.use_compression)
            .flush_every_ms(config.flush_every_ms)
            .open()?;
        tracing::debug!(path = %config.path, "opened sled store");

        Ok(Self { db: Arc::new(db), flush_on_write: config.flush_every_ms.is_none() })
    }

    /// Create a temporary store that is removed on drop (for testing)
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;

        Ok(Self { db: Arc::new(db), flush_on_write: false })
    }

    /// Flush pending writes to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    /// Get the number of keys in the store
    pub fn len(&self) -> usize {
        self.db.len()
    }

    /// Check if the store is empty
    pub fn is_empty(&self) -> bool {
        self.db.is_empty()
    }
}

#[async_trait]
impl PersistentStore for SledStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        match self.db.get(key.as_bytes())? {
            Some(bytes) => String::from_utf8(bytes.to_vec())
                .map(Some)
                .map_err(|_| StoreError::Corrupt(key.to_string())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        self.db.insert(key.as_bytes(), value.into_bytes())?;
        if self.flush_on_write {
            self.db.flush()?;
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.db.remove(key.as_bytes())?;
        if self.flush_on_write {
            self.db.flush()?;
        }
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();

        for item in self.db.scan_prefix(prefix.as_bytes()) {
            let (key, _) = item?;
            if let Ok(key_str) = String::from_utf8(key.to_vec()) {
                keys.push(key_str);
            }
        }

        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_temporary_store_is_empty() {
        let store = SledStore::temporary().unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let store = SledStore::temporary().unwrap();

        store.set("queue:entries", "[]".to_string()).await.unwrap();
        assert_eq!(store.get("queue:entries").await.unwrap(), Some("[]".to_string()));

        store.delete("queue:entries").await.unwrap();
        assert_eq!(store.get("queue:entries").await.unwrap(), None);

        // Deleting twice is fine
        store.delete("queue:entries").await.unwrap();
    }

    #[tokio::test]
    async fn test_keys_with_prefix() {
        let store = SledStore::temporary().unwrap();

        store.set("cache:GET:/a:1", "{}".to_string()).await.unwrap();
        store.set("cache:GET:/b:2", "{}".to_string()).await.unwrap();
        store.set("sync:last_tenant", "\"t1\"".to_string()).await.unwrap();

        let keys = store.keys_with_prefix("cache:").await.unwrap();
        assert_eq!(keys.len(), 2);
        assert!(keys.iter().all(|k| k.starts_with("cache:")));
    }

    #[tokio::test]
    async fn test_reopen_preserves_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.db").to_string_lossy().to_string();

        {
            let store = SledStore::open(KvConfig::new(&path).flush_every_ms(None)).unwrap();
            store.set("sync:last_tenant", "\"t1\"".to_string()).await.unwrap();
            store.flush().unwrap();
        }

        let store = SledStore::open(KvConfig::new(&path).flush_every_ms(None)).unwrap();
        assert_eq!(store.get("sync:last_tenant").await.unwrap(), Some("\"t1\"".to_string()));
    }

    #[test]
    fn test_config_builder() {
        let config = KvConfig::new("test.db")
            .cache_capacity(32 * 1024 * 1024)
            .use_compression(false)
            .flush_every_ms(Some(1000));

        assert_eq!(config.path, "test.db");
        assert_eq!(config.cache_capacity, 32 * 1024 * 1024);
        assert!(!config.use_compression);
        assert_eq!(config.flush_every_ms, Some(1000));
    }
}
