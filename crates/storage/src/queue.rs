//! Durable offline mutation queue
//!
//! Pending create/update/delete operations are kept as a single JSON array
//! under [`QUEUE_KEY`], shared by every tenant and filtered in memory. Array
//! order is enqueue order, and that order is the contract sync passes rely on.
//!
//! Durability is best-effort: if the store rejects the write during
//! [`OfflineQueueManager::enqueue`], the error is returned and the mutation is
//! not recorded.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::clock::{Clock, IdProvider};
use crate::store::{PersistentStore, StoreError};

/// Key holding the whole queue
pub const QUEUE_KEY: &str = "queue:entries";

/// Queue error types
#[derive(Debug, Error)]
pub enum QueueError {
    /// Store failure
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Stored queue could not be decoded or encoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No entry with this id
    #[error("Queue entry not found: {0}")]
    NotFound(String),
}

/// Result type for queue operations
pub type Result<T> = std::result::Result<T, QueueError>;

/// Kind of mutation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Create a resource
    Create,
    /// Update a resource
    Update,
    /// Delete a resource
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Create => write!(f, "create"),
            Operation::Update => write!(f, "update"),
            Operation::Delete => write!(f, "delete"),
        }
    }
}

/// Lifecycle status of a queue entry
///
/// `Pending -> Syncing -> {removed | Pending | Failed}`. `Failed` is terminal
/// for automatic processing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    /// Waiting for a sync pass
    Pending,
    /// Being submitted by the running pass
    Syncing,
    /// Confirmed by the server
    Synced,
    /// Retries exhausted; needs manual retry or discard
    Failed,
}

/// One queued mutation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueEntry {
    /// Stable unique id
    pub id: String,
    /// Mutation kind
    pub operation: Operation,
    /// Target resource path
    pub resource: String,
    /// Request payload
    pub payload: Value,
    /// Owning tenant
    pub tenant_id: String,
    /// User that issued the mutation
    pub user_id: String,
    /// Enqueue time in epoch milliseconds
    pub created_at: u64,
    /// Failed submission attempts so far
    pub retry_count: u32,
    /// Attempts allowed before the entry becomes `Failed`
    pub max_retries: u32,
    /// Current status
    pub status: QueueStatus,
    /// Last submission error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl QueueEntry {
    /// Whether another automatic attempt is allowed
    pub fn is_retryable(&self) -> bool {
        self.status == QueueStatus::Pending && self.retry_count < self.max_retries
    }
}

/// Partial update applied by [`OfflineQueueManager::update_status`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueuePatch {
    /// New status
    pub status: Option<QueueStatus>,
    /// New retry count
    pub retry_count: Option<u32>,
    /// New error (`Some(None)` clears it)
    pub error: Option<Option<String>>,
}

impl QueuePatch {
    /// Patch that only changes status
    pub fn status(status: QueueStatus) -> Self {
        Self { status: Some(status), ..Default::default() }
    }

    /// Also set the retry count
    pub fn retry_count(mut self, count: u32) -> Self {
        self.retry_count = Some(count);
        self
    }

    /// Also set the error message
    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(Some(error.into()));
        self
    }

    /// Also clear the error message
    pub fn clear_error(mut self) -> Self {
        self.error = Some(None);
        self
    }

    fn apply(&self, entry: &mut QueueEntry) {
        if let Some(status) = self.status {
            entry.status = status;
        }
        if let Some(count) = self.retry_count {
            entry.retry_count = count;
        }
        if let Some(error) = &self.error {
            entry.error = error.clone();
        }
    }
}

/// A mutation to record
#[derive(Debug, Clone, PartialEq)]
pub struct NewMutation {
    /// Mutation kind
    pub operation: Operation,
    /// Target resource path
    pub resource: String,
    /// Request payload
    pub payload: Value,
    /// Owning tenant
    pub tenant_id: String,
    /// Issuing user
    pub user_id: String,
    /// Retry budget; the queue default applies when `None`
    pub max_retries: Option<u32>,
}

impl NewMutation {
    /// Describe a mutation for a tenant and user
    pub fn new(
        operation: Operation,
        resource: impl Into<String>,
        payload: Value,
        tenant_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            operation,
            resource: resource.into(),
            payload,
            tenant_id: tenant_id.into(),
            user_id: user_id.into(),
            max_retries: None,
        }
    }

    /// Override the retry budget
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// Queue configuration
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Retry budget for mutations that do not specify one
    pub default_max_retries: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { default_max_retries: 3 }
    }
}

impl QueueConfig {
    /// Create a new queue configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default retry budget
    pub fn default_max_retries(mut self, max_retries: u32) -> Self {
        self.default_max_retries = max_retries;
        self
    }
}

/// Durable FIFO of pending mutations
pub struct OfflineQueueManager {
    store: Arc<dyn PersistentStore>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdProvider>,
    config: QueueConfig,
    // Serializes read-modify-write of the queue array
    lock: Mutex<()>,
}

impl OfflineQueueManager {
    /// Create a queue manager
    ///
    /// # Arguments
    ///
    /// * `store` - Durable store holding the queue array
    /// * `clock` - Source of `created_at` timestamps
    /// * `ids` - Provider of entry ids
    /// * `config` - Default retry budget
    ///
    /// # Returns
    ///
    /// A new `OfflineQueueManager`; entries already in `store` are kept
    pub fn new(
        store: Arc<dyn PersistentStore>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdProvider>,
        config: QueueConfig,
    ) -> Self {
        Self { store, clock, ids, config, lock: Mutex::new(()) }
    }

    /// Queue configuration
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Record a mutation as `Pending` with a fresh id
    pub async fn enqueue(&self, mutation: NewMutation) -> Result<QueueEntry> {
        let entry = QueueEntry {
            id: self.ids.next_id(),
            operation: mutation.operation,
            resource: mutation.resource,
            payload: mutation.payload,
            tenant_id: mutation.tenant_id,
            user_id: mutation.user_id,
            created_at: self.clock.now_millis(),
            retry_count: 0,
            max_retries: mutation.max_retries.unwrap_or(self.config.default_max_retries),
            status: QueueStatus::Pending,
            error: None,
        };
        self.insert(entry).await
    }

    /// Append a fully formed entry; an existing id is left untouched
    ///
    /// Returns the stored entry, which makes repeated inserts idempotent.
    pub async fn insert(&self, entry: QueueEntry) -> Result<QueueEntry> {
        let _guard = self.lock.lock().await;
        let mut entries = self.load().await?;

        if let Some(existing) = entries.iter().find(|e| e.id == entry.id) {
            return Ok(existing.clone());
        }

        entries.push(entry.clone());
        self.save(&entries).await?;
        tracing::debug!(
            id = %entry.id,
            operation = %entry.operation,
            resource = %entry.resource,
            tenant_id = %entry.tenant_id,
            "mutation enqueued"
        );
        Ok(entry)
    }

    /// Remove an entry; returns whether it existed
    pub async fn remove(&self, id: &str) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let mut entries = self.load().await?;

        let before = entries.len();
        entries.retain(|e| e.id != id);
        if entries.len() == before {
            return Ok(false);
        }

        self.save(&entries).await?;
        Ok(true)
    }

    /// Apply a patch to one entry and return the updated entry
    pub async fn update_status(&self, id: &str, patch: QueuePatch) -> Result<QueueEntry> {
        let _guard = self.lock.lock().await;
        let mut entries = self.load().await?;

        let entry = entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        patch.apply(entry);
        let updated = entry.clone();

        self.save(&entries).await?;
        Ok(updated)
    }

    /// Fetch one entry by id
    pub async fn get(&self, id: &str) -> Result<Option<QueueEntry>> {
        Ok(self.load().await?.into_iter().find(|e| e.id == id))
    }

    /// `Pending` and `Failed` entries for a tenant, in enqueue order
    pub async fn list_pending(&self, tenant_id: &str) -> Result<Vec<QueueEntry>> {
        self.list_where(tenant_id, |s| matches!(s, QueueStatus::Pending | QueueStatus::Failed))
            .await
    }

    /// `Failed` entries for a tenant, in enqueue order
    pub async fn list_failed(&self, tenant_id: &str) -> Result<Vec<QueueEntry>> {
        self.list_where(tenant_id, |s| s == QueueStatus::Failed).await
    }

    /// Every entry across tenants, in enqueue order
    pub async fn all(&self) -> Result<Vec<QueueEntry>> {
        self.load().await
    }

    /// Number of entries across tenants
    pub async fn len(&self) -> Result<usize> {
        Ok(self.load().await?.len())
    }

    /// Check if the queue holds no entries
    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Return entries left in `Syncing` by an interrupted pass to `Pending`
    pub async fn recover_interrupted(&self) -> Result<usize> {
        let _guard = self.lock.lock().await;
        let mut entries = self.load().await?;

        let mut recovered = 0;
        for entry in entries.iter_mut().filter(|e| e.status == QueueStatus::Syncing) {
            entry.status = QueueStatus::Pending;
            recovered += 1;
        }

        if recovered > 0 {
            self.save(&entries).await?;
            tracing::info!(recovered, "recovered interrupted queue entries");
        }
        Ok(recovered)
    }

    /// Drop entries for `tenant_id`, or every entry when `None`
    pub async fn clear(&self, tenant_id: Option<&str>) -> Result<usize> {
        let _guard = self.lock.lock().await;
        let mut entries = self.load().await?;

        let before = entries.len();
        match tenant_id {
            Some(tenant_id) => entries.retain(|e| e.tenant_id != tenant_id),
            None => entries.clear(),
        }
        let removed = before - entries.len();

        if removed > 0 {
            self.save(&entries).await?;
        }
        tracing::info!(tenant_id = ?tenant_id, removed, "cleared offline queue");
        Ok(removed)
    }

    async fn list_where<F>(&self, tenant_id: &str, keep: F) -> Result<Vec<QueueEntry>>
    where
        F: Fn(QueueStatus) -> bool,
    {
        Ok(self
            .load()
            .await?
            .into_iter()
            .filter(|e| e.tenant_id == tenant_id && keep(e.status))
            .collect())
    }

    async fn load(&self) -> Result<Vec<QueueEntry>> {
        match self.store.get(QUEUE_KEY).await? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(Vec::new()),
        }
    }

    async fn save(&self, entries: &[QueueEntry]) -> Result<()> {
        let encoded = serde_json::to_string(entries)?;
        self.store.set(QUEUE_KEY, encoded).await?;
        Ok(())
    }
}
