//! Mutation submission
//!
//! The application owns request execution. It hands the orchestrator a
//! [`MutationSubmitter`], which is invoked both for direct submissions while
//! online and for queued entries during sync passes.

use async_trait::async_trait;
use serde_json::Value;
use storage::{Operation, QueueEntry, RequestKey};

/// Application-supplied executor for mutations
///
/// Resolve `Ok` only when the server confirmed the mutation. Any `Err` counts
/// as a failed attempt and is retried according to the entry's budget.
#[async_trait]
pub trait MutationSubmitter: Send + Sync {
    /// Execute one mutation, returning the server's representation if any
    async fn submit(
        &self,
        operation: Operation,
        resource: &str,
        payload: &Value,
    ) -> anyhow::Result<Option<Value>>;
}

/// Per-call options for [`SyncOrchestrator::mutate_with`](crate::sync::SyncOrchestrator::mutate_with)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MutationOptions {
    /// Retry budget if the mutation ends up queued
    pub max_retries: Option<u32>,

    /// Cache the server's representation under this key after a direct submission
    pub cache_as: Option<RequestKey>,
}

impl MutationOptions {
    /// Create default options
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the retry budget
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Cache the response under `key`
    pub fn cache_as(mut self, key: RequestKey) -> Self {
        self.cache_as = Some(key);
        self
    }
}

/// What happened to a mutation
#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome {
    /// Submitted directly and confirmed
    Submitted(Option<Value>),

    /// Recorded in the offline queue for a later sync pass
    Queued(QueueEntry),
}

impl MutationOutcome {
    /// Whether the mutation is waiting in the queue
    pub fn is_queued(&self) -> bool {
        matches!(self, MutationOutcome::Queued(_))
    }
}
