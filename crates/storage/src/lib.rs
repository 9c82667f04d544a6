//! Storage layer for offline sync
//!
//! This crate provides the durable key-value store abstraction, the
//! tenant-scoped response cache and the offline mutation queue.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod clock;
pub mod kv;
pub mod queue;
pub mod store;

pub use cache::{CacheConfig, CacheEntry, CacheManager, CacheStats, RequestKey, Validators};
pub use clock::{Clock, ClockIds, IdProvider, ManualClock, SequentialIds, SystemClock};
pub use kv::{KvConfig, SledStore};
pub use queue::{
    NewMutation, OfflineQueueManager, Operation, QueueConfig, QueueEntry, QueueError, QueuePatch,
    QueueStatus,
};
pub use store::{MemoryStore, PersistentStore, StoreError};
