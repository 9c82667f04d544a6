//! Offline-first application state
//!
//! This crate ties the storage and networking layers together:
//! - [`SyncOrchestrator`] serves cached reads, routes mutations to the
//!   network or the offline queue, and drains the queue when connectivity
//!   allows
//! - [`CachedDataAccessor`] offers stale-while-revalidate reads for one
//!   resource
//! - [`TenantTracker`] detects tenant switches across restarts

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod accessor;
pub mod mutation;
pub mod sync;
pub mod tenant;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use accessor::{
    Access, AccessError, AccessOptions, AccessorConfig, CachedDataAccessor, DataSource, Fetcher,
};
pub use mutation::{MutationOptions, MutationOutcome, MutationSubmitter};
pub use sync::{
    OrchestratorError, SyncConfig, SyncError, SyncOrchestrator, SyncOrchestratorBuilder,
    SyncPhase, SyncReport,
};
pub use tenant::{TenantContext, TenantSwitchPolicy, TenantTracker, LAST_TENANT_KEY};
