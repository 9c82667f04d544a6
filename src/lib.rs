//! Offline-first sync and caching
//!
//! Facade over the workspace crates:
//! - [`storage`]: durable key-value stores, the tenant-scoped response cache
//!   and the offline mutation queue
//! - [`networking`]: connectivity monitoring and retry delays
//! - [`app_state`]: the sync orchestrator, tenant tracking and
//!   stale-while-revalidate accessors

#![warn(missing_docs)]
#![warn(clippy::all)]

pub use app_state;
pub use networking;
pub use storage;

pub use app_state::{
    CachedDataAccessor, MutationOutcome, MutationSubmitter, SyncConfig, SyncOrchestrator,
    TenantContext,
};
pub use networking::{NetworkMonitor, NetworkState};
pub use storage::{CacheManager, OfflineQueueManager, PersistentStore, RequestKey, SledStore};

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default filter when `RUST_LOG` is unset
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Install a global fmt subscriber filtered by `RUST_LOG`
///
/// Returns an error if a global subscriber is already installed.
pub fn init_tracing() -> Result<(), tracing_subscriber::util::TryInitError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init()
}
