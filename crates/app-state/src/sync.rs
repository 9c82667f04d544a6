//! Offline synchronization orchestrator
//!
//! This module coordinates the response cache, the offline mutation queue and
//! connectivity:
//! - Reads are served from the tenant-scoped cache
//! - Mutations are submitted directly while online, queued otherwise
//! - Queued mutations are drained by sequential sync passes on reconnect, on
//!   a periodic timer, after a retry delay, or on demand
//!
//! At most one pass runs at a time. The in-flight flag is claimed before the
//! first suspension point of a pass, so a trigger arriving while a pass awaits
//! the network is a no-op.

use networking::{NetworkMonitor, NetworkState, RetrySchedule, RetryStrategy};
use parking_lot::{Mutex, RwLock};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use storage::{
    CacheConfig, CacheManager, Clock, ClockIds, IdProvider, NewMutation, OfflineQueueManager,
    Operation, PersistentStore, QueueConfig, QueueEntry, QueueError, QueuePatch, QueueStatus,
    RequestKey, SystemClock,
};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::mutation::{MutationOptions, MutationOutcome, MutationSubmitter};
use crate::tenant::{TenantContext, TenantSwitchPolicy, TenantTracker};

/// Errors recorded by sync passes
///
/// These are never returned from the read/write/enqueue API. They are
/// captured on the queue entry and collected in [`SyncReport::errors`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SyncError {
    /// Submission failed; the entry will be retried
    #[error("{operation} {resource} failed (attempt {attempt} of {max_retries}): {message}")]
    Transient {
        /// Queue entry id
        id: String,
        /// Operation attempted
        operation: Operation,
        /// Target resource
        resource: String,
        /// Attempts so far
        attempt: u32,
        /// Attempt budget
        max_retries: u32,
        /// Submission error
        message: String,
    },

    /// Retries exhausted; the entry is `Failed` until retried or discarded
    #[error("{operation} {resource} gave up after {attempts} attempts: {message}")]
    Terminal {
        /// Queue entry id
        id: String,
        /// Operation attempted
        operation: Operation,
        /// Target resource
        resource: String,
        /// Attempts made
        attempts: u32,
        /// Last submission error
        message: String,
    },

    /// The queue could not be read or updated
    #[error("Queue unavailable: {0}")]
    Queue(String),
}

impl SyncError {
    /// Whether the entry needs manual retry or discard
    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncError::Terminal { .. })
    }
}

/// Errors returned to callers of the orchestrator
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// Queue storage failed; an enqueue in this state is not durable
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Entry is not in a state that allows the requested action
    #[error("Entry {id} is {status:?}, expected {expected:?}")]
    InvalidState {
        /// Queue entry id
        id: String,
        /// Current status
        status: QueueStatus,
        /// Required status
        expected: QueueStatus,
    },
}

/// Result type for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Orchestrator lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    /// No pass running
    Idle,

    /// One pass in flight
    Syncing,

    /// Last pass left retryable entries; the retry timer is armed
    WaitingRetry,
}

/// Outcome of one sync pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    /// Tenant the pass ran for
    pub tenant_id: String,
    /// Entries submitted
    pub attempted: usize,
    /// Entries confirmed and removed
    pub synced: usize,
    /// Entries returned to `Pending`
    pub retried: usize,
    /// Entries that became `Failed`
    pub failed: usize,
    /// Entries not attempted (held behind a retryable failure on the same
    /// resource, or connectivity dropped)
    pub skipped: usize,
    /// Entries waiting behind a `Failed` entry on the same resource; they
    /// move once that entry is retried or discarded
    pub held: usize,
    /// Errors captured during the pass
    pub errors: Vec<SyncError>,
}

impl SyncReport {
    /// Whether another pass has work to retry
    pub fn has_retryable(&self) -> bool {
        self.retried > 0 || self.skipped > 0
    }
}

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Cache settings (default TTL, capacity)
    pub cache: CacheConfig,
    /// Queue settings (default retry budget)
    pub queue: QueueConfig,
    /// Period of the reconciliation timer while online
    pub reconcile_interval: Duration,
    /// Delay policy for the retry timer
    pub retry: RetryStrategy,
    /// Handling of the previous tenant's queue on a switch
    pub tenant_switch: TenantSwitchPolicy,
    /// Record every mutation in the queue before submitting it
    pub always_enqueue: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            queue: QueueConfig::default(),
            reconcile_interval: Duration::from_secs(30),
            retry: RetryStrategy::default(),
            tenant_switch: TenantSwitchPolicy::default(),
            always_enqueue: false,
        }
    }
}

impl SyncConfig {
    /// Create a new configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set cache configuration
    pub fn cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Set queue configuration
    pub fn queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    /// Set the reconciliation period
    pub fn reconcile_interval(mut self, interval: Duration) -> Self {
        self.reconcile_interval = interval;
        self
    }

    /// Set the retry strategy
    pub fn retry(mut self, retry: RetryStrategy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the tenant switch policy
    pub fn tenant_switch(mut self, policy: TenantSwitchPolicy) -> Self {
        self.tenant_switch = policy;
        self
    }

    /// Record every mutation in the queue first
    pub fn always_enqueue(mut self, enabled: bool) -> Self {
        self.always_enqueue = enabled;
        self
    }
}

/// Builder for [`SyncOrchestrator`]
pub struct SyncOrchestratorBuilder {
    store: Arc<dyn PersistentStore>,
    monitor: NetworkMonitor,
    submitter: Arc<dyn MutationSubmitter>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdProvider>>,
    config: SyncConfig,
}

impl SyncOrchestratorBuilder {
    /// Use a specific clock (defaults to the system clock)
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Use a specific id provider (defaults to clock-based ids)
    pub fn ids(mut self, ids: Arc<dyn IdProvider>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Set configuration
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the orchestrator for `tenant` without starting timers
    ///
    /// Entries left `Syncing` by an interrupted process are returned to
    /// `Pending`, and a tenant change since the last run is applied.
    pub async fn build(self, tenant: TenantContext) -> Result<SyncOrchestrator> {
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(ClockIds::new(clock.clone())));

        let cache = CacheManager::new(self.store.clone(), clock.clone(), self.config.cache.clone());
        let queue = OfflineQueueManager::new(
            self.store.clone(),
            clock,
            ids,
            self.config.queue.clone(),
        );

        let inner = Arc::new(Inner {
            retry_schedule: Mutex::new(self.config.retry.schedule()),
            config: self.config,
            cache,
            queue,
            monitor: self.monitor,
            submitter: self.submitter,
            tenants: TenantTracker::new(self.store),
            tenant: RwLock::new(tenant.clone()),
            syncing: AtomicBool::new(false),
            started: AtomicBool::new(false),
            phase: Mutex::new(SyncPhase::Idle),
            retry_timer: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            last_report: Mutex::new(None),
        });

        inner.queue.recover_interrupted().await?;
        inner.apply_tenant(&tenant.tenant_id).await;

        Ok(SyncOrchestrator { inner })
    }

    /// Build and start the timers and connectivity listener
    pub async fn start(self, tenant: TenantContext) -> Result<SyncOrchestrator> {
        let orchestrator = self.build(tenant).await?;
        orchestrator.start();
        Ok(orchestrator)
    }
}

/// Coordinates cache, queue and connectivity behind one API
///
/// Construct once at application start and call
/// [`shutdown`](Self::shutdown) at teardown. Clones share state.
#[derive(Clone)]
pub struct SyncOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    config: SyncConfig,
    cache: CacheManager,
    queue: OfflineQueueManager,
    monitor: NetworkMonitor,
    submitter: Arc<dyn MutationSubmitter>,
    tenants: TenantTracker,
    tenant: RwLock<TenantContext>,
    syncing: AtomicBool,
    started: AtomicBool,
    phase: Mutex<SyncPhase>,
    retry_schedule: Mutex<RetrySchedule>,
    retry_timer: Mutex<Option<JoinHandle<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    last_report: Mutex<Option<SyncReport>>,
}

/// Releases the in-flight flag when a pass ends, however it ends
struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl SyncOrchestrator {
    /// Start building an orchestrator
    ///
    /// # Arguments
    ///
    /// * `store` - Durable store for the cache, the queue and the tenant marker
    /// * `monitor` - Shared connectivity monitor
    /// * `submitter` - Application-owned executor for mutations
    ///
    /// # Returns
    ///
    /// A `SyncOrchestratorBuilder` with the system clock, clock-based ids and
    /// default configuration
    pub fn builder(
        store: Arc<dyn PersistentStore>,
        monitor: NetworkMonitor,
        submitter: Arc<dyn MutationSubmitter>,
    ) -> SyncOrchestratorBuilder {
        SyncOrchestratorBuilder {
            store,
            monitor,
            submitter,
            clock: None,
            ids: None,
            config: SyncConfig::default(),
        }
    }

    /// Spawn the connectivity listener and the reconciliation timer
    ///
    /// Calling this more than once has no effect.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let listener = spawn_listener(Arc::downgrade(&self.inner), self.inner.monitor.subscribe());
        let ticker = spawn_reconciler(Arc::downgrade(&self.inner), self.inner.config.reconcile_interval);
        self.inner.tasks.lock().extend([listener, ticker]);

        tracing::info!(
            interval = ?self.inner.config.reconcile_interval,
            "sync orchestrator started"
        );

        if self.inner.monitor.is_online() {
            self.inner.spawn_pass_if_pending();
        }
    }

    /// Stop every timer and listener
    ///
    /// A pass running on a background task is cancelled with it. Entries it
    /// left `Syncing` return to `Pending` the next time an orchestrator is
    /// built over the same store.
    pub fn shutdown(&self) {
        self.inner.started.store(false, Ordering::SeqCst);
        self.inner.cancel_retry_timer();
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        let mut phase = self.inner.phase.lock();
        if *phase == SyncPhase::WaitingRetry {
            *phase = SyncPhase::Idle;
        }
        tracing::info!("sync orchestrator stopped");
    }

    /// Run a sync pass now
    ///
    /// Returns `None` without doing anything if a pass is already running.
    pub async fn sync_now(&self) -> Option<SyncReport> {
        self.inner.run_pass().await
    }

    /// Current lifecycle phase
    pub fn phase(&self) -> SyncPhase {
        *self.inner.phase.lock()
    }

    /// Report of the most recent completed pass
    pub fn last_report(&self) -> Option<SyncReport> {
        self.inner.last_report.lock().clone()
    }

    /// Current connectivity
    pub fn network_state(&self) -> NetworkState {
        self.inner.monitor.state()
    }

    /// Whether the platform reports connectivity
    pub fn is_online(&self) -> bool {
        self.inner.monitor.is_online()
    }

    /// Active tenant context
    pub fn tenant(&self) -> TenantContext {
        self.inner.tenant.read().clone()
    }

    /// Underlying cache
    pub fn cache(&self) -> &CacheManager {
        &self.inner.cache
    }

    /// Underlying queue
    pub fn queue(&self) -> &OfflineQueueManager {
        &self.inner.queue
    }

    /// Make `tenant` active
    ///
    /// The previous tenant's cache is cleared. Its queue is kept or purged
    /// according to [`SyncConfig::tenant_switch`].
    pub async fn switch_tenant(&self, tenant: TenantContext) {
        let tenant_id = tenant.tenant_id.clone();
        *self.inner.tenant.write() = tenant;
        self.inner.apply_tenant(&tenant_id).await;

        if self.inner.started.load(Ordering::SeqCst) && self.is_online() {
            self.inner.spawn_pass_if_pending();
        }
    }

    /// Read a cached value for the active tenant
    pub async fn read<T: DeserializeOwned>(&self, key: &RequestKey) -> Option<T> {
        let tenant_id = self.tenant().tenant_id;
        self.inner.cache.get(key, &tenant_id).await
    }

    /// Cache a value for the active tenant
    pub async fn write<T: Serialize>(&self, key: &RequestKey, data: &T, ttl: Option<Duration>) {
        let tenant_id = self.tenant().tenant_id;
        self.inner.cache.set(key, data, ttl, &tenant_id).await
    }

    /// Drop one cached read
    pub async fn invalidate(&self, key: &RequestKey) {
        self.inner.cache.delete(key).await
    }

    /// Drop every cached read of `resource` for the active tenant
    pub async fn invalidate_resource(&self, resource: &str) -> usize {
        let tenant_id = self.tenant().tenant_id;
        self.inner
            .cache
            .invalidate_resource(resource, Some(&tenant_id))
            .await
    }

    /// Issue a mutation with default options
    pub async fn mutate(
        &self,
        operation: Operation,
        resource: &str,
        payload: Value,
    ) -> Result<MutationOutcome> {
        self.mutate_with(operation, resource, payload, MutationOptions::default())
            .await
    }

    /// Issue a mutation
    ///
    /// While online with no earlier queued work on the same resource, the
    /// mutation is submitted directly; on success the resource's cached reads
    /// are invalidated. Otherwise, or if the direct submission fails, it is
    /// queued. Only a queue storage failure produces an error.
    pub async fn mutate_with(
        &self,
        operation: Operation,
        resource: &str,
        payload: Value,
        options: MutationOptions,
    ) -> Result<MutationOutcome> {
        let tenant = self.tenant();

        let direct = self.is_online()
            && !self.inner.config.always_enqueue
            && !self.inner.has_pending_for(&tenant.tenant_id, resource).await;
        let mut direct_failed = false;

        if direct {
            match self
                .inner
                .submitter
                .submit(operation, resource, &payload)
                .await
            {
                Ok(response) => {
                    self.inner
                        .cache
                        .invalidate_resource(resource, Some(&tenant.tenant_id))
                        .await;
                    if let (Some(key), Some(body)) = (&options.cache_as, &response) {
                        self.inner.cache.set(key, body, None, &tenant.tenant_id).await;
                    }
                    tracing::debug!(%operation, resource, "mutation submitted");
                    return Ok(MutationOutcome::Submitted(response));
                }
                Err(e) => {
                    tracing::warn!(%operation, resource, error = %e, "direct submission failed, queueing");
                    direct_failed = true;
                }
            }
        }

        let mut mutation =
            NewMutation::new(operation, resource, payload, &tenant.tenant_id, &tenant.user_id);
        mutation.max_retries = options.max_retries;
        let entry = self.inner.queue.enqueue(mutation).await?;

        if self.is_online() && self.inner.started.load(Ordering::SeqCst) {
            if direct_failed {
                self.inner.schedule_retry();
            } else {
                self.inner.spawn_pass();
            }
        }
        Ok(MutationOutcome::Queued(entry))
    }

    /// `Pending` and `Failed` entries for the active tenant, in order
    pub async fn pending_entries(&self) -> Result<Vec<QueueEntry>> {
        let tenant_id = self.tenant().tenant_id;
        Ok(self.inner.queue.list_pending(&tenant_id).await?)
    }

    /// Entries that exhausted their retries and need a decision
    pub async fn failed_entries(&self) -> Result<Vec<QueueEntry>> {
        let tenant_id = self.tenant().tenant_id;
        Ok(self.inner.queue.list_failed(&tenant_id).await?)
    }

    /// Give a `Failed` entry a fresh retry budget
    pub async fn retry_failed(&self, id: &str) -> Result<QueueEntry> {
        let entry = self
            .inner
            .queue
            .get(id)
            .await?
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;

        if entry.status != QueueStatus::Failed {
            return Err(OrchestratorError::InvalidState {
                id: id.to_string(),
                status: entry.status,
                expected: QueueStatus::Failed,
            });
        }

        let entry = self
            .inner
            .queue
            .update_status(id, QueuePatch::status(QueueStatus::Pending).retry_count(0).clear_error())
            .await?;
        tracing::info!(id, "failed entry scheduled for retry");

        if self.is_online() && self.inner.started.load(Ordering::SeqCst) {
            self.inner.spawn_pass();
        }
        Ok(entry)
    }

    /// Drop a queued entry without submitting it
    pub async fn discard(&self, id: &str) -> Result<bool> {
        let removed = self.inner.queue.remove(id).await?;
        if removed {
            tracing::info!(id, "queue entry discarded");
        }
        Ok(removed)
    }
}

impl Inner {
    async fn run_pass(self: &Arc<Self>) -> Option<SyncReport> {
        if self
            .syncing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("sync pass already running, trigger ignored");
            return None;
        }
        let _guard = PassGuard(&self.syncing);

        self.cancel_retry_timer();
        *self.phase.lock() = SyncPhase::Syncing;

        let tenant_id = self.tenant.read().tenant_id.clone();
        let mut report = SyncReport { tenant_id: tenant_id.clone(), ..Default::default() };

        // Failed entries stay in the snapshot so they keep holding their resource
        let mut seen = HashSet::new();
        match self.queue.list_pending(&tenant_id).await {
            Ok(snapshot) => {
                seen.extend(snapshot.iter().map(|e| e.id.clone()));
                tracing::debug!(tenant_id = %tenant_id, entries = snapshot.len(), "sync pass started");
                self.drain(snapshot, &mut report).await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "sync pass could not read queue");
                report.errors.push(SyncError::Queue(e.to_string()));
            }
        }

        self.finish_pass(&report, &seen).await;
        Some(report)
    }

    async fn drain(&self, snapshot: Vec<QueueEntry>, report: &mut SyncReport) {
        let mut retrying: HashSet<String> = HashSet::new();
        let mut blocked: HashSet<String> = HashSet::new();
        let mut remaining = snapshot
            .iter()
            .filter(|e| e.status == QueueStatus::Pending)
            .count();

        for entry in snapshot {
            if entry.status == QueueStatus::Failed {
                blocked.insert(entry.resource);
                continue;
            }

            if !self.monitor.is_online() {
                report.skipped += remaining;
                tracing::info!(remaining, "went offline during sync pass");
                break;
            }
            remaining -= 1;

            // Dependent mutations must not overtake an earlier one
            if blocked.contains(&entry.resource) {
                report.held += 1;
                continue;
            }
            if retrying.contains(&entry.resource) {
                report.skipped += 1;
                continue;
            }

            match self.process_entry(&entry, report).await {
                EntryOutcome::Synced | EntryOutcome::Gone => {}
                EntryOutcome::Retry => {
                    retrying.insert(entry.resource);
                }
                EntryOutcome::Failed => {
                    blocked.insert(entry.resource);
                }
            }
        }
    }

    async fn process_entry(&self, entry: &QueueEntry, report: &mut SyncReport) -> EntryOutcome {
        match self
            .queue
            .update_status(&entry.id, QueuePatch::status(QueueStatus::Syncing))
            .await
        {
            Ok(_) => {}
            Err(QueueError::NotFound(_)) => return EntryOutcome::Gone,
            Err(e) => {
                report.errors.push(SyncError::Queue(e.to_string()));
                report.skipped += 1;
                return EntryOutcome::Retry;
            }
        }

        report.attempted += 1;
        let result = self
            .submitter
            .submit(entry.operation, &entry.resource, &entry.payload)
            .await;

        match result {
            Ok(_) => {
                if let Err(e) = self.queue.remove(&entry.id).await {
                    // Still Syncing; recovered to Pending on next start
                    report.errors.push(SyncError::Queue(e.to_string()));
                }
                self.cache
                    .invalidate_resource(&entry.resource, Some(&entry.tenant_id))
                    .await;
                report.synced += 1;
                tracing::debug!(id = %entry.id, operation = %entry.operation, resource = %entry.resource, "entry synced");
                EntryOutcome::Synced
            }
            Err(e) => {
                let attempts = entry.retry_count + 1;
                let message = format!("{:#}", e);

                if attempts >= entry.max_retries {
                    let patch = QueuePatch::status(QueueStatus::Failed)
                        .retry_count(attempts)
                        .error(message.clone());
                    if let Err(qe) = self.queue.update_status(&entry.id, patch).await {
                        report.errors.push(SyncError::Queue(qe.to_string()));
                    }
                    tracing::warn!(id = %entry.id, attempts, error = %message, "entry failed permanently");
                    report.failed += 1;
                    report.errors.push(SyncError::Terminal {
                        id: entry.id.clone(),
                        operation: entry.operation,
                        resource: entry.resource.clone(),
                        attempts,
                        message,
                    });
                    EntryOutcome::Failed
                } else {
                    let patch = QueuePatch::status(QueueStatus::Pending)
                        .retry_count(attempts)
                        .error(message.clone());
                    if let Err(qe) = self.queue.update_status(&entry.id, patch).await {
                        report.errors.push(SyncError::Queue(qe.to_string()));
                    }
                    tracing::debug!(id = %entry.id, attempts, error = %message, "entry will be retried");
                    report.retried += 1;
                    report.errors.push(SyncError::Transient {
                        id: entry.id.clone(),
                        operation: entry.operation,
                        resource: entry.resource.clone(),
                        attempt: attempts,
                        max_retries: entry.max_retries,
                        message,
                    });
                    EntryOutcome::Retry
                }
            }
        }
    }

    async fn finish_pass(self: &Arc<Self>, report: &SyncReport, seen: &HashSet<String>) {
        let active = self.monitor.is_online() && self.started.load(Ordering::SeqCst);
        // Triggers for entries queued during the pass were dropped by the
        // single-flight check, so they are picked up by the retry timer
        let late = active && !report.has_retryable() && self.has_late_entries(seen).await;
        let wait_retry = active && (report.has_retryable() || late);

        if wait_retry {
            let delay = self.retry_schedule.lock().next_delay();
            *self.phase.lock() = SyncPhase::WaitingRetry;
            self.arm_retry_timer(delay);
            tracing::info!(retry_in = ?delay, retried = report.retried, late, "sync pass left retryable entries");
        } else {
            if !report.has_retryable() {
                self.retry_schedule.lock().reset();
            }
            *self.phase.lock() = SyncPhase::Idle;
        }

        tracing::info!(
            tenant_id = %report.tenant_id,
            attempted = report.attempted,
            synced = report.synced,
            retried = report.retried,
            failed = report.failed,
            skipped = report.skipped,
            held = report.held,
            "sync pass finished"
        );
        *self.last_report.lock() = Some(report.clone());
    }

    async fn apply_tenant(&self, tenant_id: &str) {
        let previous = match self.tenants.observe(tenant_id).await {
            Ok(previous) => previous,
            Err(e) => {
                tracing::warn!(error = %e, "could not update last tenant marker");
                return;
            }
        };

        let Some(previous) = previous else { return };
        tracing::info!(from = %previous, to = %tenant_id, "tenant switched");
        self.cache.clear(Some(&previous)).await;

        if self.config.tenant_switch == TenantSwitchPolicy::Purge {
            if let Err(e) = self.queue.clear(Some(&previous)).await {
                tracing::warn!(error = %e, tenant_id = %previous, "could not purge previous tenant queue");
            }
        }
    }

    async fn has_pending(&self) -> bool {
        let tenant_id = self.tenant.read().tenant_id.clone();
        match self.queue.list_pending(&tenant_id).await {
            Ok(entries) => entries.iter().any(|e| e.status == QueueStatus::Pending),
            Err(e) => {
                tracing::warn!(error = %e, "could not read queue");
                false
            }
        }
    }

    /// Whether `Pending` entries exist that were not in the pass snapshot
    async fn has_late_entries(&self, seen: &HashSet<String>) -> bool {
        let tenant_id = self.tenant.read().tenant_id.clone();
        match self.queue.list_pending(&tenant_id).await {
            Ok(entries) => entries
                .iter()
                .any(|e| e.status == QueueStatus::Pending && !seen.contains(&e.id)),
            Err(_) => false,
        }
    }

    async fn has_pending_for(&self, tenant_id: &str, resource: &str) -> bool {
        match self.queue.all().await {
            Ok(entries) => entries.iter().any(|e| {
                e.tenant_id == tenant_id
                    && e.resource == resource
                    && matches!(
                        e.status,
                        QueueStatus::Pending | QueueStatus::Syncing | QueueStatus::Failed
                    )
            }),
            // Unknown queue state: queue rather than risk overtaking
            Err(_) => true,
        }
    }

    /// Arm the retry timer unless a pass is running or one is already armed
    fn schedule_retry(self: &Arc<Self>) {
        if self.syncing.load(Ordering::Acquire) || self.retry_timer.lock().is_some() {
            return;
        }
        let delay = self.retry_schedule.lock().next_delay();
        *self.phase.lock() = SyncPhase::WaitingRetry;
        self.arm_retry_timer(delay);
        tracing::debug!(retry_in = ?delay, "retry scheduled after failed submission");
    }

    fn spawn_pass(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner.run_pass().await;
        });
    }

    fn spawn_pass_if_pending(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            if inner.has_pending().await {
                inner.run_pass().await;
            }
        });
    }

    fn arm_retry_timer(self: &Arc<Self>, delay: Duration) {
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                // Release our own handle so the pass does not abort this task
                inner.retry_timer.lock().take();
                inner.run_pass().await;
            }
        });

        if let Some(old) = self.retry_timer.lock().replace(handle) {
            old.abort();
        }
    }

    fn cancel_retry_timer(&self) {
        if let Some(timer) = self.retry_timer.lock().take() {
            timer.abort();
        }
    }
}

enum EntryOutcome {
    Synced,
    Retry,
    Failed,
    Gone,
}

fn spawn_listener(
    weak: Weak<Inner>,
    mut events: tokio::sync::broadcast::Receiver<NetworkState>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let state = match events.recv().await {
                Ok(state) => state,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "connectivity events lagged");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };

            let Some(inner) = weak.upgrade() else { break };
            match state {
                NetworkState::Online => {
                    if inner.has_pending().await {
                        inner.run_pass().await;
                    }
                }
                NetworkState::Offline => {
                    inner.cancel_retry_timer();
                    let mut phase = inner.phase.lock();
                    if *phase == SyncPhase::WaitingRetry {
                        *phase = SyncPhase::Idle;
                    }
                }
            }
        }
    })
}

fn spawn_reconciler(weak: Weak<Inner>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(inner) = weak.upgrade() else { break };

            inner.cache.purge_expired().await;
            if inner.monitor.is_online() && inner.has_pending().await {
                inner.run_pass().await;
            }
        }
    })
}
