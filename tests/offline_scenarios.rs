//! Offline Behavior Integration Tests
//!
//! End-to-end scenarios across the cache, the offline queue, connectivity
//! monitoring and the sync orchestrator's timers.

use anyhow::anyhow;
use app_state::{
    test_utils::ScriptedSubmitter, MutationOptions, MutationOutcome, MutationSubmitter,
    SyncConfig, SyncOrchestrator, SyncPhase, TenantContext,
};
use async_trait::async_trait;
use networking::{NetworkMonitor, NetworkState, RetryStrategy};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use storage::{
    CacheConfig, CacheManager, ManualClock, MemoryStore, NewMutation, Operation, PersistentStore,
    QueueStatus, RequestKey, SequentialIds,
};
use tokio::sync::watch;

/// Submitter that rejects a fixed number of calls before accepting
struct FlakySubmitter {
    remaining_failures: Mutex<u32>,
    calls: Mutex<Vec<String>>,
}

impl FlakySubmitter {
    fn new(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            remaining_failures: Mutex::new(failures),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl MutationSubmitter for FlakySubmitter {
    async fn submit(
        &self,
        _operation: Operation,
        resource: &str,
        _payload: &Value,
    ) -> anyhow::Result<Option<Value>> {
        self.calls.lock().push(resource.to_string());
        let mut remaining = self.remaining_failures.lock();
        if *remaining > 0 {
            *remaining -= 1;
            return Err(anyhow!("503 service unavailable"));
        }
        Ok(None)
    }
}

/// Helper to build an orchestrator over a fresh memory store
async fn create_orchestrator(
    submitter: Arc<dyn MutationSubmitter>,
    initial: NetworkState,
    config: SyncConfig,
) -> (SyncOrchestrator, NetworkMonitor) {
    let monitor = NetworkMonitor::new(initial);
    let orchestrator = SyncOrchestrator::builder(Arc::new(MemoryStore::new()), monitor.clone(), submitter)
        .ids(Arc::new(SequentialIds::new()))
        .config(config)
        .build(TenantContext::new("t1", "u1"))
        .await
        .unwrap();
    (orchestrator, monitor)
}

/// Let background tasks run until the queue is empty
async fn wait_for_empty_queue(orch: &SyncOrchestrator) {
    for _ in 0..200 {
        if orch.queue().is_empty().await.unwrap() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("queue never drained");
}

/// Let background tasks run until the orchestrator reaches `phase`
async fn wait_for_phase(orch: &SyncOrchestrator, phase: SyncPhase) {
    for _ in 0..200 {
        if orch.phase() == phase {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("phase {:?} never reached", phase);
}

/// Scenario A: an entry is gone once its TTL has passed
#[tokio::test]
async fn test_cache_entry_expires_after_ttl() {
    let store: Arc<dyn PersistentStore> = Arc::new(MemoryStore::new());
    let clock = ManualClock::new(10_000);
    let cache = CacheManager::new(store.clone(), Arc::new(clock.clone()), CacheConfig::default());
    let key = RequestKey::new("/customers");

    cache
        .set(&key, &json!([{"id": 1}]), Some(Duration::from_millis(1_000)), "t1")
        .await;
    assert!(cache.get::<Value>(&key, "t1").await.is_some());

    clock.advance(Duration::from_millis(1_500));

    assert_eq!(cache.get::<Value>(&key, "t1").await, None);
    assert_eq!(store.get(&key.storage_key()).await.unwrap(), None);
    assert!(cache.is_empty().await);
}

/// Scenario B: offline creates are replayed in order on reconnect
#[tokio::test]
async fn test_reconnect_replays_queue_in_order() {
    let submitter = ScriptedSubmitter::new();
    let (orch, monitor) =
        create_orchestrator(submitter.clone(), NetworkState::Offline, SyncConfig::default()).await;
    orch.start();

    for name in ["first", "second", "third"] {
        let outcome = orch
            .mutate(Operation::Create, "/customers", json!({ "name": name }))
            .await
            .unwrap();
        assert!(outcome.is_queued());
    }
    assert_eq!(submitter.call_count(), 0);

    monitor.report(true);
    wait_for_empty_queue(&orch).await;

    let names: Vec<Value> = submitter
        .calls()
        .into_iter()
        .map(|call| call.payload["name"].clone())
        .collect();
    assert_eq!(names, vec![json!("first"), json!("second"), json!("third")]);
    wait_for_phase(&orch, SyncPhase::Idle).await;

    orch.shutdown();
}

/// Scenario C: an always-failing entry stops after its retry budget
#[tokio::test]
async fn test_retry_budget_is_terminal() {
    let submitter = ScriptedSubmitter::failing();
    let (orch, monitor) =
        create_orchestrator(submitter.clone(), NetworkState::Offline, SyncConfig::default()).await;

    orch.mutate_with(
        Operation::Create,
        "/orders",
        json!({"total": 10}),
        MutationOptions::new().max_retries(2),
    )
    .await
    .unwrap();
    monitor.report(true);

    orch.sync_now().await.unwrap();
    orch.sync_now().await.unwrap();

    let failed = orch.failed_entries().await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].status, QueueStatus::Failed);

    let third = orch.sync_now().await.unwrap();
    assert_eq!(third.attempted, 0);
    assert_eq!(submitter.call_count(), 2);
    assert_eq!(orch.last_report(), Some(third));
}

/// Reconnect immediately followed by a manual trigger runs one pass
#[tokio::test]
async fn test_reconnect_and_manual_trigger_run_one_pass() {
    let submitter = ScriptedSubmitter::new();
    let (orch, monitor) =
        create_orchestrator(submitter.clone(), NetworkState::Offline, SyncConfig::default()).await;
    orch.start();
    orch.mutate(Operation::Update, "/customers/1", json!({"name": "B"}))
        .await
        .unwrap();

    let gate = submitter.install_gate();
    monitor.report(true);
    gate.entered.notified().await;

    assert!(orch.sync_now().await.is_none());
    gate.release.notify_one();

    wait_for_empty_queue(&orch).await;
    assert_eq!(submitter.call_count(), 1);

    orch.shutdown();
}

/// A retryable failure arms the retry timer, which drains the queue
#[tokio::test(start_paused = true)]
async fn test_retry_timer_resubmits_after_delay() {
    let submitter = FlakySubmitter::new(1);
    let config = SyncConfig::new()
        .retry(RetryStrategy::Fixed(Duration::from_secs(5)))
        .reconcile_interval(Duration::from_secs(3_600));
    let (orch, monitor) = create_orchestrator(submitter.clone(), NetworkState::Offline, config).await;
    orch.start();

    orch.mutate(Operation::Delete, "/customers/1", Value::Null)
        .await
        .unwrap();
    monitor.report(true);

    wait_for_phase(&orch, SyncPhase::WaitingRetry).await;
    assert_eq!(submitter.call_count(), 1);
    let pending = orch.pending_entries().await.unwrap();
    assert_eq!(pending[0].retry_count, 1);
    assert_eq!(pending[0].error.as_deref(), Some("503 service unavailable"));

    tokio::time::sleep(Duration::from_secs(6)).await;
    wait_for_empty_queue(&orch).await;
    assert_eq!(submitter.call_count(), 2);
    wait_for_phase(&orch, SyncPhase::Idle).await;

    orch.shutdown();
}

/// Going offline cancels a pending retry
#[tokio::test(start_paused = true)]
async fn test_offline_cancels_retry_timer() {
    let submitter = FlakySubmitter::new(1);
    let config = SyncConfig::new()
        .retry(RetryStrategy::Fixed(Duration::from_secs(5)))
        .reconcile_interval(Duration::from_secs(3_600));
    let (orch, monitor) = create_orchestrator(submitter.clone(), NetworkState::Offline, config).await;
    orch.start();

    orch.mutate(Operation::Create, "/orders", json!({})).await.unwrap();
    monitor.report(true);
    wait_for_phase(&orch, SyncPhase::WaitingRetry).await;

    monitor.report(false);
    wait_for_phase(&orch, SyncPhase::Idle).await;

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(submitter.call_count(), 1);
    assert_eq!(orch.pending_entries().await.unwrap().len(), 1);

    orch.shutdown();
}

/// The periodic timer picks up work no trigger announced
#[tokio::test(start_paused = true)]
async fn test_periodic_reconciliation_drains_queue() {
    let submitter = ScriptedSubmitter::new();
    let config = SyncConfig::new().reconcile_interval(Duration::from_secs(30));
    let (orch, _monitor) = create_orchestrator(submitter.clone(), NetworkState::Online, config).await;
    orch.start();
    tokio::time::sleep(Duration::from_millis(10)).await;

    // Written by another component sharing the store
    orch.queue()
        .enqueue(NewMutation::new(Operation::Create, "/notes", json!({"text": "hi"}), "t1", "u1"))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(25)).await;
    assert_eq!(submitter.call_count(), 0);

    tokio::time::sleep(Duration::from_secs(6)).await;
    wait_for_empty_queue(&orch).await;
    assert_eq!(submitter.call_count(), 1);

    orch.shutdown();
}

/// A platform watch signal drives the monitor and the orchestrator
#[tokio::test]
async fn test_platform_signal_triggers_sync() {
    let submitter = ScriptedSubmitter::new();
    let (orch, monitor) =
        create_orchestrator(submitter.clone(), NetworkState::Offline, SyncConfig::default()).await;
    orch.start();

    let (signal, receiver) = watch::channel(false);
    let follower = monitor.follow(receiver);

    orch.mutate(Operation::Create, "/customers", json!({})).await.unwrap();
    signal.send(true).unwrap();

    wait_for_empty_queue(&orch).await;
    assert!(orch.is_online());

    drop(signal);
    follower.await.unwrap();
    orch.shutdown();
}

/// Direct submissions refresh cached reads of the resource
#[tokio::test]
async fn test_online_mutation_invalidates_cached_reads() {
    let submitter = ScriptedSubmitter::new();
    let (orch, _monitor) =
        create_orchestrator(submitter.clone(), NetworkState::Online, SyncConfig::default()).await;

    let page_one = RequestKey::new("/customers").with_param("page", 1);
    let page_two = RequestKey::new("/customers").with_param("page", 2);
    orch.write(&page_one, &json!(["a"]), None).await;
    orch.write(&page_two, &json!(["b"]), None).await;

    let outcome = orch
        .mutate(Operation::Create, "/customers", json!({"name": "c"}))
        .await
        .unwrap();

    assert_eq!(outcome, MutationOutcome::Submitted(None));
    assert_eq!(orch.read::<Value>(&page_one).await, None);
    assert_eq!(orch.read::<Value>(&page_two).await, None);
}

/// Shutdown stops both the retry timer and the periodic timer
#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_timers() {
    let submitter = FlakySubmitter::new(1);
    let config = SyncConfig::new()
        .retry(RetryStrategy::Fixed(Duration::from_secs(5)))
        .reconcile_interval(Duration::from_secs(30));
    let (orch, monitor) = create_orchestrator(submitter.clone(), NetworkState::Offline, config).await;
    orch.start();

    orch.mutate(Operation::Update, "/customers/1", json!({"name": "B"}))
        .await
        .unwrap();
    monitor.report(true);
    wait_for_phase(&orch, SyncPhase::WaitingRetry).await;
    assert_eq!(submitter.call_count(), 1);

    orch.shutdown();
    assert_eq!(orch.phase(), SyncPhase::Idle);

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(submitter.call_count(), 1);
    assert_eq!(orch.pending_entries().await.unwrap().len(), 1);

    // Connectivity changes after shutdown trigger nothing either
    monitor.report(false);
    monitor.report(true);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(submitter.call_count(), 1);
}

/// A direct submission that fails during a pass is retried after it
#[tokio::test(start_paused = true)]
async fn test_direct_failure_during_pass_arms_retry() {
    let submitter = ScriptedSubmitter::new();
    submitter.fail_resource("/orders");
    let config = SyncConfig::new()
        .retry(RetryStrategy::Fixed(Duration::from_secs(5)))
        .reconcile_interval(Duration::from_secs(3_600));
    let (orch, monitor) = create_orchestrator(submitter.clone(), NetworkState::Offline, config).await;
    orch.start();

    orch.mutate(Operation::Create, "/customers", json!({})).await.unwrap();
    let gate = submitter.install_gate();
    monitor.report(true);
    gate.entered.notified().await;

    let outcome = orch.mutate(Operation::Create, "/orders", json!({})).await.unwrap();
    assert!(outcome.is_queued());

    submitter.heal();
    gate.release.notify_one();
    wait_for_phase(&orch, SyncPhase::WaitingRetry).await;
    assert_eq!(orch.pending_entries().await.unwrap().len(), 1);

    tokio::time::sleep(Duration::from_secs(6)).await;
    wait_for_empty_queue(&orch).await;
    assert_eq!(submitter.call_count(), 3);

    orch.shutdown();
}
