//! Wall-clock and identifier seams
//!
//! Cache expiry and queue ordering both depend on time and ids. Both are
//! injected so tests can drive them deterministically.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Source of epoch-millisecond timestamps
pub trait Clock: Send + Sync {
    /// Current time in milliseconds since the Unix epoch
    fn now_millis(&self) -> u64;
}

/// Clock backed by the system wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Clock that only moves when told to
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<u64>>,
}

impl ManualClock {
    /// Create a clock frozen at `start_millis`
    pub fn new(start_millis: u64) -> Self {
        Self { now: Arc::new(Mutex::new(start_millis)) }
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by.as_millis() as u64;
    }

    /// Jump to an absolute time
    pub fn set(&self, millis: u64) {
        *self.now.lock() = millis;
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        *self.now.lock()
    }
}

/// Source of unique queue entry identifiers
pub trait IdProvider: Send + Sync {
    /// Produce the next identifier; never repeats within a provider
    fn next_id(&self) -> String;
}

/// Monotonic counter ids (`op-000001`, `op-000002`, ...)
#[derive(Debug, Default)]
pub struct SequentialIds {
    next: AtomicU64,
}

impl SequentialIds {
    /// Create a provider whose first id is `op-000001`
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdProvider for SequentialIds {
    fn next_id(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        format!("op-{:06}", n)
    }
}

/// Ids built from the injected clock plus a process-local counter
///
/// Unique across restarts as long as the clock does not go backwards.
pub struct ClockIds {
    clock: Arc<dyn Clock>,
    counter: AtomicU64,
}

impl ClockIds {
    /// Create a provider reading time from `clock`
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock, counter: AtomicU64::new(0) }
    }
}

impl IdProvider for ClockIds {
    fn next_id(&self) -> String {
        let seq = self.counter.fetch_add(1, Ordering::SeqCst);
        format!("{:012x}-{:04x}", self.clock.now_millis(), seq)
    }
}
