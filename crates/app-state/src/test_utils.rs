//! Test doubles for the application-owned collaborators
//!
//! Scripted submitters and fetchers that record every call, shared by unit
//! and integration tests.

#![allow(dead_code)]

use anyhow::anyhow;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use storage::Operation;
use tokio::sync::Notify;

use crate::accessor::Fetcher;
use crate::mutation::MutationSubmitter;

/// One recorded submission
#[derive(Debug, Clone, PartialEq)]
pub struct SubmittedCall {
    /// Operation submitted
    pub operation: Operation,
    /// Target resource
    pub resource: String,
    /// Payload sent
    pub payload: Value,
}

/// Submitter whose outcome is scripted per resource
#[derive(Default)]
pub struct ScriptedSubmitter {
    calls: Mutex<Vec<SubmittedCall>>,
    failing: Mutex<HashSet<String>>,
    failing_ops: Mutex<HashSet<Operation>>,
    fail_all: AtomicBool,
    response: Mutex<Option<Value>>,
    gate: Mutex<Option<Gate>>,
}

/// Pauses a submission until released
#[derive(Clone, Default)]
pub struct Gate {
    /// Signalled when a submission reaches the gate
    pub entered: Arc<Notify>,
    /// Signal to let the submission continue
    pub release: Arc<Notify>,
}

impl ScriptedSubmitter {
    /// Submitter that accepts everything
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Submitter that rejects everything
    pub fn failing() -> Arc<Self> {
        let submitter = Self::default();
        submitter.fail_all.store(true, Ordering::SeqCst);
        Arc::new(submitter)
    }

    /// Reject submissions for one resource
    pub fn fail_resource(&self, resource: &str) {
        self.failing.lock().insert(resource.to_string());
    }

    /// Reject submissions of one operation kind
    pub fn fail_operation(&self, operation: Operation) {
        self.failing_ops.lock().insert(operation);
    }

    /// Accept every submission again
    pub fn heal(&self) {
        self.failing.lock().clear();
        self.failing_ops.lock().clear();
        self.fail_all.store(false, Ordering::SeqCst);
    }

    /// Return `value` from successful submissions
    pub fn respond_with(&self, value: Value) {
        *self.response.lock() = Some(value);
    }

    /// Hold the next submission at a gate
    pub fn install_gate(&self) -> Gate {
        let gate = Gate::default();
        *self.gate.lock() = Some(gate.clone());
        gate
    }

    /// All calls so far, in order
    pub fn calls(&self) -> Vec<SubmittedCall> {
        self.calls.lock().clone()
    }

    /// Number of calls so far
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl MutationSubmitter for ScriptedSubmitter {
    async fn submit(
        &self,
        operation: Operation,
        resource: &str,
        payload: &Value,
    ) -> anyhow::Result<Option<Value>> {
        self.calls.lock().push(SubmittedCall {
            operation,
            resource: resource.to_string(),
            payload: payload.clone(),
        });

        let gate = self.gate.lock().take();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }

        let rejected = self.fail_all.load(Ordering::SeqCst)
            || self.failing.lock().contains(resource)
            || self.failing_ops.lock().contains(&operation);
        if rejected {
            return Err(anyhow!("server rejected {} {}", operation, resource));
        }
        Ok(self.response.lock().clone())
    }
}

/// Fetcher returning a fixed value, optionally failing
pub struct StaticFetcher {
    value: Mutex<Value>,
    fail: AtomicBool,
    calls: AtomicUsize,
}

impl StaticFetcher {
    /// Fetcher that returns `value`
    pub fn new(value: Value) -> Arc<Self> {
        Arc::new(Self {
            value: Mutex::new(value),
            fail: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        })
    }

    /// Change the value returned by later fetches
    pub fn set_value(&self, value: Value) {
        *self.value.lock() = value;
    }

    /// Make fetches fail or succeed
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Number of fetches so far
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher<Value> for StaticFetcher {
    async fn fetch(&self) -> anyhow::Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow!("origin unavailable"));
        }
        Ok(self.value.lock().clone())
    }
}
