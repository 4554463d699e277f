//! Scriptable operation handlers for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::api::OperationHandler;
use crate::context::TenantId;
use crate::errors::EdgeflowError;

/// One recorded invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    /// Tenant the call ran for.
    pub tenant: TenantId,
    /// Parameters after placeholder binding.
    pub params: serde_json::Value,
}

/// An operation that records calls and returns scripted results.
///
/// By default it echoes its parameters as `{"params": ...}`. Queued
/// failures are returned first, one per call, before falling back to the
/// configured output.
#[derive(Debug)]
pub struct MockOperation {
    name: String,
    cache_ttl: Option<Duration>,
    delay: Duration,
    output: Option<serde_json::Value>,
    failures: Mutex<VecDeque<EdgeflowError>>,
    always_fail: Option<EdgeflowError>,
    calls: Mutex<Vec<RecordedCall>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl MockOperation {
    /// Creates an echoing operation.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cache_ttl: None,
            delay: Duration::ZERO,
            output: None,
            failures: Mutex::new(VecDeque::new()),
            always_fail: None,
            calls: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Returns `output` instead of echoing.
    #[must_use]
    pub fn returning(mut self, output: serde_json::Value) -> Self {
        self.output = Some(output);
        self
    }

    /// Sleeps before answering.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Marks the operation cacheable.
    #[must_use]
    pub fn cacheable(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    /// Fails every call with `error`.
    #[must_use]
    pub fn failing(mut self, error: impl Into<EdgeflowError>) -> Self {
        self.always_fail = Some(error.into());
        self
    }

    /// Fails the next call with `error`. Calls queue up in order.
    pub fn fail_next(&self, error: impl Into<EdgeflowError>) {
        self.failures.lock().push_back(error.into());
    }

    /// Number of invocations so far.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// All invocations in order.
    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    /// Parameters of the most recent call.
    #[must_use]
    pub fn last_params(&self) -> Option<serde_json::Value> {
        self.calls.lock().last().map(|c| c.params.clone())
    }

    /// Highest number of overlapping calls observed.
    #[must_use]
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OperationHandler for MockOperation {
    fn name(&self) -> &str {
        &self.name
    }

    fn cache_ttl(&self) -> Option<Duration> {
        self.cache_ttl
    }

    async fn invoke(
        &self,
        tenant: &TenantId,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, EdgeflowError> {
        self.calls.lock().push(RecordedCall {
            tenant: tenant.clone(),
            params: params.clone(),
        });

        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        if let Some(err) = self.failures.lock().pop_front() {
            return Err(err);
        }
        if let Some(err) = &self.always_fail {
            return Err(err.clone());
        }
        Ok(self
            .output
            .clone()
            .unwrap_or_else(|| serde_json::json!({ "params": params })))
    }
}
