//! Recovery strategies bound to error patterns.

use crate::context::TenantId;
use crate::errors::EdgeflowError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Where a failure happened, passed to the classifier and strategies.
#[derive(Debug, Clone, Default)]
pub struct RecoveryContext {
    /// Tenant the failing call ran for.
    pub tenant: Option<TenantId>,
    /// Operation name, if known.
    pub operation: Option<String>,
    /// Workflow task id, if the failure came from a task.
    pub task_id: Option<String>,
    /// 1-based attempt number of the failing call.
    pub attempt: u32,
    /// Free-form details.
    pub metadata: HashMap<String, serde_json::Value>,
}

impl RecoveryContext {
    /// Creates an empty context for a first attempt.
    #[must_use]
    pub fn new() -> Self {
        Self {
            attempt: 1,
            ..Self::default()
        }
    }

    /// Sets the tenant.
    #[must_use]
    pub fn with_tenant(mut self, tenant: TenantId) -> Self {
        self.tenant = Some(tenant);
        self
    }

    /// Sets the operation name.
    #[must_use]
    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    /// Sets the task id.
    #[must_use]
    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    /// Sets the attempt number.
    #[must_use]
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// What the caller should do after a strategy has been applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Run the failed call again. The strategy already waited `waited_ms`.
    Retry {
        /// Time spent waiting before returning.
        waited_ms: u64,
    },
    /// Discard the changelist and replay its staged modifications.
    ReplayTransaction,
    /// No automatic fix; a human has to follow these steps.
    Manual {
        /// Ordered steps.
        steps: Vec<String>,
    },
}

/// A fix for one class of failures.
#[async_trait]
pub trait RecoveryStrategy: Send + Sync + fmt::Debug {
    /// Strategy name used in logs.
    fn name(&self) -> &str;

    /// Returns true if `apply` can fix this failure without a human.
    ///
    /// Must not have side effects.
    fn can_auto_recover(&self, error: &EdgeflowError, context: &RecoveryContext) -> bool;

    /// Performs the fix. Call at most once per failure.
    async fn apply(
        &self,
        error: &EdgeflowError,
        context: &RecoveryContext,
    ) -> Result<RecoveryAction, EdgeflowError>;
}

/// Waits, then asks the caller to retry.
///
/// Honors a server `retry-after` hint when the error carries one.
#[derive(Debug, Clone)]
pub struct WaitAndRetry {
    base_delay: Duration,
    max_wait: Duration,
}

impl WaitAndRetry {
    /// Creates a new strategy.
    #[must_use]
    pub fn new(base_delay: Duration, max_wait: Duration) -> Self {
        Self {
            base_delay,
            max_wait,
        }
    }

    /// Returns how long `apply` will wait for this error.
    #[must_use]
    pub fn delay_for(&self, error: &EdgeflowError) -> Duration {
        let hinted = match error {
            EdgeflowError::Api(api) => api.retry_after_seconds.map(Duration::from_secs),
            _ => None,
        };
        hinted.unwrap_or(self.base_delay).min(self.max_wait)
    }
}

#[async_trait]
impl RecoveryStrategy for WaitAndRetry {
    fn name(&self) -> &str {
        "wait_and_retry"
    }

    fn can_auto_recover(&self, _error: &EdgeflowError, _context: &RecoveryContext) -> bool {
        true
    }

    async fn apply(
        &self,
        error: &EdgeflowError,
        context: &RecoveryContext,
    ) -> Result<RecoveryAction, EdgeflowError> {
        let delay = self.delay_for(error);
        let waited_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        tracing::debug!(
            operation = context.operation.as_deref().unwrap_or(""),
            delay_ms = waited_ms,
            "Waiting before retry"
        );
        tokio::time::sleep(delay).await;
        Ok(RecoveryAction::Retry { waited_ms })
    }
}

/// Discards an expired changelist and replays its modifications.
///
/// The replay itself is done by the transaction manager; this strategy only
/// signals it.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardAndReplay;

#[async_trait]
impl RecoveryStrategy for DiscardAndReplay {
    fn name(&self) -> &str {
        "discard_and_replay"
    }

    fn can_auto_recover(&self, _error: &EdgeflowError, _context: &RecoveryContext) -> bool {
        true
    }

    async fn apply(
        &self,
        _error: &EdgeflowError,
        _context: &RecoveryContext,
    ) -> Result<RecoveryAction, EdgeflowError> {
        Ok(RecoveryAction::ReplayTransaction)
    }
}

/// Never auto-recovers; returns manual steps.
#[derive(Debug, Clone, Default)]
pub struct ManualSteps {
    steps: Vec<String>,
}

impl ManualSteps {
    /// Creates a strategy returning the given steps.
    #[must_use]
    pub fn new(steps: Vec<String>) -> Self {
        Self { steps }
    }

    /// Returns the steps.
    #[must_use]
    pub fn steps(&self) -> &[String] {
        &self.steps
    }
}

#[async_trait]
impl RecoveryStrategy for ManualSteps {
    fn name(&self) -> &str {
        "manual_steps"
    }

    fn can_auto_recover(&self, _error: &EdgeflowError, _context: &RecoveryContext) -> bool {
        false
    }

    async fn apply(
        &self,
        _error: &EdgeflowError,
        _context: &RecoveryContext,
    ) -> Result<RecoveryAction, EdgeflowError> {
        Ok(RecoveryAction::Manual {
            steps: self.steps.clone(),
        })
    }
}
