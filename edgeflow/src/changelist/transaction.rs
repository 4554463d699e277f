//! Transaction records and read-only snapshots.

use super::protocol::Modification;
use super::state::TransactionState;
use crate::context::TenantId;
use crate::errors::ValidationError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

pub(crate) struct ChangelistTransaction {
    pub(crate) id: String,
    pub(crate) tenant: TenantId,
    pub(crate) resource_id: String,
    pub(crate) external_id: Option<String>,
    pub(crate) state: TransactionState,
    pub(crate) staged: Vec<Modification>,
    pub(crate) opened_at: DateTime<Utc>,
    pub(crate) started: Instant,
    pub(crate) expires_at: Instant,
    pub(crate) replays: u32,
    pub(crate) manual_steps: Vec<String>,
    pub(crate) recovery_attempted: bool,
    pub(crate) replaced_by: Option<String>,
}

impl ChangelistTransaction {
    pub(crate) fn new(
        id: String,
        tenant: TenantId,
        resource_id: impl Into<String>,
        external_id: String,
        expires_at: Instant,
    ) -> Self {
        let started = Instant::now();
        Self {
            id,
            tenant,
            resource_id: resource_id.into(),
            external_id: Some(external_id),
            state: TransactionState::Created,
            staged: Vec::new(),
            opened_at: Utc::now(),
            started,
            expires_at,
            replays: 0,
            manual_steps: Vec::new(),
            recovery_attempted: false,
            replaced_by: None,
        }
    }

    pub(crate) fn is_overdue(&self, now: Instant) -> bool {
        !self.state.is_terminal() && now >= self.expires_at
    }

    /// Moves to `next`, rejecting illegal transitions.
    pub(crate) fn transition(&mut self, next: TransactionState) -> Result<(), ValidationError> {
        if !self.state.can_transition_to(next) {
            return Err(ValidationError::new(format!(
                "Transaction '{}' cannot move from {} to {}",
                self.id, self.state, next
            )));
        }
        tracing::debug!(
            transaction_id = %self.id,
            resource = %self.resource_id,
            from = %self.state,
            to = %next,
            "Changelist transition"
        );
        self.state = next;
        Ok(())
    }

    /// Requires the current state to be one of `allowed`.
    pub(crate) fn require(
        &self,
        action: &str,
        allowed: &[TransactionState],
    ) -> Result<(), ValidationError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(ValidationError::new(format!(
                "Cannot {action} transaction '{}' in state {}",
                self.id, self.state
            )))
        }
    }

    pub(crate) fn snapshot(&self) -> TransactionSnapshot {
        let now = Instant::now();
        TransactionSnapshot {
            id: self.id.clone(),
            tenant: self.tenant.clone(),
            resource_id: self.resource_id.clone(),
            external_id: self.external_id.clone(),
            state: self.state,
            staged_count: self.staged.len(),
            opened_at: self.opened_at,
            age_ms: u64::try_from(now.duration_since(self.started).as_millis()).unwrap_or(u64::MAX),
            expires_in_ms: u64::try_from(self.expires_at.saturating_duration_since(now).as_millis())
                .unwrap_or(u64::MAX),
            replays: self.replays,
            manual_steps: self.manual_steps.clone(),
            replaced_by: self.replaced_by.clone(),
        }
    }
}

/// Read-only view of a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionSnapshot {
    /// Local transaction id.
    pub id: String,
    /// Owning tenant.
    pub tenant: TenantId,
    /// Protected resource.
    pub resource_id: String,
    /// Current upstream changelist id.
    pub external_id: Option<String>,
    /// Current state.
    pub state: TransactionState,
    /// Number of staged modifications.
    pub staged_count: usize,
    /// Wall-clock open time.
    pub opened_at: DateTime<Utc>,
    /// Time since `begin`.
    pub age_ms: u64,
    /// Time left before the deadline, 0 once passed.
    pub expires_in_ms: u64,
    /// Upstream discard-and-replay count.
    pub replays: u32,
    /// Steps for a human when the transaction failed.
    pub manual_steps: Vec<String>,
    /// Transaction opened to replace this one after expiry.
    pub replaced_by: Option<String>,
}
