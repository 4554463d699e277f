//! Transaction manager: the only sanctioned path for multi-step resource
//! updates.
//!
//! At most one live transaction exists per `(tenant, resource)`. Every
//! operation first checks the deadline; an overdue transaction is expired,
//! discarded upstream and its resource released. When auto-recovery is on,
//! the first operation that observes the expiry opens a replacement and
//! re-stages the modifications.
//!
//! Upstream failures are classified. An upstream expiry mid-operation is
//! repaired once per call by discarding and replaying against a fresh
//! upstream changelist under the same local id.

use super::protocol::{ChangelistProtocol, Modification};
use super::state::TransactionState;
use super::transaction::{ChangelistTransaction, TransactionSnapshot};
use crate::config::ChangelistConfig;
use crate::context::TenantId;
use crate::errors::{
    ConflictError, EdgeflowError, ErrorKind, ExpiredTransactionError, ValidationError,
    ValidationIssue,
};
use crate::recovery::{tags, ErrorClassifier, RecoveryAction, RecoveryContext};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

type ResourceKey = (TenantId, String);

struct ActiveEntry {
    transaction_id: String,
    expires_at: Instant,
}

/// Result of validating staged modifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "issues", rename_all = "snake_case")]
pub enum ValidationOutcome {
    /// Everything staged is valid.
    Valid,
    /// Upstream reported problems; the transaction stays open for fixes.
    Invalid(Vec<ValidationIssue>),
}

impl ValidationOutcome {
    /// Returns true if valid.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }
}

/// Result of [`TransactionManager::apply`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ApplyOutcome {
    /// The changes are live.
    Activated(TransactionSnapshot),
    /// Validation failed; the transaction is left open in `modifying`.
    Invalid {
        /// Transaction to fix and retry.
        transaction_id: String,
        /// Reported problems.
        issues: Vec<ValidationIssue>,
    },
}

#[derive(Clone, Copy)]
enum Step<'a> {
    Stage(&'a Modification),
    Validate,
    Submit,
}

impl Step<'_> {
    fn name(&self) -> &'static str {
        match self {
            Self::Stage(_) => "changelist.stage",
            Self::Validate => "changelist.validate",
            Self::Submit => "changelist.submit",
        }
    }
}

/// Coordinates changelist transactions against a [`ChangelistProtocol`].
pub struct TransactionManager {
    protocol: Arc<dyn ChangelistProtocol>,
    classifier: Arc<ErrorClassifier>,
    expiry: Duration,
    auto_recover: bool,
    transactions: DashMap<String, Arc<Mutex<ChangelistTransaction>>>,
    active: DashMap<ResourceKey, ActiveEntry>,
}

impl TransactionManager {
    /// Creates a manager.
    #[must_use]
    pub fn new(
        protocol: Arc<dyn ChangelistProtocol>,
        classifier: Arc<ErrorClassifier>,
        config: &ChangelistConfig,
    ) -> Self {
        Self {
            protocol,
            classifier,
            expiry: config.expiry(),
            auto_recover: config.auto_recover,
            transactions: DashMap::new(),
            active: DashMap::new(),
        }
    }

    /// Returns the transaction lifetime.
    #[must_use]
    pub fn expiry(&self) -> Duration {
        self.expiry
    }

    /// Returns true if expired transactions are replayed automatically.
    #[must_use]
    pub fn auto_recover(&self) -> bool {
        self.auto_recover
    }

    /// Opens a transaction on a resource.
    ///
    /// # Errors
    ///
    /// Returns [`ConflictError`] if the resource already has a live
    /// transaction for this tenant, or the upstream error if opening fails.
    pub async fn begin(&self, tenant: &TenantId, resource_id: &str) -> Result<String, EdgeflowError> {
        let key: ResourceKey = (tenant.clone(), resource_id.to_string());

        let holder = self
            .active
            .get(&key)
            .map(|e| (e.transaction_id.clone(), e.expires_at));
        if let Some((holder_id, expires_at)) = holder {
            if Instant::now() < expires_at {
                return Err(ConflictError::new(resource_id, holder_id).into());
            }
            // a holder still opening has no record yet and keeps the lock
            let released = match self.handle(&holder_id) {
                Some(handle) => {
                    let mut holder = handle.lock().await;
                    if holder.is_overdue(Instant::now()) {
                        self.expire(&mut holder).await;
                    }
                    holder.state.is_terminal()
                }
                None => false,
            };
            if !released {
                return Err(ConflictError::new(resource_id, holder_id).into());
            }
            self.active
                .remove_if(&key, |_, e| e.transaction_id == holder_id);
        }

        let id = uuid::Uuid::new_v4().to_string();
        match self.active.entry(key.clone()) {
            Entry::Occupied(existing) => {
                return Err(
                    ConflictError::new(resource_id, existing.get().transaction_id.clone()).into(),
                );
            }
            Entry::Vacant(slot) => {
                slot.insert(ActiveEntry {
                    transaction_id: id.clone(),
                    expires_at: Instant::now() + self.expiry,
                });
            }
        }

        let external_id = match self.protocol.open(tenant, resource_id).await {
            Ok(external_id) => external_id,
            Err(err) => {
                self.active.remove_if(&key, |_, e| e.transaction_id == id);
                tracing::warn!(tenant = %tenant, resource = %resource_id, error = %err, "Failed to open changelist");
                return Err(err);
            }
        };

        // the deadline counts from a successful open; the lock follows it
        let expires_at = Instant::now() + self.expiry;
        if let Some(mut entry) = self.active.get_mut(&key) {
            if entry.transaction_id == id {
                entry.expires_at = expires_at;
            }
        }
        let txn = ChangelistTransaction::new(
            id.clone(),
            tenant.clone(),
            resource_id,
            external_id,
            expires_at,
        );
        self.transactions.insert(id.clone(), Arc::new(Mutex::new(txn)));

        tracing::info!(
            tenant = %tenant,
            resource = %resource_id,
            transaction_id = %id,
            "Opened changelist transaction"
        );
        Ok(id)
    }

    /// Stages a modification.
    ///
    /// # Errors
    ///
    /// Returns a validation error for unknown ids or illegal states,
    /// [`ExpiredTransactionError`] past the deadline, or the upstream error.
    pub async fn stage(&self, id: &str, modification: Modification) -> Result<(), EdgeflowError> {
        let handle = self.require_handle(id)?;
        let mut txn = handle.lock().await;
        self.check_live(&mut txn).await?;
        txn.require("stage", &[TransactionState::Created, TransactionState::Modifying])?;

        self.run_step(&mut txn, Step::Stage(&modification)).await?;
        txn.staged.push(modification);
        txn.transition(TransactionState::Modifying)?;
        Ok(())
    }

    /// Validates all staged modifications.
    ///
    /// Upstream validation problems are returned as
    /// [`ValidationOutcome::Invalid`]; the transaction stays in `modifying`.
    ///
    /// # Errors
    ///
    /// Returns a validation error if nothing is staged or the state is
    /// wrong, [`ExpiredTransactionError`] past the deadline, or the upstream
    /// error.
    pub async fn validate(&self, id: &str) -> Result<ValidationOutcome, EdgeflowError> {
        let handle = self.require_handle(id)?;
        let mut txn = handle.lock().await;
        self.check_live(&mut txn).await?;

        if txn.staged.is_empty() {
            return Err(ValidationError::new(format!(
                "Transaction '{id}' has no staged modifications to validate"
            ))
            .into());
        }
        txn.require("validate", &[TransactionState::Modifying, TransactionState::Validated])?;

        let issues = self.run_step(&mut txn, Step::Validate).await?;
        Ok(Self::record_validation(&mut txn, issues)?)
    }

    /// Submits and activates a validated transaction.
    ///
    /// If activation fails and the protocol allows re-submission, the
    /// transaction stays `submitted` and `commit` may be called again.
    /// Otherwise it moves to `failed` with manual recovery steps.
    ///
    /// # Errors
    ///
    /// Returns the failing step's error.
    pub async fn commit(&self, id: &str) -> Result<TransactionSnapshot, EdgeflowError> {
        let handle = self.require_handle(id)?;
        let mut txn = handle.lock().await;
        self.check_live(&mut txn).await?;
        txn.require("commit", &[TransactionState::Validated, TransactionState::Submitted])?;

        self.run_step(&mut txn, Step::Submit).await?;
        txn.transition(TransactionState::Submitted)?;
        txn.transition(TransactionState::Activating)?;

        let external_id = txn.external_id.clone().unwrap_or_default();
        if let Err(err) = self.protocol.activate(&txn.tenant, &external_id).await {
            if self.protocol.allows_resubmit() {
                txn.transition(TransactionState::Submitted)?;
                tracing::warn!(
                    transaction_id = %txn.id,
                    error = %err,
                    "Activation failed; transaction left submitted for retry"
                );
            } else {
                let context = self.context_for(&txn, "changelist.activate");
                let classification = self.classifier.classify(&err, &context);
                let mut steps = vec![format!(
                    "Changelist '{external_id}' was submitted but not activated; activate or discard it upstream"
                )];
                steps.extend(classification.manual_steps());
                txn.manual_steps = steps;
                self.finish(&mut txn, TransactionState::Failed).await;
                tracing::error!(transaction_id = %txn.id, error = %err, "Activation failed");
            }
            return Err(err);
        }

        txn.transition(TransactionState::Active)?;
        self.release(&txn);
        let snapshot = txn.snapshot();
        drop(txn);
        self.transactions.remove(id);

        tracing::info!(
            tenant = %snapshot.tenant,
            resource = %snapshot.resource_id,
            transaction_id = %snapshot.id,
            modifications = snapshot.staged_count,
            "Changelist activated"
        );
        Ok(snapshot)
    }

    /// Discards a transaction from any state. Idempotent.
    ///
    /// Upstream cleanup is best effort; failures are logged.
    ///
    /// # Errors
    ///
    /// Does not fail for unknown or already-terminal ids.
    pub async fn abort(&self, id: &str) -> Result<(), EdgeflowError> {
        let Some(handle) = self.handle(id) else {
            return Ok(());
        };
        let mut txn = handle.lock().await;
        if txn.state.is_terminal() {
            return Ok(());
        }

        self.finish(&mut txn, TransactionState::Discarded).await;
        drop(txn);
        self.transactions.remove(id);
        tracing::info!(transaction_id = %id, "Changelist transaction aborted");
        Ok(())
    }

    /// Runs begin, stage for each modification, validate and commit.
    ///
    /// A validation failure is returned as [`ApplyOutcome::Invalid`] with the
    /// transaction left open. Any other failure aborts the transaction.
    ///
    /// # Errors
    ///
    /// Returns the first failure other than a validation rejection.
    pub async fn apply(
        &self,
        tenant: &TenantId,
        resource_id: &str,
        modifications: Vec<Modification>,
    ) -> Result<ApplyOutcome, EdgeflowError> {
        let id = self.begin(tenant, resource_id).await?;

        match self.drive(&id, modifications).await {
            Ok(outcome) => Ok(outcome),
            Err(EdgeflowError::ExpiredTransaction(expired)) => {
                // auto-recovery already re-staged everything on the replacement
                if let Some(replacement) = expired.replacement_id.clone() {
                    match self.drive(&replacement, Vec::new()).await {
                        Ok(outcome) => return Ok(outcome),
                        Err(err) => {
                            self.abort_quietly(&replacement).await;
                            return Err(err);
                        }
                    }
                }
                Err(expired.into())
            }
            Err(err) => {
                self.abort_quietly(&id).await;
                Err(err)
            }
        }
    }

    async fn drive(
        &self,
        id: &str,
        modifications: Vec<Modification>,
    ) -> Result<ApplyOutcome, EdgeflowError> {
        for modification in modifications {
            self.stage(id, modification).await?;
        }
        match self.validate(id).await? {
            ValidationOutcome::Valid => Ok(ApplyOutcome::Activated(self.commit(id).await?)),
            ValidationOutcome::Invalid(issues) => Ok(ApplyOutcome::Invalid {
                transaction_id: id.to_string(),
                issues,
            }),
        }
    }

    async fn abort_quietly(&self, id: &str) {
        if let Err(err) = self.abort(id).await {
            tracing::warn!(transaction_id = %id, error = %err, "Abort after failure did not complete");
        }
    }

    /// Expires every overdue transaction. Returns how many were expired.
    pub async fn sweep_expired(&self) -> usize {
        let handles: Vec<_> = self
            .transactions
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();

        let mut expired = 0;
        for handle in handles {
            let mut txn = handle.lock().await;
            if txn.is_overdue(Instant::now()) {
                self.expire(&mut txn).await;
                expired += 1;
            }
        }
        if expired > 0 {
            tracing::info!(expired, "Swept expired changelist transactions");
        }
        expired
    }

    /// Drops retained failed and expired transactions.
    pub async fn purge_terminal(&self) -> usize {
        let handles: Vec<_> = self
            .transactions
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();

        let mut purged = 0;
        for (id, handle) in handles {
            if handle.lock().await.state.is_terminal() {
                self.transactions.remove(&id);
                purged += 1;
            }
        }
        purged
    }

    /// Returns a snapshot, expiring the transaction first if it is overdue.
    ///
    /// Committed and aborted transactions are forgotten and return `None`.
    pub async fn snapshot(&self, id: &str) -> Option<TransactionSnapshot> {
        let handle = self.handle(id)?;
        let mut txn = handle.lock().await;
        if txn.is_overdue(Instant::now()) {
            self.expire(&mut txn).await;
        }
        Some(txn.snapshot())
    }

    /// Live transaction id holding a resource, if any.
    #[must_use]
    pub fn active_for(&self, tenant: &TenantId, resource_id: &str) -> Option<String> {
        let key: ResourceKey = (tenant.clone(), resource_id.to_string());
        self.active
            .get(&key)
            .filter(|e| Instant::now() < e.expires_at)
            .map(|e| e.transaction_id.clone())
    }

    /// Number of resources currently held.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Number of tracked transactions, including retained failed and
    /// expired ones.
    #[must_use]
    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    /// Returns true if nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    fn handle(&self, id: &str) -> Option<Arc<Mutex<ChangelistTransaction>>> {
        self.transactions.get(id).map(|e| Arc::clone(e.value()))
    }

    fn require_handle(&self, id: &str) -> Result<Arc<Mutex<ChangelistTransaction>>, EdgeflowError> {
        self.handle(id).ok_or_else(|| {
            EdgeflowError::validation(format!("Unknown changelist transaction '{id}'"))
        })
    }

    fn context_for(&self, txn: &ChangelistTransaction, operation: &str) -> RecoveryContext {
        RecoveryContext::new()
            .with_tenant(txn.tenant.clone())
            .with_operation(operation)
            .with_metadata("transaction_id", serde_json::json!(txn.id))
            .with_metadata("resource_id", serde_json::json!(txn.resource_id))
    }

    fn record_validation(
        txn: &mut ChangelistTransaction,
        issues: Vec<ValidationIssue>,
    ) -> Result<ValidationOutcome, ValidationError> {
        if issues.is_empty() {
            txn.transition(TransactionState::Validated)?;
            Ok(ValidationOutcome::Valid)
        } else {
            txn.transition(TransactionState::Modifying)?;
            tracing::info!(
                transaction_id = %txn.id,
                issues = issues.len(),
                "Changelist validation reported issues"
            );
            Ok(ValidationOutcome::Invalid(issues))
        }
    }

    /// Rejects terminal transactions and expires overdue ones.
    async fn check_live(&self, txn: &mut ChangelistTransaction) -> Result<(), EdgeflowError> {
        if txn.is_overdue(Instant::now()) {
            self.expire(txn).await;
        }

        match txn.state {
            TransactionState::Expired => {
                if self.auto_recover && !txn.recovery_attempted {
                    txn.recovery_attempted = true;
                    match self.replace(txn).await {
                        Ok(replacement) => txn.replaced_by = Some(replacement),
                        Err(err) => tracing::warn!(
                            transaction_id = %txn.id,
                            error = %err,
                            "Could not replace expired changelist"
                        ),
                    }
                }
                let mut err = ExpiredTransactionError::new(&txn.id, &txn.resource_id);
                if let Some(ref replacement) = txn.replaced_by {
                    err = err.with_replacement(replacement);
                }
                Err(err.into())
            }
            state if state.is_terminal() => Err(ValidationError::new(format!(
                "Transaction '{}' is {state}",
                txn.id
            ))
            .into()),
            _ => Ok(()),
        }
    }

    /// Opens a replacement for an expired transaction and re-stages its
    /// modifications.
    async fn replace(&self, expired: &ChangelistTransaction) -> Result<String, EdgeflowError> {
        let new_id = self.begin(&expired.tenant, &expired.resource_id).await?;
        let handle = self.require_handle(&new_id)?;

        let restaged = {
            let mut txn = handle.lock().await;
            txn.replays = expired.replays + 1;
            self.restage(&mut txn, expired.staged.clone()).await
        };
        if let Err(err) = restaged {
            self.abort_quietly(&new_id).await;
            return Err(err);
        }

        tracing::info!(
            expired = %expired.id,
            replacement = %new_id,
            modifications = expired.staged.len(),
            "Replayed expired changelist into a new transaction"
        );
        Ok(new_id)
    }

    async fn restage(
        &self,
        txn: &mut ChangelistTransaction,
        modifications: Vec<Modification>,
    ) -> Result<(), EdgeflowError> {
        let external_id = txn.external_id.clone().unwrap_or_default();
        for modification in modifications {
            self.protocol
                .stage(&txn.tenant, &external_id, &modification)
                .await?;
            txn.staged.push(modification);
            txn.transition(TransactionState::Modifying)?;
        }
        Ok(())
    }

    async fn call_step(
        &self,
        txn: &ChangelistTransaction,
        step: Step<'_>,
    ) -> Result<Vec<ValidationIssue>, EdgeflowError> {
        let external_id = txn.external_id.as_deref().unwrap_or_default();
        match step {
            Step::Stage(modification) => self
                .protocol
                .stage(&txn.tenant, external_id, modification)
                .await
                .map(|()| Vec::new()),
            Step::Validate => self.protocol.validate(&txn.tenant, external_id).await,
            Step::Submit => self
                .protocol
                .submit(&txn.tenant, external_id)
                .await
                .map(|()| Vec::new()),
        }
    }

    /// Calls a protocol step, applying at most one automatic recovery.
    async fn run_step(
        &self,
        txn: &mut ChangelistTransaction,
        step: Step<'_>,
    ) -> Result<Vec<ValidationIssue>, EdgeflowError> {
        let err = match self.call_step(txn, step).await {
            Ok(out) => return Ok(out),
            Err(err) => err,
        };

        match self.recovery_action(txn, step, &err).await {
            Some(RecoveryAction::ReplayTransaction) => {
                if let Err(replay_err) = self.replay_upstream(txn).await {
                    return Err(self.fail(txn, step, replay_err).await);
                }
                if matches!(step, Step::Submit) {
                    // resume at validate
                    let issues = match self.call_step(txn, Step::Validate).await {
                        Ok(issues) => issues,
                        Err(err) => return Err(self.fail(txn, Step::Validate, err).await),
                    };
                    if let ValidationOutcome::Invalid(issues) =
                        Self::record_validation(txn, issues)?
                    {
                        return Err(ValidationError::new(format!(
                            "Replayed transaction '{}' failed validation",
                            txn.id
                        ))
                        .with_issues(issues)
                        .into());
                    }
                }
            }
            Some(RecoveryAction::Retry { .. }) => {}
            _ => return Err(self.fail(txn, step, err).await),
        }

        match self.call_step(txn, step).await {
            Ok(out) => Ok(out),
            Err(err) => Err(self.fail(txn, step, err).await),
        }
    }

    async fn recovery_action(
        &self,
        txn: &ChangelistTransaction,
        step: Step<'_>,
        err: &EdgeflowError,
    ) -> Option<RecoveryAction> {
        if !self.auto_recover {
            return None;
        }
        let context = self.context_for(txn, step.name());
        let classification = self.classifier.classify(err, &context);
        if !classification.can_auto_recover(err, &context) {
            return None;
        }
        let strategy = classification.strategy?;
        match strategy.apply(err, &context).await {
            Ok(action) => {
                tracing::info!(
                    transaction_id = %txn.id,
                    step = step.name(),
                    tag = %classification.tag,
                    strategy = strategy.name(),
                    "Applying changelist recovery"
                );
                Some(action)
            }
            Err(apply_err) => {
                tracing::warn!(transaction_id = %txn.id, error = %apply_err, "Recovery strategy failed");
                None
            }
        }
    }

    /// Discards the upstream changelist, opens a fresh one and re-stages.
    async fn replay_upstream(&self, txn: &mut ChangelistTransaction) -> Result<(), EdgeflowError> {
        if let Some(old) = txn.external_id.take() {
            if let Err(err) = self.protocol.discard(&txn.tenant, &old).await {
                tracing::warn!(transaction_id = %txn.id, external_id = %old, error = %err, "Upstream discard failed during replay");
            }
        }

        let external_id = self.protocol.open(&txn.tenant, &txn.resource_id).await?;
        txn.external_id = Some(external_id);

        let staged = std::mem::take(&mut txn.staged);
        let count = staged.len();
        let restaged = self.restage(txn, staged).await;
        txn.replays += 1;
        restaged?;

        tracing::info!(
            transaction_id = %txn.id,
            replays = txn.replays,
            modifications = count,
            "Replayed changelist after upstream expiry"
        );
        Ok(())
    }

    /// Records an unrecoverable failure; returns the error for the caller.
    async fn fail(
        &self,
        txn: &mut ChangelistTransaction,
        step: Step<'_>,
        err: EdgeflowError,
    ) -> EdgeflowError {
        let context = self.context_for(txn, step.name());
        let classification = self.classifier.classify(&err, &context);

        if classification.tag == tags::CHANGELIST_EXPIRED {
            self.expire(txn).await;
            return ExpiredTransactionError::new(&txn.id, &txn.resource_id).into();
        }
        if classification.transient
            || err.kind() == ErrorKind::Validation
            || classification.tag == tags::VALIDATION
        {
            return err;
        }

        txn.manual_steps = classification.manual_steps();
        self.finish(txn, TransactionState::Failed).await;
        tracing::error!(
            transaction_id = %txn.id,
            step = step.name(),
            tag = %classification.tag,
            error = %err,
            "Changelist transaction failed"
        );
        err
    }

    async fn expire(&self, txn: &mut ChangelistTransaction) {
        tracing::warn!(
            tenant = %txn.tenant,
            resource = %txn.resource_id,
            transaction_id = %txn.id,
            state = %txn.state,
            "Changelist transaction expired"
        );
        self.finish(txn, TransactionState::Expired).await;
    }

    /// Moves to a terminal state, releases the resource and discards
    /// upstream, logging cleanup failures.
    async fn finish(&self, txn: &mut ChangelistTransaction, state: TransactionState) {
        if let Err(err) = txn.transition(state) {
            tracing::debug!(transaction_id = %txn.id, error = %err, "Ignoring terminal transition");
            return;
        }
        self.release(txn);

        if let Some(ref external_id) = txn.external_id {
            if let Err(err) = self.protocol.discard(&txn.tenant, external_id).await {
                tracing::warn!(
                    transaction_id = %txn.id,
                    external_id = %external_id,
                    error = %err,
                    "Upstream changelist cleanup failed"
                );
            }
        }
    }

    fn release(&self, txn: &ChangelistTransaction) {
        let key: ResourceKey = (txn.tenant.clone(), txn.resource_id.clone());
        self.active.remove_if(&key, |_, e| e.transaction_id == txn.id);
    }
}

impl fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionManager")
            .field("expiry", &self.expiry)
            .field("auto_recover", &self.auto_recover)
            .field("transactions", &self.transactions.len())
            .field("active", &self.active.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RecoveryConfig;
    use crate::errors::ApiError;
    use crate::testing::{InMemoryChangelist, ProtocolStep};
    use pretty_assertions::assert_eq;

    fn tenant(id: &str) -> TenantId {
        TenantId::new(id).unwrap()
    }

    fn record(name: &str) -> Modification {
        Modification::new(
            "dns.record.create",
            serde_json::json!({"name": name, "type": "A", "ttl": 300}),
        )
    }

    fn manager_with(fake: &Arc<InMemoryChangelist>, config: &ChangelistConfig) -> TransactionManager {
        TransactionManager::new(
            Arc::clone(fake) as Arc<dyn ChangelistProtocol>,
            Arc::new(ErrorClassifier::with_defaults(&RecoveryConfig::default())),
            config,
        )
    }

    fn setup() -> (Arc<InMemoryChangelist>, TransactionManager) {
        let fake = Arc::new(InMemoryChangelist::new());
        let manager = manager_with(&fake, &ChangelistConfig::default());
        (fake, manager)
    }

    async fn external_id(manager: &TransactionManager, id: &str) -> String {
        manager.snapshot(id).await.unwrap().external_id.unwrap()
    }

    #[tokio::test]
    async fn test_full_lifecycle() {
        let (fake, manager) = setup();
        let acme = tenant("acme");

        let id = manager.begin(&acme, "example.com").await.unwrap();
        let upstream = external_id(&manager, &id).await;
        manager.stage(&id, record("www")).await.unwrap();
        manager.stage(&id, record("api")).await.unwrap();
        assert_eq!(
            manager.snapshot(&id).await.unwrap().state,
            TransactionState::Modifying
        );

        assert_eq!(manager.validate(&id).await.unwrap(), ValidationOutcome::Valid);
        let done = manager.commit(&id).await.unwrap();

        assert_eq!(done.state, TransactionState::Active);
        assert_eq!(done.staged_count, 2);
        assert!(fake.changelist(&upstream).unwrap().active);
        assert!(manager.active_for(&acme, "example.com").is_none());
        assert!(manager.snapshot(&id).await.is_none());
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_begin_conflicts_until_terminal() {
        let (_fake, manager) = setup();
        let acme = tenant("acme");

        let first = manager.begin(&acme, "example.com").await.unwrap();
        let err = manager.begin(&acme, "example.com").await.unwrap_err();
        match err {
            EdgeflowError::Conflict(conflict) => {
                assert_eq!(conflict.existing_transaction_id, first);
                assert_eq!(conflict.resource_id, "example.com");
            }
            other => panic!("expected conflict, got {other:?}"),
        }

        // another tenant may hold the same resource id
        assert!(manager.begin(&tenant("other"), "example.com").await.is_ok());

        manager.abort(&first).await.unwrap();
        assert!(manager.begin(&acme, "example.com").await.is_ok());
    }

    #[tokio::test]
    async fn test_validate_requires_staged_modifications() {
        let (_fake, manager) = setup();
        let id = manager.begin(&tenant("acme"), "example.com").await.unwrap();

        let err = manager.validate(&id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.to_string().contains("no staged modifications"));
    }

    #[tokio::test]
    async fn test_validation_issues_keep_transaction_open() {
        let (fake, manager) = setup();
        let id = manager.begin(&tenant("acme"), "example.com").await.unwrap();
        manager.stage(&id, record("www")).await.unwrap();

        fake.reject_next_validation(vec![ValidationIssue::new("TTL too low").with_field("ttl")]);
        let outcome = manager.validate(&id).await.unwrap();
        assert!(!outcome.is_valid());
        assert_eq!(
            manager.snapshot(&id).await.unwrap().state,
            TransactionState::Modifying
        );

        // commit is illegal until validation passes
        let err = manager.commit(&id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        manager.stage(&id, record("fixed")).await.unwrap();
        assert!(manager.validate(&id).await.unwrap().is_valid());
        assert_eq!(manager.commit(&id).await.unwrap().staged_count, 2);
    }

    #[tokio::test]
    async fn test_stage_after_validation_is_illegal() {
        let (_fake, manager) = setup();
        let id = manager.begin(&tenant("acme"), "example.com").await.unwrap();
        manager.stage(&id, record("www")).await.unwrap();
        manager.validate(&id).await.unwrap();

        let err = manager.stage(&id, record("late")).await.unwrap_err();
        assert!(err.to_string().contains("Cannot stage"));
    }

    #[tokio::test]
    async fn test_activate_failure_leaves_submitted_when_resubmit_allowed() {
        let (fake, manager) = setup();
        let id = manager.begin(&tenant("acme"), "example.com").await.unwrap();
        let upstream = external_id(&manager, &id).await;
        manager.stage(&id, record("www")).await.unwrap();
        manager.validate(&id).await.unwrap();

        fake.fail_next(ProtocolStep::Activate, ApiError::new(500, "activation backend down"));
        assert!(manager.commit(&id).await.is_err());
        assert_eq!(
            manager.snapshot(&id).await.unwrap().state,
            TransactionState::Submitted
        );

        let done = manager.commit(&id).await.unwrap();
        assert_eq!(done.state, TransactionState::Active);
        assert_eq!(fake.changelist(&upstream).unwrap().submissions, 2);
    }

    #[tokio::test]
    async fn test_activate_failure_without_resubmit_fails_with_manual_steps() {
        let fake = Arc::new(InMemoryChangelist::new().with_resubmit(false));
        let manager = manager_with(&fake, &ChangelistConfig::default());
        let acme = tenant("acme");

        let id = manager.begin(&acme, "example.com").await.unwrap();
        manager.stage(&id, record("www")).await.unwrap();
        manager.validate(&id).await.unwrap();

        fake.fail_next(ProtocolStep::Activate, ApiError::new(403, "not allowed"));
        let err = manager.commit(&id).await.unwrap_err();
        assert_eq!(err.status(), Some(403));

        let snapshot = manager.snapshot(&id).await.unwrap();
        assert_eq!(snapshot.state, TransactionState::Failed);
        assert!(snapshot.manual_steps[0].contains("submitted but not activated"));
        assert!(snapshot.manual_steps.len() > 1);
        assert!(manager.active_for(&acme, "example.com").is_none());
    }

    #[tokio::test]
    async fn test_abort_is_idempotent_and_logs_cleanup_failures() {
        let (fake, manager) = setup();
        let acme = tenant("acme");
        let id = manager.begin(&acme, "example.com").await.unwrap();

        fake.fail_next(ProtocolStep::Discard, ApiError::new(500, "cleanup failed"));
        manager.abort(&id).await.unwrap();
        manager.abort(&id).await.unwrap();
        manager.abort("never-existed").await.unwrap();

        assert_eq!(fake.count(ProtocolStep::Discard), 1);
        assert!(manager.active_for(&acme, "example.com").is_none());
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test]
    async fn test_unrecoverable_stage_error_fails_transaction() {
        let (fake, manager) = setup();
        let acme = tenant("acme");
        let id = manager.begin(&acme, "example.com").await.unwrap();

        fake.fail_next(ProtocolStep::Stage, ApiError::new(403, "forbidden"));
        let err = manager.stage(&id, record("www")).await.unwrap_err();
        assert_eq!(err.status(), Some(403));

        let snapshot = manager.snapshot(&id).await.unwrap();
        assert_eq!(snapshot.state, TransactionState::Failed);
        assert!(!snapshot.manual_steps.is_empty());
        assert!(manager.begin(&acme, "example.com").await.is_ok());

        let err = manager.stage(&id, record("again")).await.unwrap_err();
        assert!(err.to_string().contains("failed"));
    }

    #[tokio::test]
    async fn test_upstream_validation_error_keeps_state() {
        let (fake, manager) = setup();
        let id = manager.begin(&tenant("acme"), "example.com").await.unwrap();

        fake.fail_next(ProtocolStep::Stage, ApiError::new(422, "bad record"));
        assert!(manager.stage(&id, record("bad")).await.is_err());
        assert_eq!(
            manager.snapshot(&id).await.unwrap().state,
            TransactionState::Created
        );
        manager.stage(&id, record("good")).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_stage_error_is_retried_once() {
        let (fake, manager) = setup();
        let id = manager.begin(&tenant("acme"), "example.com").await.unwrap();

        fake.fail_next(ProtocolStep::Stage, ApiError::new(429, "slow down").with_retry_after(2));
        manager.stage(&id, record("www")).await.unwrap();
        assert_eq!(fake.count(ProtocolStep::Stage), 2);
        assert_eq!(manager.snapshot(&id).await.unwrap().staged_count, 1);
    }

    #[tokio::test]
    async fn test_upstream_expiry_during_submit_replays_once() {
        let (fake, manager) = setup();
        let id = manager.begin(&tenant("acme"), "example.com").await.unwrap();
        let first_upstream = external_id(&manager, &id).await;
        manager.stage(&id, record("www")).await.unwrap();
        manager.stage(&id, record("api")).await.unwrap();
        manager.validate(&id).await.unwrap();

        fake.fail_next(
            ProtocolStep::Submit,
            ApiError::new(400, "changelist gone").with_code("CHANGELIST_EXPIRED"),
        );
        let done = manager.commit(&id).await.unwrap();

        assert_eq!(done.id, id);
        assert_eq!(done.replays, 1);
        assert_eq!(fake.count(ProtocolStep::Open), 2);
        assert!(fake.changelist(&first_upstream).unwrap().discarded);

        let replayed = fake.changelist(done.external_id.as_deref().unwrap()).unwrap();
        assert_eq!(replayed.staged.len(), 2);
        assert!(replayed.active);
    }

    #[tokio::test]
    async fn test_upstream_expiry_twice_expires_transaction() {
        let (fake, manager) = setup();
        let acme = tenant("acme");
        let id = manager.begin(&acme, "example.com").await.unwrap();

        let expired = || ApiError::new(409, "expired").with_code("changelist_expired");
        fake.fail_next(ProtocolStep::Stage, expired());
        fake.fail_next(ProtocolStep::Stage, expired());

        let err = manager.stage(&id, record("www")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExpiredTransaction);
        assert_eq!(fake.count(ProtocolStep::Open), 2);
        assert!(manager.active_for(&acme, "example.com").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_transaction_expires_and_is_replaced_once() {
        let (fake, manager) = setup();
        let acme = tenant("acme");
        let id = manager.begin(&acme, "example.com").await.unwrap();
        manager.stage(&id, record("www")).await.unwrap();

        tokio::time::advance(Duration::from_secs(1801)).await;

        assert_eq!(
            manager.snapshot(&id).await.unwrap().state,
            TransactionState::Expired
        );
        assert!(manager.active_for(&acme, "example.com").is_none());

        let err = manager.validate(&id).await.unwrap_err();
        let EdgeflowError::ExpiredTransaction(expired) = err else {
            panic!("expected expiry");
        };
        let replacement = expired.replacement_id.expect("replacement opened");

        let snapshot = manager.snapshot(&replacement).await.unwrap();
        assert_eq!(snapshot.state, TransactionState::Modifying);
        assert_eq!(snapshot.staged_count, 1);
        assert_eq!(snapshot.replays, 1);

        // recovery happens once; the old id keeps pointing at the same replacement
        let again = manager.stage(&id, record("late")).await.unwrap_err();
        let EdgeflowError::ExpiredTransaction(again) = again else {
            panic!("expected expiry");
        };
        assert_eq!(again.replacement_id.as_deref(), Some(replacement.as_str()));
        assert_eq!(fake.count(ProtocolStep::Open), 2);

        assert!(manager.validate(&replacement).await.unwrap().is_valid());
        manager.commit(&replacement).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_without_auto_recover() {
        let fake = Arc::new(InMemoryChangelist::new());
        let config = ChangelistConfig::default()
            .with_expiry(Duration::from_secs(60))
            .with_auto_recover(false);
        let manager = manager_with(&fake, &config);
        let acme = tenant("acme");

        let id = manager.begin(&acme, "example.com").await.unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;

        let err = manager.stage(&id, record("www")).await.unwrap_err();
        let EdgeflowError::ExpiredTransaction(expired) = err else {
            panic!("expected expiry");
        };
        assert!(expired.replacement_id.is_none());
        assert_eq!(fake.count(ProtocolStep::Discard), 1);

        assert!(manager.begin(&acme, "example.com").await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_begin_takes_over_overdue_holder() {
        let (_fake, manager) = setup();
        let acme = tenant("acme");
        let old = manager.begin(&acme, "example.com").await.unwrap();

        tokio::time::advance(Duration::from_secs(1801)).await;
        let new = manager.begin(&acme, "example.com").await.unwrap();

        assert_ne!(old, new);
        assert_eq!(manager.active_for(&acme, "example.com"), Some(new));
        assert_eq!(
            manager.snapshot(&old).await.unwrap().state,
            TransactionState::Expired
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_open_keeps_lock_and_deadline_aligned() {
        let fake = Arc::new(InMemoryChangelist::new().with_open_delay(Duration::from_secs(10)));
        let config = ChangelistConfig::default().with_expiry(Duration::from_secs(60));
        let manager = manager_with(&fake, &config);
        let acme = tenant("acme");

        let first = manager.begin(&acme, "example.com").await.unwrap();
        assert_eq!(manager.snapshot(&first).await.unwrap().expires_in_ms, 60_000);

        // past the time open was requested plus expiry, before the deadline
        tokio::time::advance(Duration::from_secs(56)).await;
        let err = manager.begin(&acme, "example.com").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(manager.active_for(&acme, "example.com"), Some(first.clone()));
        manager.stage(&first, record("www")).await.unwrap();
        assert_eq!(fake.count(ProtocolStep::Open), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_holder_still_opening_is_not_taken_over() {
        let fake = Arc::new(InMemoryChangelist::new().with_open_delay(Duration::from_secs(70)));
        let config = ChangelistConfig::default().with_expiry(Duration::from_secs(60));
        let manager = Arc::new(manager_with(&fake, &config));
        let acme = tenant("acme");

        let opening = {
            let manager = Arc::clone(&manager);
            let acme = acme.clone();
            tokio::spawn(async move { manager.begin(&acme, "example.com").await })
        };
        tokio::time::sleep(Duration::from_secs(65)).await;

        let err = manager.begin(&acme, "example.com").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        let first = opening.await.unwrap().unwrap();
        let snapshot = manager.snapshot(&first).await.unwrap();
        assert_eq!(snapshot.state, TransactionState::Created);
        assert_eq!(snapshot.expires_in_ms, 60_000);
        assert_eq!(manager.active_for(&acme, "example.com"), Some(first));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_and_purge() {
        let (_fake, manager) = setup();
        let acme = tenant("acme");
        manager.begin(&acme, "a.com").await.unwrap();
        manager.begin(&acme, "b.com").await.unwrap();

        tokio::time::advance(Duration::from_secs(1801)).await;
        let fresh = manager.begin(&acme, "c.com").await.unwrap();

        assert_eq!(manager.sweep_expired().await, 2);
        assert_eq!(manager.sweep_expired().await, 0);
        assert_eq!(manager.active_count(), 1);

        assert_eq!(manager.purge_terminal().await, 2);
        assert_eq!(manager.len(), 1);
        assert!(manager.snapshot(&fresh).await.is_some());
    }

    #[tokio::test]
    async fn test_apply_happy_path() {
        let (fake, manager) = setup();
        let outcome = manager
            .apply(&tenant("acme"), "example.com", vec![record("www"), record("api")])
            .await
            .unwrap();

        let ApplyOutcome::Activated(snapshot) = outcome else {
            panic!("expected activation");
        };
        assert_eq!(snapshot.staged_count, 2);
        assert_eq!(fake.count(ProtocolStep::Activate), 1);
    }

    #[tokio::test]
    async fn test_apply_returns_validation_issues_as_data() {
        let (fake, manager) = setup();
        fake.reject_next_validation(vec![ValidationIssue::new("duplicate record")]);

        let outcome = manager
            .apply(&tenant("acme"), "example.com", vec![record("www")])
            .await
            .unwrap();

        let ApplyOutcome::Invalid {
            transaction_id,
            issues,
        } = outcome
        else {
            panic!("expected validation issues");
        };
        assert_eq!(issues.len(), 1);
        assert_eq!(
            manager.snapshot(&transaction_id).await.unwrap().state,
            TransactionState::Modifying
        );
    }

    #[tokio::test]
    async fn test_apply_aborts_on_failure() {
        let (fake, manager) = setup();
        let acme = tenant("acme");
        fake.fail_next(ProtocolStep::Submit, ApiError::new(404, "zone missing"));

        let err = manager
            .apply(&acme, "example.com", vec![record("www")])
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(404));
        assert!(manager.active_for(&acme, "example.com").is_none());
    }
}
