//! Scripted in-memory changelist protocol.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use crate::changelist::{ChangelistProtocol, Modification};
use crate::context::TenantId;
use crate::errors::{EdgeflowError, ValidationIssue};

/// A protocol step, for scripting failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolStep {
    /// `open`
    Open,
    /// `stage`
    Stage,
    /// `validate`
    Validate,
    /// `submit`
    Submit,
    /// `activate`
    Activate,
    /// `discard`
    Discard,
}

/// Upstream view of one fake changelist.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FakeChangelist {
    /// Tenant that opened it.
    pub tenant: String,
    /// Resource it protects.
    pub resource_id: String,
    /// Modifications received.
    pub staged: Vec<Modification>,
    /// Submit count.
    pub submissions: usize,
    /// Activated.
    pub active: bool,
    /// Discarded.
    pub discarded: bool,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    lists: HashMap<String, FakeChangelist>,
    calls: Vec<String>,
    failures: HashMap<ProtocolStep, VecDeque<EdgeflowError>>,
    issues: VecDeque<Vec<ValidationIssue>>,
}

/// In-memory [`ChangelistProtocol`] with scriptable failures.
pub struct InMemoryChangelist {
    inner: Mutex<Inner>,
    resubmit: bool,
    open_delay: Duration,
}

impl Default for InMemoryChangelist {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryChangelist {
    /// Creates a fake that accepts everything.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            resubmit: true,
            open_delay: Duration::ZERO,
        }
    }

    /// Sets whether re-submission is allowed.
    #[must_use]
    pub fn with_resubmit(mut self, allowed: bool) -> Self {
        self.resubmit = allowed;
        self
    }

    /// Makes every `open` take `delay` before answering.
    #[must_use]
    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    /// Makes the next call of `step` fail with `error`. Queued per step.
    pub fn fail_next(&self, step: ProtocolStep, error: impl Into<EdgeflowError>) {
        self.inner
            .lock()
            .failures
            .entry(step)
            .or_default()
            .push_back(error.into());
    }

    /// Makes the next `validate` report these issues.
    pub fn reject_next_validation(&self, issues: Vec<ValidationIssue>) {
        self.inner.lock().issues.push_back(issues);
    }

    /// Calls received, as `step:id`.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().calls.clone()
    }

    /// Number of calls of one step.
    #[must_use]
    pub fn count(&self, step: ProtocolStep) -> usize {
        let prefix = format!("{}:", step_name(step));
        self.inner
            .lock()
            .calls
            .iter()
            .filter(|c| c.starts_with(&prefix))
            .count()
    }

    /// Upstream state of a changelist.
    #[must_use]
    pub fn changelist(&self, id: &str) -> Option<FakeChangelist> {
        self.inner.lock().lists.get(id).cloned()
    }

    /// Every changelist ever opened, by id.
    #[must_use]
    pub fn changelists(&self) -> HashMap<String, FakeChangelist> {
        self.inner.lock().lists.clone()
    }

    fn enter(&self, step: ProtocolStep, id: &str) -> Result<(), EdgeflowError> {
        let mut inner = self.inner.lock();
        inner.calls.push(format!("{}:{id}", step_name(step)));
        match inner.failures.get_mut(&step).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn with_list<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut FakeChangelist) -> T,
    ) -> Result<T, EdgeflowError> {
        let mut inner = self.inner.lock();
        inner
            .lists
            .get_mut(id)
            .map(f)
            .ok_or_else(|| EdgeflowError::validation(format!("unknown changelist '{id}'")))
    }
}

fn step_name(step: ProtocolStep) -> &'static str {
    match step {
        ProtocolStep::Open => "open",
        ProtocolStep::Stage => "stage",
        ProtocolStep::Validate => "validate",
        ProtocolStep::Submit => "submit",
        ProtocolStep::Activate => "activate",
        ProtocolStep::Discard => "discard",
    }
}

#[async_trait]
impl ChangelistProtocol for InMemoryChangelist {
    async fn open(&self, tenant: &TenantId, resource_id: &str) -> Result<String, EdgeflowError> {
        if !self.open_delay.is_zero() {
            tokio::time::sleep(self.open_delay).await;
        }
        self.enter(ProtocolStep::Open, resource_id)?;
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = format!("cl-{}", inner.next_id);
        inner.lists.insert(
            id.clone(),
            FakeChangelist {
                tenant: tenant.to_string(),
                resource_id: resource_id.to_string(),
                ..FakeChangelist::default()
            },
        );
        Ok(id)
    }

    async fn stage(
        &self,
        _tenant: &TenantId,
        changelist_id: &str,
        modification: &Modification,
    ) -> Result<(), EdgeflowError> {
        self.enter(ProtocolStep::Stage, changelist_id)?;
        self.with_list(changelist_id, |list| list.staged.push(modification.clone()))
    }

    async fn validate(
        &self,
        _tenant: &TenantId,
        changelist_id: &str,
    ) -> Result<Vec<ValidationIssue>, EdgeflowError> {
        self.enter(ProtocolStep::Validate, changelist_id)?;
        self.with_list(changelist_id, |_| ())?;
        Ok(self.inner.lock().issues.pop_front().unwrap_or_default())
    }

    async fn submit(&self, _tenant: &TenantId, changelist_id: &str) -> Result<(), EdgeflowError> {
        self.enter(ProtocolStep::Submit, changelist_id)?;
        self.with_list(changelist_id, |list| list.submissions += 1)
    }

    async fn activate(&self, _tenant: &TenantId, changelist_id: &str) -> Result<(), EdgeflowError> {
        self.enter(ProtocolStep::Activate, changelist_id)?;
        self.with_list(changelist_id, |list| list.active = true)
    }

    async fn discard(&self, _tenant: &TenantId, changelist_id: &str) -> Result<(), EdgeflowError> {
        self.enter(ProtocolStep::Discard, changelist_id)?;
        self.with_list(changelist_id, |list| list.discarded = true)
    }

    fn allows_resubmit(&self) -> bool {
        self.resubmit
    }
}
