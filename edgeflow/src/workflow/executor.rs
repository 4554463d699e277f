//! Phase-by-phase plan execution.

use super::binding::{self, TaskOutputs};
use super::plan::{ExecutionPlan, Phase, PlannedTask};
use super::result::{PhaseTiming, TaskResult, WorkflowResult};
use crate::changelist::{ApplyOutcome, Modification, TransactionManager};
use crate::config::WorkflowConfig;
use crate::context::TenantId;
use crate::core::{TaskStatus, WorkflowStatus};
use crate::errors::{EdgeflowError, TimeoutError, UnknownError, ValidationError};
use crate::observability::{task_span, workflow_span, SpanTimer};
use crate::recovery::{ErrorClassifier, RecoveryAction, RecoveryContext};
use crate::runner::OperationRunner;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::Instrument;
use uuid::Uuid;

/// Per-run options.
#[derive(Debug, Clone, Default)]
pub struct WorkflowOptions {
    /// Tenant to run for; falls back to the orchestrator's resolver.
    pub tenant: Option<TenantId>,
    /// Classify critical failures and apply automatic fixes.
    pub auto_recover: bool,
    /// Concurrent tasks per phase; falls back to configuration.
    pub max_concurrency: Option<usize>,
    /// Build the plan and report every task skipped without invoking any.
    pub dry_run: bool,
}

impl WorkflowOptions {
    /// Default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Options for a tenant.
    #[must_use]
    pub fn for_tenant(tenant: TenantId) -> Self {
        Self {
            tenant: Some(tenant),
            ..Self::default()
        }
    }

    /// Enables or disables automatic recovery.
    #[must_use]
    pub fn with_auto_recover(mut self, enabled: bool) -> Self {
        self.auto_recover = enabled;
        self
    }

    /// Caps concurrency within a phase.
    #[must_use]
    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit);
        self
    }

    /// Turns the run into a dry run.
    #[must_use]
    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }
}

/// Runs execution plans.
///
/// Phases run strictly in order. Tasks inside a phase are spawned onto the
/// runtime and bounded by a semaphore. A failed critical task stops the run
/// and every task that has not started is reported skipped.
#[derive(Clone)]
pub struct WorkflowExecutor {
    runner: OperationRunner,
    transactions: Option<Arc<TransactionManager>>,
    classifier: Arc<ErrorClassifier>,
    config: WorkflowConfig,
}

impl WorkflowExecutor {
    /// Creates an executor without changelist support.
    #[must_use]
    pub fn new(runner: OperationRunner, classifier: Arc<ErrorClassifier>, config: WorkflowConfig) -> Self {
        Self {
            runner,
            transactions: None,
            classifier,
            config,
        }
    }

    /// Enables changelist-bound tasks.
    #[must_use]
    pub fn with_transactions(mut self, transactions: Arc<TransactionManager>) -> Self {
        self.transactions = Some(transactions);
        self
    }

    /// Executor configuration.
    #[must_use]
    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    /// Runs `plan` for `tenant`. Failures are reported in the result.
    pub async fn execute(
        &self,
        plan: &ExecutionPlan,
        tenant: &TenantId,
        options: &WorkflowOptions,
    ) -> WorkflowResult {
        let run_id = Uuid::new_v4();
        let span = workflow_span(&plan.workflow, &run_id.to_string(), tenant.as_str());
        self.run(plan, tenant, options, run_id).instrument(span).await
    }

    async fn run(
        &self,
        plan: &ExecutionPlan,
        tenant: &TenantId,
        options: &WorkflowOptions,
        run_id: Uuid,
    ) -> WorkflowResult {
        let timer = SpanTimer::start(format!("workflow:{}", plan.workflow));
        let mut tasks: Vec<TaskResult> = plan
            .tasks
            .iter()
            .map(|t| TaskResult::pending(&t.id, &t.operation, t.phase, t.critical))
            .collect();
        let position: HashMap<String, usize> = plan
            .tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id.clone(), i))
            .collect();

        let mut result = WorkflowResult {
            workflow: plan.workflow.clone(),
            run_id,
            tenant: tenant.clone(),
            status: WorkflowStatus::Success,
            tasks: Vec::new(),
            timings_by_phase: Vec::new(),
            failed_task: None,
            error: None,
            suggestion: None,
            manual_steps: Vec::new(),
            recovery_attempts: 0,
            duration_ms: 0.0,
            dry_run: options.dry_run,
        };

        if options.dry_run {
            tasks.iter_mut().for_each(TaskResult::skip);
            tracing::info!(tasks = tasks.len(), "Dry run; no task invoked");
            result.tasks = tasks;
            result.duration_ms = timer.finish();
            return result;
        }

        let limit = options
            .max_concurrency
            .unwrap_or(self.config.max_concurrency)
            .max(1);
        let semaphore = Arc::new(Semaphore::new(limit));
        let mut outputs = TaskOutputs::new();
        let mut failed_at: Option<usize> = None;

        for phase in &plan.phases {
            let phase_timer = SpanTimer::start(format!("phase:{}", phase.index));
            tracing::info!(phase = phase.index, tasks = phase.tasks.len(), "Phase started");

            let snapshot = Arc::new(outputs.clone());
            let batch: Vec<&PlannedTask> = phase.tasks.iter().filter_map(|id| plan.task(id)).collect();
            for finished in self.run_batch(&batch, tenant, &snapshot, &semaphore).await {
                store(&mut tasks, &position, finished);
            }

            let mut critical = first_critical_failure(phase, &tasks, &position);
            if options.auto_recover {
                let mut rounds = 0;
                while let Some(i) = critical {
                    if rounds >= self.config.max_recovery_attempts {
                        break;
                    }
                    if !self.recover(&tasks[i], tenant, rounds).await {
                        break;
                    }
                    rounds += 1;
                    result.recovery_attempts += 1;

                    let retry: Vec<&PlannedTask> = phase
                        .tasks
                        .iter()
                        .filter(|id| position.get(*id).is_some_and(|&p| tasks[p].is_failed()))
                        .filter_map(|id| plan.task(id))
                        .collect();
                    tracing::info!(phase = phase.index, tasks = retry.len(), "Retrying failed tasks after recovery");
                    for mut finished in self.run_batch(&retry, tenant, &snapshot, &semaphore).await {
                        if let Some(&p) = position.get(&finished.task_id) {
                            finished.attempts += tasks[p].attempts;
                            finished.duration_ms += tasks[p].duration_ms;
                        }
                        store(&mut tasks, &position, finished);
                    }
                    critical = first_critical_failure(phase, &tasks, &position);
                }
            }

            for id in &phase.tasks {
                if let Some(task) = position.get(id).map(|&p| &tasks[p]) {
                    if let (TaskStatus::Success, Some(output)) = (task.status, &task.output) {
                        outputs.insert(id.clone(), output.clone());
                    }
                }
            }

            let duration_ms = phase_timer.finish();
            tracing::info!(phase = phase.index, duration_ms, "Phase finished");
            result.timings_by_phase.push(PhaseTiming {
                index: phase.index,
                tasks: phase.tasks.clone(),
                duration_ms,
            });

            if critical.is_some() {
                failed_at = critical;
                break;
            }
        }

        if let Some(i) = failed_at {
            tasks.iter_mut().for_each(TaskResult::skip);
            let trigger = &tasks[i];
            tracing::warn!(
                task = %trigger.task_id,
                classification = trigger.classification.as_deref().unwrap_or("unknown"),
                "Critical task failed; remaining tasks skipped"
            );
            result.status = WorkflowStatus::Failed;
            result.failed_task = Some(trigger.task_id.clone());
            result.error = trigger.error.clone();
            result.suggestion = trigger.suggestion.clone();
            result.manual_steps = trigger
                .suggestion
                .as_ref()
                .map(|s| s.manual_steps.clone())
                .unwrap_or_default();
        } else if tasks.iter().any(TaskResult::is_failed) {
            result.status = WorkflowStatus::SuccessWithWarnings;
        }

        result.tasks = tasks;
        result.duration_ms = timer.finish();
        tracing::info!(
            status = %result.status,
            succeeded = result.succeeded().len(),
            failed = result.failed().len(),
            skipped = result.skipped().len(),
            duration_ms = result.duration_ms,
            "Workflow finished"
        );
        result
    }

    /// Classifies a critical failure and applies its strategy if it can run
    /// unattended. Returns true if the failed tasks should be retried.
    async fn recover(&self, failed: &TaskResult, tenant: &TenantId, attempts: u32) -> bool {
        let Some(error) = &failed.error else {
            return false;
        };
        let context = RecoveryContext::new()
            .with_tenant(tenant.clone())
            .with_operation(&failed.operation)
            .with_task(&failed.task_id)
            .with_attempt(attempts + 1);
        let classification = self.classifier.classify(error, &context);

        if !classification.can_auto_recover(error, &context) {
            tracing::debug!(task = %failed.task_id, tag = %classification.tag, "No automatic recovery");
            return false;
        }
        let Some(strategy) = classification.strategy else {
            return false;
        };

        match strategy.apply(error, &context).await {
            Ok(RecoveryAction::Manual { .. }) => false,
            Ok(action) => {
                tracing::info!(
                    task = %failed.task_id,
                    strategy = strategy.name(),
                    action = ?action,
                    "Applied recovery strategy"
                );
                true
            }
            Err(err) => {
                tracing::warn!(task = %failed.task_id, strategy = strategy.name(), error = %err, "Recovery strategy failed");
                false
            }
        }
    }

    async fn run_batch(
        &self,
        batch: &[&PlannedTask],
        tenant: &TenantId,
        outputs: &Arc<TaskOutputs>,
        semaphore: &Arc<Semaphore>,
    ) -> Vec<TaskResult> {
        let mut running = FuturesUnordered::new();

        for task in batch {
            let this = self.clone();
            let task = (*task).clone();
            let tenant = tenant.clone();
            let outputs = Arc::clone(outputs);
            let semaphore = Arc::clone(semaphore);
            let fallback = TaskResult::pending(&task.id, &task.operation, task.phase, task.critical);
            let span = task_span(&task.id, &task.operation);

            let handle = tokio::spawn(
                async move {
                    // the semaphore is never closed
                    let _permit = semaphore.acquire_owned().await.ok();
                    this.run_task(task, &tenant, &outputs).await
                }
                .instrument(span),
            );
            running.push(handle.map(move |joined| {
                joined.unwrap_or_else(|err| {
                    let mut result = fallback;
                    result.status = TaskStatus::Failed;
                    result.attempts = 1;
                    result.error = Some(UnknownError::new(format!("Task panicked: {err}")).into());
                    result
                })
            }));
        }

        let mut finished = Vec::with_capacity(batch.len());
        while let Some(result) = running.next().await {
            finished.push(result);
        }
        finished
    }

    async fn run_task(&self, task: PlannedTask, tenant: &TenantId, outputs: &TaskOutputs) -> TaskResult {
        let timer = SpanTimer::start(task.id.clone());
        let mut result = TaskResult::pending(&task.id, &task.operation, task.phase, task.critical);
        result.status = TaskStatus::Running;

        let bound = binding::bind_outputs(&task.params, outputs).and_then(|params| {
            let resource = task
                .changelist
                .as_ref()
                .map(|cl| binding::bind_str(&cl.resource, outputs))
                .transpose()?;
            Ok((params, resource))
        });
        let (params, resource) = match bound {
            Ok(bound) => bound,
            Err(err) => {
                self.fail(&mut result, tenant, err.into());
                result.duration_ms = timer.finish();
                return result;
            }
        };

        loop {
            result.attempts += 1;
            match self.dispatch(&task, tenant, params.clone(), resource.as_deref()).await {
                Ok(output) => {
                    result.status = TaskStatus::Success;
                    result.output = Some(output);
                    break;
                }
                Err(err) => {
                    let context = RecoveryContext::new()
                        .with_tenant(tenant.clone())
                        .with_operation(&task.operation)
                        .with_task(&task.id)
                        .with_attempt(result.attempts);
                    let classification = self.classifier.classify(&err, &context);
                    if classification.transient && task.retry.allows_retry_after(result.attempts) {
                        let delay = task.retry.delay_for(result.attempts);
                        tracing::debug!(
                            task = %task.id,
                            attempt = result.attempts,
                            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                            error = %err,
                            "Retrying transient failure"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    self.fail(&mut result, tenant, err);
                    break;
                }
            }
        }

        result.duration_ms = timer.finish();
        result
    }

    fn fail(&self, result: &mut TaskResult, tenant: &TenantId, error: EdgeflowError) {
        let context = RecoveryContext::new()
            .with_tenant(tenant.clone())
            .with_operation(&result.operation)
            .with_task(&result.task_id)
            .with_attempt(result.attempts.max(1));
        let classification = self.classifier.classify(&error, &context);
        tracing::warn!(
            task = %result.task_id,
            operation = %result.operation,
            critical = result.critical,
            attempts = result.attempts,
            tag = %classification.tag,
            error = %error,
            "Task failed"
        );
        result.status = TaskStatus::Failed;
        result.error = Some(error);
        result.classification = Some(classification.tag);
        result.suggestion = classification.suggestion;
    }

    async fn dispatch(
        &self,
        task: &PlannedTask,
        tenant: &TenantId,
        params: serde_json::Value,
        resource: Option<&str>,
    ) -> Result<serde_json::Value, EdgeflowError> {
        let call = self.call(task, tenant, params, resource);
        match task.timeout().or_else(|| self.config.default_task_timeout()) {
            Some(limit) => tokio::time::timeout(limit, call).await.unwrap_or_else(|_| {
                Err(TimeoutError::new(
                    &task.operation,
                    u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                )
                .into())
            }),
            None => call.await,
        }
    }

    async fn call(
        &self,
        task: &PlannedTask,
        tenant: &TenantId,
        params: serde_json::Value,
        resource: Option<&str>,
    ) -> Result<serde_json::Value, EdgeflowError> {
        let Some(resource) = resource else {
            let value = self.runner.run(tenant, &task.operation, params).await?;
            return Ok(Arc::try_unwrap(value).unwrap_or_else(|shared| (*shared).clone()));
        };

        let transactions = self.transactions.as_ref().ok_or_else(|| {
            ValidationError::new(format!(
                "Task '{}' modifies '{resource}' but no changelist protocol is configured",
                task.id
            ))
        })?;

        let modification = Modification::new(&task.operation, params);
        match transactions.apply(tenant, resource, vec![modification]).await? {
            ApplyOutcome::Activated(snapshot) => {
                self.runner.cache().on_operation_completed(&task.operation, tenant);
                serde_json::to_value(&snapshot)
                    .map_err(|e| UnknownError::new(format!("Cannot encode transaction snapshot: {e}")).into())
            }
            ApplyOutcome::Invalid {
                transaction_id,
                issues,
            } => {
                if let Err(err) = transactions.abort(&transaction_id).await {
                    tracing::warn!(transaction_id = %transaction_id, error = %err, "Abort of rejected changelist failed");
                }
                Err(ValidationError::new(format!("Changelist on '{resource}' failed validation"))
                    .with_issues(issues)
                    .into())
            }
        }
    }
}

impl fmt::Debug for WorkflowExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowExecutor")
            .field("runner", &self.runner)
            .field("changelists", &self.transactions.is_some())
            .field("config", &self.config)
            .finish()
    }
}

fn store(tasks: &mut [TaskResult], position: &HashMap<String, usize>, finished: TaskResult) {
    if let Some(&p) = position.get(&finished.task_id) {
        tasks[p] = finished;
    }
}

fn first_critical_failure(
    phase: &Phase,
    tasks: &[TaskResult],
    position: &HashMap<String, usize>,
) -> Option<usize> {
    phase
        .tasks
        .iter()
        .filter_map(|id| position.get(id).copied())
        .find(|&p| tasks[p].critical && tasks[p].is_failed())
}
