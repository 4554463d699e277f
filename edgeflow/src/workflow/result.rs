//! Workflow and task results.

use crate::context::TenantId;
use crate::core::{TaskStatus, WorkflowStatus};
use crate::errors::EdgeflowError;
use crate::recovery::RecoverySuggestion;
use serde::Serialize;
use uuid::Uuid;

/// Outcome of one task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskResult {
    /// Task id.
    pub task_id: String,
    /// Operation name.
    pub operation: String,
    /// Final status.
    pub status: TaskStatus,
    /// Output on success.
    pub output: Option<serde_json::Value>,
    /// Failure on error.
    pub error: Option<EdgeflowError>,
    /// Classifier tag of the failure.
    pub classification: Option<String>,
    /// Remediation hint for the failure.
    pub suggestion: Option<RecoverySuggestion>,
    /// Attempts made, including retries.
    pub attempts: u32,
    /// Wall time across attempts.
    pub duration_ms: f64,
    /// Phase index.
    pub phase: usize,
    /// Critical flag copied from the plan.
    pub critical: bool,
}

impl TaskResult {
    pub(crate) fn pending(
        task_id: impl Into<String>,
        operation: impl Into<String>,
        phase: usize,
        critical: bool,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            operation: operation.into(),
            status: TaskStatus::Pending,
            output: None,
            error: None,
            classification: None,
            suggestion: None,
            attempts: 0,
            duration_ms: 0.0,
            phase,
            critical,
        }
    }

    pub(crate) fn skip(&mut self) {
        if !self.status.is_terminal() {
            self.status = TaskStatus::Skipped;
        }
    }

    /// Returns true on success.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Returns true if the task failed.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.status == TaskStatus::Failed
    }
}

/// Duration of one phase.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseTiming {
    /// Phase index.
    pub index: usize,
    /// Tasks in the phase.
    pub tasks: Vec<String>,
    /// Wall time of the phase, including recovery retries.
    pub duration_ms: f64,
}

/// Aggregated outcome of a workflow run.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowResult {
    /// Template name.
    pub workflow: String,
    /// Unique id of this run.
    pub run_id: Uuid,
    /// Tenant the run executed for.
    pub tenant: TenantId,
    /// Overall status.
    pub status: WorkflowStatus,
    /// Per-task results in declaration order.
    pub tasks: Vec<TaskResult>,
    /// Timings of the phases that ran.
    pub timings_by_phase: Vec<PhaseTiming>,
    /// Task whose failure stopped the run.
    pub failed_task: Option<String>,
    /// The triggering error.
    pub error: Option<EdgeflowError>,
    /// Remediation hint for the triggering error.
    pub suggestion: Option<RecoverySuggestion>,
    /// Steps a human has to take when no automatic fix applies.
    pub manual_steps: Vec<String>,
    /// Automatic recoveries applied.
    pub recovery_attempts: u32,
    /// Total wall time.
    pub duration_ms: f64,
    /// True when nothing was invoked.
    pub dry_run: bool,
}

impl WorkflowResult {
    /// Result for a task id.
    #[must_use]
    pub fn task(&self, id: &str) -> Option<&TaskResult> {
        self.tasks.iter().find(|t| t.task_id == id)
    }

    /// Output of a successful task.
    #[must_use]
    pub fn output(&self, id: &str) -> Option<&serde_json::Value> {
        self.task(id).and_then(|t| t.output.as_ref())
    }

    /// Returns true unless a critical task failed.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Ids of tasks with the given status, declaration order.
    #[must_use]
    pub fn with_status(&self, status: TaskStatus) -> Vec<&str> {
        self.tasks
            .iter()
            .filter(|t| t.status == status)
            .map(|t| t.task_id.as_str())
            .collect()
    }

    /// Ids of succeeded tasks.
    #[must_use]
    pub fn succeeded(&self) -> Vec<&str> {
        self.with_status(TaskStatus::Success)
    }

    /// Ids of failed tasks.
    #[must_use]
    pub fn failed(&self) -> Vec<&str> {
        self.with_status(TaskStatus::Failed)
    }

    /// Ids of skipped tasks.
    #[must_use]
    pub fn skipped(&self) -> Vec<&str> {
        self.with_status(TaskStatus::Skipped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result_with(tasks: Vec<TaskResult>) -> WorkflowResult {
        WorkflowResult {
            workflow: "w".to_string(),
            run_id: Uuid::new_v4(),
            tenant: TenantId::new("acme").unwrap(),
            status: WorkflowStatus::Failed,
            tasks,
            timings_by_phase: Vec::new(),
            failed_task: None,
            error: None,
            suggestion: None,
            manual_steps: Vec::new(),
            recovery_attempts: 0,
            duration_ms: 0.0,
            dry_run: false,
        }
    }

    #[test]
    fn test_skip_leaves_terminal_tasks() {
        let mut done = TaskResult::pending("a", "op", 0, true);
        done.status = TaskStatus::Success;
        done.skip();
        assert_eq!(done.status, TaskStatus::Success);

        let mut waiting = TaskResult::pending("b", "op", 1, true);
        waiting.skip();
        assert_eq!(waiting.status, TaskStatus::Skipped);
    }

    #[test]
    fn test_status_views() {
        let mut a = TaskResult::pending("a", "op", 0, true);
        a.status = TaskStatus::Success;
        a.output = Some(serde_json::json!({"v": 1}));
        let mut b = TaskResult::pending("b", "op", 1, true);
        b.status = TaskStatus::Failed;
        let mut c = TaskResult::pending("c", "op", 2, true);
        c.skip();

        let result = result_with(vec![a, b, c]);
        assert_eq!(result.succeeded(), vec!["a"]);
        assert_eq!(result.failed(), vec!["b"]);
        assert_eq!(result.skipped(), vec!["c"]);
        assert_eq!(result.output("a").unwrap()["v"], 1);
        assert!(result.output("b").is_none());
    }

    #[test]
    fn test_serializes_statuses() {
        let mut a = TaskResult::pending("a", "op", 0, false);
        a.skip();
        let json = serde_json::to_value(result_with(vec![a])).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["tasks"][0]["status"], "skipped");
    }
}
