//! Declarative workflow templates.

use super::retry::RetryPolicy;
use crate::errors::ValidationError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Routes a task through the changelist transaction manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangelistBinding {
    /// Target resource id. May contain placeholders.
    pub resource: String,
}

/// One task of a workflow template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskTemplate {
    /// Unique id within the template.
    pub id: String,
    /// Name of the registered operation to invoke.
    pub operation: String,
    /// Parameters, possibly containing `${...}` placeholders.
    #[serde(default)]
    pub params: serde_json::Value,
    /// Ids of tasks that must finish first.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// A failed critical task stops the workflow.
    #[serde(default = "default_critical")]
    pub critical: bool,
    /// Per-task timeout.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Retry policy for transient failures.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Present when the task modifies a changelist-protected resource.
    #[serde(default)]
    pub changelist: Option<ChangelistBinding>,
}

fn default_critical() -> bool {
    true
}

impl TaskTemplate {
    /// Creates a critical task with no parameters or dependencies.
    #[must_use]
    pub fn new(id: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            operation: operation.into(),
            params: serde_json::Value::Null,
            depends_on: Vec::new(),
            critical: true,
            timeout_ms: None,
            retry: RetryPolicy::default(),
            changelist: None,
        }
    }

    /// Sets the parameters.
    #[must_use]
    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    /// Adds dependencies.
    #[must_use]
    pub fn depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(ids.into_iter().map(Into::into));
        self
    }

    /// Marks the task optional.
    #[must_use]
    pub fn optional(mut self) -> Self {
        self.critical = false;
        self
    }

    /// Sets the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Routes the task through a changelist on `resource`.
    #[must_use]
    pub fn with_changelist(mut self, resource: impl Into<String>) -> Self {
        self.changelist = Some(ChangelistBinding {
            resource: resource.into(),
        });
        self
    }
}

/// A named, ordered list of tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    /// Template name used for lookup.
    pub name: String,
    /// Free-form description.
    #[serde(default)]
    pub description: Option<String>,
    /// Tasks in declaration order.
    #[serde(default)]
    pub tasks: Vec<TaskTemplate>,
}

impl WorkflowTemplate {
    /// Creates an empty template.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            tasks: Vec::new(),
        }
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Appends a task.
    #[must_use]
    pub fn task(mut self, task: TaskTemplate) -> Self {
        self.tasks.push(task);
        self
    }

    /// Parses a template from JSON.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the JSON does not describe a template.
    pub fn from_json_str(json: &str) -> Result<Self, ValidationError> {
        serde_json::from_str(json)
            .map_err(|e| ValidationError::new(format!("Invalid workflow template: {e}")))
    }
}

/// Named templates available to the orchestrator.
#[derive(Default)]
pub struct TemplateRegistry {
    templates: RwLock<HashMap<String, Arc<WorkflowTemplate>>>,
}

impl TemplateRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a template under its name, replacing any previous one.
    pub fn register(&self, template: WorkflowTemplate) {
        tracing::debug!(workflow = %template.name, tasks = template.tasks.len(), "Registered workflow template");
        self.templates
            .write()
            .insert(template.name.clone(), Arc::new(template));
    }

    /// Parses and registers a JSON template, returning its name.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the JSON is not a template.
    pub fn load_json(&self, json: &str) -> Result<String, ValidationError> {
        let template = WorkflowTemplate::from_json_str(json)?;
        let name = template.name.clone();
        self.register(template);
        Ok(name)
    }

    /// Looks a template up by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<WorkflowTemplate>> {
        self.templates.read().get(name).cloned()
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.templates.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of templates.
    #[must_use]
    pub fn len(&self) -> usize {
        self.templates.read().len()
    }

    /// Returns true if no templates are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.templates.read().is_empty()
    }
}

impl fmt::Debug for TemplateRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TemplateRegistry")
            .field("templates", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_builder() {
        let template = WorkflowTemplate::new("onboard")
            .with_description("Create a property")
            .task(TaskTemplate::new("a", "contract.list"))
            .task(
                TaskTemplate::new("b", "property.create")
                    .depends_on(["a"])
                    .optional()
                    .with_timeout(Duration::from_secs(2)),
            );

        assert_eq!(template.tasks.len(), 2);
        assert!(template.tasks[0].critical);
        assert!(!template.tasks[1].critical);
        assert_eq!(template.tasks[1].depends_on, vec!["a".to_string()]);
        assert_eq!(template.tasks[1].timeout_ms, Some(2000));
    }

    #[test]
    fn test_json_defaults() {
        let template = WorkflowTemplate::from_json_str(
            r#"{
                "name": "dns",
                "tasks": [
                    {"id": "zone", "operation": "zone.get", "params": {"zone": "${params.zone}"}},
                    {"id": "rec", "operation": "record.create", "depends_on": ["zone"],
                     "changelist": {"resource": "${params.zone}"}, "retry": {"max_attempts": 2}}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(template.name, "dns");
        assert!(template.tasks[0].critical);
        assert_eq!(template.tasks[0].retry, RetryPolicy::default());
        assert_eq!(
            template.tasks[1].changelist,
            Some(ChangelistBinding {
                resource: "${params.zone}".to_string()
            })
        );
        assert_eq!(template.tasks[1].retry.max_attempts, 2);
    }

    #[test]
    fn test_invalid_json() {
        let err = WorkflowTemplate::from_json_str(r#"{"tasks": 3}"#).unwrap_err();
        assert!(err.message.contains("Invalid workflow template"));
    }

    #[test]
    fn test_registry() {
        let registry = TemplateRegistry::new();
        assert!(registry.is_empty());

        registry.register(WorkflowTemplate::new("b"));
        let name = registry
            .load_json(r#"{"name": "a", "tasks": []}"#)
            .unwrap();
        assert_eq!(name, "a");

        assert_eq!(registry.names(), vec!["a".to_string(), "b".to_string()]);
        assert!(registry.get("a").is_some());
        assert!(registry.get("missing").is_none());
    }
}
