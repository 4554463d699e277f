//! Turning a template into an ordered execution plan.

use super::binding;
use super::retry::RetryPolicy;
use super::template::{ChangelistBinding, WorkflowTemplate};
use crate::errors::{CyclicDependencyError, EdgeflowError, ValidationError};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// A task with its workflow parameters bound.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedTask {
    /// Task id.
    pub id: String,
    /// Operation name.
    pub operation: String,
    /// Parameters; only `${task.*}` placeholders remain.
    pub params: serde_json::Value,
    /// Direct dependencies.
    pub depends_on: Vec<String>,
    /// Critical flag.
    pub critical: bool,
    /// Timeout in milliseconds.
    pub timeout_ms: Option<u64>,
    /// Retry policy.
    pub retry: RetryPolicy,
    /// Changelist routing with the resource's parameters bound.
    pub changelist: Option<ChangelistBinding>,
    /// Phase this task runs in.
    pub phase: usize,
}

impl PlannedTask {
    /// The timeout as a duration.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Tasks that run together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Phase {
    /// Zero-based position.
    pub index: usize,
    /// Task ids in declaration order.
    pub tasks: Vec<String>,
}

/// Ordered phases over a validated task graph.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionPlan {
    /// Template name.
    pub workflow: String,
    /// Tasks in declaration order.
    pub tasks: Vec<PlannedTask>,
    /// Phases in execution order.
    pub phases: Vec<Phase>,
}

impl ExecutionPlan {
    /// Looks a task up by id.
    #[must_use]
    pub fn task(&self, id: &str) -> Option<&PlannedTask> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// Phase task ids as plain vectors.
    #[must_use]
    pub fn phase_ids(&self) -> Vec<Vec<&str>> {
        self.phases
            .iter()
            .map(|p| p.tasks.iter().map(String::as_str).collect())
            .collect()
    }

    /// Number of tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Returns true if the plan has no tasks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Validates `template`, binds `params` and groups tasks into phases.
///
/// Phase `n` holds every task whose dependencies all sit in phases `< n`.
/// Inside a phase tasks keep declaration order, so the same input always
/// yields the same plan.
///
/// # Errors
///
/// - [`ValidationError`] for an empty template, duplicate ids, unknown or
///   self dependencies, missing parameters, malformed placeholders, and
///   placeholders referencing a task that is not an ancestor.
/// - [`CyclicDependencyError`] with the cycle path when dependencies loop.
pub fn build_plan(
    template: &WorkflowTemplate,
    params: &serde_json::Value,
) -> Result<ExecutionPlan, EdgeflowError> {
    if template.tasks.is_empty() {
        return Err(ValidationError::new(format!(
            "Workflow '{}' has no tasks",
            template.name
        ))
        .into());
    }

    let mut deps: HashMap<&str, &[String]> = HashMap::with_capacity(template.tasks.len());
    for task in &template.tasks {
        if task.id.is_empty() {
            return Err(ValidationError::new("Task id must not be empty").into());
        }
        if deps.insert(task.id.as_str(), task.depends_on.as_slice()).is_some() {
            return Err(ValidationError::new(format!("Duplicate task id '{}'", task.id)).into());
        }
    }

    for task in &template.tasks {
        for dep in &task.depends_on {
            if dep == &task.id {
                return Err(ValidationError::new(format!(
                    "Task '{}' depends on itself",
                    task.id
                ))
                .into());
            }
            if !deps.contains_key(dep.as_str()) {
                return Err(ValidationError::new(format!(
                    "Task '{}' depends on unknown task '{}'",
                    task.id, dep
                ))
                .into());
            }
        }
    }

    if let Some(cycle) = find_cycle(template, &deps) {
        return Err(CyclicDependencyError::new(cycle).into());
    }

    let phase_of = assign_phases(template, &deps);

    let mut tasks = Vec::with_capacity(template.tasks.len());
    for task in &template.tasks {
        let bound = binding::bind_params(&task.params, params)?;
        let changelist = task
            .changelist
            .as_ref()
            .map(|cl| -> Result<ChangelistBinding, ValidationError> {
                let resource = binding::bind_params(
                    &serde_json::Value::String(cl.resource.clone()),
                    params,
                )?;
                Ok(ChangelistBinding {
                    resource: match resource {
                        serde_json::Value::String(s) => s,
                        other => other.to_string(),
                    },
                })
            })
            .transpose()?;

        let ancestors = ancestors_of(&task.id, &deps);
        let mut referenced = binding::task_references(&bound)?;
        if let Some(cl) = &changelist {
            referenced.extend(binding::task_references(&serde_json::Value::String(
                cl.resource.clone(),
            ))?);
        }
        for reference in referenced {
            if !ancestors.contains(reference.as_str()) {
                return Err(ValidationError::new(format!(
                    "Task '{}' references '{}' which is not one of its dependencies",
                    task.id, reference
                ))
                .into());
            }
        }

        tasks.push(PlannedTask {
            id: task.id.clone(),
            operation: task.operation.clone(),
            params: bound,
            depends_on: task.depends_on.clone(),
            critical: task.critical,
            timeout_ms: task.timeout_ms,
            retry: task.retry.clone(),
            changelist,
            phase: phase_of.get(task.id.as_str()).copied().unwrap_or_default(),
        });
    }

    let phase_count = phase_of.values().copied().max().map_or(0, |m| m + 1);
    let phases = (0..phase_count)
        .map(|index| Phase {
            index,
            tasks: tasks
                .iter()
                .filter(|t| t.phase == index)
                .map(|t| t.id.clone())
                .collect(),
        })
        .collect();

    let plan = ExecutionPlan {
        workflow: template.name.clone(),
        tasks,
        phases,
    };
    tracing::debug!(
        workflow = %plan.workflow,
        tasks = plan.tasks.len(),
        phases = plan.phases.len(),
        "Built execution plan"
    );
    Ok(plan)
}

/// Layered Kahn sort: each round takes every remaining task whose
/// dependencies were placed in earlier rounds.
fn assign_phases<'a>(
    template: &'a WorkflowTemplate,
    deps: &HashMap<&'a str, &'a [String]>,
) -> HashMap<&'a str, usize> {
    let mut phase_of: HashMap<&str, usize> = HashMap::with_capacity(template.tasks.len());
    let mut remaining: Vec<&str> = template.tasks.iter().map(|t| t.id.as_str()).collect();
    let mut round = 0;

    while !remaining.is_empty() {
        let ready: Vec<&str> = remaining
            .iter()
            .copied()
            .filter(|id| {
                deps.get(id)
                    .is_some_and(|ds| ds.iter().all(|d| phase_of.contains_key(d.as_str())))
            })
            .collect();
        if ready.is_empty() {
            // unreachable once cycles are rejected
            break;
        }
        for id in &ready {
            phase_of.insert(*id, round);
        }
        remaining.retain(|id| !ready.contains(id));
        round += 1;
    }

    phase_of
}

fn find_cycle(template: &WorkflowTemplate, deps: &HashMap<&str, &[String]>) -> Option<Vec<String>> {
    let mut visited = HashSet::new();
    let mut on_stack = HashSet::new();
    let mut path = Vec::new();

    for task in &template.tasks {
        if !visited.contains(task.id.as_str()) {
            if let Some(cycle) = dfs_cycle(&task.id, deps, &mut visited, &mut on_stack, &mut path) {
                return Some(cycle);
            }
        }
    }
    None
}

fn dfs_cycle<'a>(
    node: &'a str,
    deps: &HashMap<&'a str, &'a [String]>,
    visited: &mut HashSet<&'a str>,
    on_stack: &mut HashSet<&'a str>,
    path: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    visited.insert(node);
    on_stack.insert(node);
    path.push(node);

    for dep in deps.get(node).copied().unwrap_or_default() {
        let dep = dep.as_str();
        if on_stack.contains(dep) {
            let start = path.iter().position(|n| *n == dep).unwrap_or(0);
            let mut cycle: Vec<String> = path[start..].iter().map(|s| (*s).to_string()).collect();
            cycle.push(dep.to_string());
            return Some(cycle);
        }
        if !visited.contains(dep) {
            if let Some(cycle) = dfs_cycle(dep, deps, visited, on_stack, path) {
                return Some(cycle);
            }
        }
    }

    path.pop();
    on_stack.remove(node);
    None
}

fn ancestors_of<'a>(id: &str, deps: &HashMap<&'a str, &'a [String]>) -> HashSet<&'a str> {
    let mut seen = HashSet::new();
    let mut stack: Vec<&str> = deps
        .get(id)
        .map(|ds| ds.iter().map(String::as_str).collect())
        .unwrap_or_default();

    while let Some(next) = stack.pop() {
        if seen.insert(next) {
            if let Some(ds) = deps.get(next) {
                stack.extend(ds.iter().map(String::as_str));
            }
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::workflow::template::TaskTemplate;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn diamond() -> WorkflowTemplate {
        WorkflowTemplate::new("diamond")
            .task(TaskTemplate::new("A", "op.a"))
            .task(TaskTemplate::new("B", "op.b").depends_on(["A"]))
            .task(TaskTemplate::new("C", "op.c").depends_on(["A"]))
            .task(TaskTemplate::new("D", "op.d").depends_on(["B", "C"]))
    }

    #[test]
    fn test_diamond_phases() {
        let plan = build_plan(&diamond(), &json!({})).unwrap();
        assert_eq!(plan.phase_ids(), vec![vec!["A"], vec!["B", "C"], vec!["D"]]);
        assert_eq!(plan.task("D").unwrap().phase, 2);
    }

    #[test]
    fn test_declaration_order_tie_break() {
        let template = WorkflowTemplate::new("order")
            .task(TaskTemplate::new("z", "op"))
            .task(TaskTemplate::new("late", "op").depends_on(["a"]))
            .task(TaskTemplate::new("a", "op"))
            .task(TaskTemplate::new("m", "op"));

        let first = build_plan(&template, &json!({})).unwrap();
        let second = build_plan(&template, &json!({})).unwrap();

        assert_eq!(first.phase_ids(), vec![vec!["z", "a", "m"], vec!["late"]]);
        assert_eq!(first, second);
        assert_eq!(
            first.tasks.iter().map(|t| t.id.as_str()).collect::<Vec<_>>(),
            vec!["z", "late", "a", "m"]
        );
    }

    #[test]
    fn test_dependencies_in_earlier_phases() {
        let template = WorkflowTemplate::new("deep")
            .task(TaskTemplate::new("e", "op").depends_on(["d", "a"]))
            .task(TaskTemplate::new("a", "op"))
            .task(TaskTemplate::new("b", "op").depends_on(["a"]))
            .task(TaskTemplate::new("c", "op").depends_on(["b"]))
            .task(TaskTemplate::new("d", "op").depends_on(["c", "a"]));

        let plan = build_plan(&template, &json!({})).unwrap();
        for task in &plan.tasks {
            for dep in &task.depends_on {
                assert!(plan.task(dep).unwrap().phase < task.phase);
            }
        }
        assert_eq!(plan.phases.len(), 5);
    }

    #[test]
    fn test_cycle_rejected_with_path() {
        let template = WorkflowTemplate::new("loop")
            .task(TaskTemplate::new("a", "op").depends_on(["c"]))
            .task(TaskTemplate::new("b", "op").depends_on(["a"]))
            .task(TaskTemplate::new("c", "op").depends_on(["b"]));

        let err = build_plan(&template, &json!({})).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CyclicDependency);
        let EdgeflowError::CyclicDependency(cycle) = err else {
            panic!("expected a cycle error");
        };
        assert_eq!(cycle.cycle_path, vec!["a", "c", "b", "a"]);
    }

    #[test]
    fn test_structural_validation() {
        let empty = WorkflowTemplate::new("empty");
        assert_eq!(build_plan(&empty, &json!({})).unwrap_err().kind(), ErrorKind::Validation);

        let dup = WorkflowTemplate::new("dup")
            .task(TaskTemplate::new("a", "op"))
            .task(TaskTemplate::new("a", "op"));
        assert!(build_plan(&dup, &json!({}))
            .unwrap_err()
            .to_string()
            .contains("Duplicate task id 'a'"));

        let unknown = WorkflowTemplate::new("unknown")
            .task(TaskTemplate::new("a", "op").depends_on(["ghost"]));
        assert!(build_plan(&unknown, &json!({}))
            .unwrap_err()
            .to_string()
            .contains("unknown task 'ghost'"));

        let selfdep =
            WorkflowTemplate::new("self").task(TaskTemplate::new("a", "op").depends_on(["a"]));
        assert!(build_plan(&selfdep, &json!({}))
            .unwrap_err()
            .to_string()
            .contains("depends on itself"));
    }

    #[test]
    fn test_params_bound_at_build_time() {
        let template = WorkflowTemplate::new("dns")
            .task(TaskTemplate::new("zone", "zone.get").with_params(json!({"zone": "${params.zone}"})))
            .task(
                TaskTemplate::new("rec", "record.create")
                    .depends_on(["zone"])
                    .with_params(json!({"zone": "${zone.name}", "ttl": "${params.ttl}"}))
                    .with_changelist("${params.zone}"),
            );

        let plan = build_plan(&template, &json!({"zone": "example.com", "ttl": 60})).unwrap();
        assert_eq!(plan.task("zone").unwrap().params, json!({"zone": "example.com"}));
        assert_eq!(
            plan.task("rec").unwrap().params,
            json!({"zone": "${zone.name}", "ttl": 60})
        );
        assert_eq!(
            plan.task("rec").unwrap().changelist.as_ref().unwrap().resource,
            "example.com"
        );

        let err = build_plan(&template, &json!({"ttl": 60})).unwrap_err();
        assert!(err.to_string().contains("Missing workflow parameter 'zone'"));
    }

    #[test]
    fn test_placeholder_text_in_parameter_values_is_literal() {
        let template = WorkflowTemplate::new("txt")
            .task(TaskTemplate::new("a", "op"))
            .task(
                TaskTemplate::new("rec", "record.create")
                    .depends_on(["a"])
                    .with_params(json!({"rdata": "${params.txt}"})),
            );

        let spf = build_plan(&template, &json!({"txt": "v=spf1 ${x}"})).unwrap();
        assert!(binding::task_references(&spf.task("rec").unwrap().params)
            .unwrap()
            .is_empty());

        let sneaky = build_plan(&template, &json!({"txt": "${a.secret}"})).unwrap();
        let mut outputs = binding::TaskOutputs::new();
        outputs.insert("a", json!({"secret": "hunter2"}));
        let dispatched =
            binding::bind_outputs(&sneaky.task("rec").unwrap().params, &outputs).unwrap();
        assert_eq!(dispatched, json!({"rdata": "${a.secret}"}));
    }

    #[test]
    fn test_reference_must_be_ancestor() {
        let transitive = WorkflowTemplate::new("ok")
            .task(TaskTemplate::new("a", "op"))
            .task(TaskTemplate::new("b", "op").depends_on(["a"]))
            .task(TaskTemplate::new("c", "op").depends_on(["b"]).with_params(json!({"x": "${a.id}"})));
        assert!(build_plan(&transitive, &json!({})).is_ok());

        let sibling = WorkflowTemplate::new("bad")
            .task(TaskTemplate::new("a", "op"))
            .task(TaskTemplate::new("b", "op").with_params(json!({"x": "${a.id}"})));
        let err = build_plan(&sibling, &json!({})).unwrap_err();
        assert!(err.to_string().contains("not one of its dependencies"));
    }
}
