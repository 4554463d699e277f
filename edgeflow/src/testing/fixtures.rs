//! Ready-made templates and registries.

use std::sync::Arc;

use super::mocks::MockOperation;
use crate::api::{OperationHandler, OperationRegistry};
use crate::context::TenantId;
use crate::workflow::{TaskTemplate, WorkflowTemplate};

/// Builds a tenant id, panicking on an empty string.
#[must_use]
pub fn tenant(id: &str) -> TenantId {
    TenantId::new(id).unwrap_or_else(|err| panic!("invalid fixture tenant: {err}"))
}

/// `A; B <- A; C <- A; D <- B, C` with operations `op.a` .. `op.d`.
#[must_use]
pub fn diamond_template() -> WorkflowTemplate {
    WorkflowTemplate::new("diamond")
        .task(TaskTemplate::new("A", "op.a"))
        .task(TaskTemplate::new("B", "op.b").depends_on(["A"]))
        .task(TaskTemplate::new("C", "op.c").depends_on(["A"]))
        .task(TaskTemplate::new("D", "op.d").depends_on(["B", "C"]))
}

/// `width` independent roots followed by `depth - 1` layers, each task
/// depending on every task of the previous layer. Operations are `op.L.I`.
#[must_use]
pub fn layered_template(name: &str, depth: usize, width: usize) -> WorkflowTemplate {
    let mut template = WorkflowTemplate::new(name);
    for layer in 0..depth {
        for i in 0..width {
            let mut task = TaskTemplate::new(format!("t{layer}_{i}"), format!("op.{layer}.{i}"));
            if layer > 0 {
                task = task.depends_on((0..width).map(|j| format!("t{}_{j}", layer - 1)));
            }
            template = template.task(task);
        }
    }
    template
}

/// Registers echoing mocks for each name and returns them in order.
#[must_use]
pub fn echo_operations(
    registry: &OperationRegistry,
    names: &[&str],
) -> Vec<Arc<MockOperation>> {
    names
        .iter()
        .map(|name| {
            let op = Arc::new(MockOperation::new(*name));
            registry.register(Arc::clone(&op) as Arc<dyn OperationHandler>);
            op
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::build_plan;

    #[test]
    fn test_layered_template_shape() {
        let template = layered_template("grid", 3, 4);
        assert_eq!(template.tasks.len(), 12);

        let plan = build_plan(&template, &serde_json::json!({})).unwrap();
        assert_eq!(plan.phases.len(), 3);
        assert!(plan.phases.iter().all(|p| p.tasks.len() == 4));
    }

    #[test]
    fn test_echo_operations_registers() {
        let registry = OperationRegistry::new();
        let ops = echo_operations(&registry, &["a", "b"]);
        assert_eq!(ops.len(), 2);
        assert_eq!(registry.names(), vec!["a".to_string(), "b".to_string()]);
    }
}
