//! Dependency-graph workflows.
//!
//! A [`WorkflowTemplate`] is expanded by [`build_plan`] into an
//! [`ExecutionPlan`] of ordered phases, which a [`WorkflowExecutor`] runs.

mod binding;
mod executor;
mod plan;
mod result;
mod retry;
mod template;


pub use binding::{bind_outputs, bind_params, lookup, task_references, Reference, TaskOutputs};
pub use executor::{WorkflowExecutor, WorkflowOptions};
pub use plan::{build_plan, ExecutionPlan, Phase, PlannedTask};
pub use result::{PhaseTiming, TaskResult, WorkflowResult};
pub use retry::{BackoffStrategy, JitterStrategy, RetryPolicy};
pub use template::{ChangelistBinding, TaskTemplate, TemplateRegistry, WorkflowTemplate};
