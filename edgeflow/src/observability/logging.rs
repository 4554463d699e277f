//! Subscriber setup and span constructors.

use anyhow::Context;
use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "edgeflow=info";

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable output.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

/// Installs a global `fmt` subscriber filtered by `RUST_LOG`.
///
/// Hosts call this once at startup. A second call fails because a global
/// subscriber is already set; the existing one stays in place.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init_tracing(format: LogFormat) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let installed = match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .try_init(),
    };
    installed.context("failed to install tracing subscriber")
}

/// Span wrapping one workflow run.
#[must_use]
pub fn workflow_span(workflow: &str, run_id: &str, tenant: &str) -> Span {
    tracing::info_span!("workflow", workflow = workflow, run_id = run_id, tenant = tenant)
}

/// Span wrapping one task attempt sequence.
#[must_use]
pub fn task_span(task: &str, operation: &str) -> Span {
    tracing::debug_span!("task", task = task, operation = operation)
}
