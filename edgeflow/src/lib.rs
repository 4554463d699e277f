//! # Edgeflow
//!
//! Orchestration substrate for multi-tenant edge management APIs.
//!
//! Edgeflow sits between callers and a remote management API and provides:
//!
//! - **Workflows**: declarative task templates compiled into phased plans and
//!   run with bounded concurrency
//! - **Request coalescing**: concurrent identical reads share one upstream call
//! - **Smart caching**: per-tenant TTL cache with rule-driven invalidation
//! - **Changelist transactions**: stage, validate and activate modifications
//!   against a versioned resource, replaying them when the changelist expires
//! - **Error recovery**: classification of failures into recovery strategies
//!   and human-readable suggestions
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use edgeflow::prelude::*;
//!
//! let orchestrator = Orchestrator::default();
//! let client: Arc<dyn ApiClient> = my_http_client();
//! orchestrator.register_operation(Arc::new(
//!     ApiOperation::new("property.list", HttpMethod::Get, "/properties", client)
//!         .cacheable(Duration::from_secs(60)),
//! ));
//! orchestrator.register_template(
//!     WorkflowTemplate::new("audit")
//!         .task(TaskTemplate::new("properties", "property.list")),
//! );
//!
//! let result = orchestrator
//!     .execute("audit", json!({}), WorkflowOptions::for_tenant(TenantId::new("acme")?))
//!     .await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod api;
pub mod cache;
pub mod changelist;
pub mod coalesce;
pub mod config;
pub mod context;
pub mod core;
pub mod errors;
pub mod observability;
pub mod orchestrator;
pub mod recovery;
pub mod runner;
pub mod testing;
pub mod workflow;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::api::{
        ApiClient, ApiOperation, FnOperation, HttpMethod, OperationHandler, OperationRegistry,
    };
    pub use crate::cache::{InvalidationRules, SmartCache};
    pub use crate::changelist::{ChangelistProtocol, Modification, TransactionManager};
    pub use crate::coalesce::RequestCoalescer;
    pub use crate::config::EdgeflowConfig;
    pub use crate::context::{TenantId, TenantResolver};
    pub use crate::core::{OperationKey, TaskStatus, WorkflowStatus};
    pub use crate::errors::{ApiError, EdgeflowError, ErrorKind, ValidationError};
    pub use crate::observability::{init_tracing, LogFormat};
    pub use crate::orchestrator::{Orchestrator, OrchestratorBuilder};
    pub use crate::recovery::{ErrorClassifier, RecoverySuggestion};
    pub use crate::workflow::{
        RetryPolicy, TaskTemplate, WorkflowOptions, WorkflowResult, WorkflowTemplate,
    };
}
