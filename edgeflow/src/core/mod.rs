//! Core domain model types for edgeflow.
//!
//! This module contains the fundamental types used throughout the crate:
//! - Task and workflow status enums
//! - Tenant-scoped operation keys

mod key;
mod status;

pub use key::{hash_parameters, OperationKey};
pub use status::{TaskStatus, WorkflowStatus};
