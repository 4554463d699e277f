//! Test doubles and fixtures for code built on edgeflow.
//!
//! - [`MockOperation`]: a scriptable [`crate::api::OperationHandler`]
//! - [`InMemoryChangelist`]: a scripted [`crate::changelist::ChangelistProtocol`]
//! - template and registry fixtures

mod changelist;
mod fixtures;
mod mocks;

pub use changelist::{FakeChangelist, InMemoryChangelist, ProtocolStep};
pub use fixtures::{diamond_template, echo_operations, layered_template, tenant};
pub use mocks::{MockOperation, RecordedCall};
