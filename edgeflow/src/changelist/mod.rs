//! Changelist transactions over a multi-step external protocol.
//!
//! A change to a protected resource goes through
//! `begin -> stage* -> validate -> commit` (or `abort`). The
//! [`TransactionManager`] enforces one live transaction per tenant and
//! resource, the state machine in [`TransactionState`], and expiry.

mod manager;
mod protocol;
mod state;
mod transaction;

pub use manager::{ApplyOutcome, TransactionManager, ValidationOutcome};
pub use protocol::{ApiChangelistProtocol, ChangelistProtocol, Modification};
pub use state::TransactionState;
pub use transaction::TransactionSnapshot;
