//! Interfaces to the external management API and the operations built on it.

mod client;
mod operation;

pub use client::{ApiClient, ApiRequest, HttpMethod};
#[cfg(test)]
pub use client::MockApiClient;
pub use operation::{
    ApiOperation, FnOperation, OperationHandler, OperationRegistry, TENANT_QUERY_PARAM,
};
