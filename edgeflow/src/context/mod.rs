//! Tenant context for isolation of cache, coalescing and transaction state.

mod tenant;

pub use tenant::{StaticTenantResolver, TenantId, TenantResolver};
