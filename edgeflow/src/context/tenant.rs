//! Tenant identity and resolution.

use crate::errors::ValidationError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// An isolated customer/account context.
///
/// Cache entries, coalescing slots and changelist transactions are all
/// partitioned by tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

impl TenantId {
    /// Creates a tenant id.
    ///
    /// # Errors
    ///
    /// Returns an error if the id is empty or whitespace-only.
    pub fn new(id: impl Into<String>) -> Result<Self, ValidationError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(ValidationError::new("Tenant id cannot be empty"));
        }
        Ok(Self(id))
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TenantId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for TenantId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TenantId> for String {
    fn from(id: TenantId) -> Self {
        id.0
    }
}

/// Supplies the active tenant for calls that do not name one.
pub trait TenantResolver: Send + Sync {
    /// Returns the currently active tenant, if any.
    fn current_tenant(&self) -> Option<TenantId>;
}

/// A resolver holding a single switchable tenant.
#[derive(Debug, Default)]
pub struct StaticTenantResolver {
    tenant: RwLock<Option<TenantId>>,
}

impl StaticTenantResolver {
    /// Creates a resolver with no active tenant.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a resolver with an active tenant.
    #[must_use]
    pub fn with_tenant(tenant: TenantId) -> Self {
        Self {
            tenant: RwLock::new(Some(tenant)),
        }
    }

    /// Switches the active tenant.
    pub fn set(&self, tenant: Option<TenantId>) {
        *self.tenant.write() = tenant;
    }
}

impl TenantResolver for StaticTenantResolver {
    fn current_tenant(&self) -> Option<TenantId> {
        self.tenant.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tenant_id_rejects_empty() {
        assert!(TenantId::new("").is_err());
        assert!(TenantId::new("   ").is_err());
        assert_eq!(TenantId::new("acme").unwrap().as_str(), "acme");
    }

    #[test]
    fn test_tenant_id_serde_validates() {
        let id: TenantId = serde_json::from_str(r#""acme""#).unwrap();
        assert_eq!(id.to_string(), "acme");
        assert!(serde_json::from_str::<TenantId>(r#""""#).is_err());
    }

    #[test]
    fn test_static_resolver_switches() {
        let resolver = StaticTenantResolver::new();
        assert!(resolver.current_tenant().is_none());

        resolver.set(Some("acme".parse().unwrap()));
        assert_eq!(resolver.current_tenant().unwrap().as_str(), "acme");

        resolver.set(None);
        assert!(resolver.current_tenant().is_none());
    }
}
