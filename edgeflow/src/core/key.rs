//! Tenant-scoped operation keys shared by the cache and the coalescer.

use crate::context::TenantId;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Identity of one operation invocation: tenant, operation name and a hash
/// of its parameters.
///
/// The tenant is a full key component, so two tenants never share an entry
/// even when their parameter hashes collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationKey {
    tenant: TenantId,
    operation: String,
    params_hash: String,
}

impl OperationKey {
    /// Builds a key by hashing `params`.
    #[must_use]
    pub fn new(tenant: &TenantId, operation: impl Into<String>, params: &serde_json::Value) -> Self {
        Self::from_parts(tenant.clone(), operation, hash_parameters(params))
    }

    /// Builds a key from a precomputed parameter hash.
    #[must_use]
    pub fn from_parts(
        tenant: TenantId,
        operation: impl Into<String>,
        params_hash: impl Into<String>,
    ) -> Self {
        Self {
            tenant,
            operation: operation.into(),
            params_hash: params_hash.into(),
        }
    }

    /// Returns the tenant.
    #[must_use]
    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    /// Returns the operation name.
    #[must_use]
    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Returns the parameter hash.
    #[must_use]
    pub fn params_hash(&self) -> &str {
        &self.params_hash
    }

    /// Returns `operation:params_hash`, the string invalidation patterns match.
    #[must_use]
    pub fn scoped_key(&self) -> String {
        format!("{}:{}", self.operation, self.params_hash)
    }
}

impl fmt::Display for OperationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.tenant, self.operation, self.params_hash)
    }
}

/// Hashes operation parameters.
///
/// `serde_json::Value` objects keep their keys sorted, so logically equal
/// parameter maps hash identically regardless of insertion order.
#[must_use]
pub fn hash_parameters(params: &serde_json::Value) -> String {
    let json = serde_json::to_string(params).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..16])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant(name: &str) -> TenantId {
        TenantId::new(name).unwrap()
    }

    #[test]
    fn test_hash_parameters_ignores_key_order() {
        let a: serde_json::Value = serde_json::from_str(r#"{"a": 1, "b": 2}"#).unwrap();
        let b: serde_json::Value = serde_json::from_str(r#"{"b": 2, "a": 1}"#).unwrap();
        assert_eq!(hash_parameters(&a), hash_parameters(&b));
        assert_ne!(
            hash_parameters(&a),
            hash_parameters(&serde_json::json!({"a": 1, "b": 3}))
        );
    }

    #[test]
    fn test_keys_differ_by_tenant_with_same_hash() {
        let params = serde_json::json!({"contract": "ctr_1"});
        let a = OperationKey::new(&tenant("acme"), "property.list", &params);
        let b = OperationKey::new(&tenant("globex"), "property.list", &params);

        assert_eq!(a.params_hash(), b.params_hash());
        assert_eq!(a.scoped_key(), b.scoped_key());
        assert_ne!(a, b);
    }

    #[test]
    fn test_display() {
        let key = OperationKey::from_parts(tenant("acme"), "dns.zone.get", "abc");
        assert_eq!(key.to_string(), "acme/dns.zone.get:abc");
        assert_eq!(key.scoped_key(), "dns.zone.get:abc");
    }
}
