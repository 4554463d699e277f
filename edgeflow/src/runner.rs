//! The single-operation path: coalescer, then cache, then handler.

use crate::api::{OperationHandler, OperationRegistry};
use crate::cache::SmartCache;
use crate::coalesce::RequestCoalescer;
use crate::context::TenantId;
use crate::core::OperationKey;
use crate::errors::{EdgeflowError, ValidationError};
use std::fmt;
use std::sync::Arc;

/// Dispatches registered operations.
///
/// Cacheable operations are coalesced on their key and served from the
/// cache when fresh. Every successful operation fires the cache's
/// invalidation rules for its name, which also drop matching results the
/// coalescer still holds in its grace window.
#[derive(Clone)]
pub struct OperationRunner {
    registry: Arc<OperationRegistry>,
    cache: Arc<SmartCache>,
    coalescer: Arc<RequestCoalescer>,
}

impl OperationRunner {
    /// Creates a runner over shared components.
    #[must_use]
    pub fn new(
        registry: Arc<OperationRegistry>,
        cache: Arc<SmartCache>,
        coalescer: Arc<RequestCoalescer>,
    ) -> Self {
        Self {
            registry,
            cache,
            coalescer,
        }
    }

    /// The operation registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<OperationRegistry> {
        &self.registry
    }

    /// The shared cache.
    #[must_use]
    pub fn cache(&self) -> &Arc<SmartCache> {
        &self.cache
    }

    /// The shared coalescer.
    #[must_use]
    pub fn coalescer(&self) -> &Arc<RequestCoalescer> {
        &self.coalescer
    }

    /// Runs `operation` for `tenant`.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an unregistered operation, otherwise
    /// whatever the handler fails with.
    pub async fn run(
        &self,
        tenant: &TenantId,
        operation: &str,
        params: serde_json::Value,
    ) -> Result<Arc<serde_json::Value>, EdgeflowError> {
        let handler = self.registry.get(operation).ok_or_else(|| {
            ValidationError::new(format!("Unknown operation '{operation}'"))
        })?;

        let result = match handler.cache_ttl() {
            Some(ttl) => self.run_cached(tenant, operation, params, handler, ttl).await,
            None => handler.invoke(tenant, params).await.map(Arc::new),
        };

        match &result {
            Ok(_) => {
                let purged = self.cache.on_operation_completed(operation, tenant);
                let patterns = self.cache.invalidation_patterns(operation);
                let forgotten = if patterns.is_empty() {
                    0
                } else {
                    self.coalescer.forget_resolved(|key| {
                        key.tenant() == tenant && patterns.iter().any(|p| p.matches(key))
                    })
                };
                if purged + forgotten > 0 {
                    tracing::debug!(tenant = %tenant, operation, purged, forgotten, "Invalidated cache after operation");
                }
            }
            Err(err) => {
                tracing::debug!(tenant = %tenant, operation, error = %err, "Operation failed");
            }
        }
        result
    }

    async fn run_cached(
        &self,
        tenant: &TenantId,
        operation: &str,
        params: serde_json::Value,
        handler: Arc<dyn OperationHandler>,
        ttl: std::time::Duration,
    ) -> Result<Arc<serde_json::Value>, EdgeflowError> {
        let key = OperationKey::new(tenant, operation, &params);
        let cache = Arc::clone(&self.cache);
        let tenant = tenant.clone();
        let operation = operation.to_string();

        self.coalescer
            .coalesce(key, move || async move {
                let value = cache
                    .get_or_fetch(&tenant, &operation, &params, Some(ttl), || {
                        handler.invoke(&tenant, params.clone())
                    })
                    .await?;
                Ok(Arc::try_unwrap(value).unwrap_or_else(|shared| (*shared).clone()))
            })
            .await
    }
}

impl fmt::Debug for OperationRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationRunner")
            .field("operations", &self.registry.len())
            .field("cached_entries", &self.cache.len())
            .field("in_flight", &self.coalescer.in_flight())
            .finish()
    }
}
