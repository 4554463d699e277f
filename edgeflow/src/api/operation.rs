//! Operation handlers and their registry.
//!
//! An [`OperationHandler`] is the black-box `(params) -> result` unit that
//! workflow tasks and cache fetches invoke. Per-endpoint tool adapters live
//! outside this crate and register themselves here.

use super::{ApiClient, ApiRequest, HttpMethod};
use crate::context::TenantId;
use crate::errors::{EdgeflowError, ValidationError};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Query parameter carrying the tenant on outgoing API requests.
pub const TENANT_QUERY_PARAM: &str = "accountSwitchKey";

/// A named operation that can be invoked with JSON parameters.
#[async_trait]
pub trait OperationHandler: Send + Sync {
    /// Returns the operation name (e.g. `property.list`).
    fn name(&self) -> &str;

    /// Returns the cache TTL for read operations whose results may be cached.
    fn cache_ttl(&self) -> Option<Duration> {
        None
    }

    /// Invokes the operation for a tenant.
    async fn invoke(
        &self,
        tenant: &TenantId,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, EdgeflowError>;
}

/// A closure-backed operation.
pub struct FnOperation<F> {
    name: String,
    cache_ttl: Option<Duration>,
    func: F,
}

impl<F, Fut> FnOperation<F>
where
    F: Fn(TenantId, serde_json::Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<serde_json::Value, EdgeflowError>> + Send,
{
    /// Creates a new closure-backed operation.
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            cache_ttl: None,
            func,
        }
    }

    /// Marks the operation as cacheable.
    #[must_use]
    pub fn cacheable(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }
}

impl<F> fmt::Debug for FnOperation<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnOperation")
            .field("name", &self.name)
            .field("cache_ttl", &self.cache_ttl)
            .finish()
    }
}

#[async_trait]
impl<F, Fut> OperationHandler for FnOperation<F>
where
    F: Fn(TenantId, serde_json::Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<serde_json::Value, EdgeflowError>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn cache_ttl(&self) -> Option<Duration> {
        self.cache_ttl
    }

    async fn invoke(
        &self,
        tenant: &TenantId,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, EdgeflowError> {
        (self.func)(tenant.clone(), params).await
    }
}

/// An operation forwarded to the external API.
///
/// `{name}` segments in the path template are filled from the parameters;
/// remaining parameters become query parameters for GET/DELETE and the JSON
/// body otherwise.
pub struct ApiOperation {
    name: String,
    method: HttpMethod,
    path_template: String,
    cache_ttl: Option<Duration>,
    client: Arc<dyn ApiClient>,
}

impl ApiOperation {
    /// Creates a new API-backed operation.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        method: HttpMethod,
        path_template: impl Into<String>,
        client: Arc<dyn ApiClient>,
    ) -> Self {
        Self {
            name: name.into(),
            method,
            path_template: path_template.into(),
            cache_ttl: None,
            client,
        }
    }

    /// Marks the operation as cacheable.
    #[must_use]
    pub fn cacheable(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    /// Builds the request for a tenant and parameter set.
    ///
    /// # Errors
    ///
    /// Returns an error if params are not an object or a path variable is
    /// missing.
    pub fn build_request(
        &self,
        tenant: &TenantId,
        params: serde_json::Value,
    ) -> Result<ApiRequest, ValidationError> {
        let mut remaining = match params {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => serde_json::Map::new(),
            other => {
                return Err(ValidationError::new(format!(
                    "Operation '{}' expects object parameters, got {}",
                    self.name, other
                )));
            }
        };

        let mut path = String::with_capacity(self.path_template.len());
        let mut rest = self.path_template.as_str();
        while let Some(start) = rest.find('{') {
            let Some(len) = rest[start..].find('}') else {
                return Err(ValidationError::new(format!(
                    "Unterminated path variable in '{}'",
                    self.path_template
                )));
            };
            path.push_str(&rest[..start]);
            let var = &rest[start + 1..start + len];
            let value = remaining.remove(var).ok_or_else(|| {
                ValidationError::new(format!(
                    "Operation '{}' requires parameter '{}'",
                    self.name, var
                ))
            })?;
            path.push_str(&scalar_to_string(&value));
            rest = &rest[start + len + 1..];
        }
        path.push_str(rest);

        let mut request = ApiRequest::new(self.method, path)
            .with_query(TENANT_QUERY_PARAM, tenant.as_str());

        if self.method.has_body() {
            request = request.with_body(serde_json::Value::Object(remaining));
        } else {
            for (key, value) in remaining {
                request = request.with_query(key, scalar_to_string(&value));
            }
        }

        Ok(request)
    }
}

impl fmt::Debug for ApiOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiOperation")
            .field("name", &self.name)
            .field("method", &self.method)
            .field("path_template", &self.path_template)
            .finish()
    }
}

#[async_trait]
impl OperationHandler for ApiOperation {
    fn name(&self) -> &str {
        &self.name
    }

    fn cache_ttl(&self) -> Option<Duration> {
        self.cache_ttl
    }

    async fn invoke(
        &self,
        tenant: &TenantId,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, EdgeflowError> {
        let request = self.build_request(tenant, params)?;
        Ok(self.client.call(request).await?)
    }
}

fn scalar_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Registry of operation handlers by name.
#[derive(Default)]
pub struct OperationRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn OperationHandler>>>,
}

impl OperationRegistry {
    /// Creates a new empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler under its own name, replacing any previous one.
    pub fn register(&self, handler: Arc<dyn OperationHandler>) {
        let name = handler.name().to_string();
        self.handlers.write().insert(name, handler);
    }

    /// Gets a handler by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn OperationHandler>> {
        self.handlers.read().get(name).cloned()
    }

    /// Returns true if a handler is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.read().contains_key(name)
    }

    /// Lists registered operation names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Returns the number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    /// Returns true if no handlers are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }
}

impl fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationRegistry")
            .field("operations", &self.names())
            .finish()
    }
}
