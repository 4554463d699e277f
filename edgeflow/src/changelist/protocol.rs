//! The external changelist handshake.

use crate::api::{ApiClient, ApiRequest, HttpMethod, TENANT_QUERY_PARAM};
use crate::context::TenantId;
use crate::errors::{EdgeflowError, ValidationIssue};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// One staged change to a protected resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Modification {
    /// Operation the change performs, e.g. `dns.record.create`.
    pub operation: String,
    /// Operation payload.
    pub payload: serde_json::Value,
}

impl Modification {
    /// Creates a modification.
    #[must_use]
    pub fn new(operation: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            operation: operation.into(),
            payload,
        }
    }
}

/// Multi-step protocol guarding changes to one external resource.
///
/// Implementations talk to the upstream API; the transaction manager owns
/// all state-machine bookkeeping.
#[async_trait]
pub trait ChangelistProtocol: Send + Sync {
    /// Opens an upstream changelist and returns its upstream id.
    async fn open(&self, tenant: &TenantId, resource_id: &str) -> Result<String, EdgeflowError>;

    /// Stages one modification.
    async fn stage(
        &self,
        tenant: &TenantId,
        changelist_id: &str,
        modification: &Modification,
    ) -> Result<(), EdgeflowError>;

    /// Validates everything staged. An empty list means valid.
    async fn validate(
        &self,
        tenant: &TenantId,
        changelist_id: &str,
    ) -> Result<Vec<ValidationIssue>, EdgeflowError>;

    /// Submits the changelist.
    async fn submit(&self, tenant: &TenantId, changelist_id: &str) -> Result<(), EdgeflowError>;

    /// Activates a submitted changelist.
    async fn activate(&self, tenant: &TenantId, changelist_id: &str)
        -> Result<(), EdgeflowError>;

    /// Discards the changelist upstream.
    async fn discard(&self, tenant: &TenantId, changelist_id: &str) -> Result<(), EdgeflowError>;

    /// Whether a submitted changelist may be submitted again after a failed
    /// activation.
    fn allows_resubmit(&self) -> bool {
        true
    }
}

/// [`ChangelistProtocol`] over the management API's zone changelist
/// endpoints.
///
/// ```text
/// POST   {base}/changelists?zone={resource}
/// POST   {base}/changelists/{id}/modifications
/// POST   {base}/changelists/{id}/validate
/// POST   {base}/changelists/{id}/submit
/// POST   {base}/changelists/{id}/activate
/// DELETE {base}/changelists/{id}
/// ```
pub struct ApiChangelistProtocol {
    client: Arc<dyn ApiClient>,
    base_path: String,
    resubmit: bool,
}

impl ApiChangelistProtocol {
    /// Default path prefix.
    pub const DEFAULT_BASE_PATH: &'static str = "/config-dns/v2";

    /// Creates an adapter with the default base path.
    #[must_use]
    pub fn new(client: Arc<dyn ApiClient>) -> Self {
        Self {
            client,
            base_path: Self::DEFAULT_BASE_PATH.to_string(),
            resubmit: true,
        }
    }

    /// Sets the base path.
    #[must_use]
    pub fn with_base_path(mut self, base_path: impl Into<String>) -> Self {
        self.base_path = base_path.into().trim_end_matches('/').to_string();
        self
    }

    /// Sets whether re-submission is allowed.
    #[must_use]
    pub fn with_resubmit(mut self, allowed: bool) -> Self {
        self.resubmit = allowed;
        self
    }

    fn changelist_path(&self, changelist_id: &str, action: Option<&str>) -> String {
        match action {
            Some(action) => format!("{}/changelists/{changelist_id}/{action}", self.base_path),
            None => format!("{}/changelists/{changelist_id}", self.base_path),
        }
    }

    async fn send(
        &self,
        tenant: &TenantId,
        request: ApiRequest,
    ) -> Result<serde_json::Value, EdgeflowError> {
        let request = request.with_query(TENANT_QUERY_PARAM, tenant.as_str());
        Ok(self.client.call(request).await?)
    }
}

impl fmt::Debug for ApiChangelistProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiChangelistProtocol")
            .field("base_path", &self.base_path)
            .field("resubmit", &self.resubmit)
            .finish()
    }
}

#[async_trait]
impl ChangelistProtocol for ApiChangelistProtocol {
    async fn open(&self, tenant: &TenantId, resource_id: &str) -> Result<String, EdgeflowError> {
        let request = ApiRequest::post(format!("{}/changelists", self.base_path))
            .with_query("zone", resource_id);
        let response = self.send(tenant, request).await?;

        let id = response
            .get("id")
            .or_else(|| response.get("zone"))
            .and_then(serde_json::Value::as_str)
            .unwrap_or(resource_id);
        Ok(id.to_string())
    }

    async fn stage(
        &self,
        tenant: &TenantId,
        changelist_id: &str,
        modification: &Modification,
    ) -> Result<(), EdgeflowError> {
        let request = ApiRequest::post(self.changelist_path(changelist_id, Some("modifications")))
            .with_body(serde_json::json!({
                "operation": modification.operation,
                "payload": modification.payload,
            }));
        self.send(tenant, request).await.map(|_| ())
    }

    async fn validate(
        &self,
        tenant: &TenantId,
        changelist_id: &str,
    ) -> Result<Vec<ValidationIssue>, EdgeflowError> {
        let request = ApiRequest::post(self.changelist_path(changelist_id, Some("validate")));
        let response = self.send(tenant, request).await?;

        match response.get("issues") {
            None | Some(serde_json::Value::Null) => Ok(Vec::new()),
            Some(issues) => serde_json::from_value(issues.clone()).map_err(|e| {
                EdgeflowError::unknown(format!("Malformed validation response: {e}"))
            }),
        }
    }

    async fn submit(&self, tenant: &TenantId, changelist_id: &str) -> Result<(), EdgeflowError> {
        let request = ApiRequest::post(self.changelist_path(changelist_id, Some("submit")));
        self.send(tenant, request).await.map(|_| ())
    }

    async fn activate(
        &self,
        tenant: &TenantId,
        changelist_id: &str,
    ) -> Result<(), EdgeflowError> {
        let request = ApiRequest::post(self.changelist_path(changelist_id, Some("activate")));
        self.send(tenant, request).await.map(|_| ())
    }

    async fn discard(&self, tenant: &TenantId, changelist_id: &str) -> Result<(), EdgeflowError> {
        let request = ApiRequest::new(HttpMethod::Delete, self.changelist_path(changelist_id, None));
        self.send(tenant, request).await.map(|_| ())
    }

    fn allows_resubmit(&self) -> bool {
        self.resubmit
    }
}
