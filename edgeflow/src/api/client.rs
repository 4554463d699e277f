//! Seam to the signed-request executor.
//!
//! Request signing and transport are supplied by the host; this crate only
//! sees an [`ApiClient`] that turns an [`ApiRequest`] into a JSON response
//! or an [`ApiError`].

use crate::errors::ApiError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// HTTP method of an API request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    /// GET
    #[default]
    Get,
    /// POST
    Post,
    /// PUT
    Put,
    /// PATCH
    Patch,
    /// DELETE
    Delete,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Get => write!(f, "GET"),
            Self::Post => write!(f, "POST"),
            Self::Put => write!(f, "PUT"),
            Self::Patch => write!(f, "PATCH"),
            Self::Delete => write!(f, "DELETE"),
        }
    }
}

impl HttpMethod {
    /// Returns true if requests with this method carry a body.
    #[must_use]
    pub fn has_body(&self) -> bool {
        matches!(self, Self::Post | Self::Put | Self::Patch)
    }
}

/// One call against the external management API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiRequest {
    /// HTTP method.
    pub method: HttpMethod,
    /// Path relative to the API host.
    pub path: String,
    /// Query parameters.
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    /// JSON body.
    #[serde(default)]
    pub body: Option<serde_json::Value>,
}

impl ApiRequest {
    /// Creates a request without query or body.
    #[must_use]
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: BTreeMap::new(),
            body: None,
        }
    }

    /// Shorthand for a GET request.
    #[must_use]
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, path)
    }

    /// Shorthand for a POST request.
    #[must_use]
    pub fn post(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Post, path)
    }

    /// Adds a query parameter.
    #[must_use]
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }

    /// Sets the JSON body.
    #[must_use]
    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// Executes signed requests against the external API.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ApiClient: Send + Sync {
    /// Performs the request and returns the decoded JSON response.
    async fn call(&self, request: ApiRequest) -> Result<serde_json::Value, ApiError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder() {
        let request = ApiRequest::post("/config-dns/v2/changelists")
            .with_query("zone", "example.com")
            .with_body(serde_json::json!({}));

        assert_eq!(request.method, HttpMethod::Post);
        assert_eq!(request.query.get("zone").unwrap(), "example.com");
        assert!(request.body.is_some());
    }

    #[test]
    fn test_method_serialize() {
        assert_eq!(serde_json::to_string(&HttpMethod::Delete).unwrap(), r#""DELETE""#);
        assert!(HttpMethod::Patch.has_body());
        assert!(!HttpMethod::Get.has_body());
    }

    #[tokio::test]
    async fn test_mock_client() {
        let mut client = MockApiClient::new();
        client
            .expect_call()
            .withf(|request| request.path == "/papi/v1/groups")
            .times(1)
            .returning(|_| Ok(serde_json::json!({"groups": []})));

        let response = client.call(ApiRequest::get("/papi/v1/groups")).await.unwrap();
        assert_eq!(response["groups"], serde_json::json!([]));
    }
}
