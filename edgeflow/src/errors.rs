//! Error types for the edgeflow orchestration substrate.
//!
//! Every failure that crosses a component boundary is an [`EdgeflowError`].
//! Errors are `Clone` so that a single coalesced failure can be delivered to
//! every waiting caller, and `Serialize` so workflow results can carry them.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// The main error type for edgeflow operations.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EdgeflowError {
    /// Input or state validation failed.
    #[error("{0}")]
    Validation(#[from] ValidationError),

    /// A concurrent transaction already holds the resource.
    #[error("{0}")]
    Conflict(#[from] ConflictError),

    /// A workflow template contains a dependency cycle.
    #[error("{0}")]
    CyclicDependency(#[from] CyclicDependencyError),

    /// An operation exceeded its time budget.
    #[error("{0}")]
    Timeout(#[from] TimeoutError),

    /// A changelist transaction expired before reaching a terminal state.
    #[error("{0}")]
    ExpiredTransaction(#[from] ExpiredTransactionError),

    /// The external management API rejected a request.
    #[error("{0}")]
    Api(#[from] ApiError),

    /// Anything that could not be attributed to a known category.
    #[error("{0}")]
    Unknown(#[from] UnknownError),
}

/// Taxonomy tag for an [`EdgeflowError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// See [`ValidationError`].
    Validation,
    /// See [`ConflictError`].
    Conflict,
    /// See [`CyclicDependencyError`].
    CyclicDependency,
    /// See [`TimeoutError`].
    Timeout,
    /// See [`ExpiredTransactionError`].
    ExpiredTransaction,
    /// See [`ApiError`].
    Api,
    /// See [`UnknownError`].
    Unknown,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation => write!(f, "validation"),
            Self::Conflict => write!(f, "conflict"),
            Self::CyclicDependency => write!(f, "cyclic_dependency"),
            Self::Timeout => write!(f, "timeout"),
            Self::ExpiredTransaction => write!(f, "expired_transaction"),
            Self::Api => write!(f, "api"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

impl EdgeflowError {
    /// Returns the taxonomy tag of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::CyclicDependency(_) => ErrorKind::CyclicDependency,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::ExpiredTransaction(_) => ErrorKind::ExpiredTransaction,
            Self::Api(_) => ErrorKind::Api,
            Self::Unknown(_) => ErrorKind::Unknown,
        }
    }

    /// Returns the HTTP status if this error came from the external API.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api(err) => Some(err.status),
            _ => None,
        }
    }

    /// Shorthand for a [`ValidationError`] with a message only.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(ValidationError::new(message))
    }

    /// Shorthand for an [`UnknownError`].
    #[must_use]
    pub fn unknown(message: impl Into<String>) -> Self {
        Self::Unknown(UnknownError::new(message))
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("kind".to_string(), serde_json::json!(self.kind().to_string()));
        map.insert("message".to_string(), serde_json::json!(self.to_string()));

        match self {
            Self::Validation(err) if !err.issues.is_empty() => {
                map.insert("issues".to_string(), serde_json::json!(err.issues));
            }
            Self::Conflict(err) => {
                map.insert("resource_id".to_string(), serde_json::json!(err.resource_id));
                map.insert(
                    "existing_transaction_id".to_string(),
                    serde_json::json!(err.existing_transaction_id),
                );
            }
            Self::CyclicDependency(err) => {
                map.insert("cycle_path".to_string(), serde_json::json!(err.cycle_path));
            }
            Self::Timeout(err) => {
                map.insert("operation".to_string(), serde_json::json!(err.operation));
                map.insert("timeout_ms".to_string(), serde_json::json!(err.timeout_ms));
            }
            Self::ExpiredTransaction(err) => {
                map.insert("transaction_id".to_string(), serde_json::json!(err.transaction_id));
                if let Some(ref replacement) = err.replacement_id {
                    map.insert("replacement_id".to_string(), serde_json::json!(replacement));
                }
            }
            Self::Api(err) => {
                map.insert("status".to_string(), serde_json::json!(err.status));
                if let Some(ref code) = err.code {
                    map.insert("code".to_string(), serde_json::json!(code));
                }
            }
            _ => {}
        }

        map
    }
}

/// A single structured validation problem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// Field or path the issue refers to, if any.
    #[serde(default)]
    pub field: Option<String>,
    /// Human-readable description.
    pub message: String,
    /// Machine-readable code, if the source supplied one.
    #[serde(default)]
    pub code: Option<String>,
}

impl ValidationIssue {
    /// Creates a new issue.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            field: None,
            message: message.into(),
            code: None,
        }
    }

    /// Sets the field.
    #[must_use]
    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    /// Sets the code.
    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

/// Error raised when input or state validation fails.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("Validation failed: {message}")]
pub struct ValidationError {
    /// The error message.
    pub message: String,
    /// Structured issues, if any.
    #[serde(default)]
    pub issues: Vec<ValidationIssue>,
}

impl ValidationError {
    /// Creates a new validation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            issues: Vec::new(),
        }
    }

    /// Attaches structured issues.
    #[must_use]
    pub fn with_issues(mut self, issues: Vec<ValidationIssue>) -> Self {
        self.issues = issues;
        self
    }
}

/// Error raised when a resource already has a non-terminal transaction.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("Conflict: resource '{resource_id}' already has an open transaction '{existing_transaction_id}'")]
pub struct ConflictError {
    /// The contested resource.
    pub resource_id: String,
    /// The transaction currently holding the resource.
    pub existing_transaction_id: String,
}

impl ConflictError {
    /// Creates a new conflict error.
    #[must_use]
    pub fn new(resource_id: impl Into<String>, existing_transaction_id: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
            existing_transaction_id: existing_transaction_id.into(),
        }
    }
}

/// Error raised when a workflow template contains a dependency cycle.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("Cyclic dependency detected: {}", cycle_path.join(" -> "))]
pub struct CyclicDependencyError {
    /// The task ids forming the cycle, first id repeated at the end.
    pub cycle_path: Vec<String>,
}

impl CyclicDependencyError {
    /// Creates a new cyclic dependency error.
    #[must_use]
    pub fn new(cycle_path: Vec<String>) -> Self {
        Self { cycle_path }
    }
}

/// Error raised when an operation exceeds its timeout.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("Operation '{operation}' timed out after {timeout_ms}ms")]
pub struct TimeoutError {
    /// The operation or task that timed out.
    pub operation: String,
    /// The budget that was exceeded.
    pub timeout_ms: u64,
}

impl TimeoutError {
    /// Creates a new timeout error.
    #[must_use]
    pub fn new(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self {
            operation: operation.into(),
            timeout_ms,
        }
    }
}

/// Error raised when a changelist transaction has expired.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("Transaction '{transaction_id}' on resource '{resource_id}' has expired")]
pub struct ExpiredTransactionError {
    /// The expired transaction.
    pub transaction_id: String,
    /// The resource it was protecting.
    pub resource_id: String,
    /// The transaction opened by auto-recovery to replace it, if any.
    #[serde(default)]
    pub replacement_id: Option<String>,
}

impl ExpiredTransactionError {
    /// Creates a new expired transaction error.
    #[must_use]
    pub fn new(transaction_id: impl Into<String>, resource_id: impl Into<String>) -> Self {
        Self {
            transaction_id: transaction_id.into(),
            resource_id: resource_id.into(),
            replacement_id: None,
        }
    }

    /// Records the replacement transaction.
    #[must_use]
    pub fn with_replacement(mut self, replacement_id: impl Into<String>) -> Self {
        self.replacement_id = Some(replacement_id.into());
        self
    }
}

/// Error returned by the external management API.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("API error {status}{}: {message}", code.as_ref().map(|c| format!(" ({c})")).unwrap_or_default())]
pub struct ApiError {
    /// HTTP status code.
    pub status: u16,
    /// API-specific error code or type.
    #[serde(default)]
    pub code: Option<String>,
    /// Error detail.
    pub message: String,
    /// Server-provided retry hint, in seconds.
    #[serde(default)]
    pub retry_after_seconds: Option<u64>,
}

impl ApiError {
    /// Creates a new API error.
    #[must_use]
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            code: None,
            message: message.into(),
            retry_after_seconds: None,
        }
    }

    /// Sets the API error code.
    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Sets the retry-after hint.
    #[must_use]
    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after_seconds = Some(seconds);
        self
    }

    /// Returns true for 5xx responses.
    #[must_use]
    pub fn is_server_error(&self) -> bool {
        (500..600).contains(&self.status)
    }
}

/// Error that could not be classified.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("Unknown error: {message}")]
pub struct UnknownError {
    /// The error message.
    pub message: String,
}

impl UnknownError {
    /// Creates a new unknown error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags() {
        assert_eq!(EdgeflowError::validation("x").kind(), ErrorKind::Validation);
        assert_eq!(
            EdgeflowError::from(ApiError::new(429, "slow down")).kind(),
            ErrorKind::Api
        );
        assert_eq!(ErrorKind::ExpiredTransaction.to_string(), "expired_transaction");
    }

    #[test]
    fn test_cyclic_dependency_message() {
        let err = CyclicDependencyError::new(vec![
            "a".to_string(),
            "b".to_string(),
            "a".to_string(),
        ]);
        assert!(err.to_string().contains("a -> b -> a"));
    }

    #[test]
    fn test_api_error_display_with_code() {
        let err = ApiError::new(409, "busy").with_code("changelist_exists");
        assert_eq!(err.to_string(), "API error 409 (changelist_exists): busy");
        assert!(!err.is_server_error());
        assert!(ApiError::new(503, "down").is_server_error());
    }

    #[test]
    fn test_to_dict_includes_structured_fields() {
        let err = EdgeflowError::from(
            ValidationError::new("bad record")
                .with_issues(vec![ValidationIssue::new("ttl too low").with_field("ttl")]),
        );
        let dict = err.to_dict();
        assert_eq!(dict.get("kind").unwrap(), "validation");
        assert!(dict.contains_key("issues"));

        let dict = EdgeflowError::from(ConflictError::new("zone-1", "tx-1")).to_dict();
        assert_eq!(dict.get("resource_id").unwrap(), "zone-1");
    }

    #[test]
    fn test_serialize_tagged() {
        let err = EdgeflowError::from(TimeoutError::new("property.list", 250));
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "timeout");
        assert_eq!(json["timeout_ms"], 250);

        let back: EdgeflowError = serde_json::from_value(json).unwrap();
        assert_eq!(back.kind(), ErrorKind::Timeout);
    }
}
