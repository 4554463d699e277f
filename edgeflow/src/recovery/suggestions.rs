//! Remediation hints attached to classified failures.

use serde::{Deserialize, Serialize};

/// Structured remediation info for a classified failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoverySuggestion {
    /// Short title for the failure class.
    pub title: String,
    /// What went wrong, in one sentence.
    pub summary: String,
    /// Steps a human should take when no automatic fix applies.
    #[serde(default)]
    pub manual_steps: Vec<String>,
}

impl RecoverySuggestion {
    /// Creates a new suggestion.
    #[must_use]
    pub fn new(title: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            summary: summary.into(),
            manual_steps: Vec::new(),
        }
    }

    /// Appends a manual step.
    #[must_use]
    pub fn step(mut self, step: impl Into<String>) -> Self {
        self.manual_steps.push(step.into());
        self
    }
}

pub(crate) fn changelist_expired() -> RecoverySuggestion {
    RecoverySuggestion::new(
        "Changelist Expired",
        "The changelist was not committed before the API discarded it.",
    )
    .step("Open a new changelist for the resource")
    .step("Re-stage the pending modifications and validate again")
}

pub(crate) fn rate_limited() -> RecoverySuggestion {
    RecoverySuggestion::new(
        "Rate Limit Exceeded",
        "The API throttled the request.",
    )
    .step("Wait for the interval given in the retry-after header")
    .step("Reduce concurrency for this tenant if the limit is hit repeatedly")
}

pub(crate) fn server_error() -> RecoverySuggestion {
    RecoverySuggestion::new(
        "Upstream Server Error",
        "The API returned a 5xx response.",
    )
    .step("Retry the operation after a short delay")
    .step("Check the API status page if the error persists")
}

pub(crate) fn timeout() -> RecoverySuggestion {
    RecoverySuggestion::new(
        "Operation Timed Out",
        "The operation did not finish within its time budget.",
    )
    .step("Retry the operation")
    .step("Raise the task timeout if the operation is known to be slow")
}

pub(crate) fn authentication() -> RecoverySuggestion {
    RecoverySuggestion::new(
        "Authentication Failed",
        "The API rejected the request credentials.",
    )
    .step("Verify the client token, client secret and access token")
    .step("Confirm the credentials have not expired or been rotated")
}

pub(crate) fn permission_denied() -> RecoverySuggestion {
    RecoverySuggestion::new(
        "Permission Denied",
        "The credentials are valid but lack access to this resource.",
    )
    .step("Check the API client's granted permissions for this service")
    .step("Confirm the tenant (account switch key) is correct")
}

pub(crate) fn not_found() -> RecoverySuggestion {
    RecoverySuggestion::new(
        "Resource Not Found",
        "The referenced resource does not exist for this tenant.",
    )
    .step("Verify the resource id and the contract/group it belongs to")
    .step("List resources for the tenant to find the correct id")
}

pub(crate) fn conflict() -> RecoverySuggestion {
    RecoverySuggestion::new(
        "Concurrent Modification",
        "Another transaction is already modifying this resource.",
    )
    .step("Wait for the open transaction to finish, or abort it")
    .step("Retry the update once the resource is free")
}

pub(crate) fn validation() -> RecoverySuggestion {
    RecoverySuggestion::new(
        "Invalid Request",
        "The request or staged modifications failed validation.",
    )
    .step("Review the reported validation issues")
    .step("Correct the input and stage the modifications again")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let s = RecoverySuggestion::new("T", "S").step("one").step("two");
        assert_eq!(s.manual_steps, vec!["one".to_string(), "two".to_string()]);
    }

    #[test]
    fn test_builtin_suggestions_have_steps() {
        for s in [
            changelist_expired(),
            rate_limited(),
            server_error(),
            timeout(),
            authentication(),
            permission_denied(),
            not_found(),
            conflict(),
            validation(),
        ] {
            assert!(!s.manual_steps.is_empty(), "{} has no steps", s.title);
        }
    }
}
