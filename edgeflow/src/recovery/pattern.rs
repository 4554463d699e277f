//! Declarative error matchers.

use super::strategy::RecoveryStrategy;
use super::suggestions::RecoverySuggestion;
use crate::errors::{EdgeflowError, ErrorKind, ValidationError};
use regex::Regex;
use std::sync::Arc;

/// Matches an HTTP status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusMatcher {
    /// One exact status.
    Exact(u16),
    /// An inclusive range.
    Range(u16, u16),
    /// Any of a set.
    AnyOf(Vec<u16>),
}

impl StatusMatcher {
    /// Returns true if `status` matches.
    #[must_use]
    pub fn matches(&self, status: u16) -> bool {
        match self {
            Self::Exact(s) => *s == status,
            Self::Range(lo, hi) => (*lo..=*hi).contains(&status),
            Self::AnyOf(set) => set.contains(&status),
        }
    }
}

/// Conditions on an error. Every set condition must hold.
#[derive(Debug, Clone, Default)]
pub struct ErrorMatcher {
    kinds: Vec<ErrorKind>,
    status: Option<StatusMatcher>,
    code_contains: Option<String>,
    message: Option<Regex>,
}

impl ErrorMatcher {
    /// A matcher with no conditions. Matches every error.
    #[must_use]
    pub fn any() -> Self {
        Self::default()
    }

    /// Requires one of the given kinds (may be called repeatedly).
    #[must_use]
    pub fn with_kind(mut self, kind: ErrorKind) -> Self {
        self.kinds.push(kind);
        self
    }

    /// Requires an exact HTTP status.
    #[must_use]
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(StatusMatcher::Exact(status));
        self
    }

    /// Requires an HTTP status in an inclusive range.
    #[must_use]
    pub fn with_status_range(mut self, lo: u16, hi: u16) -> Self {
        self.status = Some(StatusMatcher::Range(lo, hi));
        self
    }

    /// Requires one of several HTTP statuses.
    #[must_use]
    pub fn with_status_in(mut self, statuses: &[u16]) -> Self {
        self.status = Some(StatusMatcher::AnyOf(statuses.to_vec()));
        self
    }

    /// Requires the API error code to contain `needle` (case-insensitive).
    #[must_use]
    pub fn with_code_containing(mut self, needle: impl Into<String>) -> Self {
        self.code_contains = Some(needle.into().to_lowercase());
        self
    }

    /// Requires the rendered error message to match a regex.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the regex does not compile.
    pub fn with_message_regex(mut self, pattern: &str) -> Result<Self, ValidationError> {
        let regex = Regex::new(pattern)
            .map_err(|e| ValidationError::new(format!("Invalid message pattern '{pattern}': {e}")))?;
        self.message = Some(regex);
        Ok(self)
    }

    /// Returns true if the error satisfies every condition.
    #[must_use]
    pub fn matches(&self, error: &EdgeflowError) -> bool {
        if !self.kinds.is_empty() && !self.kinds.contains(&error.kind()) {
            return false;
        }

        if let Some(ref status) = self.status {
            match error.status() {
                Some(s) if status.matches(s) => {}
                _ => return false,
            }
        }

        if let Some(ref needle) = self.code_contains {
            let code = match error {
                EdgeflowError::Api(api) => api.code.as_deref(),
                _ => None,
            };
            match code {
                Some(code) if code.to_lowercase().contains(needle.as_str()) => {}
                _ => return false,
            }
        }

        if let Some(ref regex) = self.message {
            if !regex.is_match(&error.to_string()) {
                return false;
            }
        }

        true
    }
}

/// One row of the classification table.
///
/// The pattern matches when any of its matchers matches.
#[derive(Debug, Clone)]
pub struct ErrorPattern {
    /// Classification tag.
    pub tag: String,
    /// Alternative matchers.
    pub matchers: Vec<ErrorMatcher>,
    /// Bound strategy, if any.
    pub strategy: Option<Arc<dyn RecoveryStrategy>>,
    /// Whether a plain retry of the same call may succeed.
    pub transient: bool,
    /// Remediation hint.
    pub suggestion: Option<RecoverySuggestion>,
}

impl ErrorPattern {
    /// Creates a pattern with no matchers.
    #[must_use]
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            matchers: Vec::new(),
            strategy: None,
            transient: false,
            suggestion: None,
        }
    }

    /// Adds an alternative matcher.
    #[must_use]
    pub fn matching(mut self, matcher: ErrorMatcher) -> Self {
        self.matchers.push(matcher);
        self
    }

    /// Binds a strategy.
    #[must_use]
    pub fn with_strategy(mut self, strategy: Arc<dyn RecoveryStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Marks the pattern as transient.
    #[must_use]
    pub fn transient(mut self) -> Self {
        self.transient = true;
        self
    }

    /// Attaches a suggestion.
    #[must_use]
    pub fn with_suggestion(mut self, suggestion: RecoverySuggestion) -> Self {
        self.suggestion = Some(suggestion);
        self
    }

    /// Returns true if any matcher accepts the error.
    #[must_use]
    pub fn matches(&self, error: &EdgeflowError) -> bool {
        self.matchers.iter().any(|m| m.matches(error))
    }
}
