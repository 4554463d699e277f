//! Ordered, first-match-wins error classification.

use super::pattern::{ErrorMatcher, ErrorPattern};
use super::strategy::{DiscardAndReplay, ManualSteps, RecoveryContext, RecoveryStrategy, WaitAndRetry};
use super::suggestions::{self, RecoverySuggestion};
use crate::config::RecoveryConfig;
use crate::errors::{EdgeflowError, ErrorKind};
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

/// Built-in classification tags.
pub mod tags {
    /// Changelist expired upstream or locally.
    pub const CHANGELIST_EXPIRED: &str = "changelist_expired";
    /// HTTP 429.
    pub const RATE_LIMITED: &str = "rate_limited";
    /// HTTP 5xx.
    pub const SERVER_ERROR: &str = "server_error";
    /// Operation timeout.
    pub const TIMEOUT: &str = "timeout";
    /// HTTP 401.
    pub const AUTHENTICATION: &str = "authentication";
    /// HTTP 403.
    pub const PERMISSION_DENIED: &str = "permission_denied";
    /// HTTP 404.
    pub const NOT_FOUND: &str = "not_found";
    /// Concurrent transaction or HTTP 409.
    pub const CONFLICT: &str = "conflict";
    /// Invalid input or HTTP 400/422.
    pub const VALIDATION: &str = "validation";
    /// Nothing matched.
    pub const UNKNOWN: &str = "unknown";
}

/// Result of classifying an error.
#[derive(Debug, Clone)]
pub struct Classification {
    /// Matched tag, or `unknown`.
    pub tag: String,
    /// Whether a plain retry may succeed.
    pub transient: bool,
    /// Bound strategy.
    pub strategy: Option<Arc<dyn RecoveryStrategy>>,
    /// Remediation hint.
    pub suggestion: Option<RecoverySuggestion>,
}

impl Classification {
    /// The classification returned when no pattern matches.
    #[must_use]
    pub fn unknown() -> Self {
        Self {
            tag: tags::UNKNOWN.to_string(),
            transient: false,
            strategy: None,
            suggestion: None,
        }
    }

    /// Returns true if nothing matched.
    #[must_use]
    pub fn is_unknown(&self) -> bool {
        self.tag == tags::UNKNOWN
    }

    /// Returns true if the bound strategy can fix this failure unattended.
    #[must_use]
    pub fn can_auto_recover(&self, error: &EdgeflowError, context: &RecoveryContext) -> bool {
        self.strategy
            .as_ref()
            .is_some_and(|s| s.can_auto_recover(error, context))
    }

    /// Manual steps from the suggestion, if any.
    #[must_use]
    pub fn manual_steps(&self) -> Vec<String> {
        self.suggestion
            .as_ref()
            .map(|s| s.manual_steps.clone())
            .unwrap_or_default()
    }
}

impl From<&ErrorPattern> for Classification {
    fn from(pattern: &ErrorPattern) -> Self {
        Self {
            tag: pattern.tag.clone(),
            transient: pattern.transient,
            strategy: pattern.strategy.clone(),
            suggestion: pattern.suggestion.clone(),
        }
    }
}

/// Ordered table of error patterns.
///
/// The table is the only state; `classify` takes a read lock and never
/// fails.
#[derive(Default)]
pub struct ErrorClassifier {
    patterns: RwLock<Vec<ErrorPattern>>,
}

impl ErrorClassifier {
    /// Creates an empty classifier. Everything classifies as `unknown`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a classifier with the built-in table.
    #[must_use]
    pub fn with_defaults(config: &RecoveryConfig) -> Self {
        let classifier = Self::new();
        for pattern in default_patterns(config) {
            classifier.register(pattern);
        }
        classifier
    }

    /// Appends a pattern (lowest precedence so far).
    pub fn register(&self, pattern: ErrorPattern) {
        tracing::debug!(tag = %pattern.tag, "Registered error pattern");
        self.patterns.write().push(pattern);
    }

    /// Prepends a pattern (highest precedence).
    pub fn register_first(&self, pattern: ErrorPattern) {
        tracing::debug!(tag = %pattern.tag, "Registered error pattern with top precedence");
        self.patterns.write().insert(0, pattern);
    }

    /// Classifies an error against the table.
    #[must_use]
    pub fn classify(&self, error: &EdgeflowError, context: &RecoveryContext) -> Classification {
        let patterns = self.patterns.read();
        let classification = patterns
            .iter()
            .find(|p| p.matches(error))
            .map_or_else(Classification::unknown, Classification::from);

        tracing::debug!(
            tag = %classification.tag,
            kind = %error.kind(),
            operation = context.operation.as_deref().unwrap_or(""),
            task = context.task_id.as_deref().unwrap_or(""),
            "Classified error"
        );
        classification
    }

    /// Tags in precedence order.
    #[must_use]
    pub fn patterns(&self) -> Vec<String> {
        self.patterns.read().iter().map(|p| p.tag.clone()).collect()
    }

    /// Number of patterns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.patterns.read().len()
    }

    /// Returns true if the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.patterns.read().is_empty()
    }
}

impl fmt::Debug for ErrorClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorClassifier")
            .field("patterns", &self.patterns())
            .finish()
    }
}

fn manual(suggestion: &RecoverySuggestion) -> Arc<dyn RecoveryStrategy> {
    Arc::new(ManualSteps::new(suggestion.manual_steps.clone()))
}

fn default_patterns(config: &RecoveryConfig) -> Vec<ErrorPattern> {
    let wait: Arc<dyn RecoveryStrategy> = Arc::new(WaitAndRetry::new(
        config.retry_base_delay(),
        config.max_wait(),
    ));

    let auth = suggestions::authentication();
    let denied = suggestions::permission_denied();
    let missing = suggestions::not_found();
    let conflict = suggestions::conflict();
    let invalid = suggestions::validation();

    vec![
        ErrorPattern::new(tags::CHANGELIST_EXPIRED)
            .matching(ErrorMatcher::any().with_kind(ErrorKind::ExpiredTransaction))
            .matching(
                ErrorMatcher::any()
                    .with_status_range(400, 499)
                    .with_code_containing("expired"),
            )
            .with_strategy(Arc::new(DiscardAndReplay))
            .with_suggestion(suggestions::changelist_expired()),
        ErrorPattern::new(tags::RATE_LIMITED)
            .matching(ErrorMatcher::any().with_status(429))
            .with_strategy(Arc::clone(&wait))
            .transient()
            .with_suggestion(suggestions::rate_limited()),
        ErrorPattern::new(tags::SERVER_ERROR)
            .matching(ErrorMatcher::any().with_status_range(500, 599))
            .with_strategy(Arc::clone(&wait))
            .transient()
            .with_suggestion(suggestions::server_error()),
        ErrorPattern::new(tags::TIMEOUT)
            .matching(ErrorMatcher::any().with_kind(ErrorKind::Timeout))
            .with_strategy(wait)
            .transient()
            .with_suggestion(suggestions::timeout()),
        ErrorPattern::new(tags::AUTHENTICATION)
            .matching(ErrorMatcher::any().with_status(401))
            .with_strategy(manual(&auth))
            .with_suggestion(auth),
        ErrorPattern::new(tags::PERMISSION_DENIED)
            .matching(ErrorMatcher::any().with_status(403))
            .with_strategy(manual(&denied))
            .with_suggestion(denied),
        ErrorPattern::new(tags::NOT_FOUND)
            .matching(ErrorMatcher::any().with_status(404))
            .with_strategy(manual(&missing))
            .with_suggestion(missing),
        ErrorPattern::new(tags::CONFLICT)
            .matching(ErrorMatcher::any().with_kind(ErrorKind::Conflict))
            .matching(ErrorMatcher::any().with_status(409))
            .with_strategy(manual(&conflict))
            .with_suggestion(conflict),
        ErrorPattern::new(tags::VALIDATION)
            .matching(ErrorMatcher::any().with_kind(ErrorKind::Validation))
            .matching(ErrorMatcher::any().with_status_in(&[400, 422]))
            .with_strategy(manual(&invalid))
            .with_suggestion(invalid),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{ApiError, ConflictError, ExpiredTransactionError, TimeoutError};
    use pretty_assertions::assert_eq;

    fn classifier() -> ErrorClassifier {
        ErrorClassifier::with_defaults(&RecoveryConfig::default())
    }

    fn tag_of(err: impl Into<EdgeflowError>) -> String {
        classifier().classify(&err.into(), &RecoveryContext::new()).tag
    }

    #[test]
    fn test_default_table_order() {
        assert_eq!(
            classifier().patterns(),
            vec![
                "changelist_expired",
                "rate_limited",
                "server_error",
                "timeout",
                "authentication",
                "permission_denied",
                "not_found",
                "conflict",
                "validation",
            ]
        );
    }

    #[test]
    fn test_builtin_tags() {
        assert_eq!(tag_of(ExpiredTransactionError::new("tx", "zone")), tags::CHANGELIST_EXPIRED);
        assert_eq!(
            tag_of(ApiError::new(400, "gone").with_code("changelist.expired")),
            tags::CHANGELIST_EXPIRED
        );
        assert_eq!(tag_of(ApiError::new(429, "slow")), tags::RATE_LIMITED);
        assert_eq!(tag_of(ApiError::new(502, "bad gw")), tags::SERVER_ERROR);
        assert_eq!(tag_of(TimeoutError::new("op", 5)), tags::TIMEOUT);
        assert_eq!(tag_of(ApiError::new(401, "who")), tags::AUTHENTICATION);
        assert_eq!(tag_of(ApiError::new(403, "no")), tags::PERMISSION_DENIED);
        assert_eq!(tag_of(ApiError::new(404, "where")), tags::NOT_FOUND);
        assert_eq!(tag_of(ConflictError::new("zone", "tx")), tags::CONFLICT);
        assert_eq!(tag_of(ApiError::new(409, "busy")), tags::CONFLICT);
        assert_eq!(tag_of(ApiError::new(422, "bad")), tags::VALIDATION);
        assert_eq!(tag_of(EdgeflowError::validation("bad")), tags::VALIDATION);
        assert_eq!(tag_of(EdgeflowError::unknown("???")), tags::UNKNOWN);
    }

    #[test]
    fn test_auto_and_transient_flags() {
        let c = classifier();
        let ctx = RecoveryContext::new();

        let rate = EdgeflowError::from(ApiError::new(429, "slow"));
        let class = c.classify(&rate, &ctx);
        assert!(class.transient);
        assert!(class.can_auto_recover(&rate, &ctx));

        let expired = EdgeflowError::from(ExpiredTransactionError::new("tx", "zone"));
        let class = c.classify(&expired, &ctx);
        assert!(!class.transient);
        assert!(class.can_auto_recover(&expired, &ctx));

        let denied = EdgeflowError::from(ApiError::new(403, "no"));
        let class = c.classify(&denied, &ctx);
        assert!(!class.can_auto_recover(&denied, &ctx));
        assert!(!class.manual_steps().is_empty());

        let unknown = EdgeflowError::unknown("x");
        let class = c.classify(&unknown, &ctx);
        assert!(class.is_unknown());
        assert!(!class.can_auto_recover(&unknown, &ctx));
        assert!(class.manual_steps().is_empty());
    }

    #[test]
    fn test_register_first_takes_precedence() {
        let c = classifier();
        c.register_first(
            ErrorPattern::new("quota")
                .matching(ErrorMatcher::any().with_status(429).with_code_containing("quota")),
        );
        c.register(ErrorPattern::new("catch_all").matching(ErrorMatcher::any()));

        let ctx = RecoveryContext::new();
        let quota = EdgeflowError::from(ApiError::new(429, "q").with_code("QUOTA_EXCEEDED"));
        assert_eq!(c.classify(&quota, &ctx).tag, "quota");

        let plain = EdgeflowError::from(ApiError::new(429, "slow"));
        assert_eq!(c.classify(&plain, &ctx).tag, tags::RATE_LIMITED);

        assert_eq!(c.classify(&EdgeflowError::unknown("x"), &ctx).tag, "catch_all");
        assert_eq!(c.len(), 11);
    }

    #[test]
    fn test_empty_classifier() {
        let c = ErrorClassifier::new();
        assert!(c.is_empty());
        assert!(c
            .classify(&EdgeflowError::validation("x"), &RecoveryContext::new())
            .is_unknown());
    }
}
