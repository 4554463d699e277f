//! Error classification and recovery strategies.
//!
//! Failures from any component are matched against an ordered table of
//! [`ErrorPattern`]s. The first match yields a [`Classification`] carrying a
//! tag, a transient flag, an optional [`RecoveryStrategy`] and a remediation
//! hint. Patterns are data; new ones are registered at runtime.

mod classifier;
mod pattern;
mod strategy;
mod suggestions;

pub use classifier::{tags, Classification, ErrorClassifier};
pub use pattern::{ErrorMatcher, ErrorPattern, StatusMatcher};
pub use strategy::{
    DiscardAndReplay, ManualSteps, RecoveryAction, RecoveryContext, RecoveryStrategy, WaitAndRetry,
};
pub use suggestions::RecoverySuggestion;
