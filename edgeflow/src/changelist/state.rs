//! Changelist transaction states.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a changelist transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    /// Opened, nothing staged.
    #[default]
    Created,
    /// At least one modification staged.
    Modifying,
    /// Staged modifications passed validation.
    Validated,
    /// Submitted upstream, not yet activated.
    Submitted,
    /// Activation in progress.
    Activating,
    /// Activated. Terminal.
    Active,
    /// Deadline passed before reaching a terminal state. Terminal.
    Expired,
    /// Explicitly aborted. Terminal.
    Discarded,
    /// Unrecoverable failure. Terminal.
    Failed,
}

impl TransactionState {
    /// Returns the snake_case name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Modifying => "modifying",
            Self::Validated => "validated",
            Self::Submitted => "submitted",
            Self::Activating => "activating",
            Self::Active => "active",
            Self::Expired => "expired",
            Self::Discarded => "discarded",
            Self::Failed => "failed",
        }
    }

    /// Returns true for states with no outgoing transitions.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Active | Self::Expired | Self::Discarded | Self::Failed
        )
    }

    /// Returns true if `next` is a legal successor.
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        use TransactionState::{
            Activating, Active, Created, Discarded, Expired, Failed, Modifying, Submitted,
            Validated,
        };

        if self.is_terminal() {
            return false;
        }
        if matches!(next, Discarded | Failed | Expired) {
            return true;
        }

        match self {
            Created => matches!(next, Modifying),
            Modifying => matches!(next, Modifying | Validated),
            Validated => matches!(next, Validated | Modifying | Submitted),
            Submitted => matches!(next, Submitted | Modifying | Activating),
            Activating => matches!(next, Active | Submitted),
            Active | Expired | Discarded | Failed => false,
        }
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_is_legal() {
        let path = [
            TransactionState::Created,
            TransactionState::Modifying,
            TransactionState::Validated,
            TransactionState::Submitted,
            TransactionState::Activating,
            TransactionState::Active,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_terminal_states_are_final() {
        for state in [
            TransactionState::Active,
            TransactionState::Expired,
            TransactionState::Discarded,
            TransactionState::Failed,
        ] {
            assert!(state.is_terminal());
            assert!(!state.can_transition_to(TransactionState::Discarded));
            assert!(!state.can_transition_to(TransactionState::Modifying));
        }
    }

    #[test]
    fn test_illegal_shortcuts() {
        assert!(!TransactionState::Created.can_transition_to(TransactionState::Validated));
        assert!(!TransactionState::Modifying.can_transition_to(TransactionState::Submitted));
        assert!(!TransactionState::Validated.can_transition_to(TransactionState::Active));
        assert!(TransactionState::Activating.can_transition_to(TransactionState::Submitted));
    }

    #[test]
    fn test_any_live_state_can_fail_or_expire() {
        for state in [
            TransactionState::Created,
            TransactionState::Modifying,
            TransactionState::Validated,
            TransactionState::Submitted,
            TransactionState::Activating,
        ] {
            assert!(state.can_transition_to(TransactionState::Failed));
            assert!(state.can_transition_to(TransactionState::Expired));
            assert!(state.can_transition_to(TransactionState::Discarded));
        }
    }

    #[test]
    fn test_serde_names() {
        assert_eq!(
            serde_json::to_value(TransactionState::Activating).unwrap(),
            serde_json::json!("activating")
        );
        assert_eq!(TransactionState::Validated.to_string(), "validated");
    }
}
