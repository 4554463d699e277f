//! Declarative invalidation rules.

use crate::core::OperationKey;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// A key pattern matched against `operation:params_hash`.
///
/// A trailing `*` matches any suffix. Without `*`, the pattern matches either
/// the operation name (every parameter variant) or one exact scoped key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyPattern(String);

impl KeyPattern {
    /// Creates a pattern.
    #[must_use]
    pub fn new(pattern: impl Into<String>) -> Self {
        Self(pattern.into())
    }

    /// Returns the raw pattern.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if the key matches. The tenant is not considered.
    #[must_use]
    pub fn matches(&self, key: &OperationKey) -> bool {
        match self.0.strip_suffix('*') {
            Some(prefix) => key.scoped_key().starts_with(prefix),
            None => key.operation() == self.0 || key.scoped_key() == self.0,
        }
    }
}

impl fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for KeyPattern {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for KeyPattern {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Maps a completed operation to the cache patterns it invalidates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InvalidationRules {
    rules: HashMap<String, Vec<KeyPattern>>,
}

impl Default for InvalidationRules {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl InvalidationRules {
    /// Creates an empty rule set.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            rules: HashMap::new(),
        }
    }

    /// Creates the built-in rule set for property, DNS and network list
    /// operations.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut rules = Self::empty();
        rules.add_rule("property.create", ["property.list*"]);
        rules.add_rule("property.delete", ["property.list*", "property.get*"]);
        for op in ["dns.record.create", "dns.record.update", "dns.record.delete"] {
            rules.add_rule(op, ["dns.record.list*", "dns.zone.get*"]);
        }
        rules.add_rule("network_list.update", ["network_list.*"]);
        rules
    }

    /// Adds patterns for a triggering operation, keeping existing ones.
    pub fn add_rule<I, P>(&mut self, trigger: impl Into<String>, patterns: I)
    where
        I: IntoIterator<Item = P>,
        P: Into<KeyPattern>,
    {
        let entry = self.rules.entry(trigger.into()).or_default();
        for pattern in patterns {
            let pattern = pattern.into();
            if !entry.contains(&pattern) {
                entry.push(pattern);
            }
        }
    }

    /// Removes all patterns for a trigger.
    pub fn remove_rule(&mut self, trigger: &str) -> Option<Vec<KeyPattern>> {
        self.rules.remove(trigger)
    }

    /// Patterns invalidated when `operation` completes.
    #[must_use]
    pub fn patterns_for(&self, operation: &str) -> &[KeyPattern] {
        self.rules.get(operation).map(Vec::as_slice).unwrap_or_default()
    }

    /// Number of trigger operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Returns true if there are no rules.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
