//! Storage key generation for a (rule, target) pair.

use std::fmt;

use super::rules::{Rule, RuleKind};

/// A key that uniquely identifies the state of one rule for one target.
///
/// The key is the target namespaced by the rule's algorithm and, when the
/// rule has one, its id. Rules of different algorithms never share state,
/// and two rules of the same algorithm share counters only when they share
/// an id or both omit one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetKey {
    /// The caller-supplied target
    pub target: String,
    /// The algorithm that owns this state
    pub kind: RuleKind,
    /// The id of the rule this state belongs to
    pub rule_id: Option<String>,
}

impl TargetKey {
    /// Create a new key for `target` under `rule`.
    pub fn new(target: &str, rule: &Rule) -> Self {
        Self {
            target: target.to_string(),
            kind: rule.kind(),
            rule_id: rule.id().map(str::to_string),
        }
    }

    /// Key holding the counter value.
    pub fn value_key(&self) -> String {
        match &self.rule_id {
            Some(id) => format!("{}:{}:{}", self.kind.as_str(), id, self.target),
            None => format!("{}:{}", self.kind.as_str(), self.target),
        }
    }

    /// Key holding the last-flow or start instant.
    pub fn start_key(&self) -> String {
        format!("{}-st", self.value_key())
    }

    /// Key holding the penalty lock flag.
    pub fn lock_key(&self) -> String {
        format!("{}-lock", self.value_key())
    }
}

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::rules::{FixedWindowRule, TokenBucketRule};
    use std::time::Duration;

    fn rule() -> Rule {
        FixedWindowRule::new(3, Duration::from_secs(1)).unwrap().into()
    }

    #[test]
    fn test_key_without_rule_id() {
        let key = TargetKey::new("10.0.0.1", &rule());
        assert_eq!(key.value_key(), "fixed_window:10.0.0.1");
        assert_eq!(key.start_key(), "fixed_window:10.0.0.1-st");
        assert_eq!(key.lock_key(), "fixed_window:10.0.0.1-lock");
    }

    #[test]
    fn test_key_with_rule_id() {
        let key = TargetKey::new("client_a", &rule().with_id("login"));
        assert_eq!(key.to_string(), "fixed_window:login:client_a");
        assert_eq!(key.start_key(), "fixed_window:login:client_a-st");
        assert_eq!(key.lock_key(), "fixed_window:login:client_a-lock");
    }

    #[test]
    fn test_key_equality() {
        let key1 = TargetKey::new("t", &rule().with_id("a"));
        let key2 = TargetKey::new("t", &rule().with_id("a"));
        let key3 = TargetKey::new("t", &rule().with_id("b"));

        assert_eq!(key1, key2);
        assert_ne!(key1, key3);
    }

    #[test]
    fn test_rules_of_different_algorithms_never_share_a_key() {
        let token: Rule = TokenBucketRule::new(1, 1, Duration::from_secs(60)).unwrap().into();
        assert_ne!(TargetKey::new("t", &rule()), TargetKey::new("t", &token));
        assert_ne!(
            TargetKey::new("t", &rule().with_id("shared")).value_key(),
            TargetKey::new("t", &token.with_id("shared")).value_key()
        );
    }
}
