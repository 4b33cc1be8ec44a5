//! Check results.

use std::time::Duration;

use serde::Serialize;

use super::rules::Rule;

/// The outcome of one rule for one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleCheckResult {
    /// The target that was checked
    pub target: String,
    /// The rule as it was applied, including any per-check override
    pub rule: Rule,
    /// Whether the request is denied by this rule
    pub is_limit: bool,
    /// Remaining (buckets) or observed (windows) quantity; -1 when the
    /// target is under a penalty lock
    pub count: i64,
    /// Suggested delay in milliseconds before proceeding. Only leaky
    /// buckets suggest a delay; they report -1 when denying.
    pub wait_ms: i64,
    /// Whether the rule asked for denials to raise
    pub raise_on_limit: bool,
}

impl RuleCheckResult {
    /// Suggested delay, zero when none applies.
    pub fn wait(&self) -> Duration {
        Duration::from_millis(self.wait_ms.max(0) as u64)
    }
}

/// The combined outcome of every rule for one target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AggregateResult {
    /// Per-rule results, in rule order
    pub results: Vec<RuleCheckResult>,
}

impl AggregateResult {
    pub fn new(results: Vec<RuleCheckResult>) -> Self {
        Self { results }
    }

    /// Denied if any rule denied.
    pub fn is_limit(&self) -> bool {
        self.results.iter().any(|r| r.is_limit)
    }

    /// Largest suggested wait across all rules, in milliseconds.
    pub fn wait_ms(&self) -> i64 {
        self.results.iter().map(|r| r.wait_ms).max().unwrap_or(0)
    }

    /// Largest suggested wait, zero when none applies.
    pub fn wait(&self) -> Duration {
        Duration::from_millis(self.wait_ms().max(0) as u64)
    }

    /// Results of the rules that denied.
    pub fn limited(&self) -> impl Iterator<Item = &RuleCheckResult> {
        self.results.iter().filter(|r| r.is_limit)
    }
}
