//! Rate limiter: runs every rule against a target and aggregates the outcome.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, trace, warn};

use super::algorithm::Decision;
use super::backend::RateLimitBackend;
use super::key::TargetKey;
use super::overrides::RuleOverrides;
use super::result::{AggregateResult, RuleCheckResult};
use super::rules::Rule;
use crate::error::{Result, SluiceError};

type TargetHook = Arc<dyn Fn(&str) + Send + Sync>;
type ResultHook = Arc<dyn Fn(&str, &AggregateResult) + Send + Sync>;

/// Optional callbacks around each check.
///
/// `on_triggered` runs when at least one rule denied, including when the
/// check is about to fail with [`SluiceError::Throttled`].
#[derive(Clone, Default)]
pub struct CheckHooks {
    before_check: Option<TargetHook>,
    after_check: Option<ResultHook>,
    on_triggered: Option<ResultHook>,
}

impl CheckHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_before_check(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.before_check = Some(Arc::new(hook));
        self
    }

    pub fn with_after_check(mut self, hook: impl Fn(&str, &AggregateResult) + Send + Sync + 'static) -> Self {
        self.after_check = Some(Arc::new(hook));
        self
    }

    pub fn with_on_triggered(mut self, hook: impl Fn(&str, &AggregateResult) + Send + Sync + 'static) -> Self {
        self.on_triggered = Some(Arc::new(hook));
        self
    }

    fn before(&self, target: &str) {
        if let Some(hook) = &self.before_check {
            hook(target);
        }
    }

    fn after(&self, target: &str, aggregate: &AggregateResult) {
        if aggregate.is_limit() {
            if let Some(hook) = &self.on_triggered {
                hook(target, aggregate);
            }
        }
        if let Some(hook) = &self.after_check {
            hook(target, aggregate);
        }
    }
}

impl fmt::Debug for CheckHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckHooks")
            .field("before_check", &self.before_check.is_some())
            .field("after_check", &self.after_check.is_some())
            .field("on_triggered", &self.on_triggered.is_some())
            .finish()
    }
}

enum RuleList {
    Fixed(Arc<Vec<Rule>>),
    Updatable(RwLock<Arc<Vec<Rule>>>),
}

/// The rate limiter that checks targets against a list of rules.
///
/// Each check reads the current instant once and evaluates every rule in
/// order against the backend. The request is denied if any rule denies, and
/// the suggested wait is the largest wait any rule reported. A rule with
/// `raise_on_limit` turns its denial into [`SluiceError::Throttled`] and
/// stops the check there.
///
/// This struct is thread-safe and can be shared across multiple tasks.
pub struct RateLimiter<B> {
    backend: B,
    rules: RuleList,
    hooks: CheckHooks,
}

impl<B: RateLimitBackend> RateLimiter<B> {
    /// Create a rate limiter whose rules are fixed for its lifetime.
    pub fn new(backend: B, rules: Vec<Rule>) -> Self {
        warn_on_shared_counters(&rules);
        Self {
            backend,
            rules: RuleList::Fixed(Arc::new(rules)),
            hooks: CheckHooks::default(),
        }
    }

    /// Create a rate limiter whose rules can be replaced with
    /// [`RateLimiter::update_rules`].
    pub fn updatable(backend: B, rules: Vec<Rule>) -> Self {
        warn_on_shared_counters(&rules);
        Self {
            backend,
            rules: RuleList::Updatable(RwLock::new(Arc::new(rules))),
            hooks: CheckHooks::default(),
        }
    }

    pub fn with_hooks(mut self, hooks: CheckHooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Snapshot of the current rules.
    pub fn rules(&self) -> Arc<Vec<Rule>> {
        match &self.rules {
            RuleList::Fixed(rules) => rules.clone(),
            RuleList::Updatable(rules) => rules.read().clone(),
        }
    }

    pub fn is_updatable(&self) -> bool {
        matches!(self.rules, RuleList::Updatable(_))
    }

    /// Replace the rules. Checks already running keep the rules they started with.
    pub fn update_rules(&self, rules: Vec<Rule>) -> Result<()> {
        match &self.rules {
            RuleList::Fixed(_) => Err(SluiceError::Config(
                "rules can only be updated on an updatable rate limiter".to_string(),
            )),
            RuleList::Updatable(current) => {
                info!(rules = rules.len(), "Rate limit rules updated");
                warn_on_shared_counters(&rules);
                *current.write() = Arc::new(rules);
                Ok(())
            }
        }
    }

    /// Check `target` against the configured rules.
    pub fn check(&self, target: &str) -> Result<AggregateResult> {
        self.check_rules(target, &self.rules(), None)
    }

    /// Check `target` with per-check overrides applied to the configured rules.
    pub fn check_with_overrides(&self, target: &str, overrides: &RuleOverrides) -> Result<AggregateResult> {
        self.check_rules(target, &self.rules(), Some(overrides))
    }

    /// Check `target` against an explicit list of rules.
    pub fn check_rules(
        &self,
        target: &str,
        rules: &[Rule],
        overrides: Option<&RuleOverrides>,
    ) -> Result<AggregateResult> {
        self.hooks.before(target);
        let rules = resolve(rules, overrides)?;
        let now_ms = self.backend.now_millis()?;

        let mut results = Vec::with_capacity(rules.len());
        for rule in rules {
            let key = TargetKey::new(target, &rule);
            let decision = self.backend.check(&key, &rule, now_ms)?;
            self.record(target, &key, rule, decision, &mut results)?;
        }
        Ok(self.finish(target, results))
    }

    /// Suspending variant of [`RateLimiter::check`].
    pub async fn check_async(&self, target: &str) -> Result<AggregateResult> {
        let rules = self.rules();
        self.check_rules_async(target, &rules, None).await
    }

    /// Suspending variant of [`RateLimiter::check_with_overrides`].
    pub async fn check_with_overrides_async(
        &self,
        target: &str,
        overrides: &RuleOverrides,
    ) -> Result<AggregateResult> {
        let rules = self.rules();
        self.check_rules_async(target, &rules, Some(overrides)).await
    }

    /// Suspending variant of [`RateLimiter::check_rules`].
    pub async fn check_rules_async(
        &self,
        target: &str,
        rules: &[Rule],
        overrides: Option<&RuleOverrides>,
    ) -> Result<AggregateResult> {
        self.hooks.before(target);
        let rules = resolve(rules, overrides)?;
        let now_ms = self.backend.now_millis_async().await?;

        let mut results = Vec::with_capacity(rules.len());
        for rule in rules {
            let key = TargetKey::new(target, &rule);
            let decision = self.backend.check_async(&key, &rule, now_ms).await?;
            self.record(target, &key, rule, decision, &mut results)?;
        }
        Ok(self.finish(target, results))
    }

    /// Check `target` and, if allowed, sleep for the suggested wait before
    /// returning.
    pub async fn check_and_wait_async(&self, target: &str) -> Result<AggregateResult> {
        let aggregate = self.check_async(target).await?;
        if !aggregate.is_limit() {
            let wait = aggregate.wait();
            if !wait.is_zero() {
                trace!(target = %target, wait_ms = wait.as_millis() as u64, "Waiting before proceeding");
                tokio::time::sleep(wait).await;
            }
        }
        Ok(aggregate)
    }

    fn record(
        &self,
        target: &str,
        key: &TargetKey,
        rule: Rule,
        decision: Decision,
        results: &mut Vec<RuleCheckResult>,
    ) -> Result<()> {
        trace!(
            key = %key,
            rule = %rule.name(),
            limited = decision.limited,
            count = decision.count,
            wait_ms = decision.wait_ms,
            "Rule evaluated"
        );

        let raise = decision.limited && rule.raise_on_limit();
        if decision.limited {
            debug!(key = %key, rule = %rule.name(), count = decision.count, "Rate limit triggered");
        }

        let rule_name = rule.name().to_string();
        results.push(RuleCheckResult {
            target: target.to_string(),
            raise_on_limit: rule.raise_on_limit(),
            rule,
            is_limit: decision.limited,
            count: decision.count,
            wait_ms: decision.wait_ms,
        });

        if raise {
            let partial = AggregateResult::new(std::mem::take(results));
            self.hooks.after(target, &partial);
            return Err(SluiceError::Throttled {
                target: target.to_string(),
                rule: rule_name,
            });
        }
        Ok(())
    }

    fn finish(&self, target: &str, results: Vec<RuleCheckResult>) -> AggregateResult {
        let aggregate = AggregateResult::new(results);
        self.hooks.after(target, &aggregate);
        aggregate
    }
}

/// Rules of the same algorithm share counters unless their ids differ.
fn warn_on_shared_counters(rules: &[Rule]) {
    for (i, rule) in rules.iter().enumerate() {
        let shared = rules[..i]
            .iter()
            .any(|earlier| earlier.kind() == rule.kind() && earlier.id() == rule.id());
        if shared {
            warn!(rule = %rule.name(), "Rules share counters for every target, give them distinct ids");
        }
    }
}

/// The rules to evaluate for one check, with overrides applied.
fn resolve(rules: &[Rule], overrides: Option<&RuleOverrides>) -> Result<Vec<Rule>> {
    match overrides {
        Some(overrides) => rules.iter().map(|rule| overrides.apply(rule)).collect(),
        None => Ok(rules.to_vec()),
    }
}
