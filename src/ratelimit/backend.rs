//! Counter store trait for abstracting local and distributed implementations.

use std::sync::Arc;

use async_trait::async_trait;

use super::algorithm::Decision;
use super::key::TargetKey;
use super::rules::Rule;
use crate::error::Result;

/// Trait for counter store implementations.
///
/// This trait abstracts over both the in-process [`LocalStore`] and the
/// Redis-backed [`RedisStore`] so the limiter can work with either. A store
/// owns the per-target state and penalty locks and runs the whole
/// lock-check, evaluate, persist sequence for one key atomically.
///
/// [`LocalStore`]: super::LocalStore
/// [`RedisStore`]: super::RedisStore
#[async_trait]
pub trait RateLimitBackend: Send + Sync {
    /// Current instant in epoch milliseconds, from this store's clock.
    fn now_millis(&self) -> Result<i64>;

    /// Suspending variant of [`RateLimitBackend::now_millis`].
    async fn now_millis_async(&self) -> Result<i64> {
        self.now_millis()
    }

    /// Evaluate `rule` for `key` at `now_ms` and persist the outcome.
    fn check(&self, key: &TargetKey, rule: &Rule, now_ms: i64) -> Result<Decision>;

    /// Suspending variant of [`RateLimitBackend::check`].
    async fn check_async(&self, key: &TargetKey, rule: &Rule, now_ms: i64) -> Result<Decision> {
        self.check(key, rule, now_ms)
    }
}

#[async_trait]
impl<B: RateLimitBackend + ?Sized> RateLimitBackend for Arc<B> {
    fn now_millis(&self) -> Result<i64> {
        (**self).now_millis()
    }

    async fn now_millis_async(&self) -> Result<i64> {
        (**self).now_millis_async().await
    }

    fn check(&self, key: &TargetKey, rule: &Rule, now_ms: i64) -> Result<Decision> {
        (**self).check(key, rule, now_ms)
    }

    async fn check_async(&self, key: &TargetKey, rule: &Rule, now_ms: i64) -> Result<Decision> {
        (**self).check_async(key, rule, now_ms).await
    }
}
