//! Rate limiting logic and state management.

pub mod algorithm;
mod alignment;
mod backend;
mod distributed;
mod key;
mod limiter;
mod local;
mod notation;
mod overrides;
mod penalty;
mod result;
mod rules;
mod time;

pub use alignment::StartAlignment;
pub use backend::RateLimitBackend;
pub use distributed::{RedisStore, RedisTimeSource};
pub use key::TargetKey;
pub use limiter::{CheckHooks, RateLimiter};
pub use local::LocalStore;
pub use notation::{format_period, parse_period};
pub use overrides::{
    FixedWindowOverride, LeakyBucketOverride, RuleOverrides, SlidingWindowOverride, TokenBucketOverride,
};
pub use penalty::PenaltyLocks;
pub use result::{AggregateResult, RuleCheckResult};
pub use rules::{
    AlgorithmConfig, FixedWindowRule, LeakyBucketRule, PeriodValue, Rule, RuleConfig, RuleKind, RuleOptions,
    RuleSet, SlidingWindowRule, TokenBucketRule, MAX_LOCK_SECONDS, MAX_QUANTITY,
};
pub use time::{ManualTimeSource, SystemTimeSource, TimeSource};
