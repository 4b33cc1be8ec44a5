//! Pure decision logic for the four rate limiting algorithms.
//!
//! Each algorithm maps (stored state, rule, current instant) to a
//! [`Decision`]. Nothing here touches a store or a clock: backends read the
//! state, call [`evaluate`] inside their critical section, and persist
//! [`Decision::next`] when it is present. A denial never carries a next
//! state, so a denied check leaves the stored state untouched.

pub mod fixed_window;
pub mod leaky_bucket;
pub mod sliding_window;
pub mod token_bucket;

use super::rules::{Rule, RuleKind};

/// Stored state of a token or leaky bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketState {
    /// Tokens left (token bucket) or queued requests (leaky bucket)
    pub value: i64,
    /// Instant (epoch ms) up to which flow has been accounted
    pub last_flow_ms: i64,
}

/// Stored state of a fixed window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowState {
    /// Requests admitted in the current window
    pub value: i64,
    /// Instant (epoch ms) at which the window closes
    pub window_end_ms: i64,
}

/// One sub-period bucket of a sliding window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubPeriod {
    /// Absolute sub-period index since the window origin
    pub index: i64,
    pub count: i64,
}

/// Stored state of a sliding window: a circular record of sub-period counts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlidingState {
    /// Instant (epoch ms) sub-period indices are measured from
    pub origin_ms: i64,
    /// Sub-period length the slots were recorded with
    pub sub_period_ms: i64,
    /// Slot `i` holds the sub-period whose index is congruent to `i`
    pub slots: Vec<SubPeriod>,
}

/// Per-target state, tagged by the algorithm that owns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CounterState {
    TokenBucket(BucketState),
    LeakyBucket(BucketState),
    FixedWindow(WindowState),
    SlidingWindow(SlidingState),
}

/// The outcome of evaluating one rule for one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request is denied
    pub limited: bool,
    /// Remaining or observed quantity, -1 when denied by a penalty lock
    pub count: i64,
    /// Suggested delay in milliseconds; -1 when a leaky bucket denies
    pub wait_ms: i64,
    /// State to persist, present only when the request is allowed
    pub next: Option<CounterState>,
    /// Instant (epoch ms) after which `next` is equivalent to no state
    pub expires_at_ms: i64,
}

impl Decision {
    fn allow(count: i64, wait_ms: i64, next: CounterState, expires_at_ms: i64) -> Self {
        Self {
            limited: false,
            count,
            wait_ms,
            next: Some(next),
            expires_at_ms,
        }
    }

    fn deny(count: i64, wait_ms: i64) -> Self {
        Self {
            limited: true,
            count,
            wait_ms,
            next: None,
            expires_at_ms: 0,
        }
    }

    /// Denial for a target under an active penalty lock.
    pub fn locked(kind: RuleKind) -> Self {
        let wait_ms = if kind == RuleKind::LeakyBucket { -1 } else { 0 };
        Self::deny(-1, wait_ms)
    }

    /// Whether this denial should set the penalty lock for `rule`.
    pub fn trips_lock(&self, rule: &Rule) -> bool {
        self.limited && rule.lock_seconds() > 0
    }
}

/// Evaluate `rule` against the stored state at `now_ms`.
///
/// State owned by a different algorithm is treated as absent.
pub fn evaluate(rule: &Rule, state: Option<&CounterState>, now_ms: i64) -> Decision {
    let alignment = rule.alignment();
    match rule {
        Rule::TokenBucket(r) => {
            let state = match state {
                Some(CounterState::TokenBucket(s)) => Some(s),
                _ => None,
            };
            token_bucket::evaluate(r, alignment, state, now_ms)
        }
        Rule::LeakyBucket(r) => {
            let state = match state {
                Some(CounterState::LeakyBucket(s)) => Some(s),
                _ => None,
            };
            leaky_bucket::evaluate(r, alignment, state, now_ms)
        }
        Rule::FixedWindow(r) => {
            let state = match state {
                Some(CounterState::FixedWindow(s)) => Some(s),
                _ => None,
            };
            fixed_window::evaluate(r, alignment, state, now_ms)
        }
        Rule::SlidingWindow(r) => {
            let state = match state {
                Some(CounterState::SlidingWindow(s)) => Some(s),
                _ => None,
            };
            sliding_window::evaluate(r, alignment, state, now_ms)
        }
    }
}

/// `ceil(a / b)` for positive operands.
pub(crate) fn ceil_div(a: i64, b: i64) -> i64 {
    a / b + i64::from(a % b != 0)
}
