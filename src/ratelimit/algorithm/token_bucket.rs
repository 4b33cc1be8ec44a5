//! Token bucket.
//!
//! The bucket starts full. Every `inflow_unit` that passes adds
//! `inflow_quantity_per_unit` tokens (never more than `capacity`), and every
//! admitted request takes one token.

use super::{ceil_div, BucketState, CounterState, Decision};
use crate::ratelimit::alignment::StartAlignment;
use crate::ratelimit::rules::TokenBucketRule;

pub fn evaluate(
    rule: &TokenBucketRule,
    alignment: StartAlignment,
    state: Option<&BucketState>,
    now_ms: i64,
) -> Decision {
    let capacity = rule.capacity();
    let unit = rule.inflow_unit_ms();
    let expires_at_ms = now_ms.saturating_add(idle_ttl_ms(rule));

    let Some(state) = state else {
        let value = capacity - 1;
        let next = BucketState {
            value,
            last_flow_ms: alignment.window_start(now_ms, unit),
        };
        return Decision::allow(value, 0, CounterState::TokenBucket(next), expires_at_ms);
    };

    let elapsed = (now_ms - state.last_flow_ms).max(0);
    let (mut tentative, last_flow_ms) = if elapsed < unit {
        (state.value - 1, state.last_flow_ms)
    } else {
        let units = elapsed / unit;
        let inflow = units.saturating_mul(rule.inflow_quantity_per_unit());
        (
            state.value.max(0).saturating_add(inflow) - 1,
            state.last_flow_ms + units * unit,
        )
    };

    if tentative >= capacity {
        tentative = capacity - 1;
    }

    if tentative < 0 {
        return Decision::deny(tentative, 0);
    }

    let next = BucketState {
        value: tentative,
        last_flow_ms,
    };
    Decision::allow(tentative, 0, CounterState::TokenBucket(next), expires_at_ms)
}

/// Time after the last write at which an empty bucket is full again.
pub fn idle_ttl_ms(rule: &TokenBucketRule) -> i64 {
    let unit = rule.inflow_unit_ms();
    let units_to_fill = ceil_div(rule.capacity(), rule.inflow_quantity_per_unit());
    unit.saturating_mul(units_to_fill + 1)
}
