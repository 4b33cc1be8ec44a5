//! Leaky bucket.
//!
//! Requests join a queue that drains `outflow_quantity_per_unit` requests
//! every `outflow_unit`. Instead of holding requests in a real queue, an
//! admitted request is told how long to wait before proceeding, which is
//! the time its batch needs to reach the head of the queue. Requests are
//! denied only once the queue is full (`capacity` waiting plus the batch
//! currently draining).

use super::{ceil_div, BucketState, CounterState, Decision};
use crate::ratelimit::alignment::StartAlignment;
use crate::ratelimit::rules::LeakyBucketRule;

pub fn evaluate(
    rule: &LeakyBucketRule,
    alignment: StartAlignment,
    state: Option<&BucketState>,
    now_ms: i64,
) -> Decision {
    let capacity = rule.capacity();
    let per_unit = rule.outflow_quantity_per_unit();
    let unit = rule.outflow_unit_ms();
    let expires_at_ms = now_ms.saturating_add(idle_ttl_ms(rule));

    let Some(state) = state else {
        let next = BucketState {
            value: 1,
            last_flow_ms: alignment.window_start(now_ms, unit),
        };
        return Decision::allow(
            visible_depth(1, per_unit),
            0,
            CounterState::LeakyBucket(next),
            expires_at_ms,
        );
    };

    let elapsed = (now_ms - state.last_flow_ms).max(0);
    let (candidate, last_flow_ms, wait_ms) = if elapsed < unit {
        let candidate = state.value.saturating_add(1);
        if candidate > capacity.saturating_add(per_unit) {
            return Decision::deny(capacity, -1);
        }
        let wait = batch_wait(candidate, per_unit, unit, unit - elapsed);
        (candidate, state.last_flow_ms, wait)
    } else {
        let units = elapsed / unit;
        let last_flow_ms = state.last_flow_ms + units * unit;
        if state.value < per_unit {
            (1, last_flow_ms, 0)
        } else {
            let drained = units.saturating_mul(per_unit);
            let net = state.value.saturating_sub(drained) + 1;
            let candidate = if net > 0 { net } else { 1 };
            let rest_of_unit = unit - (now_ms - last_flow_ms);
            let wait = batch_wait(candidate, per_unit, unit, rest_of_unit);
            (candidate, last_flow_ms, wait)
        }
    };

    let next = BucketState {
        value: candidate,
        last_flow_ms,
    };
    Decision::allow(
        visible_depth(candidate, per_unit),
        wait_ms,
        CounterState::LeakyBucket(next),
        expires_at_ms,
    )
}

/// Delay for the `candidate`-th queued request: the rest of the current
/// unit, plus one full unit for every batch ahead of it beyond the first.
fn batch_wait(candidate: i64, per_unit: i64, unit: i64, rest_of_unit: i64) -> i64 {
    if candidate <= per_unit {
        return 0;
    }
    let batch = ceil_div(candidate, per_unit) - 1;
    if batch == 1 {
        rest_of_unit
    } else {
        unit.saturating_mul(batch - 1).saturating_add(rest_of_unit)
    }
}

/// Queue depth excluding the batch that drains in the current unit.
fn visible_depth(candidate: i64, per_unit: i64) -> i64 {
    (candidate - per_unit).max(0)
}

/// Time after the last write at which a full queue has drained.
pub fn idle_ttl_ms(rule: &LeakyBucketRule) -> i64 {
    let per_unit = rule.outflow_quantity_per_unit();
    let units_to_drain = ceil_div(rule.capacity().saturating_add(per_unit), per_unit);
    rule.outflow_unit_ms().saturating_mul(units_to_drain.saturating_add(1))
}
