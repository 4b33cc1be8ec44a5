//! Sliding window over a circular record of sub-period counts.
//!
//! The window is split into `sub_period_count` sub-periods. Each check drops
//! sub-periods that have slid out of the window, sums the rest, and admits
//! the request only while that sum is below the threshold. Memory per target
//! is one slot per sub-period, and the window edge is accurate to one
//! sub-period.
//!
//! When a check runs with a different sub-period layout than the stored
//! one (an override or a rule update), the live total of the stored layout
//! moves into the current sub-period of a fresh layout.

use super::{CounterState, Decision, SlidingState, SubPeriod};
use crate::ratelimit::alignment::StartAlignment;
use crate::ratelimit::rules::SlidingWindowRule;

pub fn evaluate(
    rule: &SlidingWindowRule,
    alignment: StartAlignment,
    state: Option<&SlidingState>,
    now_ms: i64,
) -> Decision {
    let sub_period = rule.sub_period_ms();
    let slots_len = rule.sub_period_count();

    let (origin_ms, mut slots) = match state {
        Some(s) if s.sub_period_ms == sub_period && s.slots.len() as i64 == slots_len => {
            (s.origin_ms, s.slots.clone())
        }
        _ => {
            let origin_ms = alignment.window_start(now_ms, sub_period);
            let mut slots = vec![SubPeriod::default(); slots_len as usize];
            if let Some(s) = state {
                let index = (now_ms - origin_ms).div_euclid(sub_period);
                slots[index.rem_euclid(slots_len) as usize] = SubPeriod {
                    index,
                    count: live_total(s, now_ms),
                };
            }
            (origin_ms, slots)
        }
    };

    let current = (now_ms - origin_ms).div_euclid(sub_period);
    for slot in slots.iter_mut() {
        if slot.index <= current - slots_len {
            *slot = SubPeriod::default();
        }
    }

    let total: i64 = slots.iter().map(|s| s.count).sum();
    if total >= rule.threshold() {
        return Decision::deny(total, 0);
    }

    let slot = &mut slots[current.rem_euclid(slots_len) as usize];
    if slot.index != current {
        *slot = SubPeriod {
            index: current,
            count: 0,
        };
    }
    slot.count += 1;

    let next = SlidingState {
        origin_ms,
        sub_period_ms: sub_period,
        slots,
    };
    Decision::allow(
        total + 1,
        0,
        CounterState::SlidingWindow(next),
        now_ms.saturating_add(idle_ttl_ms(rule)),
    )
}

/// Sum of the sub-periods of `state` still inside its own window at `now_ms`.
fn live_total(state: &SlidingState, now_ms: i64) -> i64 {
    if state.sub_period_ms <= 0 {
        return 0;
    }
    let slots_len = state.slots.len() as i64;
    let current = (now_ms - state.origin_ms).div_euclid(state.sub_period_ms);
    state
        .slots
        .iter()
        .filter(|slot| slot.index > current - slots_len)
        .map(|slot| slot.count)
        .sum()
}

/// Time after the last write at which every sub-period has slid out.
pub fn idle_ttl_ms(rule: &SlidingWindowRule) -> i64 {
    rule.window_ms().saturating_add(rule.sub_period_ms())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::VecDeque;
    use std::time::Duration;

    const T0: i64 = 1_700_000_000_000;

    fn rule(threshold: i64, window_ms: u64, sub_ms: u64) -> SlidingWindowRule {
        SlidingWindowRule::new(threshold, Duration::from_millis(window_ms), Duration::from_millis(sub_ms))
            .unwrap()
    }

    fn sliding(decision: &Decision) -> SlidingState {
        match &decision.next {
            Some(CounterState::SlidingWindow(s)) => s.clone(),
            other => panic!("unexpected state {:?}", other),
        }
    }

    #[test]
    fn test_denies_at_threshold_within_window() {
        let rule = rule(3, 1_000, 250);
        let mut state = None;
        for (i, at) in [0, 100, 300].into_iter().enumerate() {
            let decision = evaluate(&rule, StartAlignment::FromFirstRequest, state.as_ref(), T0 + at);
            assert!(!decision.limited);
            assert_eq!(decision.count, i as i64 + 1);
            state = Some(sliding(&decision));
        }

        let denied = evaluate(&rule, StartAlignment::FromFirstRequest, state.as_ref(), T0 + 900);
        assert!(denied.limited);
        assert_eq!(denied.count, 3);
        assert!(denied.next.is_none());
    }

    #[test]
    fn test_old_sub_periods_slide_out() {
        let rule = rule(3, 1_000, 250);
        let mut state = None;
        for at in [0, 100, 300] {
            let decision = evaluate(&rule, StartAlignment::FromFirstRequest, state.as_ref(), T0 + at);
            state = Some(sliding(&decision));
        }

        // At 1000ms sub-period 0 (two requests) has left the window.
        let decision = evaluate(&rule, StartAlignment::FromFirstRequest, state.as_ref(), T0 + 1_000);
        assert!(!decision.limited);
        assert_eq!(decision.count, 2);
        state = Some(sliding(&decision));

        let decision = evaluate(&rule, StartAlignment::FromFirstRequest, state.as_ref(), T0 + 1_010);
        assert!(!decision.limited);
        assert_eq!(decision.count, 3);
        state = Some(sliding(&decision));

        let denied = evaluate(&rule, StartAlignment::FromFirstRequest, state.as_ref(), T0 + 1_020);
        assert!(denied.limited);
    }

    #[test]
    fn test_layout_change_keeps_live_total() {
        let fine = rule(3, 1_000, 100);
        let coarse = rule(3, 1_000, 500);
        let mut state = None;
        for at in [0, 50] {
            let decision = evaluate(&fine, StartAlignment::FromFirstRequest, state.as_ref(), T0 + at);
            state = Some(sliding(&decision));
        }

        let decision = evaluate(&coarse, StartAlignment::FromFirstRequest, state.as_ref(), T0 + 150);
        assert!(!decision.limited);
        assert_eq!(decision.count, 3);
        let moved = sliding(&decision);
        assert_eq!(moved.sub_period_ms, 500);
        assert_eq!(moved.slots.len(), 2);

        // back to the fine layout: the carried total still counts
        let before = moved.clone();
        let denied = evaluate(&fine, StartAlignment::FromFirstRequest, Some(&moved), T0 + 200);
        assert!(denied.limited);
        assert_eq!(denied.count, 3);
        assert!(denied.next.is_none());
        assert_eq!(moved, before);
    }

    #[test]
    fn test_layout_change_drops_expired_sub_periods() {
        let fine = rule(3, 1_000, 100);
        let coarse = rule(3, 1_000, 500);
        let first = evaluate(&fine, StartAlignment::FromFirstRequest, None, T0);
        let state = sliding(&first);

        let decision = evaluate(&coarse, StartAlignment::FromFirstRequest, Some(&state), T0 + 1_000);
        assert!(!decision.limited);
        assert_eq!(decision.count, 1);
    }

    #[test]
    fn test_zero_threshold_denies_without_state() {
        let rule = rule(0, 1_000, 100);
        let decision = evaluate(&rule, StartAlignment::FromFirstRequest, None, T0);
        assert!(decision.limited);
        assert_eq!(decision.count, 0);
    }

    proptest! {
        #[test]
        fn prop_never_more_than_threshold_across_live_sub_periods(
            threshold in 1i64..8,
            sub_ms in 10u64..200,
            periods in 1u64..6,
            steps in proptest::collection::vec(0i64..150, 1..120),
        ) {
            let rule = rule(threshold, sub_ms * periods, sub_ms);
            let periods = periods as i64;
            let sub_ms = sub_ms as i64;
            let mut state: Option<SlidingState> = None;
            let mut admitted: VecDeque<i64> = VecDeque::new();
            let mut origin = None;
            let mut now = T0;
            for step in steps {
                now += step;
                let origin = *origin.get_or_insert(now);
                let current = (now - origin).div_euclid(sub_ms);
                let decision = evaluate(&rule, StartAlignment::FromFirstRequest, state.as_ref(), now);
                if decision.limited {
                    prop_assert!(decision.next.is_none());
                    continue;
                }
                state = Some(sliding(&decision));
                admitted.push_back(current);
                while let Some(&front) = admitted.front() {
                    if front <= current - periods {
                        admitted.pop_front();
                    } else {
                        break;
                    }
                }
                prop_assert!(admitted.len() as i64 <= threshold);
            }
        }
    }
}
