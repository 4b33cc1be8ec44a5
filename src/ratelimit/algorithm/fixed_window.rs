//! Fixed window: a single counter that resets when its window closes.

use super::{CounterState, Decision, WindowState};
use crate::ratelimit::alignment::StartAlignment;
use crate::ratelimit::rules::FixedWindowRule;

pub fn evaluate(
    rule: &FixedWindowRule,
    alignment: StartAlignment,
    state: Option<&WindowState>,
    now_ms: i64,
) -> Decision {
    let threshold = rule.threshold();

    let live = state.filter(|s| now_ms < s.window_end_ms);
    let Some(state) = live else {
        if threshold == 0 {
            return Decision::deny(0, 0);
        }
        let window = rule.window_ms();
        let window_end_ms = alignment.window_start(now_ms, window) + window;
        let next = WindowState {
            value: 1,
            window_end_ms,
        };
        return Decision::allow(1, 0, CounterState::FixedWindow(next), window_end_ms);
    };

    if state.value >= threshold {
        return Decision::deny(state.value, 0);
    }

    let next = WindowState {
        value: state.value + 1,
        window_end_ms: state.window_end_ms,
    };
    Decision::allow(next.value, 0, CounterState::FixedWindow(next), state.window_end_ms)
}
