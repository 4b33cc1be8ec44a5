//! Time-window start alignment.

use serde::{Deserialize, Serialize};

const SECOND_MS: i64 = 1_000;
const MINUTE_MS: i64 = 60 * SECOND_MS;
const HOUR_MS: i64 = 60 * MINUTE_MS;
const DAY_MS: i64 = 24 * HOUR_MS;

/// How the start of a rule's window is anchored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartAlignment {
    /// The window starts at the first request observed for a target.
    #[default]
    FromFirstRequest,
    /// The window starts at a natural wall-clock boundary (top of the
    /// second, minute, hour or day).
    FromNaturalPeriodBoundary,
}

impl StartAlignment {
    /// Compute the window start for `now_ms` and a window of `window_ms`.
    ///
    /// Both values are epoch milliseconds. A window that divides one day
    /// evenly starts on a multiple of itself since midnight UTC, so a 10s
    /// window starts at :00, :10, :20 and so on. Other windows are truncated
    /// to the largest calendar unit that fits inside them.
    pub fn window_start(self, now_ms: i64, window_ms: i64) -> i64 {
        match self {
            StartAlignment::FromFirstRequest => now_ms,
            StartAlignment::FromNaturalPeriodBoundary => {
                if window_ms <= 0 {
                    return now_ms;
                }
                let step = if DAY_MS % window_ms == 0 {
                    window_ms
                } else {
                    calendar_unit(window_ms)
                };
                now_ms - now_ms.rem_euclid(step)
            }
        }
    }
}

/// The largest calendar unit that does not exceed `window_ms`.
fn calendar_unit(window_ms: i64) -> i64 {
    [DAY_MS, HOUR_MS, MINUTE_MS, SECOND_MS]
        .into_iter()
        .find(|unit| window_ms >= *unit)
        .unwrap_or(1)
}
