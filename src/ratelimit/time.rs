//! Sources of the current instant.
//!
//! The in-process backend reads the local clock. The distributed backend
//! prefers the shared store's clock so that cooperating processes agree on
//! elapsed time even when their own clocks drift.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;

use crate::error::Result;

/// Supplies the current instant, either blocking or suspending.
#[async_trait]
pub trait TimeSource: Send + Sync {
    /// Read the current instant.
    fn now(&self) -> Result<DateTime<Utc>>;

    /// Read the current instant, suspending if the clock lives elsewhere.
    async fn now_async(&self) -> Result<DateTime<Utc>> {
        self.now()
    }

    /// Current instant in milliseconds since the Unix epoch.
    fn now_millis(&self) -> Result<i64> {
        self.now().map(|t| t.timestamp_millis())
    }

    /// Suspending variant of [`TimeSource::now_millis`].
    async fn now_millis_async(&self) -> Result<i64> {
        self.now_async().await.map(|t| t.timestamp_millis())
    }
}

/// The local wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now(&self) -> Result<DateTime<Utc>> {
        Ok(Utc::now())
    }
}

/// A clock that only moves when told to.
///
/// Useful for deterministic tests and simulations.
#[derive(Debug)]
pub struct ManualTimeSource {
    now: Mutex<DateTime<Utc>>,
}

impl ManualTimeSource {
    /// Create a clock frozen at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Create a clock frozen at the given epoch milliseconds.
    pub fn from_millis(millis: i64) -> Self {
        Self::new(DateTime::from_timestamp_millis(millis).unwrap_or_default())
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let delta = TimeDelta::from_std(by).unwrap_or(TimeDelta::MAX);
        let mut now = self.now.lock();
        *now = now.checked_add_signed(delta).unwrap_or(DateTime::<Utc>::MAX_UTC);
    }

    /// Jump to a specific instant.
    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }
}

impl TimeSource for ManualTimeSource {
    fn now(&self) -> Result<DateTime<Utc>> {
        Ok(*self.now.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_time_source_advances() {
        let clock = ManualTimeSource::from_millis(1_000);
        assert_eq!(clock.now_millis().unwrap(), 1_000);

        clock.advance(Duration::from_millis(250));
        assert_eq!(clock.now_millis().unwrap(), 1_250);

        clock.set(DateTime::from_timestamp_millis(5_000).unwrap());
        assert_eq!(clock.now_millis().unwrap(), 5_000);
    }

    #[tokio::test]
    async fn test_async_read_matches_sync_read() {
        let clock = ManualTimeSource::from_millis(42_000);
        assert_eq!(clock.now_millis_async().await.unwrap(), 42_000);
    }

    #[test]
    fn test_system_time_source_is_recent() {
        let before = Utc::now().timestamp_millis();
        let now = SystemTimeSource.now_millis().unwrap();
        assert!(now >= before);
    }
}
