//! In-process penalty locks.
//!
//! A lock is set the first time a rule with `lock_seconds > 0` denies a
//! target. Until it expires every check against that target is denied
//! without reading or writing the counter. The first writer wins: tripping
//! the rule again while locked does not extend the lock.

use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

/// Table of lock expiry instants (epoch ms) keyed by storage key.
#[derive(Debug, Default)]
pub struct PenaltyLocks {
    locks: DashMap<String, i64>,
}

impl PenaltyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `key` is locked at `now_ms`.
    pub fn is_locked(&self, key: &str, now_ms: i64) -> bool {
        self.locks
            .get(key)
            .map_or(false, |expires_at| *expires_at > now_ms)
    }

    /// Lock `key` for `duration` unless an unexpired lock already exists.
    ///
    /// Returns `true` if this call set the lock.
    pub fn try_lock(&self, key: &str, now_ms: i64, duration: Duration) -> bool {
        let millis = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        let expires_at = now_ms.saturating_add(millis);
        match self.locks.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                if *entry.get() > now_ms {
                    return false;
                }
                entry.insert(expires_at);
            }
            Entry::Vacant(entry) => {
                entry.insert(expires_at);
            }
        }
        debug!(key = %key, expires_at = expires_at, "Penalty lock set");
        true
    }

    /// Drop every lock that has expired at `now_ms`.
    pub fn sweep_expired(&self, now_ms: i64) {
        self.locks.retain(|_, expires_at| *expires_at > now_ms);
    }

    /// Number of lock entries, expired or not.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    pub fn clear(&self) {
        self.locks.clear();
    }
}
