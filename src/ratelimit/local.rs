//! In-process counter store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::Rng;
use tracing::{debug, info, trace};

use super::algorithm::{self, CounterState, Decision};
use super::backend::RateLimitBackend;
use super::key::TargetKey;
use super::penalty::PenaltyLocks;
use super::rules::Rule;
use super::time::{SystemTimeSource, TimeSource};
use crate::error::Result;

/// One in this many checks also sweeps expired entries.
const SWEEP_ONE_IN: u32 = 1024;

#[derive(Debug, Clone)]
struct StoredState {
    state: CounterState,
    expires_at_ms: i64,
}

impl StoredState {
    fn is_live(&self, now_ms: i64) -> bool {
        self.expires_at_ms > now_ms
    }
}

/// Counter store held in process memory.
///
/// State lives in a sharded map keyed by storage key. A check holds the
/// entry for its key while it reads, evaluates and writes, so checks on the
/// same target are serialized while unrelated targets proceed in parallel.
/// Entries past their idle expiry behave as absent and are reclaimed by
/// occasional sweeps.
pub struct LocalStore {
    states: DashMap<String, StoredState>,
    locks: PenaltyLocks,
    time_source: Arc<dyn TimeSource>,
}

impl LocalStore {
    /// Create a store that reads the local wall clock.
    pub fn new() -> Self {
        Self::with_time_source(Arc::new(SystemTimeSource))
    }

    /// Create a store that reads the given clock.
    pub fn with_time_source(time_source: Arc<dyn TimeSource>) -> Self {
        info!("Local rate limit store initialized");
        Self {
            states: DashMap::new(),
            locks: PenaltyLocks::new(),
            time_source,
        }
    }

    /// Stored state for `key`, whether or not it has expired.
    pub fn peek(&self, key: &TargetKey) -> Option<CounterState> {
        self.states.get(&key.value_key()).map(|s| s.state.clone())
    }

    /// Whether `key` is under a penalty lock at `now_ms`.
    pub fn is_locked(&self, key: &TargetKey, now_ms: i64) -> bool {
        self.locks.is_locked(&key.value_key(), now_ms)
    }

    /// Number of stored states, expired or not.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Drop all state and locks.
    pub fn clear(&self) {
        self.states.clear();
        self.locks.clear();
    }

    /// Drop every expired state and lock. Returns the number of states removed.
    pub fn sweep_expired(&self) -> Result<usize> {
        let now_ms = self.time_source.now_millis()?;
        Ok(self.sweep_at(now_ms))
    }

    fn sweep_at(&self, now_ms: i64) -> usize {
        let before = self.states.len();
        self.states.retain(|_, stored| stored.is_live(now_ms));
        self.locks.sweep_expired(now_ms);
        let removed = before.saturating_sub(self.states.len());
        if removed > 0 {
            debug!(removed = removed, "Swept expired rate limit state");
        }
        removed
    }

    fn maybe_sweep(&self, now_ms: i64) {
        if rand::thread_rng().gen_ratio(1, SWEEP_ONE_IN) {
            self.sweep_at(now_ms);
        }
    }
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateLimitBackend for LocalStore {
    fn now_millis(&self) -> Result<i64> {
        self.time_source.now_millis()
    }

    async fn now_millis_async(&self) -> Result<i64> {
        self.time_source.now_millis_async().await
    }

    fn check(&self, key: &TargetKey, rule: &Rule, now_ms: i64) -> Result<Decision> {
        let storage_key = key.value_key();

        let decision = {
            let entry = self.states.entry(storage_key.clone());

            if self.locks.is_locked(&storage_key, now_ms) {
                trace!(key = %key, rule = %rule.name(), "Target is locked");
                Decision::locked(rule.kind())
            } else {
                let decision = match &entry {
                    Entry::Occupied(e) if e.get().is_live(now_ms) => {
                        algorithm::evaluate(rule, Some(&e.get().state), now_ms)
                    }
                    _ => algorithm::evaluate(rule, None, now_ms),
                };

                if let Some(next) = &decision.next {
                    let stored = StoredState {
                        state: next.clone(),
                        expires_at_ms: decision.expires_at_ms,
                    };
                    match entry {
                        Entry::Occupied(mut e) => {
                            e.insert(stored);
                        }
                        Entry::Vacant(e) => {
                            e.insert(stored);
                        }
                    }
                }

                if decision.trips_lock(rule) {
                    self.locks
                        .try_lock(&storage_key, now_ms, Duration::from_secs(rule.lock_seconds()));
                }
                decision
            }
        };

        self.maybe_sweep(now_ms);
        Ok(decision)
    }
}
