//! End-to-end checks against the in-process backend.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use proptest::prelude::*;

use sluice::ratelimit::algorithm::{BucketState, CounterState};
use sluice::ratelimit::{
    parse_period, FixedWindowRule, LeakyBucketRule, LocalStore, ManualTimeSource, RateLimiter, Rule,
    SlidingWindowRule, StartAlignment, TargetKey, TokenBucketRule,
};

const T0: i64 = 1_700_000_000_000;

fn limiter(rules: Vec<Rule>) -> (Arc<ManualTimeSource>, RateLimiter<LocalStore>) {
    let clock = Arc::new(ManualTimeSource::from_millis(T0));
    let store = LocalStore::with_time_source(clock.clone());
    (clock, RateLimiter::new(store, rules))
}

#[test]
fn token_bucket_drains_then_refills() {
    let rule: Rule = TokenBucketRule::new(5, 1, Duration::from_secs(1)).unwrap().into();
    let (clock, limiter) = limiter(vec![rule.clone()]);

    for expected in [4, 3, 2, 1, 0] {
        let aggregate = limiter.check("client").unwrap();
        assert!(!aggregate.is_limit());
        assert_eq!(aggregate.results[0].count, expected);
    }

    let denied = limiter.check("client").unwrap();
    assert!(denied.is_limit());
    let key = TargetKey::new("client", &rule);
    assert_eq!(
        limiter.backend().peek(&key),
        Some(CounterState::TokenBucket(BucketState {
            value: 0,
            last_flow_ms: T0
        }))
    );

    clock.advance(Duration::from_secs(1));
    let refilled = limiter.check("client").unwrap();
    assert!(!refilled.is_limit());
    assert_eq!(refilled.results[0].count, 0);
}

#[test]
fn fixed_window_counts_then_resets() {
    let rule: Rule = FixedWindowRule::new(3, Duration::from_secs(1)).unwrap().into();
    let (clock, limiter) = limiter(vec![rule.with_alignment(StartAlignment::FromFirstRequest)]);

    for expected in [1, 2, 3] {
        let aggregate = limiter.check("client").unwrap();
        assert!(!aggregate.is_limit());
        assert_eq!(aggregate.results[0].count, expected);
    }

    let denied = limiter.check("client").unwrap();
    assert!(denied.is_limit());
    assert_eq!(denied.results[0].count, 3);

    clock.advance(Duration::from_secs(1));
    let reset = limiter.check("client").unwrap();
    assert!(!reset.is_limit());
    assert_eq!(reset.results[0].count, 1);
}

#[test]
fn leaky_bucket_queues_with_increasing_wait() {
    let rule: Rule = LeakyBucketRule::new(3, 1, Duration::from_secs(1)).unwrap().into();
    let (_, limiter) = limiter(vec![rule]);

    let mut last_wait = -1;
    for _ in 0..4 {
        let aggregate = limiter.check("client").unwrap();
        assert!(!aggregate.is_limit());
        assert!(aggregate.wait_ms() > last_wait);
        last_wait = aggregate.wait_ms();
    }
    assert_eq!(last_wait, 3_000);

    let denied = limiter.check("client").unwrap();
    assert!(denied.is_limit());
    assert_eq!(denied.results[0].count, 3);
    assert_eq!(denied.results[0].wait_ms, -1);
}

#[test]
fn sliding_window_rejects_uneven_sub_periods() {
    let err = SlidingWindowRule::new(10, Duration::from_millis(1_500), Duration::from_millis(400)).unwrap_err();
    assert!(err.is_config_error());
}

#[test]
fn period_notation() {
    assert_eq!(parse_period("10s").unwrap(), Duration::from_secs(10));
    assert!(parse_period("10x").unwrap_err().is_config_error());
    assert!(parse_period("").unwrap_err().is_config_error());
}

#[test]
fn lock_denies_every_rule_variant_until_expiry() {
    let rules: Vec<Rule> = vec![
        Rule::from(TokenBucketRule::new(1, 1, Duration::from_secs(1)).unwrap()).with_id("token"),
        Rule::from(LeakyBucketRule::new(1, 1, Duration::from_secs(1)).unwrap()).with_id("leaky"),
        Rule::from(FixedWindowRule::new(1, Duration::from_secs(1)).unwrap()).with_id("fixed"),
        Rule::from(SlidingWindowRule::new(1, Duration::from_secs(1), Duration::from_millis(100)).unwrap())
            .with_id("sliding"),
    ];

    for rule in rules {
        let (clock, limiter) = limiter(vec![rule.clone().with_lock_seconds(10)]);

        // trip the rule
        let mut tripped = false;
        for _ in 0..5 {
            if limiter.check("client").unwrap().is_limit() {
                tripped = true;
                break;
            }
        }
        assert!(tripped, "{} never denied", rule.name());

        // long after the counter itself would have recovered
        clock.advance(Duration::from_secs(5));
        let locked = limiter.check("client").unwrap();
        assert!(locked.is_limit(), "{} not locked", rule.name());
        assert_eq!(locked.results[0].count, -1);

        clock.advance(Duration::from_secs(6));
        assert!(!limiter.check("client").unwrap().is_limit(), "{} still locked", rule.name());
    }
}

#[test]
fn rules_with_distinct_ids_keep_separate_counters() {
    let fixed = |id: &str| -> Rule {
        Rule::from(FixedWindowRule::new(1, Duration::from_secs(60)).unwrap()).with_id(id)
    };
    let (_, limiter) = limiter(vec![fixed("a")]);
    assert!(!limiter.check("client").unwrap().is_limit());

    // same target, different rule id
    let aggregate = limiter.check_rules("client", &[fixed("b")], None).unwrap();
    assert!(!aggregate.is_limit());

    // same target, same rule id
    let aggregate = limiter.check_rules("client", &[fixed("a")], None).unwrap();
    assert!(aggregate.is_limit());
}

#[tokio::test]
async fn concurrent_async_checks_admit_exactly_threshold() {
    let rule: Rule = FixedWindowRule::new(50, Duration::from_secs(60)).unwrap().into();
    let (_, limiter) = limiter(vec![rule]);
    let limiter = Arc::new(limiter);

    let tasks = (0..8).map(|_| {
        let limiter = limiter.clone();
        tokio::spawn(async move {
            let mut allowed = 0usize;
            for _ in 0..25 {
                if !limiter.check_async("shared").await.unwrap().is_limit() {
                    allowed += 1;
                }
            }
            allowed
        })
    });

    let allowed: usize = join_all(tasks).await.into_iter().map(|r| r.unwrap()).sum();
    assert_eq!(allowed, 50);
}

#[test]
fn blocking_on_async_path_matches_sync() {
    let rule: Rule = TokenBucketRule::new(3, 1, Duration::from_secs(1)).unwrap().into();
    let (_, limiter) = limiter(vec![rule]);

    let first = tokio_test::block_on(limiter.check_async("client")).unwrap();
    let second = limiter.check("client").unwrap();
    assert_eq!(first.results[0].count, 2);
    assert_eq!(second.results[0].count, 1);
}

fn any_rule() -> impl Strategy<Value = Rule> {
    prop_oneof![
        (1i64..6, 1i64..3, 1u64..2_000).prop_map(|(c, q, u)| {
            Rule::from(TokenBucketRule::new(c, q, Duration::from_millis(u)).unwrap())
        }),
        (1i64..6, 1i64..3, 1u64..2_000).prop_map(|(c, q, u)| {
            Rule::from(LeakyBucketRule::new(c, q, Duration::from_millis(u)).unwrap())
        }),
        (0i64..6, 1u64..2_000).prop_map(|(t, w)| {
            Rule::from(FixedWindowRule::new(t, Duration::from_millis(w)).unwrap())
        }),
        (0i64..6, 1u64..200, 1u64..6).prop_map(|(t, s, n)| {
            Rule::from(
                SlidingWindowRule::new(t, Duration::from_millis(s * n), Duration::from_millis(s)).unwrap(),
            )
        }),
    ]
}

proptest! {
    #[test]
    fn denied_checks_leave_state_untouched(
        rule in any_rule(),
        steps in proptest::collection::vec(0u64..500, 1..40),
    ) {
        let (clock, limiter) = limiter(vec![rule.clone()]);
        let key = TargetKey::new("client", &rule);

        for step in steps {
            clock.advance(Duration::from_millis(step));
            let before = limiter.backend().peek(&key);
            let aggregate = limiter.check("client").unwrap();
            if aggregate.is_limit() {
                prop_assert_eq!(limiter.backend().peek(&key), before);
            }
        }
    }

    #[test]
    fn token_bucket_never_stores_more_than_capacity_minus_one(
        capacity in 1i64..10,
        inflow in 1i64..10,
        steps in proptest::collection::vec(0u64..5_000, 1..40),
    ) {
        let rule: Rule = TokenBucketRule::new(capacity, inflow, Duration::from_secs(1)).unwrap().into();
        let (clock, limiter) = limiter(vec![rule.clone()]);
        let key = TargetKey::new("client", &rule);

        for step in steps {
            clock.advance(Duration::from_millis(step));
            if !limiter.check("client").unwrap().is_limit() {
                match limiter.backend().peek(&key) {
                    Some(CounterState::TokenBucket(state)) => prop_assert!(state.value <= capacity - 1),
                    other => prop_assert!(false, "unexpected state {:?}", other),
                }
            }
        }
    }
}
