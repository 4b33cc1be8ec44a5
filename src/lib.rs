//! Sluice - Rate Limiting Engine
//!
//! This crate decides, for a stream of requests identified by a
//! caller-supplied target, whether each request may proceed under one or
//! more throttling rules. Four algorithms are provided (token bucket, leaky
//! bucket, fixed window and sliding window), each backed either by
//! in-process state or by a Redis server shared between processes.
//!
//! ```no_run
//! use std::time::Duration;
//! use sluice::ratelimit::{LocalStore, RateLimiter, TokenBucketRule};
//!
//! # fn main() -> sluice::error::Result<()> {
//! let rule = TokenBucketRule::new(100, 10, Duration::from_secs(1))?;
//! let limiter = RateLimiter::new(LocalStore::new(), vec![rule.into()]);
//!
//! let decision = limiter.check("client-42")?;
//! if decision.is_limit() {
//!     // reject the request
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod ratelimit;
