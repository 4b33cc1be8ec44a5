//! Distributed counter store backed by Redis.
//!
//! Every check runs as one Lua script on the Redis server, so the lock
//! check, the read of the stored state, the decision and the write happen
//! atomically with respect to every other process sharing the server. The
//! scripts mirror the decision functions in [`super::algorithm`].
//!
//! Per target the store keeps a value key, a `-st` key with the last-flow
//! or origin instant, and a `-lock` key holding the penalty flag. Fixed
//! windows keep no start key and rely on the value key's expiry instead.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::{Client, Connection, RedisError, RedisResult, Script, ScriptInvocation};
use tokio::sync::OnceCell;
use tracing::{debug, info, trace};

use super::algorithm::{leaky_bucket, sliding_window, token_bucket, Decision};
use super::backend::RateLimitBackend;
use super::key::TargetKey;
use super::rules::Rule;
use super::time::TimeSource;
use crate::error::{Result, SluiceError};

/// Blocking and multiplexed async connections to one Redis server.
struct RedisConnections {
    client: Client,
    /// Idle blocking connections, reused across checks
    idle: Mutex<Vec<Connection>>,
    /// Async connection, opened on first use
    manager: OnceCell<ConnectionManager>,
}

impl RedisConnections {
    fn new(url: &str) -> Result<Self> {
        let client = Client::open(url)?;
        Ok(Self {
            client,
            idle: Mutex::new(Vec::new()),
            manager: OnceCell::new(),
        })
    }

    /// Run `f` on a blocking connection. Connections that fail are dropped.
    fn with_connection<T>(&self, f: impl FnOnce(&mut Connection) -> RedisResult<T>) -> Result<T> {
        let pooled = self.idle.lock().pop();
        let mut conn = match pooled {
            Some(conn) => conn,
            None => {
                debug!("Opening Redis connection");
                self.client.get_connection()?
            }
        };

        let value = f(&mut conn)?;
        self.idle.lock().push(conn);
        Ok(value)
    }

    async fn manager(&self) -> Result<ConnectionManager> {
        let manager = self
            .manager
            .get_or_try_init(|| async {
                debug!("Opening Redis connection manager");
                ConnectionManager::new(self.client.clone()).await
            })
            .await?;
        Ok(manager.clone())
    }
}

fn time_reply_to_datetime((secs, micros): (i64, i64)) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, (micros * 1_000) as u32)
        .ok_or_else(|| SluiceError::Config(format!("Redis TIME out of range: {}s {}us", secs, micros)))
}

/// Reads the current instant from the Redis server's clock.
///
/// Processes sharing one Redis server agree on elapsed time through this
/// clock even when their own clocks drift apart.
#[derive(Clone)]
pub struct RedisTimeSource {
    connections: Arc<RedisConnections>,
}

#[async_trait]
impl TimeSource for RedisTimeSource {
    fn now(&self) -> Result<DateTime<Utc>> {
        let reply: (i64, i64) = self
            .connections
            .with_connection(|conn| redis::cmd("TIME").query(conn))?;
        time_reply_to_datetime(reply)
    }

    async fn now_async(&self) -> Result<DateTime<Utc>> {
        let mut conn = self.connections.manager().await?;
        let reply: (i64, i64) = redis::cmd("TIME").query_async(&mut conn).await?;
        time_reply_to_datetime(reply)
    }
}

struct Scripts {
    token_bucket: Script,
    leaky_bucket: Script,
    fixed_window: Script,
    sliding_window: Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            token_bucket: Script::new(include_str!("scripts/token_bucket.lua")),
            leaky_bucket: Script::new(include_str!("scripts/leaky_bucket.lua")),
            fixed_window: Script::new(include_str!("scripts/fixed_window.lua")),
            sliding_window: Script::new(include_str!("scripts/sliding_window.lua")),
        }
    }
}

/// Counter store shared by every process connected to one Redis server.
pub struct RedisStore {
    connections: Arc<RedisConnections>,
    scripts: Scripts,
    time_source: Arc<dyn TimeSource>,
}

impl RedisStore {
    /// Create a store for the server at `url`, using the server's clock.
    ///
    /// No connection is opened until the first check.
    pub fn new(url: &str) -> Result<Self> {
        let connections = Arc::new(RedisConnections::new(url)?);
        let time_source = Arc::new(RedisTimeSource {
            connections: connections.clone(),
        });
        info!(url = %sanitize_url(url), "Redis rate limit store initialized");
        Ok(Self {
            connections,
            scripts: Scripts::load(),
            time_source,
        })
    }

    /// Use a different clock, e.g. the local one.
    pub fn with_time_source(mut self, time_source: Arc<dyn TimeSource>) -> Self {
        self.time_source = time_source;
        self
    }

    /// A clock reading this store's Redis server.
    pub fn redis_time_source(&self) -> RedisTimeSource {
        RedisTimeSource {
            connections: self.connections.clone(),
        }
    }

    /// Delete all state and the penalty lock for `key`.
    pub fn reset(&self, key: &TargetKey) -> Result<()> {
        let keys = vec![key.value_key(), key.start_key(), key.lock_key()];
        self.connections
            .with_connection(|conn| redis::cmd("DEL").arg(&keys).query(conn))
    }

    /// Suspending variant of [`RedisStore::reset`].
    pub async fn reset_async(&self, key: &TargetKey) -> Result<()> {
        let keys = vec![key.value_key(), key.start_key(), key.lock_key()];
        let mut conn = self.connections.manager().await?;
        let _: () = redis::cmd("DEL").arg(&keys).query_async(&mut conn).await?;
        Ok(())
    }

    fn invocation(&self, key: &TargetKey, rule: &Rule, now_ms: i64) -> ScriptInvocation<'_> {
        let alignment = rule.alignment();
        let lock_seconds = rule.lock_seconds();

        match rule {
            Rule::TokenBucket(r) => {
                let mut invocation = self.scripts.token_bucket.prepare_invoke();
                invocation
                    .key(key.value_key())
                    .key(key.start_key())
                    .key(key.lock_key())
                    .arg(now_ms)
                    .arg(alignment.window_start(now_ms, r.inflow_unit_ms()))
                    .arg(lock_seconds)
                    .arg(token_bucket::idle_ttl_ms(r))
                    .arg(r.capacity())
                    .arg(r.inflow_quantity_per_unit())
                    .arg(r.inflow_unit_ms());
                invocation
            }
            Rule::LeakyBucket(r) => {
                let mut invocation = self.scripts.leaky_bucket.prepare_invoke();
                invocation
                    .key(key.value_key())
                    .key(key.start_key())
                    .key(key.lock_key())
                    .arg(now_ms)
                    .arg(alignment.window_start(now_ms, r.outflow_unit_ms()))
                    .arg(lock_seconds)
                    .arg(leaky_bucket::idle_ttl_ms(r))
                    .arg(r.capacity())
                    .arg(r.outflow_quantity_per_unit())
                    .arg(r.outflow_unit_ms());
                invocation
            }
            Rule::FixedWindow(r) => {
                let window = r.window_ms();
                let window_end = alignment.window_start(now_ms, window) + window;
                let mut invocation = self.scripts.fixed_window.prepare_invoke();
                invocation
                    .key(key.value_key())
                    .key(key.lock_key())
                    .arg(now_ms)
                    .arg(lock_seconds)
                    .arg((window_end - now_ms).max(1))
                    .arg(r.threshold());
                invocation
            }
            Rule::SlidingWindow(r) => {
                let mut invocation = self.scripts.sliding_window.prepare_invoke();
                invocation
                    .key(key.value_key())
                    .key(key.start_key())
                    .key(key.lock_key())
                    .arg(now_ms)
                    .arg(alignment.window_start(now_ms, r.sub_period_ms()))
                    .arg(lock_seconds)
                    .arg(sliding_window::idle_ttl_ms(r))
                    .arg(r.threshold())
                    .arg(r.sub_period_ms())
                    .arg(r.sub_period_count());
                invocation
            }
        }
    }
}

/// Strip credentials from a Redis URL before logging it.
fn sanitize_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_string(),
    }
}

/// Convert a `{limited, count, wait_ms}` script reply.
fn decision_from_reply(reply: Vec<i64>) -> Result<Decision> {
    match reply.as_slice() {
        [limited, count, wait_ms] => Ok(Decision {
            limited: *limited == 1,
            count: *count,
            wait_ms: *wait_ms,
            next: None,
            expires_at_ms: 0,
        }),
        _ => Err(SluiceError::Redis(RedisError::from((
            redis::ErrorKind::TypeError,
            "Unexpected rate limit script reply",
            format!("{:?}", reply),
        )))),
    }
}

#[async_trait]
impl RateLimitBackend for RedisStore {
    fn now_millis(&self) -> Result<i64> {
        self.time_source.now_millis()
    }

    async fn now_millis_async(&self) -> Result<i64> {
        self.time_source.now_millis_async().await
    }

    fn check(&self, key: &TargetKey, rule: &Rule, now_ms: i64) -> Result<Decision> {
        let invocation = self.invocation(key, rule, now_ms);
        let reply: Vec<i64> = self
            .connections
            .with_connection(|conn| invocation.invoke(conn))?;

        trace!(key = %key, rule = %rule.name(), reply = ?reply, "Redis check");
        decision_from_reply(reply)
    }

    async fn check_async(&self, key: &TargetKey, rule: &Rule, now_ms: i64) -> Result<Decision> {
        let mut conn = self.connections.manager().await?;
        let reply: Vec<i64> = self
            .invocation(key, rule, now_ms)
            .invoke_async(&mut conn)
            .await?;

        trace!(key = %key, rule = %rule.name(), reply = ?reply, "Redis check");
        decision_from_reply(reply)
    }
}
