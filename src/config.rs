//! Configuration management for Sluice.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, SluiceError};
use crate::ratelimit::{LocalStore, RateLimitBackend, RateLimiter, RedisStore, Rule, RuleConfig, SystemTimeSource};

/// Prefix of environment variables that override file settings,
/// e.g. `SLUICE__BACKEND__URL`.
const ENV_PREFIX: &str = "SLUICE";

/// Main configuration for a Sluice rate limiter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SluiceConfig {
    /// Where rate limit state is kept
    #[serde(default)]
    pub backend: BackendConfig,

    /// Rules checked against every target, in order
    #[serde(default)]
    pub rules: Vec<RuleConfig>,

    /// Whether rules may be replaced at runtime
    #[serde(default)]
    pub updatable: bool,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Backend configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    /// State held in process memory
    #[default]
    Local,
    /// State shared through a Redis server
    Redis {
        /// Redis connection URL
        #[serde(default = "default_redis_url")]
        url: String,
        /// Read the local clock instead of the Redis server's
        #[serde(default)]
        use_local_clock: bool,
    },
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl SluiceConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| SluiceError::Config(e.to_string()))
    }

    /// Load configuration from a YAML file, then apply `SLUICE__*`
    /// environment variables on top.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()).format(config::FileFormat::Yaml))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Validate the configured rules.
    pub fn build_rules(&self) -> Result<Vec<Rule>> {
        self.rules.iter().cloned().map(Rule::try_from).collect()
    }

    /// Create the configured backend.
    pub fn build_backend(&self) -> Result<Arc<dyn RateLimitBackend>> {
        match &self.backend {
            BackendConfig::Local => Ok(Arc::new(LocalStore::new())),
            BackendConfig::Redis { url, use_local_clock } => {
                let store = RedisStore::new(url)?;
                let store = if *use_local_clock {
                    store.with_time_source(Arc::new(SystemTimeSource))
                } else {
                    store
                };
                Ok(Arc::new(store))
            }
        }
    }

    /// Create a rate limiter with the configured backend and rules.
    pub fn build_limiter(&self) -> Result<RateLimiter<Arc<dyn RateLimitBackend>>> {
        let rules = self.build_rules()?;
        let backend = self.build_backend()?;
        info!(
            rules = rules.len(),
            updatable = self.updatable,
            backend = ?self.backend,
            "Rate limiter configured"
        );

        Ok(if self.updatable {
            RateLimiter::updatable(backend, rules)
        } else {
            RateLimiter::new(backend, rules)
        })
    }
}
