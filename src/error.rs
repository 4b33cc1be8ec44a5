//! Error types for sluice.

use thiserror::Error;

/// Main error type for sluice operations.
#[derive(Error, Debug)]
pub enum SluiceError {
    /// Invalid rule parameters or configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed period notation such as `"10x"`
    #[error("Could not parse notation '{0}'")]
    InvalidNotation(String),

    /// A rule configured to raise on limit denied the request
    #[error("Rate limit triggered for target '{target}' by rule '{rule}'")]
    Throttled {
        /// The target that was denied
        target: String,
        /// Identifier of the rule that denied it
        rule: String,
    },

    /// Shared store errors, passed through untouched
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Layered configuration source errors
    #[error("Configuration source error: {0}")]
    ConfigSource(#[from] config::ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SluiceError {
    /// Whether this error was raised while building rules or loading configuration.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SluiceError::Config(_) | SluiceError::InvalidNotation(_) | SluiceError::ConfigSource(_)
        )
    }

    /// Whether this error is a raise-on-limit denial.
    pub fn is_throttled(&self) -> bool {
        matches!(self, SluiceError::Throttled { .. })
    }
}

/// Result type alias for sluice operations.
pub type Result<T> = std::result::Result<T, SluiceError>;
