//! Error types for the outbound governance pipeline.
//!
//! These errors never cross the public admission or compliance operations:
//! the rate limiter folds store failures into its degraded-mode policy and
//! the compliance gate always produces a decision. They surface only from
//! constructors, configuration loading and the store adapters themselves.

use std::time::Duration;

use thiserror::Error;

/// Main error type for governance operations.
#[derive(Error, Debug)]
pub enum GovernanceError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors reported by the Redis client
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// The counter store could not be reached or refused the operation
    #[error("Counter store unavailable: {0}")]
    StoreUnavailable(String),

    /// A counter store call did not complete in time
    #[error("Counter store operation timed out after {0:?}")]
    Timeout(Duration),

    /// A content rule failed to compile
    #[error("Invalid content pattern: {0}")]
    Pattern(#[from] regex::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for GovernanceError {
    fn from(err: config::ConfigError) -> Self {
        GovernanceError::Config(err.to_string())
    }
}

/// Result type alias for governance operations.
pub type Result<T> = std::result::Result<T, GovernanceError>;
