//! Error types for shard-keeper.
//!
//! Defines the client-facing error taxonomy with classification for retry behavior.

use std::time::Duration;

use thiserror::Error;

use crate::ShardIndex;
use crate::coordination::CoordinationError;

/// Error type for routing, membership and configuration operations
#[derive(Error, Debug)]
pub enum Error {
    /// Dispatch was invoked without arguments, so there is no key to route on
    #[error("Operation requires at least one argument as routing key")]
    NoRoutingKey,

    /// The first argument cannot be read as a string key
    #[error("Routing key is not representable as a string: {0}")]
    InvalidRoutingKey(String),

    /// The selector picked a shard index with no live endpoint
    #[error("Shard {index} unavailable ({shard_count} shards registered)")]
    ShardUnavailable { index: ShardIndex, shard_count: usize },

    /// A shard node payload could not be parsed as `host:port`
    #[error("Malformed shard data at {path}: {reason}")]
    MalformedShardData { path: String, reason: String },

    /// Connectivity to the coordination service was lost
    #[error("Coordination service unavailable: {0}")]
    CoordinationUnavailable(String),

    /// Failure raised by the backend store, passed through untouched
    #[error(transparent)]
    Backend(#[from] fred::error::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Configuration file could not be parsed
    #[error("Configuration parse error: {0}")]
    Config(#[from] toml::de::Error),

    /// I/O error (configuration file, health listener)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<CoordinationError> for Error {
    fn from(e: CoordinationError) -> Self {
        Error::CoordinationUnavailable(e.to_string())
    }
}

impl Error {
    /// Check if this error indicates a missing shard
    pub fn is_shard_unavailable(&self) -> bool {
        matches!(self, Error::ShardUnavailable { .. })
    }

    /// Check if this error should be retried by the caller
    pub fn is_retryable(&self) -> bool {
        match self {
            // Membership may catch up with the selector's view
            Error::ShardUnavailable { .. } | Error::CoordinationUnavailable(_) => true,
            Error::Backend(e) => matches!(
                e.kind(),
                fred::error::ErrorKind::IO
                    | fred::error::ErrorKind::Timeout
                    | fred::error::ErrorKind::Canceled
            ),
            Error::NoRoutingKey
            | Error::InvalidRoutingKey(_)
            | Error::MalformedShardData { .. }
            | Error::InvalidConfig(_)
            | Error::Config(_)
            | Error::Io(_) => false,
        }
    }

    /// Get the recommended delay before the caller retries
    pub fn retry_after(&self) -> Option<Duration> {
        if self.is_retryable() {
            Some(Duration::from_millis(500))
        } else {
            None
        }
    }
}

/// Result type alias for shard-keeper operations
pub type Result<T> = std::result::Result<T, Error>;
