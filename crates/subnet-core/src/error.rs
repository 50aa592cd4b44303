//! Error types for the subnet lease core
//!
//! This module defines all error types used throughout the crate.

use thiserror::Error;

/// Result type alias for lease operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the subnet lease system
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or incoherent network configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// The registry holds no network configuration at all
    #[error("network config not found in the registry; was it written under the configured prefix?")]
    ConfigNotFound,

    /// A single registry call failed (transport, leader election, ...)
    #[error("Registry error: {0}")]
    Registry(String),

    /// A create raced with another node for the same subnet key
    #[error("subnet already exists: {0}")]
    AlreadyExists(String),

    /// Lease key not present in the registry
    #[error("Lease not found: {0}")]
    NotFound(String),

    /// No free subnet left between SubnetMin and SubnetMax
    #[error("out of subnets")]
    OutOfSubnets,

    /// Allocation lost the create race on every attempt
    #[error("max retries reached trying to acquire a subnet ({attempts} attempts)")]
    MaxRetriesExceeded {
        /// Number of allocation attempts made
        attempts: usize,
    },

    /// Our own lease was removed out of band
    #[error("lease has been revoked")]
    LeaseRevoked,

    /// A watch stream ended without being cancelled
    #[error("watch stream closed")]
    WatchClosed,

    /// Operation not supported by this registry binding
    #[error("unimplemented: {0}")]
    Unimplemented(&'static str),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Filesystem errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a registry error
    pub fn registry(msg: impl Into<String>) -> Self {
        Self::Registry(msg.into())
    }

    /// Create an "already exists" error for a subnet key
    pub fn already_exists(key: impl Into<String>) -> Self {
        Self::AlreadyExists(key.into())
    }

    /// Create a "not found" error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// True when a create lost an optimistic-concurrency race
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }

    /// True for failures that may succeed if the same call is repeated later
    ///
    /// Configuration problems, a missing config and a revoked lease are
    /// operator-visible conditions; retrying them changes nothing.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Registry(_) | Self::AlreadyExists(_) | Self::Io(_))
    }
}

/// Helper for converting anyhow::Error to our Error type
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_not_found_is_not_retryable() {
        assert!(!Error::ConfigNotFound.is_retryable());
        assert!(!Error::config("bad").is_retryable());
        assert!(Error::registry("connection reset").is_retryable());
    }

    #[test]
    fn already_exists_is_detected() {
        let err = Error::already_exists("10.3.1.0-24");
        assert!(err.is_already_exists());
        assert_eq!(err.to_string(), "subnet already exists: 10.3.1.0-24");
    }
}
