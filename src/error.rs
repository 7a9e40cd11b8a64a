//! Error types for Ratewarden.

use thiserror::Error;

/// Main error type for Ratewarden operations.
#[derive(Error, Debug)]
pub enum RatewardenError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A caller passed an argument that can never be valid
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// An internal invariant was broken; indicates a bug, never a runtime condition
    #[error("Internal invariant violated: {0}")]
    Invariant(String),

    /// Backing store returned an error or a malformed reply
    #[error("Store error: {0}")]
    Store(String),

    /// Redis transport errors
    #[cfg(feature = "redis-store")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// One region did not answer before its deadline
    #[error("Region {region} timed out after {timeout_ms}ms")]
    RegionTimeout { region: String, timeout_ms: u64 },

    /// No region of a multi-region limiter answered before the deadline
    #[error("All {regions} regions timed out")]
    AllRegionsTimedOut { regions: usize },

    /// Every region of a multi-region limiter failed
    #[error("All {regions} regions failed, last error: {last_error}")]
    AllRegionsFailed {
        /// Number of regions that were queried
        regions: usize,
        /// Message of the last observed failure
        last_error: String,
    },

    /// A spawned decision task panicked or was aborted
    #[error("Task error: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Ratewarden operations.
pub type Result<T> = std::result::Result<T, RatewardenError>;
