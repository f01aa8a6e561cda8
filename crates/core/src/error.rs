//! Error types for Tessera
//!
//! This module defines all error types used throughout the system.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.
//!
//! Errors fall into three families:
//! - business failures (quota, version, option mismatch) that a caller may
//!   react to, and in the case of version conflicts, retry
//! - structural violations (`Corruption`) that indicate a broken invariant
//! - infrastructure outcomes (I/O, interruption, cancellation, timeout)

use std::io;
use thiserror::Error;

/// Result type alias for Tessera operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the Tessera engine
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (file operations, mapping, flushing)
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    /// Allocator has fewer free blocks than requested plus its safety buffer
    #[error("Quota exceeded: requested {requested} blocks, {available} available")]
    QuotaExceeded {
        /// Number of blocks requested
        requested: u64,
        /// Number of blocks available after the safety buffer
        available: u64,
    },

    /// Caller's expected version does not match the stored version
    #[error("Version mismatch: expected {expected}, got {actual}")]
    VersionMismatch {
        /// Version supplied by the caller
        expected: u64,
        /// Version currently stored
        actual: u64,
    },

    /// Caller supplied a version for a key that does not exist yet
    #[error("Version supplied on first insert: {supplied}")]
    VersionMismatchInit {
        /// Version supplied by the caller
        supplied: u64,
    },

    /// Record options conflict with the stored state (e.g. insert-only on a live key)
    #[error("Option mismatch: {0}")]
    OptionMismatch(String),

    /// Broken structural invariant (caller bug or on-disk corruption)
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Invalid argument supplied by the caller
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Named container does not exist
    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    /// Named container already exists
    #[error("Container already exists: {0}")]
    ContainerExists(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Operation rejected or abandoned because of shutdown
    #[error("Operation interrupted")]
    Interrupted,

    /// Operation was not executed (e.g. a read racing a delete of the same value)
    #[error("Operation cancelled")]
    Cancelled,

    /// Bounded wait on an operation elapsed
    #[error("Operation timed out")]
    Timeout,

    /// Shared worker queue is at capacity
    #[error("Worker queue is full")]
    Backpressure,
}

impl Error {
    /// Build a `Corruption` error and log it with the given context.
    pub fn corruption(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        tracing::error!(detail = %msg, "structural violation");
        Error::Corruption(msg)
    }

    /// Build an `InvalidArgument` error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Business failures: the request was understood but conflicts with state or quota.
    pub fn is_business(&self) -> bool {
        matches!(
            self,
            Error::QuotaExceeded { .. }
                | Error::VersionMismatch { .. }
                | Error::VersionMismatchInit { .. }
                | Error::OptionMismatch(_)
        )
    }

    /// Only version conflicts are worth an automatic retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::VersionMismatch { .. })
    }

    /// Cooperative outcomes that are not business failures.
    pub fn is_interruption(&self) -> bool {
        matches!(self, Error::Interrupted | Error::Cancelled | Error::Timeout)
    }

    /// Infrastructure failures (I/O, interruption).
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Error::IoError(_) | Error::Backpressure) || self.is_interruption()
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::SerializationError(e.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::SerializationError(e.to_string())
    }
}
