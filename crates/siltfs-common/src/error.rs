//! Error types for siltfs
//!
//! This module defines the common error type used throughout the system.

use thiserror::Error;

/// Common result type for siltfs operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for siltfs
#[derive(Debug, Error)]
pub enum Error {
    /// Bad caller input: oversized value, lock coverage or mode mismatch,
    /// inverted batch window.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A bounded allocation pool is exhausted.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// The key is known not to exist.
    #[error("not found")]
    NotFound,

    /// An item already exists at the key.
    #[error("already exists")]
    AlreadyExists,

    /// Internal retry signal: the cache has no coverage for the key and
    /// the caller must populate from the manifest. Never returned from a
    /// public operation.
    #[error("coverage gap, read required")]
    NeedsRead,

    /// An I/O error propagated verbatim from the manifest or a segment.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An invariant violation was detected; the affected structure can no
    /// longer be trusted.
    #[error("corruption detected: {0}")]
    Corruption(String),
}

impl Error {
    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create an out of memory error
    pub fn out_of_memory(msg: impl Into<String>) -> Self {
        Self::OutOfMemory(msg.into())
    }

    /// Create a corruption error
    pub fn corruption(msg: impl Into<String>) -> Self {
        Self::Corruption(msg.into())
    }

    /// Check if this is a normal negative result
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }

    /// Check if this is the internal coverage-gap signal
    #[must_use]
    pub fn is_needs_read(&self) -> bool {
        matches!(self, Self::NeedsRead)
    }

    /// Check if the operation can be retried after the caller intervenes
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NeedsRead | Self::OutOfMemory(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_predicates() {
        assert!(Error::NotFound.is_not_found());
        assert!(!Error::AlreadyExists.is_not_found());
        assert!(Error::NeedsRead.is_needs_read());
        assert!(Error::out_of_memory("pool").is_retryable());
        assert!(!Error::corruption("bad node").is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = Error::invalid_argument("value too large");
        assert_eq!(err.to_string(), "invalid argument: value too large");
        assert_eq!(Error::NotFound.to_string(), "not found");
    }
}
