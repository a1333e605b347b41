//! Error types for the herald-store crate.

use std::io;

use thiserror::Error;

/// Top-level store error type.
///
/// All store operations return this error type, which categorizes failures
/// into I/O, serialization, and logical errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// I/O operation failed (file read/write/rename).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization or deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    /// No record exists for the given address.
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Internal error (lock poisoning, etc.).
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Serialization and deserialization errors.
#[derive(Debug, Error)]
pub enum SerializationError {
    /// Bincode serialization failed.
    #[error("Bincode encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    /// Bincode deserialization failed (corrupt or truncated store file).
    #[error("Bincode decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}

/// Specialized `Result` type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

impl<T> From<std::sync::PoisonError<T>> for StoreError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        Self::Internal(format!("Lock poisoned: {e}"))
    }
}

impl StoreError {
    /// Returns `true` if this error means the backing storage itself failed,
    /// as opposed to a logical error like a missing record.
    #[must_use]
    pub const fn is_io(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Serialization(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let store_err: StoreError = io_err.into();
        assert!(matches!(store_err, StoreError::Io(_)));
        assert!(store_err.is_io());
    }

    #[test]
    fn test_not_found_is_not_io() {
        let err = StoreError::NotFound("a@example.com".to_string());
        assert!(!err.is_io());
        assert_eq!(err.to_string(), "Record not found: a@example.com");
    }
}
