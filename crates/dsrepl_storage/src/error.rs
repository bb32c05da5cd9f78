//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Attempted to read beyond the end of storage.
    #[error("read beyond end of storage: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// The requested read offset.
        offset: u64,
        /// The requested read length.
        len: usize,
        /// The current storage size.
        size: u64,
    },

    /// A write was attempted through a read-only handle.
    #[error("storage opened read-only")]
    ReadOnly,

    /// Truncation past the current end was requested.
    #[error("cannot truncate to {requested} bytes, storage holds {size}")]
    InvalidTruncate {
        /// Requested new size.
        requested: u64,
        /// Current size.
        size: u64,
    },
}

impl StorageError {
    /// Returns true if the error came from the operating system rather than
    /// from a misuse of the backend.
    #[must_use]
    pub fn is_io(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_classification() {
        let err = StorageError::from(io::Error::new(io::ErrorKind::Other, "disk"));
        assert!(err.is_io());
        assert!(!StorageError::ReadOnly.is_io());
    }

    #[test]
    fn display_mentions_sizes() {
        let err = StorageError::InvalidTruncate {
            requested: 10,
            size: 4,
        };
        assert!(err.to_string().contains("10"));
        assert!(err.to_string().contains('4'));
    }
}
