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

    /// Attempted to grow the storage through `truncate`.
    #[error("cannot truncate to {requested} bytes, storage is only {size} bytes")]
    InvalidTruncate {
        /// The requested new size.
        requested: u64,
        /// The current storage size.
        size: u64,
    },

    /// Another process holds the lock on this storage file.
    #[error("storage locked by another process: {path}")]
    Locked {
        /// The locked file.
        path: String,
    },
}

impl StorageError {
    /// Returns true if the error is caused by the storage medium rather than
    /// by a caller passing bad offsets.
    #[must_use]
    pub fn is_io(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Locked { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_classification() {
        let err = StorageError::Io(io::Error::other("disk gone"));
        assert!(err.is_io());

        let err = StorageError::ReadPastEnd {
            offset: 10,
            len: 4,
            size: 8,
        };
        assert!(!err.is_io());
    }

    #[test]
    fn display_includes_sizes() {
        let err = StorageError::InvalidTruncate {
            requested: 100,
            size: 5,
        };
        let msg = err.to_string();
        assert!(msg.contains("100"));
        assert!(msg.contains('5'));
    }
}
