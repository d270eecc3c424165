//! Error types for calsync core.

use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The local storage medium failed. The operation that triggered it was
    /// not applied and may be retried by the caller.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(#[from] calsync_storage::StorageError),

    /// A row or log record could not be encoded or decoded.
    #[error("codec error: {message}")]
    Codec {
        /// Description of the failure.
        message: String,
    },

    /// The durable log contains a damaged record that is not a torn tail.
    #[error("store corrupted at offset {offset}: {message}")]
    Corrupted {
        /// Byte offset of the damaged record.
        offset: u64,
        /// Description of the corruption.
        message: String,
    },

    /// A read or write referenced a table that was never created.
    #[error("unknown table: {table}")]
    UnknownTable {
        /// Name of the table.
        table: String,
    },

    /// A schema migration step failed; the store stays at the last good version.
    #[error("migration failed: {message}")]
    MigrationFailed {
        /// Description of the failure.
        message: String,
    },

    /// A mutation payload does not make sense for its kind or target.
    #[error("malformed payload for mutation {kind}: {message}")]
    MalformedPayload {
        /// Mutation kind name.
        kind: String,
        /// Description of the problem.
        message: String,
    },

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },
}

impl CoreError {
    /// Creates a codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    /// Creates a corruption error.
    pub fn corrupted(offset: u64, message: impl Into<String>) -> Self {
        Self::Corrupted {
            offset,
            message: message.into(),
        }
    }

    /// Creates an unknown table error.
    pub fn unknown_table(table: impl Into<String>) -> Self {
        Self::UnknownTable {
            table: table.into(),
        }
    }

    /// Creates a migration failed error.
    pub fn migration_failed(message: impl Into<String>) -> Self {
        Self::MigrationFailed {
            message: message.into(),
        }
    }

    /// Creates a malformed payload error.
    pub fn malformed(kind: impl ToString, message: impl Into<String>) -> Self {
        Self::MalformedPayload {
            kind: kind.to_string(),
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Returns true if the failure came from the storage medium.
    #[must_use]
    pub fn is_storage_unavailable(&self) -> bool {
        matches!(self, Self::StorageUnavailable(_))
    }
}
