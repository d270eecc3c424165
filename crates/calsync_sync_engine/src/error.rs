//! Error types for the sync engine.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Why the server refused a mutation for good.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectionReason {
    /// The entity does not exist on the server.
    NotFound,
    /// The payload failed server-side validation.
    Validation(String),
    /// The user may not perform the change.
    Unauthorized(String),
    /// A version conflict the engine cannot merge.
    UnresolvedConflict(String),
}

impl RejectionReason {
    /// Returns true for [`RejectionReason::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, RejectionReason::NotFound)
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectionReason::NotFound => write!(f, "not found"),
            RejectionReason::Validation(msg) => write!(f, "validation failed: {msg}"),
            RejectionReason::Unauthorized(msg) => write!(f, "unauthorized: {msg}"),
            RejectionReason::UnresolvedConflict(msg) => write!(f, "unresolved conflict: {msg}"),
        }
    }
}

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The server could not be reached.
    #[error("network unavailable: {message}")]
    NetworkUnavailable {
        /// Error message.
        message: String,
    },

    /// The server failed in a way that may succeed later (5xx).
    #[error("server error {status}: {message}")]
    ServerTransient {
        /// HTTP-style status code.
        status: u16,
        /// Error message.
        message: String,
    },

    /// The server asked the client to slow down.
    #[error("rate limited")]
    RateLimited {
        /// Minimum wait the server asked for.
        retry_after: Option<Duration>,
    },

    /// The request did not complete within the configured timeout.
    #[error("operation timed out")]
    Timeout,

    /// The server refused the mutation; it will not be retried.
    #[error("mutation rejected: {reason}")]
    TerminalRejection {
        /// Why the server refused it.
        reason: RejectionReason,
    },

    /// Local storage failed while recording an outcome.
    #[error("storage error: {0}")]
    Storage(#[from] calsync_core::CoreError),

    /// Sync was cancelled.
    #[error("sync cancelled")]
    Cancelled,
}

impl SyncError {
    /// Creates a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkUnavailable {
            message: message.into(),
        }
    }

    /// Creates a terminal rejection.
    pub fn rejected(reason: RejectionReason) -> Self {
        Self::TerminalRejection { reason }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::NetworkUnavailable { .. }
                | SyncError::ServerTransient { .. }
                | SyncError::RateLimited { .. }
                | SyncError::Timeout
        )
    }

    /// The server's requested minimum wait, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SyncError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::network("connection reset").is_retryable());
        assert!(SyncError::ServerTransient {
            status: 503,
            message: "busy".into()
        }
        .is_retryable());
        assert!(SyncError::RateLimited { retry_after: None }.is_retryable());
        assert!(SyncError::Timeout.is_retryable());
        assert!(!SyncError::rejected(RejectionReason::NotFound).is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
    }

    #[test]
    fn error_display() {
        let err = SyncError::rejected(RejectionReason::Validation("end before start".into()));
        assert_eq!(
            err.to_string(),
            "mutation rejected: validation failed: end before start"
        );
        assert_eq!(
            SyncError::rejected(RejectionReason::NotFound).to_string(),
            "mutation rejected: not found"
        );
    }

    #[test]
    fn retry_after_only_for_rate_limits() {
        let limited = SyncError::RateLimited {
            retry_after: Some(Duration::from_secs(5)),
        };
        assert_eq!(limited.retry_after(), Some(Duration::from_secs(5)));
        assert_eq!(SyncError::Timeout.retry_after(), None);
    }
}
