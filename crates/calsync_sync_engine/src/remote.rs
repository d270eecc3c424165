//! The remote store the engine talks to, and how its failures are classified.
//!
//! Implementations wrap whatever protocol the server speaks. Every call must
//! be safe to repeat: the server deduplicates sends by
//! [`RemoteRequest::idempotency_key`], since a retry after a lost response
//! delivers the same mutation twice.

use crate::error::{RejectionReason, SyncError};
use async_trait::async_trait;
use calsync_core::{Entity, EntityId, EntityKind, Fields, Mutation, MutationKind};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// One mutation as sent to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRequest {
    /// What to do.
    pub kind: MutationKind,
    /// Target entity.
    pub entity_id: EntityId,
    /// Field values being set. Empty for deletes.
    pub payload: Fields,
    /// Server version the change was computed against.
    pub base_version: Option<u64>,
    /// Stable across retries of the same mutation.
    pub idempotency_key: String,
}

impl RemoteRequest {
    /// Builds the request for a queued mutation.
    pub fn from_mutation(mutation: &Mutation, device_id: &str) -> Self {
        Self {
            kind: mutation.kind,
            entity_id: mutation.entity_id,
            payload: mutation.payload.clone(),
            base_version: mutation.base_version,
            idempotency_key: mutation.idempotency_key(device_id),
        }
    }
}

/// An entity that changed on the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteChange {
    /// Changed entity.
    pub entity_id: EntityId,
    /// Its kind.
    pub kind: EntityKind,
    /// Current server state, `None` if deleted.
    pub state: Option<Entity>,
}

/// Result of a pull.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PullResponse {
    /// Entities changed since the requested cursor.
    pub changes: Vec<RemoteChange>,
    /// Cursor to pass to the next pull.
    pub cursor: u64,
}

/// Failure reported by a [`RemoteStore`].
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    /// The request never got a response.
    #[error("network error: {message}")]
    Network {
        /// Error message.
        message: String,
    },

    /// The server answered with an error status.
    #[error("status {code}: {message}")]
    Status {
        /// HTTP-style status code.
        code: u16,
        /// Error message.
        message: String,
        /// Minimum wait the server asked for.
        retry_after: Option<Duration>,
    },

    /// The entity changed on the server since `base_version`.
    #[error("version conflict, server has version {:?}", server_state.version)]
    Conflict {
        /// Current server state of the entity.
        server_state: Entity,
    },
}

impl RemoteError {
    /// Creates a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Creates a status error without a retry hint.
    pub fn status(code: u16, message: impl Into<String>) -> Self {
        Self::Status {
            code,
            message: message.into(),
            retry_after: None,
        }
    }
}

/// Server-side storage of calendars and events.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Applies one mutation. Returns the entity's authoritative state, or
    /// `None` after a delete.
    async fn send(&self, request: RemoteRequest) -> Result<Option<Entity>, RemoteError>;

    /// Returns entities changed after `cursor`.
    async fn pull(&self, cursor: u64) -> Result<PullResponse, RemoteError>;
}

/// What the engine does with a failed send.
#[derive(Debug)]
pub enum Disposition {
    /// Try again after a backoff.
    Retry(SyncError),
    /// Drop the mutation and roll it back.
    Reject(RejectionReason),
    /// Re-apply the mutation on top of the server's state.
    Rebase(Entity),
}

/// Sorts a remote failure into retry, reject or rebase.
pub fn classify(error: RemoteError) -> Disposition {
    match error {
        RemoteError::Network { message } => Disposition::Retry(SyncError::NetworkUnavailable {
            message,
        }),
        RemoteError::Conflict { server_state } => Disposition::Rebase(server_state),
        RemoteError::Status {
            code,
            message,
            retry_after,
        } => match code {
            404 | 410 => Disposition::Reject(RejectionReason::NotFound),
            401 | 403 => Disposition::Reject(RejectionReason::Unauthorized(message)),
            409 => Disposition::Reject(RejectionReason::UnresolvedConflict(message)),
            408 => Disposition::Retry(SyncError::Timeout),
            429 => Disposition::Retry(SyncError::RateLimited { retry_after }),
            400..=499 => Disposition::Reject(RejectionReason::Validation(message)),
            _ => Disposition::Retry(SyncError::ServerTransient {
                status: code,
                message,
            }),
        },
    }
}
