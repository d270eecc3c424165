//! # calsync Sync Engine
//!
//! Background task that drives queued mutations to the server.
//!
//! This crate provides:
//! - [`SyncEngine`]: drains the [`calsync_core::MutationQueue`] and pulls
//!   server changes into the local cache
//! - [`RemoteStore`]: the async interface to the server
//! - [`MockRemote`]: an in-memory server for tests
//!
//! ## Architecture
//!
//! ```text
//!  MutationQueue ──claim_ready──► SyncEngine ──send──► RemoteStore
//!        ▲                           │  ▲                  │
//!        └── ack / reschedule ───────┘  └──── response ────┘
//!            reject / rebase
//!
//!  LocalCache ◄──reconcile── SyncEngine ◄──pull── RemoteStore
//! ```
//!
//! ## Outcomes
//!
//! | Server answer | Queue outcome | Event |
//! |---|---|---|
//! | success | `ack_and_reconcile` | `Acked` |
//! | network error, 5xx, 408, 429, timeout | `reschedule` with backoff | `Rescheduled` |
//! | 404, 410 | `reject_missing`, no stale copy kept | `Rejected` |
//! | 400, 401, 403, 422, 409 without state | `reject` | `Rejected` |
//! | newer server version | `rebase`, resend | `ConflictResolved` |
//!
//! ## Key Invariants
//!
//! - At most one send per entity is in flight
//! - A later mutation for an entity is never sent before an earlier one is
//!   resolved
//! - Every send carries the same idempotency key on every attempt
//! - Nothing is sent while connectivity is offline or unknown
//! - Cancellation never interrupts a send that has started

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
pub mod connectivity;
mod engine;
mod error;
mod mock;
mod remote;

pub use config::{RetryConfig, SyncConfig};
pub use connectivity::Connectivity;
pub use engine::{DrainReport, EngineState, SyncEngine, SyncEvent, SyncStats};
pub use error::{RejectionReason, SyncError, SyncResult};
pub use mock::MockRemote;
pub use remote::{classify, Disposition, PullResponse, RemoteChange, RemoteError, RemoteRequest, RemoteStore};

// Re-export for convenience
pub use tokio_util::sync::CancellationToken;
