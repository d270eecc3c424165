//! # calsync Core
//!
//! Local-first core of the calsync calendar client.
//!
//! This crate provides:
//! - A crash-safe durable store of named tables ([`store`])
//! - Forward-only schema migrations ([`migration`])
//! - The optimistic local read model ([`cache`])
//! - The durable outbound mutation queue ([`queue`])
//! - [`Replica`], which opens all of the above in the right order
//!
//! ## Architecture
//!
//! ```text
//! user action ──► MutationQueue::enqueue ──► one WriteBatch
//!                         │                    (mutation row + cache record
//!                         │                     + sequence counter)
//!                         ▼
//!                    LocalCache ◄── UI reads projections
//!                         ▲
//!   sync engine ──────────┘ ack / reschedule / reject / rebase
//! ```
//!
//! Sending mutations to the server lives in `calsync_sync_engine`.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod cache;
pub mod clock;
mod config;
mod entity;
mod error;
pub mod migration;
mod mutation;
pub mod queue;
mod replica;
pub mod store;
mod types;

pub use cache::{CacheEntry, CacheRecord, LocalCache, SyncStatus};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use entity::{Entity, EntityId};
pub use error::{CoreError, CoreResult};
pub use migration::{MigrationManager, MigrationRunResult};
pub use mutation::Mutation;
pub use queue::MutationQueue;
pub use replica::Replica;
pub use store::{DurableStore, StoreStats, WriteBatch};
pub use types::{EntityKind, Fields, MutationKind, Operation, Sequence, Timestamp};
