//! # calsync Storage
//!
//! Byte-level home of the replica log.
//!
//! A backend only appends, reads back, and cuts off bytes. The framing of
//! committed batches, checksums and replay all live in `calsync_core`'s
//! durable store, which is the only user of this crate.
//!
//! - [`FileBackend`]: one locked file per replica
//! - [`InMemoryBackend`]: shared buffer for tests, able to fail or tear writes
//!
//! ```rust
//! use calsync_storage::{InMemoryBackend, StorageBackend};
//!
//! let mut log = InMemoryBackend::new();
//! let first = log.append(b"batch").unwrap();
//! assert_eq!(log.reopen().read_at(first, 5).unwrap(), b"batch");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
