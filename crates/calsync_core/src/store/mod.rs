//! Durable store: a crash-safe, table-namespaced key/value log.
//!
//! Every logical operation is a [`WriteBatch`] that is appended to the
//! storage backend as a single checksummed record. On open the log is
//! replayed into an in-memory index; a record cut short by a crash is
//! detected by its length or checksum and truncated away, so a batch is
//! either fully visible after restart or not at all.
//!
//! ```text
//! record := magic "CSLG" | version u16 | payload_len u32 | payload (CBOR) | crc32
//! ```

mod batch;
mod durable;
mod record;

pub use batch::{WriteBatch, WriteOp};
pub use durable::{DurableStore, StoreStats};
pub use record::{compute_crc32, RECORD_MAGIC, RECORD_VERSION};

use crate::error::{CoreError, CoreResult};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Table holding one cache record per entity, keyed by entity id bytes.
pub const ENTITIES: &str = "entities";
/// Table holding queued mutations, keyed by big-endian sequence.
pub const MUTATIONS: &str = "mutations";
/// Table holding replica metadata.
pub const META: &str = "meta";

/// Keys of the `meta` table.
pub mod meta_keys {
    /// Next sequence number to assign.
    pub const NEXT_SEQUENCE: &[u8] = b"next_sequence";
    /// Identifier of this device, part of every idempotency key.
    pub const DEVICE_ID: &[u8] = b"device_id";
    /// Cursor of the last pull from the remote store.
    pub const PULL_CURSOR: &[u8] = b"pull_cursor";
}

/// Encodes a row value as CBOR.
pub fn encode_row<T: Serialize>(value: &T) -> CoreResult<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| CoreError::codec(e.to_string()))?;
    Ok(buf)
}

/// Decodes a row value written by [`encode_row`].
pub fn decode_row<T: DeserializeOwned>(bytes: &[u8]) -> CoreResult<T> {
    ciborium::from_reader(bytes).map_err(|e| CoreError::codec(e.to_string()))
}
