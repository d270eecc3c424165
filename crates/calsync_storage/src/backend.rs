//! Storage backend trait definition.

use crate::error::StorageResult;

/// A low-level append-only byte store.
///
/// The durable store writes each committed batch as one appended record and
/// replays the whole byte range on open. Backends never interpret the bytes.
///
/// # Invariants
///
/// - `append` returns the offset where data was written
/// - `read_at` returns exactly the bytes previously written at that offset
/// - `flush` pushes appended data to the OS; `sync` makes it durable
/// - Backends must be `Send + Sync`
pub trait StorageBackend: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::ReadPastEnd`] if the range extends past
    /// the current size, or an I/O error.
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Appends data to the end of the storage and returns its offset.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Flushes pending writes to the operating system.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush operation fails.
    fn flush(&mut self) -> StorageResult<()>;

    /// Returns the current size in bytes, which is also the offset of the
    /// next `append`.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn size(&self) -> StorageResult<u64>;

    /// Syncs data and metadata to durable storage.
    ///
    /// After this returns, all previously appended data survives process
    /// termination and power loss.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync operation fails.
    fn sync(&mut self) -> StorageResult<()>;

    /// Truncates the storage to `new_size` bytes.
    ///
    /// Used during recovery to cut off a torn tail record.
    ///
    /// # Errors
    ///
    /// Returns an error if `new_size` is greater than the current size or the
    /// truncation fails.
    fn truncate(&mut self, new_size: u64) -> StorageResult<()>;
}
