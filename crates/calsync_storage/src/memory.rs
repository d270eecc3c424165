//! A replica log held in memory, with fault injection for crash tests.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::{Mutex, RwLock};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
struct Shared {
    bytes: RwLock<Vec<u8>>,
    fail_writes: AtomicBool,
    /// Bytes of the next append that reach the log before it fails.
    tear_at: Mutex<Option<usize>>,
}

/// An in-memory replica log.
///
/// Handles made with [`InMemoryBackend::reopen`] see the same bytes and the
/// same fault settings. Dropping a store and opening a new one on a reopened
/// handle is how tests simulate a process restart.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    shared: Arc<Shared>,
}

impl InMemoryBackend {
    /// An empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A log that starts with `bytes`, e.g. a prefix cut from another log.
    #[must_use]
    pub fn with_data(bytes: Vec<u8>) -> Self {
        let backend = Self::default();
        *backend.shared.bytes.write() = bytes;
        backend
    }

    /// Another handle on the same log.
    #[must_use]
    pub fn reopen(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Snapshot of the log contents.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.shared.bytes.read().clone()
    }

    /// While set, appends, flushes and syncs fail as a full disk would.
    pub fn set_fail_writes(&self, fail: bool) {
        self.shared.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// The next append writes only its first `bytes` bytes, then fails.
    pub fn tear_next_append(&self, bytes: usize) {
        *self.shared.tear_at.lock() = Some(bytes);
    }

    fn writable(&self) -> StorageResult<()> {
        if self.shared.fail_writes.load(Ordering::SeqCst) {
            Err(io::Error::other("injected write failure").into())
        } else {
            Ok(())
        }
    }
}

impl StorageBackend for InMemoryBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let bytes = self.shared.bytes.read();
        let size = bytes.len() as u64;
        usize::try_from(offset)
            .ok()
            .and_then(|start| bytes.get(start..start.checked_add(len)?))
            .map(<[u8]>::to_vec)
            .ok_or(StorageError::ReadPastEnd { offset, len, size })
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        self.writable()?;
        let mut bytes = self.shared.bytes.write();
        let at = bytes.len() as u64;
        match self.shared.tear_at.lock().take() {
            Some(keep) if keep < data.len() => {
                bytes.extend_from_slice(&data[..keep]);
                Err(io::Error::new(io::ErrorKind::Interrupted, "injected torn write").into())
            }
            _ => {
                bytes.extend_from_slice(data);
                Ok(at)
            }
        }
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.writable()
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.shared.bytes.read().len() as u64)
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.writable()
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let mut bytes = self.shared.bytes.write();
        let size = bytes.len() as u64;
        if new_size > size {
            return Err(StorageError::InvalidTruncate {
                requested: new_size,
                size,
            });
        }
        bytes.truncate(new_size as usize);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_sees_committed_bytes() {
        let mut log = InMemoryBackend::new();
        assert_eq!(log.append(b"rec1").unwrap(), 0);
        assert_eq!(log.append(b"rec2").unwrap(), 4);

        let after_restart = log.reopen();
        drop(log);
        assert_eq!(after_restart.size().unwrap(), 8);
        assert_eq!(after_restart.read_at(4, 4).unwrap(), b"rec2");
    }

    #[test]
    fn reads_outside_the_log_fail() {
        let log = InMemoryBackend::with_data(b"rec1".to_vec());
        for (offset, len) in [(2, 4), (5, 0), (u64::MAX, 1)] {
            assert!(matches!(
                log.read_at(offset, len),
                Err(StorageError::ReadPastEnd { size: 4, .. })
            ));
        }
        assert!(log.read_at(4, 0).unwrap().is_empty());
    }

    #[test]
    fn full_disk_rejects_writes_but_not_reads() {
        let mut log = InMemoryBackend::with_data(b"rec1".to_vec());
        log.set_fail_writes(true);

        assert!(log.append(b"rec2").is_err());
        assert!(log.flush().is_err());
        assert!(log.sync().is_err());
        assert_eq!(log.read_at(0, 4).unwrap(), b"rec1");

        log.set_fail_writes(false);
        assert_eq!(log.append(b"rec2").unwrap(), 4);
    }

    #[test]
    fn torn_append_leaves_a_prefix_then_recovers() {
        let mut log = InMemoryBackend::new();
        log.append(b"rec1").unwrap();
        log.reopen().tear_next_append(2);

        assert!(log.append(b"rec2").is_err());
        assert_eq!(log.data(), b"rec1re");

        log.truncate(4).unwrap();
        assert_eq!(log.append(b"rec2").unwrap(), 4);
        assert_eq!(log.data(), b"rec1rec2");
        assert!(matches!(
            log.truncate(9),
            Err(StorageError::InvalidTruncate { requested: 9, size: 8 })
        ));
    }
}
