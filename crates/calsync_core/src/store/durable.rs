//! The durable store.

use super::batch::{WriteBatch, WriteOp};
use super::record::{encode_record, read_record, ReadOutcome};
use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use calsync_storage::{InMemoryBackend, StorageBackend, StorageError};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

/// Rows per table, ordered by key.
type Table = BTreeMap<Vec<u8>, Vec<u8>>;

/// Target size of one record written by [`DurableStore::compact_into`].
const COMPACT_CHUNK_BYTES: usize = 1024 * 1024;

#[derive(Debug, Default)]
struct State {
    tables: BTreeMap<String, Table>,
    schema_version: u32,
    records: u64,
}

impl State {
    /// Checks that every write targets a table that exists or is created
    /// earlier in the same batch.
    fn validate(&self, batch: &WriteBatch) -> CoreResult<()> {
        let mut created: BTreeSet<&str> = BTreeSet::new();
        for op in batch.ops() {
            match op {
                WriteOp::CreateTable { table } => {
                    created.insert(table.as_str());
                }
                WriteOp::Put { table, .. } | WriteOp::Delete { table, .. } => {
                    if !self.tables.contains_key(table) && !created.contains(table.as_str()) {
                        return Err(CoreError::unknown_table(table.clone()));
                    }
                }
                WriteOp::SetSchemaVersion(_) => {}
            }
        }
        Ok(())
    }

    /// Applies a validated batch.
    fn apply(&mut self, batch: &WriteBatch) {
        for op in batch.ops() {
            match op {
                WriteOp::CreateTable { table } => {
                    self.tables.entry(table.clone()).or_default();
                }
                WriteOp::Put { table, key, value } => {
                    if let Some(rows) = self.tables.get_mut(table) {
                        rows.insert(key.clone(), value.clone());
                    }
                }
                WriteOp::Delete { table, key } => {
                    if let Some(rows) = self.tables.get_mut(table) {
                        rows.remove(key);
                    }
                }
                WriteOp::SetSchemaVersion(version) => self.schema_version = *version,
            }
        }
        self.records += 1;
    }
}

/// Summary of a store's contents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Rows per table.
    pub tables: BTreeMap<String, usize>,
    /// Current schema version.
    pub schema_version: u32,
    /// Records replayed or committed since open.
    pub records: u64,
    /// Size of the log in bytes.
    pub log_bytes: u64,
    /// Bytes of torn tail discarded when the store was opened.
    pub recovered_bytes: u64,
}

impl StoreStats {
    /// Total rows over all tables.
    #[must_use]
    pub fn total_rows(&self) -> usize {
        self.tables.values().sum()
    }
}

/// Crash-safe key/value storage grouped into named tables.
///
/// Each committed [`WriteBatch`] is appended to the backend as one
/// checksummed record and then applied to an in-memory index, so reads never
/// touch the backend. On open, the whole log is replayed; an incomplete final
/// record is cut off, which makes every batch all-or-nothing across crashes.
///
/// The store is safe to share between threads. Commits are serialized on the
/// backend lock; reads only take the index lock and always observe a batch
/// either completely or not at all.
///
/// # Example
///
/// ```rust
/// use calsync_core::store::{DurableStore, WriteBatch};
///
/// let store = DurableStore::open_in_memory().unwrap();
/// let mut batch = WriteBatch::new();
/// batch.create_table("meta").put("meta", b"k".to_vec(), b"v".to_vec());
/// store.commit(&batch).unwrap();
/// assert_eq!(store.get("meta", b"k").unwrap(), Some(b"v".to_vec()));
/// ```
pub struct DurableStore {
    config: Config,
    backend: Mutex<Box<dyn StorageBackend>>,
    state: RwLock<State>,
    recovered_bytes: u64,
    poisoned: AtomicBool,
}

impl DurableStore {
    /// Opens a store over a backend, replaying its log.
    ///
    /// # Errors
    ///
    /// - `StorageUnavailable` if the backend cannot be read or the torn tail
    ///   cannot be truncated
    /// - `Corrupted` if a record other than the last one is damaged
    pub fn open(mut backend: Box<dyn StorageBackend>, config: Config) -> CoreResult<Self> {
        let size = backend.size()?;
        let log = backend.read_at(0, size as usize)?;

        let mut state = State::default();
        let mut offset = 0usize;
        let mut recovered_bytes = 0u64;

        loop {
            match read_record(&log, offset, config.max_record_size)? {
                ReadOutcome::Record { batch, next } => {
                    state.validate(&batch).map_err(|e| {
                        CoreError::corrupted(offset as u64, format!("record does not apply: {e}"))
                    })?;
                    state.apply(&batch);
                    offset = next;
                }
                ReadOutcome::TornTail => {
                    recovered_bytes = size - offset as u64;
                    tracing::warn!(
                        offset,
                        bytes = recovered_bytes,
                        "discarding torn record at end of log"
                    );
                    backend.truncate(offset as u64)?;
                    backend.sync()?;
                    break;
                }
                ReadOutcome::End => break,
            }
        }

        tracing::debug!(
            records = state.records,
            tables = state.tables.len(),
            schema_version = state.schema_version,
            "store opened"
        );

        Ok(Self {
            config,
            backend: Mutex::new(backend),
            state: RwLock::new(state),
            recovered_bytes,
            poisoned: AtomicBool::new(false),
        })
    }

    /// Opens an empty, non-persistent store.
    ///
    /// # Errors
    ///
    /// Never fails in practice; the signature matches [`DurableStore::open`].
    pub fn open_in_memory() -> CoreResult<Self> {
        Self::open(Box::new(InMemoryBackend::new()), Config::default())
    }

    /// Returns the configuration the store was opened with.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Atomically applies a batch.
    ///
    /// When this returns `Ok`, the batch is durable (subject to
    /// `sync_on_commit`) and visible to readers. When it returns `Err`, none
    /// of it is visible, now or after a restart.
    ///
    /// # Errors
    ///
    /// - `UnknownTable` if a write targets a table that does not exist
    /// - `StorageUnavailable` if the backend write fails
    pub fn commit(&self, batch: &WriteBatch) -> CoreResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        if self.poisoned.load(Ordering::SeqCst) {
            return Err(poisoned_error());
        }

        let mut backend = self.backend.lock();
        self.state.read().validate(batch)?;
        let record = encode_record(batch, self.config.max_record_size)?;

        let start = backend.size()?;
        if let Err(err) = self.append_record(&mut **backend, &record) {
            if let Err(rollback) = backend.truncate(start) {
                tracing::error!(error = %rollback, "failed to roll back partial record");
                self.poisoned.store(true, Ordering::SeqCst);
            }
            return Err(err.into());
        }

        self.state.write().apply(batch);
        Ok(())
    }

    fn append_record(
        &self,
        backend: &mut dyn StorageBackend,
        record: &[u8],
    ) -> Result<(), StorageError> {
        backend.append(record)?;
        backend.flush()?;
        if self.config.sync_on_commit {
            backend.sync()?;
        }
        Ok(())
    }

    /// Reads a row.
    ///
    /// # Errors
    ///
    /// Returns `UnknownTable` if the table does not exist.
    pub fn get(&self, table: &str, key: &[u8]) -> CoreResult<Option<Vec<u8>>> {
        let state = self.state.read();
        let rows = state
            .tables
            .get(table)
            .ok_or_else(|| CoreError::unknown_table(table))?;
        Ok(rows.get(key).cloned())
    }

    /// Returns all rows of a table in key order.
    ///
    /// # Errors
    ///
    /// Returns `UnknownTable` if the table does not exist.
    pub fn scan(&self, table: &str) -> CoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let state = self.state.read();
        let rows = state
            .tables
            .get(table)
            .ok_or_else(|| CoreError::unknown_table(table))?;
        Ok(rows.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    /// Returns true if the table exists.
    #[must_use]
    pub fn has_table(&self, table: &str) -> bool {
        self.state.read().tables.contains_key(table)
    }

    /// Returns the names of all tables.
    #[must_use]
    pub fn table_names(&self) -> Vec<String> {
        self.state.read().tables.keys().cloned().collect()
    }

    /// Returns the schema version slot. Zero for a fresh store.
    #[must_use]
    pub fn schema_version(&self) -> u32 {
        self.state.read().schema_version
    }

    /// Returns a summary of the store.
    ///
    /// # Errors
    ///
    /// Returns `StorageUnavailable` if the log size cannot be read.
    pub fn stats(&self) -> CoreResult<StoreStats> {
        let log_bytes = self.backend.lock().size()?;
        let state = self.state.read();
        Ok(StoreStats {
            tables: state
                .tables
                .iter()
                .map(|(name, rows)| (name.clone(), rows.len()))
                .collect(),
            schema_version: state.schema_version,
            records: state.records,
            log_bytes,
            recovered_bytes: self.recovered_bytes,
        })
    }

    /// Writes the live contents of the store to an empty backend as a
    /// minimal log, and returns the number of bytes written.
    ///
    /// The source store is not modified. Opening the target yields the same
    /// tables, rows and schema version.
    ///
    /// # Errors
    ///
    /// - `InvalidOperation` if the target is not empty
    /// - `StorageUnavailable` if writing the target fails
    pub fn compact_into(&self, target: &mut dyn StorageBackend) -> CoreResult<u64> {
        if target.size()? != 0 {
            return Err(CoreError::invalid_operation(
                "compaction target must be empty",
            ));
        }

        let mut batches = Vec::new();
        {
            let state = self.state.read();
            let mut header = WriteBatch::new();
            for name in state.tables.keys() {
                header.create_table(name);
            }
            header.set_schema_version(state.schema_version);
            batches.push(header);

            let mut current = WriteBatch::new();
            let mut current_bytes = 0usize;
            for (name, rows) in &state.tables {
                for (key, value) in rows {
                    current_bytes += key.len() + value.len();
                    current.put(name, key.clone(), value.clone());
                    if current_bytes >= COMPACT_CHUNK_BYTES {
                        batches.push(std::mem::take(&mut current));
                        current_bytes = 0;
                    }
                }
            }
            if !current.is_empty() {
                batches.push(current);
            }
        }

        let mut written = 0u64;
        for batch in &batches {
            let record = encode_record(batch, self.config.max_record_size)?;
            target.append(&record)?;
            written += record.len() as u64;
        }
        target.flush()?;
        target.sync()?;

        tracing::info!(records = batches.len(), bytes = written, "store compacted");
        Ok(written)
    }
}

fn poisoned_error() -> CoreError {
    CoreError::StorageUnavailable(StorageError::Io(io::Error::other(
        "store is read-only after an unrecoverable write failure",
    )))
}

impl std::fmt::Debug for DurableStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("DurableStore")
            .field("tables", &state.tables.len())
            .field("schema_version", &state.schema_version)
            .field("records", &state.records)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(table: &str, key: &[u8], value: &[u8]) -> WriteBatch {
        let mut batch = WriteBatch::new();
        batch.put(table, key.to_vec(), value.to_vec());
        batch
    }

    fn store_with_table(backend: &InMemoryBackend) -> DurableStore {
        let store = DurableStore::open(Box::new(backend.reopen()), Config::default()).unwrap();
        let mut batch = WriteBatch::new();
        batch.create_table("t");
        store.commit(&batch).unwrap();
        store
    }

    #[test]
    fn fresh_store_is_empty() {
        let store = DurableStore::open_in_memory().unwrap();
        assert_eq!(store.schema_version(), 0);
        assert!(store.table_names().is_empty());
        assert_eq!(store.stats().unwrap().records, 0);
    }

    #[test]
    fn unknown_table_is_rejected() {
        let store = DurableStore::open_in_memory().unwrap();
        let err = store.commit(&put("nope", b"k", b"v")).unwrap_err();
        assert!(matches!(err, CoreError::UnknownTable { .. }));
        assert!(matches!(
            store.get("nope", b"k"),
            Err(CoreError::UnknownTable { .. })
        ));
    }

    #[test]
    fn table_created_in_same_batch_accepts_writes() {
        let store = DurableStore::open_in_memory().unwrap();
        let mut batch = WriteBatch::new();
        batch
            .create_table("t")
            .put("t", b"a".to_vec(), b"1".to_vec())
            .set_schema_version(3);
        store.commit(&batch).unwrap();

        assert_eq!(store.get("t", b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.schema_version(), 3);
    }

    #[test]
    fn rejected_batch_leaves_nothing_behind() {
        let store = DurableStore::open_in_memory().unwrap();
        let mut batch = WriteBatch::new();
        batch
            .create_table("t")
            .put("t", b"a".to_vec(), b"1".to_vec())
            .put("missing", b"b".to_vec(), b"2".to_vec());

        assert!(store.commit(&batch).is_err());
        assert!(!store.has_table("t"));
    }

    #[test]
    fn commits_survive_reopen() {
        let backend = InMemoryBackend::new();
        {
            let store = store_with_table(&backend);
            store.commit(&put("t", b"a", b"1")).unwrap();
            store.commit(&put("t", b"b", b"2")).unwrap();
            let mut delete = WriteBatch::new();
            delete.delete("t", b"a".to_vec());
            store.commit(&delete).unwrap();
        }

        let store = DurableStore::open(Box::new(backend.reopen()), Config::default()).unwrap();
        assert_eq!(store.scan("t").unwrap(), vec![(b"b".to_vec(), b"2".to_vec())]);
        assert_eq!(store.stats().unwrap().records, 4);
    }

    #[test]
    fn failed_write_is_not_visible() {
        let backend = InMemoryBackend::new();
        let store = store_with_table(&backend);

        backend.set_fail_writes(true);
        let err = store.commit(&put("t", b"a", b"1")).unwrap_err();
        assert!(err.is_storage_unavailable());
        assert_eq!(store.get("t", b"a").unwrap(), None);

        backend.set_fail_writes(false);
        store.commit(&put("t", b"a", b"2")).unwrap();
        assert_eq!(store.get("t", b"a").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn torn_append_is_rolled_back() {
        let backend = InMemoryBackend::new();
        let store = store_with_table(&backend);
        let before = backend.data().len();

        backend.tear_next_append(5);
        assert!(store.commit(&put("t", b"a", b"1")).is_err());
        assert_eq!(backend.data().len(), before);

        store.commit(&put("t", b"b", b"2")).unwrap();
        drop(store);

        let reopened = DurableStore::open(Box::new(backend.reopen()), Config::default()).unwrap();
        assert_eq!(reopened.get("t", b"a").unwrap(), None);
        assert_eq!(reopened.get("t", b"b").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn torn_tail_is_truncated_on_open() {
        let backend = InMemoryBackend::new();
        {
            let store = store_with_table(&backend);
            store.commit(&put("t", b"a", b"1")).unwrap();
            store.commit(&put("t", b"b", b"2")).unwrap();
        }
        let full = backend.data();
        let torn = InMemoryBackend::with_data(full[..full.len() - 3].to_vec());

        let store = DurableStore::open(Box::new(torn.reopen()), Config::default()).unwrap();
        assert_eq!(store.get("t", b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.get("t", b"b").unwrap(), None);
        assert!(store.stats().unwrap().recovered_bytes > 0);
        assert!(torn.data().len() < full.len());

        store.commit(&put("t", b"c", b"3")).unwrap();
        drop(store);
        let again = DurableStore::open(Box::new(torn.reopen()), Config::default()).unwrap();
        assert_eq!(again.get("t", b"c").unwrap(), Some(b"3".to_vec()));
        assert_eq!(again.stats().unwrap().recovered_bytes, 0);
    }

    #[test]
    fn damage_before_the_tail_is_corruption() {
        let backend = InMemoryBackend::new();
        {
            let store = store_with_table(&backend);
            store.commit(&put("t", b"a", b"1")).unwrap();
        }
        let mut bytes = backend.data();
        bytes[12] ^= 0xff;

        let result = DurableStore::open(
            Box::new(InMemoryBackend::with_data(bytes)),
            Config::default(),
        );
        assert!(matches!(result, Err(CoreError::Corrupted { offset: 0, .. })));
    }

    #[test]
    fn compaction_preserves_contents() {
        let backend = InMemoryBackend::new();
        let store = store_with_table(&backend);
        for i in 0u8..20 {
            store.commit(&put("t", &[i], &[i; 8])).unwrap();
        }
        let mut delete = WriteBatch::new();
        delete.delete("t", vec![0u8]).set_schema_version(7);
        store.commit(&delete).unwrap();

        let mut target = InMemoryBackend::new();
        let written = store.compact_into(&mut target).unwrap();
        assert!(written < backend.data().len() as u64);

        let compacted = DurableStore::open(Box::new(target), Config::default()).unwrap();
        assert_eq!(compacted.scan("t").unwrap(), store.scan("t").unwrap());
        assert_eq!(compacted.schema_version(), 7);
    }

    #[test]
    fn compaction_requires_empty_target() {
        let store = DurableStore::open_in_memory().unwrap();
        let mut target = InMemoryBackend::with_data(vec![1]);
        assert!(matches!(
            store.compact_into(&mut target),
            Err(CoreError::InvalidOperation { .. })
        ));
    }
}
