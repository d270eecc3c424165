//! The opened local replica: store, cache and queue for one session.

use crate::cache::{LocalCache, SyncStatus};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::entity::{Entity, EntityId};
use crate::error::{CoreError, CoreResult};
use crate::migration::{MigrationManager, MigrationRunResult};
use crate::queue::MutationQueue;
use crate::store::DurableStore;
use crate::types::{EntityKind, Fields, MutationKind, Operation, Sequence};
use calsync_storage::{FileBackend, InMemoryBackend, StorageBackend};
use std::path::Path;
use std::sync::Arc;

/// A local replica of the user's calendars.
///
/// Opening a replica migrates the store before the cache or the queue touch
/// it. The replica hands out shared handles so the UI path and a background
/// sync engine can work on the same queue.
///
/// # Example
///
/// ```rust
/// use calsync_core::{EntityKind, Replica};
/// use serde_json::json;
///
/// let replica = Replica::open_in_memory().unwrap();
/// let fields = [("name".to_string(), json!("Work"))].into_iter().collect();
/// let (id, _) = replica.create(EntityKind::Calendar, fields).unwrap();
/// assert_eq!(replica.get(id).unwrap().field("name"), Some(&json!("Work")));
/// ```
#[derive(Debug)]
pub struct Replica {
    store: Arc<DurableStore>,
    cache: Arc<LocalCache>,
    queue: Arc<MutationQueue>,
    migration: MigrationRunResult,
}

impl Replica {
    /// Opens a replica over a backend with the system clock.
    ///
    /// # Errors
    ///
    /// - `StorageUnavailable` or `Corrupted` if the log cannot be replayed
    /// - `MigrationFailed` if the schema cannot be brought up to date
    pub fn open(backend: Box<dyn StorageBackend>, config: Config) -> CoreResult<Self> {
        Self::open_with(backend, config, Arc::new(SystemClock))
    }

    /// Opens a replica over a backend with an explicit clock.
    ///
    /// # Errors
    ///
    /// See [`Replica::open`].
    pub fn open_with(
        backend: Box<dyn StorageBackend>,
        config: Config,
        clock: Arc<dyn Clock>,
    ) -> CoreResult<Self> {
        let migrate = config.migrate_on_open;
        let store = Arc::new(DurableStore::open(backend, config)?);

        let manager = MigrationManager::builtin()?;
        let migration = if migrate {
            manager.run_pending(&store)?
        } else {
            let version = store.schema_version();
            if version != manager.target_version() {
                return Err(CoreError::migration_failed(format!(
                    "store is at schema version {version}, expected {}",
                    manager.target_version()
                )));
            }
            MigrationRunResult {
                initial_version: version,
                applied: Vec::new(),
                final_version: version,
            }
        };

        let cache = Arc::new(LocalCache::load(&store)?);
        let queue = Arc::new(MutationQueue::open(
            Arc::clone(&store),
            Arc::clone(&cache),
            clock,
        )?);

        tracing::info!(
            schema_version = migration.final_version,
            migrations = migration.applied_count(),
            pending = queue.len(),
            entities = cache.len(),
            "replica opened"
        );

        Ok(Self {
            store,
            cache,
            queue,
            migration,
        })
    }

    /// Opens a replica stored in a file, creating it if missing.
    ///
    /// # Errors
    ///
    /// Returns `StorageUnavailable` if the file is locked by another process
    /// or cannot be opened, and otherwise as [`Replica::open`].
    pub fn open_path(path: &Path, config: Config) -> CoreResult<Self> {
        let backend = FileBackend::open(path)?;
        Self::open(Box::new(backend), config)
    }

    /// Opens a fresh, non-persistent replica.
    ///
    /// # Errors
    ///
    /// See [`Replica::open`].
    pub fn open_in_memory() -> CoreResult<Self> {
        Self::open(Box::new(InMemoryBackend::new()), Config::default())
    }

    /// The durable store.
    #[must_use]
    pub fn store(&self) -> &Arc<DurableStore> {
        &self.store
    }

    /// The local cache.
    #[must_use]
    pub fn cache(&self) -> &Arc<LocalCache> {
        &self.cache
    }

    /// The mutation queue.
    #[must_use]
    pub fn queue(&self) -> &Arc<MutationQueue> {
        &self.queue
    }

    /// Migrations applied while opening.
    #[must_use]
    pub fn migration(&self) -> &MigrationRunResult {
        &self.migration
    }

    /// Enqueues an arbitrary mutation.
    ///
    /// # Errors
    ///
    /// See [`MutationQueue::enqueue`].
    pub fn submit(
        &self,
        kind: MutationKind,
        entity_id: EntityId,
        payload: Fields,
    ) -> CoreResult<Sequence> {
        self.queue.enqueue(kind, entity_id, payload)
    }

    /// Creates a new calendar or event with a fresh id.
    ///
    /// # Errors
    ///
    /// See [`MutationQueue::enqueue`].
    pub fn create(&self, kind: EntityKind, fields: Fields) -> CoreResult<(EntityId, Sequence)> {
        let id = EntityId::new();
        let sequence = self.submit(MutationKind::new(kind, Operation::Create), id, fields)?;
        Ok((id, sequence))
    }

    /// Changes fields of a known entity. `null` values remove fields.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if the entity is unknown or deleted,
    /// otherwise see [`MutationQueue::enqueue`].
    pub fn update(&self, id: EntityId, fields: Fields) -> CoreResult<Sequence> {
        let kind = self.kind_of(id)?;
        self.submit(MutationKind::new(kind, Operation::Update), id, fields)
    }

    /// Deletes a known entity.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if the entity is unknown or deleted,
    /// otherwise see [`MutationQueue::enqueue`].
    pub fn delete(&self, id: EntityId) -> CoreResult<Sequence> {
        let kind = self.kind_of(id)?;
        self.submit(MutationKind::new(kind, Operation::Delete), id, Fields::new())
    }

    /// The entity as the UI should show it.
    #[must_use]
    pub fn get(&self, id: EntityId) -> Option<Entity> {
        self.cache.get(id)
    }

    /// Sync status of an entity.
    #[must_use]
    pub fn status(&self, id: EntityId) -> Option<SyncStatus> {
        self.cache.status(id)
    }

    /// All visible entities of a kind.
    #[must_use]
    pub fn list(&self, kind: EntityKind) -> Vec<Entity> {
        self.cache.list(kind)
    }

    /// Kind of an entity the UI can still see.
    fn kind_of(&self, id: EntityId) -> CoreResult<EntityKind> {
        match self.cache.entry(id) {
            Some(entry) if entry.projected().is_some() => Ok(entry.kind()),
            Some(_) => Err(CoreError::invalid_operation(format!("entity {id} is deleted"))),
            None => Err(CoreError::invalid_operation(format!("unknown entity {id}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;

    fn name(value: &str) -> Fields {
        [("name".to_string(), json!(value))].into_iter().collect()
    }

    #[test]
    fn open_migrates_fresh_store() {
        let replica = Replica::open_in_memory().unwrap();
        assert_eq!(replica.migration().initial_version, 0);
        assert_eq!(replica.migration().final_version, 3);
        assert_eq!(replica.queue().device_id().len(), 36);
    }

    #[test]
    fn unmigrated_store_is_refused_without_auto_migrate() {
        let result = Replica::open(
            Box::new(InMemoryBackend::new()),
            Config::default().migrate_on_open(false),
        );
        assert!(matches!(result, Err(CoreError::MigrationFailed { .. })));
    }

    #[test]
    fn state_survives_restart() {
        let backend = InMemoryBackend::new();
        let clock = Arc::new(ManualClock::new(0));
        let (id, device) = {
            let replica =
                Replica::open_with(Box::new(backend.reopen()), Config::default(), clock.clone())
                    .unwrap();
            let (id, _) = replica.create(EntityKind::Calendar, name("Home")).unwrap();
            replica.update(id, name("House")).unwrap();
            (id, replica.queue().device_id().to_string())
        };

        let replica =
            Replica::open_with(Box::new(backend.reopen()), Config::default(), clock).unwrap();
        assert_eq!(replica.migration().applied_count(), 0);
        assert_eq!(replica.queue().device_id(), device);
        assert_eq!(replica.queue().len(), 2);
        assert_eq!(replica.get(id).unwrap().field("name"), Some(&json!("House")));
        assert_eq!(replica.status(id), Some(SyncStatus::Pending { count: 2 }));

        let next = replica.create(EntityKind::Event, name("x")).unwrap().1;
        assert_eq!(next, Sequence::new(3));
    }

    #[test]
    fn update_of_unknown_entity_is_refused() {
        let replica = Replica::open_in_memory().unwrap();
        assert!(matches!(
            replica.update(EntityId::new(), name("x")),
            Err(CoreError::InvalidOperation { .. })
        ));
    }

    #[test]
    fn delete_hides_entity_immediately() {
        let replica = Replica::open_in_memory().unwrap();
        let (id, _) = replica.create(EntityKind::Event, name("Standup")).unwrap();
        replica.delete(id).unwrap();
        assert_eq!(replica.get(id), None);
        assert!(replica.list(EntityKind::Event).is_empty());
    }

    #[test]
    fn deleted_calendar_cannot_be_edited_back() {
        let replica = Replica::open_in_memory().unwrap();
        let (id, _) = replica.create(EntityKind::Calendar, name("Work")).unwrap();
        replica.delete(id).unwrap();

        let color = [("color".to_string(), json!("red"))].into_iter().collect();
        assert!(matches!(
            replica.update(id, color),
            Err(CoreError::InvalidOperation { .. })
        ));
        assert!(matches!(
            replica.delete(id),
            Err(CoreError::InvalidOperation { .. })
        ));
        assert_eq!(replica.get(id), None);
        assert!(replica.list(EntityKind::Calendar).is_empty());
        assert_eq!(replica.queue().len(), 2);
    }

    #[test]
    fn update_queued_behind_deleted_calendar_stays_hidden() {
        let replica = Replica::open_in_memory().unwrap();
        let (id, _) = replica.create(EntityKind::Calendar, name("Work")).unwrap();
        replica.delete(id).unwrap();
        replica
            .submit(MutationKind::UpdateCalendar, id, name("Ghost"))
            .unwrap();

        assert_eq!(replica.get(id), None);
        assert!(replica.list(EntityKind::Calendar).is_empty());
        assert_eq!(replica.status(id), Some(SyncStatus::Pending { count: 3 }));
    }
}
