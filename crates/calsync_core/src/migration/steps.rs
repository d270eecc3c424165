//! Built-in schema history.

use super::{Migration, MigrationContext, SchemaVersion};
use crate::cache::{fold, CacheRecord};
use crate::entity::EntityId;
use crate::error::{CoreError, CoreResult};
use crate::mutation::Mutation;
use crate::store::{decode_row, encode_row, meta_keys, ENTITIES, META, MUTATIONS};
use crate::types::Sequence;
use std::collections::HashMap;
use uuid::Uuid;

/// Version 1: creates the `entities`, `mutations` and `meta` tables.
#[derive(Debug, Default)]
pub struct CreateCoreTables;

impl Migration for CreateCoreTables {
    fn version(&self) -> SchemaVersion {
        1
    }

    fn name(&self) -> &str {
        "create_core_tables"
    }

    fn description(&self) -> Option<&str> {
        Some("create the entities, mutations and meta tables")
    }

    fn up(&self, ctx: &mut MigrationContext<'_>) -> CoreResult<()> {
        ctx.create_table(ENTITIES);
        ctx.create_table(MUTATIONS);
        ctx.create_table(META);
        Ok(())
    }
}

/// Version 2: assigns the device id and the sequence counter.
#[derive(Debug, Default)]
pub struct SeedMetadata;

impl Migration for SeedMetadata {
    fn version(&self) -> SchemaVersion {
        2
    }

    fn name(&self) -> &str {
        "seed_metadata"
    }

    fn description(&self) -> Option<&str> {
        Some("assign a device id and initialise the sequence counter")
    }

    fn up(&self, ctx: &mut MigrationContext<'_>) -> CoreResult<()> {
        let store = ctx.store();

        if store.get(META, meta_keys::DEVICE_ID)?.is_none() {
            let device_id = Uuid::new_v4().to_string();
            ctx.put(META, meta_keys::DEVICE_ID, encode_row(&device_id)?);
        }

        if ctx.store().get(META, meta_keys::NEXT_SEQUENCE)?.is_none() {
            let next = ctx
                .store()
                .scan(MUTATIONS)?
                .last()
                .and_then(|(key, _)| Sequence::from_key(key))
                .map_or(Sequence::new(1), Sequence::next);
            ctx.put(META, meta_keys::NEXT_SEQUENCE, encode_row(&next.as_u64())?);
        }
        Ok(())
    }
}

/// Version 3: recomputes every stored projection from its confirmed state
/// and pending mutations.
#[derive(Debug, Default)]
pub struct RebuildProjections;

impl Migration for RebuildProjections {
    fn version(&self) -> SchemaVersion {
        3
    }

    fn name(&self) -> &str {
        "rebuild_projections"
    }

    fn description(&self) -> Option<&str> {
        Some("recompute cached projections from confirmed state and the queue")
    }

    fn up(&self, ctx: &mut MigrationContext<'_>) -> CoreResult<()> {
        let store = ctx.store();

        let mut pending: HashMap<EntityId, Vec<Mutation>> = HashMap::new();
        for (_, value) in store.scan(MUTATIONS)? {
            let mutation: Mutation = decode_row(&value)?;
            pending.entry(mutation.entity_id).or_default().push(mutation);
        }

        let mut rebuilt = 0usize;
        for (key, value) in store.scan(ENTITIES)? {
            let id = EntityId::from_slice(&key)
                .ok_or_else(|| CoreError::migration_failed("entity key is not 16 bytes"))?;
            let mut record: CacheRecord = decode_row(&value)?;
            let mutations = pending.remove(&id).unwrap_or_default();

            if record.confirmed.is_none() && mutations.is_empty() && record.failure.is_none() {
                ctx.delete(ENTITIES, key);
                continue;
            }

            let projected = fold(record.confirmed.clone(), &mutations)?;
            if projected != record.projected {
                record.projected = projected;
                ctx.put(ENTITIES, key, encode_row(&record)?);
                rebuilt += 1;
            }
        }

        for (id, mutations) in pending {
            let Some(first) = mutations.first() else {
                continue;
            };
            let record = CacheRecord {
                kind: first.kind.entity_kind(),
                confirmed: None,
                projected: fold(None, &mutations)?,
                failure: None,
            };
            ctx.put(ENTITIES, id.as_bytes().to_vec(), encode_row(&record)?);
            rebuilt += 1;
        }

        ctx.custom(&format!("rebuilt {rebuilt} projections"));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Entity;
    use crate::migration::MigrationManager;
    use crate::store::{DurableStore, WriteBatch};
    use crate::types::{EntityKind, Fields, MutationKind};
    use serde_json::json;

    fn migrate(store: &DurableStore) {
        MigrationManager::builtin().unwrap().run_pending(store).unwrap();
    }

    #[test]
    fn builtin_history_reaches_target() {
        let store = DurableStore::open_in_memory().unwrap();
        migrate(&store);

        assert_eq!(store.schema_version(), 3);
        assert!(store.has_table(ENTITIES));
        assert!(store.has_table(MUTATIONS));
        let next: u64 =
            decode_row(&store.get(META, meta_keys::NEXT_SEQUENCE).unwrap().unwrap()).unwrap();
        assert_eq!(next, 1);
        let device: String =
            decode_row(&store.get(META, meta_keys::DEVICE_ID).unwrap().unwrap()).unwrap();
        assert!(Uuid::parse_str(&device).is_ok());
    }

    #[test]
    fn running_twice_changes_nothing() {
        let store = DurableStore::open_in_memory().unwrap();
        migrate(&store);
        let before = store.stats().unwrap();
        let device = store.get(META, meta_keys::DEVICE_ID).unwrap();

        let second = MigrationManager::builtin().unwrap().run_pending(&store).unwrap();
        assert_eq!(second.applied_count(), 0);
        assert_eq!(store.stats().unwrap(), before);
        assert_eq!(store.get(META, meta_keys::DEVICE_ID).unwrap(), device);
    }

    #[test]
    fn seed_resumes_after_existing_mutations() {
        let store = DurableStore::open_in_memory().unwrap();
        let mut batch = WriteBatch::new();
        batch
            .create_table(ENTITIES)
            .create_table(MUTATIONS)
            .create_table(META)
            .set_schema_version(1);
        let m = Mutation::new(
            Sequence::new(41),
            MutationKind::DeleteEvent,
            EntityId::new(),
            Fields::new(),
            0,
            None,
        );
        batch.put(MUTATIONS, m.sequence.to_key().to_vec(), encode_row(&m).unwrap());
        store.commit(&batch).unwrap();

        migrate(&store);
        let next: u64 =
            decode_row(&store.get(META, meta_keys::NEXT_SEQUENCE).unwrap().unwrap()).unwrap();
        assert_eq!(next, 42);
    }

    #[test]
    fn stale_projection_is_rebuilt() {
        let store = DurableStore::open_in_memory().unwrap();
        let id = EntityId::new();
        let confirmed = Entity::new(
            id,
            EntityKind::Calendar,
            [("name".to_string(), json!("Old"))].into_iter().collect(),
        );
        let record = CacheRecord {
            kind: EntityKind::Calendar,
            confirmed: Some(confirmed),
            projected: None,
            failure: None,
        };
        let update = Mutation::new(
            Sequence::new(1),
            MutationKind::UpdateCalendar,
            id,
            [("name".to_string(), json!("New"))].into_iter().collect(),
            0,
            None,
        );

        let mut batch = WriteBatch::new();
        batch
            .create_table(ENTITIES)
            .create_table(MUTATIONS)
            .create_table(META)
            .put(ENTITIES, id.as_bytes().to_vec(), encode_row(&record).unwrap())
            .put(MUTATIONS, update.sequence.to_key().to_vec(), encode_row(&update).unwrap())
            .set_schema_version(2);
        store.commit(&batch).unwrap();

        let run = MigrationManager::builtin().unwrap().run_pending(&store).unwrap();
        assert_eq!(run.applied.len(), 1);

        let stored: CacheRecord =
            decode_row(&store.get(ENTITIES, id.as_bytes()).unwrap().unwrap()).unwrap();
        assert_eq!(
            stored.projected.and_then(|e| e.field("name").cloned()),
            Some(json!("New"))
        );
    }
}
