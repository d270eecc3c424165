//! The local read model.
//!
//! For every entity the cache keeps the last state the server confirmed, the
//! mutations still waiting in the queue, and the projection the UI reads:
//!
//! ```text
//! projected = fold(confirmed, pending)
//! ```
//!
//! [`apply`] and [`fold`] are pure. [`CacheEntry`] transitions are pure as
//! well and return a new entry, which lets the mutation queue persist an
//! entry before installing it with [`LocalCache::install`].

use crate::entity::{Entity, EntityId};
use crate::error::{CoreError, CoreResult};
use crate::mutation::Mutation;
use crate::store::{decode_row, encode_row, DurableStore, WriteBatch, ENTITIES, MUTATIONS};
use crate::types::{EntityKind, Fields, Operation, Sequence};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Applies one mutation to an entity state.
///
/// - create inserts the entity with the payload's fields
/// - update merges the payload into the fields; a `null` value removes the
///   field. An absent or deleted entity stays absent
/// - delete yields `None`
///
/// # Errors
///
/// Returns `MalformedPayload` if a delete carries fields, a create carries
/// none, a field name is empty, or the mutation targets an entity of another
/// kind.
pub fn apply(entity: Option<Entity>, mutation: &Mutation) -> CoreResult<Option<Entity>> {
    validate_payload(mutation)?;
    let kind = mutation.kind.entity_kind();
    if let Some(existing) = &entity {
        if existing.kind != kind {
            return Err(CoreError::malformed(
                mutation.kind,
                format!("entity {} is a {}", existing.id, existing.kind),
            ));
        }
    }

    Ok(match mutation.kind.operation() {
        Operation::Create => {
            let mut created = Entity::new(mutation.entity_id, kind, Fields::new());
            created.version = entity.and_then(|e| e.version);
            merge(&mut created.fields, &mutation.payload);
            Some(created)
        }
        Operation::Update => entity.map(|mut updated| {
            merge(&mut updated.fields, &mutation.payload);
            updated
        }),
        Operation::Delete => None,
    })
}

/// Left fold of [`apply`] over mutations in sequence order.
///
/// `fold(base, &[])` is `base`.
///
/// # Errors
///
/// Returns the first `MalformedPayload` error.
pub fn fold(base: Option<Entity>, pending: &[Mutation]) -> CoreResult<Option<Entity>> {
    pending.iter().try_fold(base, apply)
}

/// Checks a payload against its mutation kind, independent of cache state.
///
/// # Errors
///
/// Returns `MalformedPayload` describing the first problem found.
pub fn validate_payload(mutation: &Mutation) -> CoreResult<()> {
    match mutation.kind.operation() {
        Operation::Delete if !mutation.payload.is_empty() => {
            return Err(CoreError::malformed(mutation.kind, "delete carries fields"));
        }
        Operation::Create if mutation.payload.is_empty() => {
            return Err(CoreError::malformed(mutation.kind, "create without fields"));
        }
        _ => {}
    }
    if mutation.payload.keys().any(String::is_empty) {
        return Err(CoreError::malformed(mutation.kind, "empty field name"));
    }
    Ok(())
}

fn merge(fields: &mut Fields, payload: &Fields) {
    for (name, value) in payload {
        if value.is_null() {
            fields.remove(name);
        } else {
            fields.insert(name.clone(), value.clone());
        }
    }
}

/// Sync status of one entity, for the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStatus {
    /// The projection equals the server-confirmed state.
    Synced,
    /// Mutations are still waiting to be sent.
    Pending {
        /// Number of queued mutations.
        count: usize,
    },
    /// The last mutation was rejected by the server and rolled back.
    Failed {
        /// Sequence of the rejected mutation.
        sequence: Sequence,
        /// Why the server rejected it.
        reason: String,
    },
}

/// A rejected mutation remembered for the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    /// Sequence of the rejected mutation.
    pub sequence: Sequence,
    /// Why the server rejected it.
    pub reason: String,
}

/// The persisted part of a cache entry, stored in the `entities` table.
///
/// Pending mutations are not part of the record; they live in the
/// `mutations` table and are joined back in on load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    /// Calendar or event.
    pub kind: EntityKind,
    /// Last server-confirmed state. `None` if never confirmed or deleted.
    pub confirmed: Option<Entity>,
    /// State shown to the UI.
    pub projected: Option<Entity>,
    /// Last rejected mutation, if not yet dismissed.
    pub failure: Option<Failure>,
}

/// Everything the cache knows about one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    kind: EntityKind,
    confirmed: Option<Entity>,
    pending: Vec<Mutation>,
    projected: Option<Entity>,
    failure: Option<Failure>,
}

impl CacheEntry {
    /// An entry with no state at all.
    #[must_use]
    pub fn vacant(kind: EntityKind) -> Self {
        Self {
            kind,
            confirmed: None,
            pending: Vec::new(),
            projected: None,
            failure: None,
        }
    }

    /// Rebuilds an entry from its stored record and pending mutations.
    ///
    /// The stored projection is taken as is.
    #[must_use]
    pub fn from_record(record: CacheRecord, mut pending: Vec<Mutation>) -> Self {
        pending.sort_by_key(|m| m.sequence);
        Self {
            kind: record.kind,
            confirmed: record.confirmed,
            pending,
            projected: record.projected,
            failure: record.failure,
        }
    }

    /// The persisted part of the entry.
    #[must_use]
    pub fn to_record(&self) -> CacheRecord {
        CacheRecord {
            kind: self.kind,
            confirmed: self.confirmed.clone(),
            projected: self.projected.clone(),
            failure: self.failure.clone(),
        }
    }

    /// Calendar or event.
    #[must_use]
    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    /// Last server-confirmed state.
    #[must_use]
    pub fn confirmed(&self) -> Option<&Entity> {
        self.confirmed.as_ref()
    }

    /// Server version of the confirmed state.
    #[must_use]
    pub fn confirmed_version(&self) -> Option<u64> {
        self.confirmed.as_ref().and_then(|e| e.version)
    }

    /// Queued mutations in sequence order.
    #[must_use]
    pub fn pending(&self) -> &[Mutation] {
        &self.pending
    }

    /// State shown to the UI.
    #[must_use]
    pub fn projected(&self) -> Option<&Entity> {
        self.projected.as_ref()
    }

    /// Last rejected mutation.
    #[must_use]
    pub fn failure(&self) -> Option<&Failure> {
        self.failure.as_ref()
    }

    /// Sync status derived from the entry.
    #[must_use]
    pub fn status(&self) -> SyncStatus {
        if !self.pending.is_empty() {
            SyncStatus::Pending {
                count: self.pending.len(),
            }
        } else if let Some(failure) = &self.failure {
            SyncStatus::Failed {
                sequence: failure.sequence,
                reason: failure.reason.clone(),
            }
        } else {
            SyncStatus::Synced
        }
    }

    /// True if the entry carries no information and can be dropped.
    #[must_use]
    pub fn is_vacant(&self) -> bool {
        self.confirmed.is_none() && self.pending.is_empty() && self.failure.is_none()
    }

    /// True if the stored projection equals the fold of confirmed and pending.
    ///
    /// # Errors
    ///
    /// Returns `MalformedPayload` if the pending mutations do not fold.
    pub fn is_consistent(&self) -> CoreResult<bool> {
        Ok(fold(self.confirmed.clone(), &self.pending)? == self.projected)
    }

    /// The entry after optimistically applying a new mutation.
    ///
    /// # Errors
    ///
    /// Returns `MalformedPayload` if the mutation does not fit the entry.
    pub fn with_optimistic(&self, mutation: &Mutation) -> CoreResult<Self> {
        if mutation.kind.entity_kind() != self.kind {
            return Err(CoreError::malformed(
                mutation.kind,
                format!("entity {} is a {}", mutation.entity_id, self.kind),
            ));
        }
        let projected = apply(self.projected.clone(), mutation)?;
        let mut next = self.clone();
        next.pending.push(mutation.clone());
        next.projected = projected;
        Ok(next)
    }

    /// The entry with a new confirmed state, pending mutations re-applied.
    ///
    /// # Errors
    ///
    /// Returns `MalformedPayload` if the pending mutations do not fold onto
    /// the new state.
    pub fn reconciled(&self, server_state: Option<Entity>) -> CoreResult<Self> {
        let mut next = self.clone();
        next.confirmed = server_state;
        next.refold()?;
        Ok(next)
    }

    /// The entry without the effect of a rejected mutation.
    ///
    /// # Errors
    ///
    /// Returns `MalformedPayload` if the remaining mutations do not fold.
    pub fn rolled_back(&self, sequence: Sequence, reason: &str) -> CoreResult<Self> {
        let mut next = self.clone();
        next.pending.retain(|m| m.sequence != sequence);
        next.failure = Some(Failure {
            sequence,
            reason: reason.to_string(),
        });
        next.refold()?;
        Ok(next)
    }

    /// The entry after the server accepted a mutation.
    ///
    /// With a server state, that state becomes the confirmed base. Without
    /// one, the mutation is folded into the confirmed base.
    ///
    /// # Errors
    ///
    /// Returns `MalformedPayload` if the remaining mutations do not fold.
    pub fn acknowledged(
        &self,
        mutation: &Mutation,
        server_state: Option<Option<Entity>>,
    ) -> CoreResult<Self> {
        let mut next = self.clone();
        next.pending.retain(|m| m.sequence != mutation.sequence);
        next.confirmed = match server_state {
            Some(state) => state,
            None => apply(next.confirmed.take(), mutation)?,
        };
        next.failure = None;
        next.refold()?;
        Ok(next)
    }

    /// The entry after a version conflict: the server state becomes the
    /// confirmed base and the updated mutation replaces its old copy.
    ///
    /// # Errors
    ///
    /// Returns `MalformedPayload` if the pending mutations do not fold onto
    /// the server state.
    pub fn rebased(&self, mutation: &Mutation, server_state: Entity) -> CoreResult<Self> {
        let mut next = self.with_replaced(mutation);
        next.confirmed = Some(server_state);
        next.refold()?;
        Ok(next)
    }

    /// The entry with a pending mutation's bookkeeping updated.
    #[must_use]
    pub fn with_replaced(&self, mutation: &Mutation) -> Self {
        let mut next = self.clone();
        if let Some(slot) = next
            .pending
            .iter_mut()
            .find(|m| m.sequence == mutation.sequence)
        {
            *slot = mutation.clone();
        }
        next
    }

    /// The entry with its failure dismissed.
    #[must_use]
    pub fn without_failure(&self) -> Self {
        let mut next = self.clone();
        next.failure = None;
        next
    }

    /// Adds the write for this entry's record to a batch, or its removal if
    /// the entry is vacant.
    ///
    /// # Errors
    ///
    /// Returns a codec error if the record cannot be encoded.
    pub fn write_to(&self, id: EntityId, batch: &mut WriteBatch) -> CoreResult<()> {
        if self.is_vacant() {
            batch.delete(ENTITIES, id.as_bytes().to_vec());
        } else {
            batch.put(ENTITIES, id.as_bytes().to_vec(), encode_row(&self.to_record())?);
        }
        Ok(())
    }

    fn refold(&mut self) -> CoreResult<()> {
        self.projected = fold(self.confirmed.clone(), &self.pending)?;
        Ok(())
    }
}

/// In-memory read model shared by the UI path and the sync engine.
///
/// Share it with `Arc`. The `stage_*` methods compute the next entry without
/// changing the cache; callers that persist entries install them afterwards.
/// The plain operations (`apply_optimistic`, `reconcile`, `rollback`) change
/// the in-memory model directly.
#[derive(Debug, Default)]
pub struct LocalCache {
    entries: RwLock<HashMap<EntityId, CacheEntry>>,
}

impl LocalCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads cache records and pending mutations from the store.
    ///
    /// # Errors
    ///
    /// Returns `UnknownTable` if the store is not migrated, or a codec error
    /// for an undecodable row.
    pub fn load(store: &DurableStore) -> CoreResult<Self> {
        let mut pending: HashMap<EntityId, Vec<Mutation>> = HashMap::new();
        for (_, value) in store.scan(MUTATIONS)? {
            let mutation: Mutation = decode_row(&value)?;
            pending.entry(mutation.entity_id).or_default().push(mutation);
        }

        let mut entries = HashMap::new();
        for (key, value) in store.scan(ENTITIES)? {
            let id = EntityId::from_slice(&key)
                .ok_or_else(|| CoreError::codec("entity key is not 16 bytes"))?;
            let record: CacheRecord = decode_row(&value)?;
            let mutations = pending.remove(&id).unwrap_or_default();
            entries.insert(id, CacheEntry::from_record(record, mutations));
        }

        // Mutations whose entity row is missing get a fresh projection.
        for (id, mutations) in pending {
            let Some(first) = mutations.first() else {
                continue;
            };
            let mut entry = CacheEntry::vacant(first.kind.entity_kind());
            entry.pending = mutations;
            entry.pending.sort_by_key(|m| m.sequence);
            entry.refold()?;
            entries.insert(id, entry);
        }

        tracing::debug!(entities = entries.len(), "cache loaded");
        Ok(Self {
            entries: RwLock::new(entries),
        })
    }

    /// The projection the UI shows, `None` if absent or deleted.
    #[must_use]
    pub fn get(&self, id: EntityId) -> Option<Entity> {
        self.entries
            .read()
            .get(&id)
            .and_then(|e| e.projected.clone())
    }

    /// The full entry for an entity.
    #[must_use]
    pub fn entry(&self, id: EntityId) -> Option<CacheEntry> {
        self.entries.read().get(&id).cloned()
    }

    /// Sync status of an entity, `None` if the cache has never seen it.
    #[must_use]
    pub fn status(&self, id: EntityId) -> Option<SyncStatus> {
        self.entries.read().get(&id).map(CacheEntry::status)
    }

    /// All visible entities of a kind, ordered by id.
    #[must_use]
    pub fn list(&self, kind: EntityKind) -> Vec<Entity> {
        let mut entities: Vec<Entity> = self
            .entries
            .read()
            .values()
            .filter(|e| e.kind == kind)
            .filter_map(|e| e.projected.clone())
            .collect();
        entities.sort_by_key(|e| e.id);
        entities
    }

    /// Pending mutations for an entity in sequence order.
    #[must_use]
    pub fn pending_for(&self, id: EntityId) -> Vec<Mutation> {
        self.entries
            .read()
            .get(&id)
            .map(|e| e.pending.clone())
            .unwrap_or_default()
    }

    /// Ids of all entities in the cache, ordered.
    #[must_use]
    pub fn ids(&self) -> Vec<EntityId> {
        let mut ids: Vec<EntityId> = self.entries.read().keys().copied().collect();
        ids.sort();
        ids
    }

    /// Number of entities in the cache.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// True if the cache holds no entities.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Computes the entry after an optimistic mutation.
    ///
    /// # Errors
    ///
    /// Returns `MalformedPayload` if the mutation does not fit.
    pub fn stage_optimistic(&self, mutation: &Mutation) -> CoreResult<CacheEntry> {
        validate_payload(mutation)?;
        self.current(mutation.entity_id, mutation.kind.entity_kind())
            .with_optimistic(mutation)
    }

    /// Computes the entry after a server state is reconciled.
    ///
    /// # Errors
    ///
    /// Returns `MalformedPayload` if pending mutations do not fold onto it.
    pub fn stage_reconcile(
        &self,
        id: EntityId,
        kind: EntityKind,
        server_state: Option<Entity>,
    ) -> CoreResult<CacheEntry> {
        self.current(id, kind).reconciled(server_state)
    }

    /// Computes the entry after a rejected mutation is rolled back.
    ///
    /// # Errors
    ///
    /// Returns `MalformedPayload` if remaining mutations do not fold.
    pub fn stage_rollback(&self, mutation: &Mutation, reason: &str) -> CoreResult<CacheEntry> {
        self.current(mutation.entity_id, mutation.kind.entity_kind())
            .rolled_back(mutation.sequence, reason)
    }

    /// Computes the entry after an acknowledged mutation.
    ///
    /// # Errors
    ///
    /// Returns `MalformedPayload` if remaining mutations do not fold.
    pub fn stage_ack(
        &self,
        mutation: &Mutation,
        server_state: Option<Option<Entity>>,
    ) -> CoreResult<CacheEntry> {
        self.current(mutation.entity_id, mutation.kind.entity_kind())
            .acknowledged(mutation, server_state)
    }

    /// Computes the entry after a conflict rebase.
    ///
    /// # Errors
    ///
    /// Returns `MalformedPayload` if pending mutations do not fold onto the
    /// server state.
    pub fn stage_rebase(&self, mutation: &Mutation, server_state: Entity) -> CoreResult<CacheEntry> {
        self.current(mutation.entity_id, mutation.kind.entity_kind())
            .rebased(mutation, server_state)
    }

    /// Computes the entry with updated retry bookkeeping for a mutation.
    #[must_use]
    pub fn stage_replace(&self, mutation: &Mutation) -> CacheEntry {
        self.current(mutation.entity_id, mutation.kind.entity_kind())
            .with_replaced(mutation)
    }

    /// Installs a computed entry. Vacant entries are removed.
    pub fn install(&self, id: EntityId, entry: CacheEntry) {
        let mut entries = self.entries.write();
        if entry.is_vacant() {
            entries.remove(&id);
        } else {
            entries.insert(id, entry);
        }
    }

    /// Applies a mutation optimistically and returns the new projection.
    ///
    /// # Errors
    ///
    /// Returns `MalformedPayload` if the mutation does not fit the entity.
    pub fn apply_optimistic(&self, mutation: &Mutation) -> CoreResult<Option<Entity>> {
        let entry = self.stage_optimistic(mutation)?;
        let projected = entry.projected.clone();
        self.install(mutation.entity_id, entry);
        Ok(projected)
    }

    /// Replaces the confirmed state of an entity and re-applies its pending
    /// mutations. `None` means the server confirmed the entity deleted.
    ///
    /// # Errors
    ///
    /// Returns `MalformedPayload` if pending mutations do not fold onto it.
    pub fn reconcile(
        &self,
        id: EntityId,
        kind: EntityKind,
        server_state: Option<Entity>,
    ) -> CoreResult<Option<Entity>> {
        let entry = self.stage_reconcile(id, kind, server_state)?;
        let projected = entry.projected.clone();
        self.install(id, entry);
        Ok(projected)
    }

    /// Removes a rejected mutation's effect and marks the entity failed.
    ///
    /// # Errors
    ///
    /// Returns `MalformedPayload` if remaining mutations do not fold.
    pub fn rollback(&self, mutation: &Mutation, reason: &str) -> CoreResult<Option<Entity>> {
        let entry = self.stage_rollback(mutation, reason)?;
        let projected = entry.projected.clone();
        self.install(mutation.entity_id, entry);
        Ok(projected)
    }

    fn current(&self, id: EntityId, kind: EntityKind) -> CacheEntry {
        self.entries
            .read()
            .get(&id)
            .cloned()
            .unwrap_or_else(|| CacheEntry::vacant(kind))
    }
}
