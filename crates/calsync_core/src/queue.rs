//! The durable mutation queue.
//!
//! Every user action becomes a [`Mutation`] row in the `mutations` table,
//! written in the same batch as the optimistic cache record and the sequence
//! counter. The queue hands mutations to the sync engine strictly in
//! per-entity order: only the earliest pending mutation of an entity is ever
//! ready, and never while an earlier hand-out for that entity is unresolved.
//!
//! Lock order is queue state, then store, then cache install. Every write
//! the queue makes, the pull cursor included, happens under the queue lock,
//! so readers never see one half of a change.

use crate::cache::{CacheEntry, LocalCache};
use crate::clock::{self, Clock};
use crate::entity::{Entity, EntityId};
use crate::error::{CoreError, CoreResult};
use crate::mutation::Mutation;
use crate::store::{decode_row, encode_row, meta_keys, DurableStore, WriteBatch, META, MUTATIONS};
use crate::types::{EntityKind, Fields, MutationKind, Sequence, Timestamp};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

type Listener = Box<dyn Fn(Sequence) + Send + Sync>;

struct QueueState {
    pending: BTreeMap<Sequence, Mutation>,
    next_sequence: Sequence,
    in_flight: HashSet<EntityId>,
}

impl QueueState {
    /// Earliest pending mutation of every entity, in sequence order.
    fn heads(&self) -> impl Iterator<Item = &Mutation> {
        let mut seen = HashSet::new();
        self.pending
            .values()
            .filter(move |m| seen.insert(m.entity_id))
    }
}

/// Durable FIFO-by-entity queue of outbound mutations.
pub struct MutationQueue {
    store: Arc<DurableStore>,
    cache: Arc<LocalCache>,
    clock: Arc<dyn Clock>,
    device_id: String,
    state: Mutex<QueueState>,
    listeners: Mutex<Vec<Listener>>,
}

impl MutationQueue {
    /// Loads the queue from a migrated store.
    ///
    /// `cache` must have been loaded from the same store.
    ///
    /// # Errors
    ///
    /// Returns `MigrationFailed` if the store has not been migrated, or a
    /// codec error for undecodable rows.
    pub fn open(
        store: Arc<DurableStore>,
        cache: Arc<LocalCache>,
        clock: Arc<dyn Clock>,
    ) -> CoreResult<Self> {
        if !store.has_table(META) {
            return Err(CoreError::migration_failed("store has no meta table; run migrations"));
        }
        let device_id: String = store
            .get(META, meta_keys::DEVICE_ID)?
            .map(|raw| decode_row(&raw))
            .transpose()?
            .ok_or_else(|| CoreError::migration_failed("store has no device id; run migrations"))?;

        let mut pending = BTreeMap::new();
        for (key, value) in store.scan(MUTATIONS)? {
            let sequence = Sequence::from_key(&key)
                .ok_or_else(|| CoreError::codec("mutation key is not 8 bytes"))?;
            let mutation: Mutation = decode_row(&value)?;
            pending.insert(sequence, mutation);
        }

        let stored_next = match store.get(META, meta_keys::NEXT_SEQUENCE)? {
            Some(raw) => Sequence::new(decode_row::<u64>(&raw)?),
            None => Sequence::new(1),
        };
        let after_pending = pending
            .keys()
            .next_back()
            .map_or(Sequence::new(1), |s: &Sequence| s.next());
        let next_sequence = stored_next.max(after_pending);

        tracing::debug!(
            pending = pending.len(),
            next_sequence = next_sequence.as_u64(),
            "mutation queue opened"
        );

        Ok(Self {
            store,
            cache,
            clock,
            device_id,
            state: Mutex::new(QueueState {
                pending,
                next_sequence,
                in_flight: HashSet::new(),
            }),
            listeners: Mutex::new(Vec::new()),
        })
    }

    /// Identifier of this device.
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// The cache this queue keeps in step.
    #[must_use]
    pub fn cache(&self) -> &Arc<LocalCache> {
        &self.cache
    }

    /// The clock used for enqueue stamps and retry scheduling.
    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Registers a callback invoked after every successful enqueue.
    pub fn on_enqueue(&self, listener: impl Fn(Sequence) + Send + Sync + 'static) {
        self.listeners.lock().push(Box::new(listener));
    }

    /// Durably appends a mutation and applies it optimistically.
    ///
    /// When this returns, the mutation survives a crash and the cache shows
    /// its effect.
    ///
    /// # Errors
    ///
    /// - `MalformedPayload` if the payload does not fit the kind or the entity
    /// - `StorageUnavailable` if the write fails; nothing is enqueued
    pub fn enqueue(
        &self,
        kind: MutationKind,
        entity_id: EntityId,
        payload: Fields,
    ) -> CoreResult<Sequence> {
        let sequence = {
            let mut state = self.state.lock();
            let sequence = state.next_sequence;
            let base_version = self
                .cache
                .entry(entity_id)
                .and_then(|e| e.confirmed_version());
            let mutation = Mutation::new(
                sequence,
                kind,
                entity_id,
                payload,
                self.clock.now(),
                base_version,
            );

            let entry = self.cache.stage_optimistic(&mutation)?;
            let mut batch = WriteBatch::new();
            batch.put(MUTATIONS, sequence.to_key().to_vec(), encode_row(&mutation)?);
            entry.write_to(entity_id, &mut batch)?;
            batch.put(
                META,
                meta_keys::NEXT_SEQUENCE,
                encode_row(&sequence.next().as_u64())?,
            );
            self.store.commit(&batch)?;

            state.pending.insert(sequence, mutation);
            state.next_sequence = sequence.next();
            self.cache.install(entity_id, entry);
            sequence
        };

        tracing::debug!(%sequence, %kind, %entity_id, "mutation enqueued");
        for listener in self.listeners.lock().iter() {
            listener(sequence);
        }
        Ok(sequence)
    }

    /// Mutations the engine may send at `now`, in sequence order.
    ///
    /// Only the earliest pending mutation of each entity is considered, and
    /// only if it is due and its entity has no unresolved hand-out.
    #[must_use]
    pub fn peek_ready(&self, now: Timestamp) -> Vec<Mutation> {
        let state = self.state.lock();
        state
            .heads()
            .filter(|m| m.is_due(now) && !state.in_flight.contains(&m.entity_id))
            .map(|m| self.for_sending(m))
            .collect()
    }

    /// Like [`MutationQueue::peek_ready`], but marks up to `limit` entities as
    /// in flight until the mutation is acked, rejected, rescheduled, rebased
    /// or released.
    pub fn claim_ready(&self, now: Timestamp, limit: usize) -> Vec<Mutation> {
        let mut state = self.state.lock();
        let ready: Vec<Mutation> = state
            .heads()
            .filter(|m| m.is_due(now) && !state.in_flight.contains(&m.entity_id))
            .take(limit)
            .map(|m| self.for_sending(m))
            .collect();
        for m in &ready {
            state.in_flight.insert(m.entity_id);
        }
        ready
    }

    /// The mutation with its base version refreshed to the entity's current
    /// confirmed version, which is what an entity head was computed against
    /// once every earlier mutation has been acknowledged.
    fn for_sending(&self, mutation: &Mutation) -> Mutation {
        let mut out = mutation.clone();
        if let Some(entry) = self.cache.entry(mutation.entity_id) {
            out.base_version = entry.confirmed_version().or(mutation.base_version);
        }
        out
    }

    /// Removes an acknowledged mutation and folds it into the confirmed state.
    ///
    /// Returns `false` if the sequence is not pending; acknowledging twice is
    /// harmless.
    ///
    /// # Errors
    ///
    /// Returns `StorageUnavailable` if the write fails; the mutation stays.
    pub fn ack(&self, sequence: Sequence) -> CoreResult<bool> {
        self.resolve(sequence, "acked", |cache, m| cache.stage_ack(m, None))
    }

    /// Removes an acknowledged mutation and takes the server's state as the
    /// confirmed state. `None` means the server confirmed a deletion.
    ///
    /// # Errors
    ///
    /// Returns `StorageUnavailable` if the write fails; the mutation stays.
    pub fn ack_and_reconcile(
        &self,
        sequence: Sequence,
        server_state: Option<Entity>,
    ) -> CoreResult<bool> {
        self.resolve(sequence, "acked", |cache, m| {
            cache.stage_ack(m, Some(server_state))
        })
    }

    /// Removes a rejected mutation and rolls back its optimistic effect.
    ///
    /// # Errors
    ///
    /// Returns `StorageUnavailable` if the write fails; the mutation stays.
    pub fn reject(&self, sequence: Sequence, reason: &str) -> CoreResult<bool> {
        self.resolve(sequence, "rejected", |cache, m| {
            cache.stage_rollback(m, reason)
        })
    }

    /// Rejects a mutation whose entity the server does not have, clearing the
    /// confirmed state so no stale copy remains.
    ///
    /// # Errors
    ///
    /// Returns `StorageUnavailable` if the write fails; the mutation stays.
    pub fn reject_missing(&self, sequence: Sequence, reason: &str) -> CoreResult<bool> {
        self.resolve(sequence, "rejected", |cache, m| {
            cache.stage_rollback(m, reason)?.reconciled(None)
        })
    }

    fn resolve(
        &self,
        sequence: Sequence,
        outcome: &str,
        stage: impl FnOnce(&LocalCache, &Mutation) -> CoreResult<CacheEntry>,
    ) -> CoreResult<bool> {
        let mut state = self.state.lock();
        let Some(mutation) = state.pending.get(&sequence).cloned() else {
            return Ok(false);
        };

        let entry = stage(&self.cache, &mutation)?;
        let mut batch = WriteBatch::new();
        batch.delete(MUTATIONS, sequence.to_key().to_vec());
        entry.write_to(mutation.entity_id, &mut batch)?;
        self.store.commit(&batch)?;

        state.pending.remove(&sequence);
        state.in_flight.remove(&mutation.entity_id);
        self.cache.install(mutation.entity_id, entry);

        tracing::debug!(%sequence, entity_id = %mutation.entity_id, outcome, "mutation resolved");
        Ok(true)
    }

    /// Records a failed attempt and schedules the next one after `delay`.
    ///
    /// Returns the updated mutation, or `None` if the sequence is not pending.
    ///
    /// # Errors
    ///
    /// Returns `StorageUnavailable` if the write fails.
    pub fn reschedule(&self, sequence: Sequence, delay: Duration) -> CoreResult<Option<Mutation>> {
        let mut state = self.state.lock();
        let Some(mut mutation) = state.pending.get(&sequence).cloned() else {
            return Ok(None);
        };
        mutation.attempt_count = mutation.attempt_count.saturating_add(1);
        mutation.next_attempt_at = clock::after(self.clock.now(), delay);

        let mut batch = WriteBatch::new();
        batch.put(MUTATIONS, sequence.to_key().to_vec(), encode_row(&mutation)?);
        self.store.commit(&batch)?;

        let entry = self.cache.stage_replace(&mutation);
        state.pending.insert(sequence, mutation.clone());
        state.in_flight.remove(&mutation.entity_id);
        self.cache.install(mutation.entity_id, entry);
        Ok(Some(mutation))
    }

    /// Resolves a version conflict: the server state becomes the confirmed
    /// state, the mutation is re-applied on top of it and made due now.
    ///
    /// Returns the updated mutation, or `None` if the sequence is not pending.
    ///
    /// # Errors
    ///
    /// - `MalformedPayload` if the mutation cannot be applied to the server
    ///   state (for example a different entity kind)
    /// - `StorageUnavailable` if the write fails
    pub fn rebase(&self, sequence: Sequence, server_state: Entity) -> CoreResult<Option<Mutation>> {
        let mut state = self.state.lock();
        let Some(mut mutation) = state.pending.get(&sequence).cloned() else {
            return Ok(None);
        };
        mutation.base_version = server_state.version;
        mutation.next_attempt_at = self.clock.now();
        mutation.conflicts = mutation.conflicts.saturating_add(1);

        let entry = self.cache.stage_rebase(&mutation, server_state)?;
        let mut batch = WriteBatch::new();
        batch.put(MUTATIONS, sequence.to_key().to_vec(), encode_row(&mutation)?);
        entry.write_to(mutation.entity_id, &mut batch)?;
        self.store.commit(&batch)?;

        state.pending.insert(sequence, mutation.clone());
        state.in_flight.remove(&mutation.entity_id);
        self.cache.install(mutation.entity_id, entry);
        Ok(Some(mutation))
    }

    /// Clears the in-flight mark of a claimed mutation without an outcome.
    pub fn release(&self, sequence: Sequence) {
        let mut state = self.state.lock();
        if let Some(entity_id) = state.pending.get(&sequence).map(|m| m.entity_id) {
            state.in_flight.remove(&entity_id);
        }
    }

    /// Durably replaces the confirmed state of an entity, for state pulled
    /// from the server. Pending mutations are re-applied on top.
    ///
    /// # Errors
    ///
    /// - `MalformedPayload` if pending mutations do not fit the new state
    /// - `StorageUnavailable` if the write fails
    pub fn reconcile(
        &self,
        entity_id: EntityId,
        kind: EntityKind,
        server_state: Option<Entity>,
    ) -> CoreResult<Option<Entity>> {
        let _state = self.state.lock();
        let entry = self.cache.stage_reconcile(entity_id, kind, server_state)?;
        let mut batch = WriteBatch::new();
        entry.write_to(entity_id, &mut batch)?;
        self.store.commit(&batch)?;

        let projected = entry.projected().cloned();
        self.cache.install(entity_id, entry);
        Ok(projected)
    }

    /// Forgets the recorded failure of an entity.
    ///
    /// # Errors
    ///
    /// Returns `StorageUnavailable` if the write fails.
    pub fn dismiss_failure(&self, entity_id: EntityId) -> CoreResult<()> {
        let _state = self.state.lock();
        let Some(entry) = self.cache.entry(entity_id) else {
            return Ok(());
        };
        if entry.failure().is_none() {
            return Ok(());
        }
        let entry = entry.without_failure();
        let mut batch = WriteBatch::new();
        entry.write_to(entity_id, &mut batch)?;
        self.store.commit(&batch)?;
        self.cache.install(entity_id, entry);
        Ok(())
    }

    /// A pending mutation by sequence.
    #[must_use]
    pub fn get(&self, sequence: Sequence) -> Option<Mutation> {
        self.state.lock().pending.get(&sequence).cloned()
    }

    /// All pending mutations in sequence order.
    #[must_use]
    pub fn pending(&self) -> Vec<Mutation> {
        self.state.lock().pending.values().cloned().collect()
    }

    /// Number of pending mutations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// True if nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().pending.is_empty()
    }

    /// Number of entities with an unresolved hand-out.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// The sequence the next enqueue will get.
    #[must_use]
    pub fn next_sequence(&self) -> Sequence {
        self.state.lock().next_sequence
    }

    /// Earliest `next_attempt_at` among mutations that could become ready.
    #[must_use]
    pub fn next_due(&self) -> Option<Timestamp> {
        let state = self.state.lock();
        state
            .heads()
            .filter(|m| !state.in_flight.contains(&m.entity_id))
            .map(|m| m.next_attempt_at)
            .min()
    }

    /// The stored pull cursor, zero if never pulled.
    ///
    /// # Errors
    ///
    /// Returns a codec error if the stored cursor is damaged.
    pub fn cursor(&self) -> CoreResult<u64> {
        match self.store.get(META, meta_keys::PULL_CURSOR)? {
            Some(raw) => decode_row(&raw),
            None => Ok(0),
        }
    }

    /// Persists the pull cursor.
    ///
    /// # Errors
    ///
    /// Returns `StorageUnavailable` if the write fails.
    pub fn set_cursor(&self, cursor: u64) -> CoreResult<()> {
        let _state = self.state.lock();
        let mut batch = WriteBatch::new();
        batch.put(META, meta_keys::PULL_CURSOR, encode_row(&cursor)?);
        self.store.commit(&batch)
    }
}

impl std::fmt::Debug for MutationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MutationQueue")
            .field("device_id", &self.device_id)
            .field("pending", &state.pending.len())
            .field("next_sequence", &state.next_sequence)
            .field("in_flight", &state.in_flight.len())
            .finish_non_exhaustive()
    }
}
