//! Queued mutation records.

use crate::entity::EntityId;
use crate::types::{Fields, MutationKind, Sequence, Timestamp};
use serde::{Deserialize, Serialize};

/// One intended change to a calendar or event.
///
/// Mutations are immutable apart from the retry bookkeeping
/// (`attempt_count`, `next_attempt_at`, `conflicts`, `base_version`), which
/// only the sync engine changes through the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    /// Queue position.
    pub sequence: Sequence,
    /// What the mutation does.
    pub kind: MutationKind,
    /// Target entity.
    pub entity_id: EntityId,
    /// Field values being set. Empty for deletes.
    pub payload: Fields,
    /// When the mutation was enqueued.
    pub enqueued_at: Timestamp,
    /// Number of failed delivery attempts so far.
    pub attempt_count: u32,
    /// Earliest time the engine may send the mutation again.
    pub next_attempt_at: Timestamp,
    /// Confirmed server version of the entity the mutation was computed against.
    pub base_version: Option<u64>,
    /// Number of times the mutation was rebased after a version conflict.
    #[serde(default)]
    pub conflicts: u32,
}

impl Mutation {
    /// Creates a mutation that is ready to send immediately.
    #[must_use]
    pub fn new(
        sequence: Sequence,
        kind: MutationKind,
        entity_id: EntityId,
        payload: Fields,
        enqueued_at: Timestamp,
        base_version: Option<u64>,
    ) -> Self {
        Self {
            sequence,
            kind,
            entity_id,
            payload,
            enqueued_at,
            attempt_count: 0,
            next_attempt_at: enqueued_at,
            base_version,
            conflicts: 0,
        }
    }

    /// Returns true if the engine may send the mutation at `now`.
    #[must_use]
    pub fn is_due(&self, now: Timestamp) -> bool {
        self.next_attempt_at <= now
    }

    /// Key the remote store uses to deduplicate retried deliveries.
    ///
    /// Sequences are only unique per device, so the device id is part of the
    /// key. The key does not change across retries or rebases.
    #[must_use]
    pub fn idempotency_key(&self, device_id: &str) -> String {
        format!("{device_id}:{}", self.sequence.as_u64())
    }
}
