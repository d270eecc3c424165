//! Core type definitions for calsync.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Field values of a calendar or event, keyed by field name.
///
/// Values are opaque JSON to the queue and the cache; only the merge rules
/// in [`crate::cache`] look at them, and only to drop `null`s.
pub type Fields = BTreeMap<String, serde_json::Value>;

/// Wall-clock time in milliseconds since the Unix epoch.
pub type Timestamp = u64;

/// Position of a mutation in the queue.
///
/// Sequence numbers are assigned at enqueue time, strictly increasing and
/// never reused, including across restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sequence(pub u64);

impl Sequence {
    /// Creates a new sequence number.
    #[must_use]
    pub const fn new(seq: u64) -> Self {
        Self(seq)
    }

    /// Returns the raw sequence value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next sequence number.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Big-endian key bytes, so the store's key order is sequence order.
    #[must_use]
    pub const fn to_key(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    /// Parses key bytes written by [`Sequence::to_key`].
    #[must_use]
    pub fn from_key(key: &[u8]) -> Option<Self> {
        let bytes: [u8; 8] = key.try_into().ok()?;
        Some(Self(u64::from_be_bytes(bytes)))
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seq:{}", self.0)
    }
}

/// The two kinds of entity the client syncs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    /// A calendar.
    Calendar,
    /// An event inside a calendar.
    Event,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Calendar => f.write_str("calendar"),
            Self::Event => f.write_str("event"),
        }
    }
}

/// What a mutation does to its entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    /// Insert a new entity.
    Create,
    /// Merge fields into an existing entity.
    Update,
    /// Remove the entity.
    Delete,
}

/// The kind of a queued mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MutationKind {
    /// Create a calendar.
    CreateCalendar,
    /// Update calendar fields.
    UpdateCalendar,
    /// Delete a calendar.
    DeleteCalendar,
    /// Create an event.
    CreateEvent,
    /// Update event fields.
    UpdateEvent,
    /// Delete an event.
    DeleteEvent,
}

impl MutationKind {
    /// Builds the mutation kind for an operation on an entity kind.
    #[must_use]
    pub const fn new(entity: EntityKind, operation: Operation) -> Self {
        match (entity, operation) {
            (EntityKind::Calendar, Operation::Create) => Self::CreateCalendar,
            (EntityKind::Calendar, Operation::Update) => Self::UpdateCalendar,
            (EntityKind::Calendar, Operation::Delete) => Self::DeleteCalendar,
            (EntityKind::Event, Operation::Create) => Self::CreateEvent,
            (EntityKind::Event, Operation::Update) => Self::UpdateEvent,
            (EntityKind::Event, Operation::Delete) => Self::DeleteEvent,
        }
    }

    /// Returns the kind of entity this mutation targets.
    #[must_use]
    pub const fn entity_kind(self) -> EntityKind {
        match self {
            Self::CreateCalendar | Self::UpdateCalendar | Self::DeleteCalendar => {
                EntityKind::Calendar
            }
            Self::CreateEvent | Self::UpdateEvent | Self::DeleteEvent => EntityKind::Event,
        }
    }

    /// Returns the operation this mutation performs.
    #[must_use]
    pub const fn operation(self) -> Operation {
        match self {
            Self::CreateCalendar | Self::CreateEvent => Operation::Create,
            Self::UpdateCalendar | Self::UpdateEvent => Operation::Update,
            Self::DeleteCalendar | Self::DeleteEvent => Operation::Delete,
        }
    }

    /// Returns the variant name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CreateCalendar => "CreateCalendar",
            Self::UpdateCalendar => "UpdateCalendar",
            Self::DeleteCalendar => "DeleteCalendar",
            Self::CreateEvent => "CreateEvent",
            Self::UpdateEvent => "UpdateEvent",
            Self::DeleteEvent => "DeleteEvent",
        }
    }
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
