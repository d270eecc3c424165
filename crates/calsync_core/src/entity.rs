//! Entity identifiers and entity state.

use crate::types::{EntityKind, Fields};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Stable identifier of a calendar or event.
///
/// Entity IDs are 128-bit UUIDs generated on the client at creation time, so
/// entities created offline already carry the id the server will use.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(Uuid);

impl EntityId {
    /// Creates a new random entity ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates an entity ID from raw bytes.
    #[inline]
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Returns the raw bytes.
    #[inline]
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Converts to a UUID.
    #[must_use]
    pub const fn to_uuid(&self) -> Uuid {
        self.0
    }

    /// Creates an entity ID from a slice.
    ///
    /// Returns `None` if the slice is not exactly 16 bytes.
    #[must_use]
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        let bytes: [u8; 16] = slice.try_into().ok()?;
        Some(Self::from_bytes(bytes))
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({})", self.0)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for EntityId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// A calendar or event as seen by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Stable identifier.
    pub id: EntityId,
    /// Calendar or event.
    pub kind: EntityKind,
    /// Current field values.
    pub fields: Fields,
    /// Server version marker, `None` until the server has confirmed the entity.
    pub version: Option<u64>,
}

impl Entity {
    /// Creates an entity that the server has not confirmed yet.
    #[must_use]
    pub fn new(id: EntityId, kind: EntityKind, fields: Fields) -> Self {
        Self {
            id,
            kind,
            fields,
            version: None,
        }
    }

    /// Sets the server version.
    #[must_use]
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = Some(version);
        self
    }

    /// Returns a field value.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        self.fields.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_is_unique() {
        assert_ne!(EntityId::new(), EntityId::new());
    }

    #[test]
    fn from_slice() {
        let id = EntityId::new();
        assert_eq!(EntityId::from_slice(id.as_bytes()), Some(id));
        assert!(EntityId::from_slice(&[0u8; 15]).is_none());
    }

    #[test]
    fn display_is_hyphenated_uuid() {
        let id = EntityId::from_bytes([0; 16]);
        assert_eq!(id.to_string(), "00000000-0000-0000-0000-000000000000");
    }
}
