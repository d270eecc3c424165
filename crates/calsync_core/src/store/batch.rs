//! Atomic write batches.

use serde::{Deserialize, Serialize};

/// A single write inside a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteOp {
    /// Create a table. A no-op if it already exists.
    CreateTable {
        /// Table name.
        table: String,
    },
    /// Insert or replace a row.
    Put {
        /// Table name.
        table: String,
        /// Row key.
        key: Vec<u8>,
        /// Row value.
        value: Vec<u8>,
    },
    /// Remove a row. A no-op if it does not exist.
    Delete {
        /// Table name.
        table: String,
        /// Row key.
        key: Vec<u8>,
    },
    /// Replace the schema version slot.
    SetSchemaVersion(u32),
}

/// An ordered set of writes committed all-or-nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    /// Creates an empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a table creation.
    pub fn create_table(&mut self, table: &str) -> &mut Self {
        self.ops.push(WriteOp::CreateTable {
            table: table.to_string(),
        });
        self
    }

    /// Adds a row insert or replace.
    pub fn put(&mut self, table: &str, key: impl Into<Vec<u8>>, value: Vec<u8>) -> &mut Self {
        self.ops.push(WriteOp::Put {
            table: table.to_string(),
            key: key.into(),
            value,
        });
        self
    }

    /// Adds a row removal.
    pub fn delete(&mut self, table: &str, key: impl Into<Vec<u8>>) -> &mut Self {
        self.ops.push(WriteOp::Delete {
            table: table.to_string(),
            key: key.into(),
        });
        self
    }

    /// Sets the schema version as part of the batch.
    pub fn set_schema_version(&mut self, version: u32) -> &mut Self {
        self.ops.push(WriteOp::SetSchemaVersion(version));
        self
    }

    /// Appends all writes of another batch.
    pub fn extend(&mut self, other: WriteBatch) -> &mut Self {
        self.ops.extend(other.ops);
        self
    }

    /// Returns the writes in order.
    #[must_use]
    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    /// Returns the number of writes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Returns true if the batch has no writes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_keeps_order() {
        let mut batch = WriteBatch::new();
        batch
            .create_table("t")
            .put("t", b"k".to_vec(), vec![1])
            .delete("t", b"k".to_vec())
            .set_schema_version(2);

        assert_eq!(batch.len(), 4);
        assert!(matches!(batch.ops()[0], WriteOp::CreateTable { .. }));
        assert_eq!(batch.ops()[3], WriteOp::SetSchemaVersion(2));
    }

    #[test]
    fn extend_appends() {
        let mut a = WriteBatch::new();
        a.create_table("a");
        let mut b = WriteBatch::new();
        b.create_table("b");

        a.extend(b);
        assert_eq!(a.len(), 2);
        assert!(!a.is_empty());
    }
}
