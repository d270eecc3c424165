//! Schema migration support.
//!
//! The durable store carries a single integer schema version. Migrations
//! move it forward one step at a time:
//!
//! - **Forward-only**: there is no downgrade path
//! - **Gapless**: registered versions must be exactly 1..=N
//! - **Atomic per step**: a step's writes and the new version commit in one
//!   batch, so a failed step leaves the store at the version it started from
//!   and the next launch resumes the same step
//!
//! ## Usage
//!
//! ```rust
//! use calsync_core::migration::MigrationManager;
//! use calsync_core::store::DurableStore;
//!
//! let store = DurableStore::open_in_memory().unwrap();
//! let manager = MigrationManager::builtin().unwrap();
//! let run = manager.run_pending(&store).unwrap();
//! assert_eq!(run.final_version, manager.target_version());
//! ```

mod steps;

pub use steps::{CreateCoreTables, RebuildProjections, SeedMetadata};

use crate::error::{CoreError, CoreResult};
use crate::store::{DurableStore, WriteBatch};
use std::collections::BTreeMap;

/// Version number for migrations.
pub type SchemaVersion = u32;

/// Information about a migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationInfo {
    /// Version the store is at after this migration.
    pub version: SchemaVersion,
    /// Human-readable name.
    pub name: String,
    /// Description of what this migration does.
    pub description: Option<String>,
}

/// Result of a single applied migration.
#[derive(Debug, Clone)]
pub struct MigrationResult {
    /// The migration version that was applied.
    pub version: SchemaVersion,
    /// The migration name.
    pub name: String,
    /// Operations the step performed.
    pub operations: Vec<MigrationOperation>,
}

/// Result of running all pending migrations.
#[derive(Debug, Clone)]
pub struct MigrationRunResult {
    /// Version found on disk before the run.
    pub initial_version: SchemaVersion,
    /// Migrations applied, in order.
    pub applied: Vec<MigrationResult>,
    /// The final schema version.
    pub final_version: SchemaVersion,
}

impl MigrationRunResult {
    /// Number of migrations applied.
    #[must_use]
    pub fn applied_count(&self) -> usize {
        self.applied.len()
    }
}

/// An operation performed during a migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationOperation {
    /// Created a table.
    CreateTable {
        /// Name of the table.
        name: String,
    },
    /// Wrote a row.
    Put {
        /// Table the row belongs to.
        table: String,
    },
    /// Removed a row.
    Delete {
        /// Table the row belonged to.
        table: String,
    },
    /// Custom operation.
    Custom {
        /// Description of the operation.
        description: String,
    },
}

/// Context passed to migration steps.
///
/// Reads go to the store as it was before the step started; writes are
/// collected into a batch that commits together with the version bump.
pub struct MigrationContext<'a> {
    store: &'a DurableStore,
    current_version: SchemaVersion,
    batch: WriteBatch,
    operations: Vec<MigrationOperation>,
}

impl<'a> MigrationContext<'a> {
    fn new(store: &'a DurableStore, current_version: SchemaVersion) -> Self {
        Self {
            store,
            current_version,
            batch: WriteBatch::new(),
            operations: Vec::new(),
        }
    }

    /// The schema version the step starts from.
    #[must_use]
    pub fn current_version(&self) -> SchemaVersion {
        self.current_version
    }

    /// The store being migrated.
    #[must_use]
    pub fn store(&self) -> &'a DurableStore {
        self.store
    }

    /// Creates a table unless it already exists.
    pub fn create_table(&mut self, name: &str) {
        let pending = self.operations.iter().any(
            |op| matches!(op, MigrationOperation::CreateTable { name: n } if n == name),
        );
        if self.store.has_table(name) || pending {
            return;
        }
        self.batch.create_table(name);
        self.operations.push(MigrationOperation::CreateTable {
            name: name.to_string(),
        });
    }

    /// Writes a row.
    pub fn put(&mut self, table: &str, key: impl Into<Vec<u8>>, value: Vec<u8>) {
        self.batch.put(table, key, value);
        self.operations.push(MigrationOperation::Put {
            table: table.to_string(),
        });
    }

    /// Removes a row.
    pub fn delete(&mut self, table: &str, key: impl Into<Vec<u8>>) {
        self.batch.delete(table, key);
        self.operations.push(MigrationOperation::Delete {
            table: table.to_string(),
        });
    }

    /// Records a custom operation.
    pub fn custom(&mut self, description: &str) {
        self.operations.push(MigrationOperation::Custom {
            description: description.to_string(),
        });
    }

    /// Operations recorded so far.
    #[must_use]
    pub fn operations(&self) -> &[MigrationOperation] {
        &self.operations
    }
}

/// Trait for defining migrations.
pub trait Migration: Send + Sync {
    /// Returns the version the store is at after this migration.
    ///
    /// Versions must be unique and sequential starting from 1.
    fn version(&self) -> SchemaVersion;

    /// Returns the name of this migration.
    fn name(&self) -> &str;

    /// Returns an optional description.
    fn description(&self) -> Option<&str> {
        None
    }

    /// Runs the migration.
    ///
    /// Must be safe to run again against a store at `version() - 1`, which is
    /// guaranteed when all writes go through the context.
    fn up(&self, ctx: &mut MigrationContext<'_>) -> CoreResult<()>;
}

/// Manages schema migrations.
pub struct MigrationManager {
    /// Registered migrations, keyed by version.
    migrations: BTreeMap<SchemaVersion, Box<dyn Migration>>,
}

impl MigrationManager {
    /// Creates a new migration manager with no migrations.
    #[must_use]
    pub fn new() -> Self {
        Self {
            migrations: BTreeMap::new(),
        }
    }

    /// Creates a manager with the built-in calsync schema history.
    ///
    /// # Errors
    ///
    /// Never fails in practice; registration errors would indicate a broken
    /// build.
    pub fn builtin() -> CoreResult<Self> {
        let mut manager = Self::new();
        manager.register(Box::new(CreateCoreTables))?;
        manager.register(Box::new(SeedMetadata))?;
        manager.register(Box::new(RebuildProjections))?;
        manager.validate()?;
        Ok(manager)
    }

    /// Registers a migration.
    ///
    /// # Errors
    ///
    /// Returns an error if a migration with the same version already exists.
    pub fn register(&mut self, migration: Box<dyn Migration>) -> CoreResult<()> {
        let version = migration.version();
        if self.migrations.contains_key(&version) {
            return Err(CoreError::migration_failed(format!(
                "migration version {version} already registered"
            )));
        }
        self.migrations.insert(version, migration);
        Ok(())
    }

    /// Returns the version a fully migrated store is at.
    #[must_use]
    pub fn target_version(&self) -> SchemaVersion {
        self.migrations.keys().next_back().copied().unwrap_or(0)
    }

    /// Returns list of registered migrations.
    #[must_use]
    pub fn list(&self) -> Vec<MigrationInfo> {
        self.migrations.values().map(|m| info(m.as_ref())).collect()
    }

    /// Returns migrations the store has not applied yet.
    #[must_use]
    pub fn pending(&self, store: &DurableStore) -> Vec<MigrationInfo> {
        let current = store.schema_version();
        self.migrations
            .range(current.saturating_add(1)..)
            .map(|(_, m)| info(m.as_ref()))
            .collect()
    }

    /// Validates that migrations are sequential with no gaps.
    ///
    /// # Errors
    ///
    /// Returns `MigrationFailed` naming the first missing version.
    pub fn validate(&self) -> CoreResult<()> {
        for (i, version) in self.migrations.keys().enumerate() {
            let expected = i as SchemaVersion + 1;
            if *version != expected {
                return Err(CoreError::migration_failed(format!(
                    "migration version gap: expected {expected}, got {version}"
                )));
            }
        }
        Ok(())
    }

    /// Brings the store to the target version.
    ///
    /// Each step commits together with its version bump. On failure the store
    /// stays at the last version that committed and the error is returned;
    /// later steps are not attempted.
    ///
    /// # Errors
    ///
    /// Returns `MigrationFailed` if the registry has gaps, the store is newer
    /// than the target version, or a step fails.
    pub fn run_pending(&self, store: &DurableStore) -> CoreResult<MigrationRunResult> {
        self.validate()?;

        let initial_version = store.schema_version();
        let target = self.target_version();
        if initial_version > target {
            return Err(CoreError::migration_failed(format!(
                "store schema version {initial_version} is newer than supported version {target}"
            )));
        }

        let mut applied = Vec::new();
        for (version, migration) in self.migrations.range(initial_version.saturating_add(1)..) {
            let mut ctx = MigrationContext::new(store, version - 1);
            migration.up(&mut ctx).map_err(|e| {
                step_failed(*version, migration.name(), &e)
            })?;

            let MigrationContext {
                mut batch,
                operations,
                ..
            } = ctx;
            batch.set_schema_version(*version);
            store
                .commit(&batch)
                .map_err(|e| step_failed(*version, migration.name(), &e))?;

            tracing::info!(
                version = *version,
                name = migration.name(),
                operations = operations.len(),
                "applied migration"
            );
            applied.push(MigrationResult {
                version: *version,
                name: migration.name().to_string(),
                operations,
            });
        }

        Ok(MigrationRunResult {
            initial_version,
            applied,
            final_version: store.schema_version(),
        })
    }
}

impl Default for MigrationManager {
    fn default() -> Self {
        Self::new()
    }
}

fn info(migration: &dyn Migration) -> MigrationInfo {
    MigrationInfo {
        version: migration.version(),
        name: migration.name().to_string(),
        description: migration.description().map(String::from),
    }
}

fn step_failed(version: SchemaVersion, name: &str, cause: &CoreError) -> CoreError {
    tracing::error!(version, name, error = %cause, "migration step failed");
    match cause {
        CoreError::MigrationFailed { .. } => CoreError::migration_failed(cause.to_string()),
        _ => CoreError::migration_failed(format!("step {version} ({name}): {cause}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use calsync_storage::InMemoryBackend;
    use crate::config::Config;

    struct TestMigration {
        version: SchemaVersion,
        name: String,
        should_fail: bool,
    }

    impl Migration for TestMigration {
        fn version(&self) -> SchemaVersion {
            self.version
        }

        fn name(&self) -> &str {
            &self.name
        }

        fn up(&self, ctx: &mut MigrationContext<'_>) -> CoreResult<()> {
            ctx.create_table(&self.name);
            ctx.put(&self.name, b"marker".to_vec(), vec![self.version as u8]);
            if self.should_fail {
                return Err(CoreError::migration_failed("intentional failure"));
            }
            Ok(())
        }
    }

    fn make_migration(version: SchemaVersion, name: &str) -> Box<dyn Migration> {
        Box::new(TestMigration {
            version,
            name: name.to_string(),
            should_fail: false,
        })
    }

    fn make_failing_migration(version: SchemaVersion, name: &str) -> Box<dyn Migration> {
        Box::new(TestMigration {
            version,
            name: name.to_string(),
            should_fail: true,
        })
    }

    #[test]
    fn register_and_list_migrations() {
        let mut manager = MigrationManager::new();

        manager.register(make_migration(1, "first")).unwrap();
        manager.register(make_migration(2, "second")).unwrap();

        let list = manager.list();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].version, 1);
        assert_eq!(list[0].name, "first");
        assert_eq!(list[1].version, 2);
        assert_eq!(manager.target_version(), 2);
    }

    #[test]
    fn duplicate_version_rejected() {
        let mut manager = MigrationManager::new();

        manager.register(make_migration(1, "first")).unwrap();
        let result = manager.register(make_migration(1, "duplicate"));

        assert!(matches!(result, Err(CoreError::MigrationFailed { .. })));
    }

    #[test]
    fn validate_detects_gaps() {
        let mut manager = MigrationManager::new();

        manager.register(make_migration(1, "first")).unwrap();
        manager.register(make_migration(3, "third")).unwrap();

        assert!(manager.validate().is_err());
        let store = DurableStore::open_in_memory().unwrap();
        assert!(manager.run_pending(&store).is_err());
        assert_eq!(store.schema_version(), 0);
    }

    #[test]
    fn run_pending_applies_in_order() {
        let mut manager = MigrationManager::new();
        manager.register(make_migration(2, "second")).unwrap();
        manager.register(make_migration(1, "first")).unwrap();

        let store = DurableStore::open_in_memory().unwrap();
        let result = manager.run_pending(&store).unwrap();

        assert_eq!(result.initial_version, 0);
        assert_eq!(result.final_version, 2);
        let versions: Vec<_> = result.applied.iter().map(|m| m.version).collect();
        assert_eq!(versions, vec![1, 2]);
        assert!(store.has_table("first"));
        assert!(store.has_table("second"));
    }

    #[test]
    fn pending_skips_applied() {
        let mut manager = MigrationManager::new();
        manager.register(make_migration(1, "first")).unwrap();

        let store = DurableStore::open_in_memory().unwrap();
        manager.run_pending(&store).unwrap();

        manager.register(make_migration(2, "second")).unwrap();
        let pending = manager.pending(&store);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].version, 2);
    }

    #[test]
    fn failed_step_does_not_advance_version() {
        let backend = InMemoryBackend::new();
        let store = DurableStore::open(Box::new(backend.reopen()), Config::default()).unwrap();

        let mut manager = MigrationManager::new();
        manager.register(make_migration(1, "first")).unwrap();
        manager.register(make_failing_migration(2, "failing")).unwrap();
        manager.register(make_migration(3, "third")).unwrap();

        let err = manager.run_pending(&store).unwrap_err();
        assert!(matches!(err, CoreError::MigrationFailed { .. }));
        assert_eq!(store.schema_version(), 1);
        assert!(!store.has_table("failing"));
        assert!(!store.has_table("third"));
        drop(store);

        // Next launch resumes at the failed step.
        let store = DurableStore::open(Box::new(backend.reopen()), Config::default()).unwrap();
        assert_eq!(store.schema_version(), 1);
        let mut fixed = MigrationManager::new();
        fixed.register(make_migration(1, "first")).unwrap();
        fixed.register(make_migration(2, "failing")).unwrap();
        fixed.register(make_migration(3, "third")).unwrap();
        let result = fixed.run_pending(&store).unwrap();
        assert_eq!(result.initial_version, 1);
        assert_eq!(result.applied_count(), 2);
        assert_eq!(store.schema_version(), 3);
    }

    #[test]
    fn storage_failure_during_step_leaves_version() {
        let backend = InMemoryBackend::new();
        let store = DurableStore::open(Box::new(backend.reopen()), Config::default()).unwrap();
        let mut manager = MigrationManager::new();
        manager.register(make_migration(1, "first")).unwrap();

        backend.set_fail_writes(true);
        assert!(matches!(
            manager.run_pending(&store),
            Err(CoreError::MigrationFailed { .. })
        ));
        assert_eq!(store.schema_version(), 0);

        backend.set_fail_writes(false);
        manager.run_pending(&store).unwrap();
        assert_eq!(store.schema_version(), 1);
    }

    #[test]
    fn newer_store_is_rejected() {
        let store = DurableStore::open_in_memory().unwrap();
        let mut batch = WriteBatch::new();
        batch.set_schema_version(9);
        store.commit(&batch).unwrap();

        let manager = MigrationManager::builtin().unwrap();
        let err = manager.run_pending(&store).unwrap_err();
        assert!(err.to_string().contains("newer"));
        assert_eq!(store.schema_version(), 9);
    }

    #[test]
    fn context_guards_table_creation() {
        let store = DurableStore::open_in_memory().unwrap();
        let mut batch = WriteBatch::new();
        batch.create_table("existing");
        store.commit(&batch).unwrap();

        let mut ctx = MigrationContext::new(&store, 0);
        ctx.create_table("existing");
        ctx.create_table("fresh");
        ctx.create_table("fresh");
        ctx.custom("noted");

        assert_eq!(
            ctx.operations(),
            &[
                MigrationOperation::CreateTable {
                    name: "fresh".into()
                },
                MigrationOperation::Custom {
                    description: "noted".into()
                },
            ]
        );
    }
}
