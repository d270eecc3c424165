//! Migration commands.

use super::{open_store, CliResult};
use calsync_core::MigrationManager;
use std::path::Path;
use tracing::info;

/// Shows which built-in migrations are applied.
pub fn status(path: &Path) -> CliResult<()> {
    info!("Checking migration status for {:?}", path);

    let store = open_store(path)?;
    let manager = MigrationManager::builtin()?;
    let current = store.schema_version();

    println!("Migration Status");
    println!("================");
    println!("  Current version: {current}");
    println!("  Target version:  {}", manager.target_version());
    println!();

    for migration in manager.list() {
        let status = if migration.version <= current {
            "✓ applied"
        } else {
            "○ pending"
        };
        println!("  v{}: {} [{}]", migration.version, migration.name, status);
        if let Some(desc) = &migration.description {
            println!("      {desc}");
        }
    }

    Ok(())
}

/// Applies pending migrations.
pub fn run(path: &Path) -> CliResult<()> {
    let store = open_store(path)?;
    let manager = MigrationManager::builtin()?;
    let result = manager.run_pending(&store)?;

    if result.applied.is_empty() {
        println!("Schema is up to date (version {})", result.final_version);
        return Ok(());
    }

    println!(
        "Migrated from version {} to {}",
        result.initial_version, result.final_version
    );
    for step in &result.applied {
        println!(
            "  ✓ v{}: {} ({} operation(s))",
            step.version,
            step.name,
            step.operations.len()
        );
    }
    Ok(())
}
