//! Inspect command implementation.

use super::{open_store, CliResult, OutputFormat};
use calsync_core::store::{decode_row, meta_keys, ENTITIES, META, MUTATIONS};
use calsync_core::{DurableStore, MigrationManager};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Replica inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Replica path.
    pub path: String,
    /// Log size in bytes.
    pub log_bytes: u64,
    /// Number of log records.
    pub records: u64,
    /// Bytes of torn tail dropped while opening.
    pub recovered_bytes: u64,
    /// Schema version on disk.
    pub schema_version: u32,
    /// Schema version this build expects.
    pub target_version: u32,
    /// Migrations not yet applied.
    pub pending_migrations: usize,
    /// Rows per table.
    pub tables: BTreeMap<String, usize>,
    /// Entities in the local cache.
    pub entities: usize,
    /// Mutations waiting to be sent.
    pub pending_mutations: usize,
    /// Identifier of the device that owns the replica.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    /// Cursor of the last pull.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pull_cursor: Option<u64>,
}

/// Runs the inspect command.
pub fn run(path: &Path, format: OutputFormat) -> CliResult<()> {
    let store = open_store(path)?;
    let result = inspect(&store, path)?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        OutputFormat::Text => print_text_output(&result),
    }
    Ok(())
}

/// Collects statistics about an open store.
pub fn inspect(store: &DurableStore, path: &Path) -> CliResult<InspectResult> {
    let stats = store.stats()?;
    let manager = MigrationManager::builtin()?;

    let (device_id, pull_cursor) = if store.has_table(META) {
        let device_id = store
            .get(META, meta_keys::DEVICE_ID)?
            .map(|raw| decode_row::<String>(&raw))
            .transpose()?;
        let pull_cursor = store
            .get(META, meta_keys::PULL_CURSOR)?
            .map(|raw| decode_row::<u64>(&raw))
            .transpose()?;
        (device_id, pull_cursor)
    } else {
        (None, None)
    };

    Ok(InspectResult {
        path: path.display().to_string(),
        log_bytes: stats.log_bytes,
        records: stats.records,
        recovered_bytes: stats.recovered_bytes,
        schema_version: stats.schema_version,
        target_version: manager.target_version(),
        pending_migrations: manager.pending(store).len(),
        entities: stats.tables.get(ENTITIES).copied().unwrap_or(0),
        pending_mutations: stats.tables.get(MUTATIONS).copied().unwrap_or(0),
        tables: stats.tables,
        device_id,
        pull_cursor,
    })
}

fn print_text_output(result: &InspectResult) {
    println!("Replica: {}", result.path);
    println!();
    println!("Log:");
    println!("  Size:            {} bytes", result.log_bytes);
    println!("  Records:         {}", result.records);
    if result.recovered_bytes > 0 {
        println!("  Torn tail:       {} bytes dropped", result.recovered_bytes);
    }
    println!();
    println!("Schema:");
    println!(
        "  Version:         {} (expected {})",
        result.schema_version, result.target_version
    );
    if result.pending_migrations > 0 {
        println!("  Pending:         {} migration(s)", result.pending_migrations);
    }
    println!();
    println!("Contents:");
    println!("  Entities:        {}", result.entities);
    println!("  Pending:         {} mutation(s)", result.pending_mutations);
    if let Some(device_id) = &result.device_id {
        println!("  Device:          {device_id}");
    }
    if let Some(cursor) = result.pull_cursor {
        println!("  Pull cursor:     {cursor}");
    }
    println!();
    println!("Tables:");
    for (name, rows) in &result.tables {
        println!("  {name:<16} {rows} row(s)");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testing::sample_replica;
    use tempfile::tempdir;

    #[test]
    fn inspect_reports_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("calsync.log");
        sample_replica(&path);

        let store = open_store(&path).unwrap();
        let result = inspect(&store, &path).unwrap();
        assert_eq!(result.schema_version, result.target_version);
        assert_eq!(result.pending_migrations, 0);
        assert_eq!(result.entities, 2);
        assert_eq!(result.pending_mutations, 2);
        assert_eq!(result.device_id.as_deref().map(str::len), Some(36));
        assert_eq!(result.pull_cursor, None);
        assert!(result.log_bytes > 0);
    }

    #[test]
    fn missing_file_is_reported() {
        let dir = tempdir().unwrap();
        let err = open_store(&dir.path().join("nope.log")).unwrap_err();
        assert!(err.to_string().contains("no replica found"));
    }
}
