//! Compact command implementation.

use super::{open_store, CliResult};
use calsync_storage::{FileBackend, InMemoryBackend, StorageBackend};
use std::path::Path;

/// Compaction statistics.
#[derive(Debug)]
pub struct CompactStats {
    /// Records in the log before compaction.
    pub records_before: u64,
    /// Live rows written to the snapshot.
    pub rows: usize,
    /// Bytes before compaction.
    pub bytes_before: u64,
    /// Bytes after compaction.
    pub bytes_after: u64,
}

/// Runs the compact command.
///
/// The snapshot is written next to the log and renamed over it once
/// complete, so an interrupted compaction leaves the original untouched.
pub fn run(path: &Path, dry_run: bool) -> CliResult<CompactStats> {
    let store = open_store(path)?;
    let before = store.stats()?;

    println!("Compacting replica at {:?}", path);
    if dry_run {
        println!("(dry run - no changes will be made)");
    }
    println!();

    let mut preview = InMemoryBackend::new();
    store.compact_into(&mut preview)?;
    let stats = CompactStats {
        records_before: before.records,
        rows: before.total_rows(),
        bytes_before: before.log_bytes,
        bytes_after: preview.size()?,
    };

    println!("Compaction Analysis:");
    println!("  Records:     {}", stats.records_before);
    println!("  Live rows:   {}", stats.rows);
    println!("  Size before: {} bytes", stats.bytes_before);
    println!("  Size after:  {} bytes", stats.bytes_after);
    println!(
        "  Space saved: {} bytes ({:.1}%)",
        stats.bytes_before.saturating_sub(stats.bytes_after),
        if stats.bytes_before > 0 {
            (stats.bytes_before.saturating_sub(stats.bytes_after) as f64
                / stats.bytes_before as f64)
                * 100.0
        } else {
            0.0
        }
    );

    if dry_run {
        return Ok(stats);
    }
    if stats.bytes_after >= stats.bytes_before {
        println!();
        println!("No compaction needed - log is already minimal");
        return Ok(stats);
    }

    println!();
    println!("Performing compaction...");
    let staging = path.with_extension("compact");
    if staging.exists() {
        std::fs::remove_file(&staging)?;
    }
    {
        let mut target = FileBackend::open(&staging)?;
        store.compact_into(&mut target)?;
    }
    drop(store);
    std::fs::rename(&staging, path)?;
    tracing::info!(
        bytes_before = stats.bytes_before,
        bytes_after = stats.bytes_after,
        "replica compacted"
    );
    println!("✓ Compaction complete");
    Ok(stats)
}
