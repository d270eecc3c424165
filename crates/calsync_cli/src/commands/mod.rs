//! CLI command implementations.

pub mod compact;
pub mod dump_queue;
pub mod inspect;
pub mod migrate;
pub mod verify;

use calsync_core::{Config, DurableStore};
use calsync_storage::FileBackend;
use clap::ValueEnum;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Result type for commands.
pub type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Output format for commands that print data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text.
    Text,
    /// Pretty-printed JSON.
    Json,
}

/// Errors raised by the commands themselves.
#[derive(Debug, Error)]
pub enum CliError {
    /// The replica file does not exist.
    #[error("no replica found at {}", .0.display())]
    NotFound(PathBuf),

    /// Verification found problems.
    #[error("verification failed with {0} problem(s)")]
    VerifyFailed(usize),
}

/// Opens an existing replica log without migrating it.
///
/// Replaying the log checks every record checksum; a torn tail left by a
/// crash is dropped the same way the application would drop it.
pub fn open_store(path: &Path) -> CliResult<DurableStore> {
    if !path.exists() {
        return Err(CliError::NotFound(path.to_path_buf()).into());
    }
    let backend = FileBackend::open(path)?;
    Ok(DurableStore::open(Box::new(backend), Config::default())?)
}

#[cfg(test)]
pub(crate) mod testing {
    use calsync_core::{Config, EntityKind, Fields, Replica};
    use serde_json::json;
    use std::path::Path;

    /// Writes a replica with two pending mutations and one synced calendar.
    pub fn sample_replica(path: &Path) {
        let replica = Replica::open_path(path, Config::default()).unwrap();
        let name = |v: &str| -> Fields { [("name".to_string(), json!(v))].into_iter().collect() };
        let (calendar, seq) = replica.create(EntityKind::Calendar, name("Work")).unwrap();
        replica.queue().ack(seq).unwrap();
        replica.update(calendar, name("Office")).unwrap();
        replica.create(EntityKind::Event, name("Standup")).unwrap();
    }
}
