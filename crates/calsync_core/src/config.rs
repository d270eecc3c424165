//! Replica configuration.

/// Configuration for opening a replica's durable store.
#[derive(Debug, Clone)]
pub struct Config {
    /// Whether to `fsync` the log after every committed batch (safer but slower).
    ///
    /// When disabled, commits are only flushed to the OS and a power loss may
    /// drop the most recent batches (never a partial one).
    pub sync_on_commit: bool,

    /// Upper bound on a single log record's payload.
    ///
    /// A header announcing a larger payload is treated as damage rather than
    /// an allocation request.
    pub max_record_size: u32,

    /// Whether opening a store runs pending schema migrations.
    ///
    /// When disabled, opening a store that is not at the current schema
    /// version fails with `MigrationFailed`.
    pub migrate_on_open: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sync_on_commit: true,
            max_record_size: 64 * 1024 * 1024, // 64 MB
            migrate_on_open: true,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to sync the log on every commit.
    #[must_use]
    pub const fn sync_on_commit(mut self, value: bool) -> Self {
        self.sync_on_commit = value;
        self
    }

    /// Sets the maximum record payload size.
    #[must_use]
    pub const fn max_record_size(mut self, size: u32) -> Self {
        self.max_record_size = size;
        self
    }

    /// Sets whether opening runs pending migrations.
    #[must_use]
    pub const fn migrate_on_open(mut self, value: bool) -> Self {
        self.migrate_on_open = value;
        self
    }
}
