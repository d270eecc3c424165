//! calsync CLI
//!
//! Maintenance tools for a calsync replica file.
//!
//! # Commands
//!
//! - `inspect` - Display store statistics and metadata
//! - `migrate` - Bring the schema up to date
//! - `dump-queue` - List pending mutations
//! - `verify` - Verify log integrity and cache consistency
//! - `compact` - Rewrite the log without superseded records

mod commands;

use clap::{Parser, Subcommand};
use commands::OutputFormat;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// calsync replica maintenance tools.
#[derive(Parser)]
#[command(name = "calsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the replica log file
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display store statistics and metadata
    Inspect {
        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Run pending schema migrations
    Migrate {
        /// Only show which migrations are applied or pending
        #[arg(short, long)]
        status: bool,
    },

    /// List pending mutations in sequence order
    DumpQueue {
        /// Maximum number of mutations to show
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Verify log checksums and cache consistency
    Verify,

    /// Rewrite the log as a minimal snapshot
    Compact {
        /// Dry run - show what would be done
        #[arg(short, long)]
        dry_run: bool,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Inspect { format } => {
            let path = cli.path.ok_or("Replica path required for inspect")?;
            commands::inspect::run(&path, format)?;
        }
        Commands::Migrate { status } => {
            let path = cli.path.ok_or("Replica path required for migrate")?;
            if status {
                commands::migrate::status(&path)?;
            } else {
                commands::migrate::run(&path)?;
            }
        }
        Commands::DumpQueue { limit, format } => {
            let path = cli.path.ok_or("Replica path required for dump-queue")?;
            commands::dump_queue::run(&path, limit, format)?;
        }
        Commands::Verify => {
            let path = cli.path.ok_or("Replica path required for verify")?;
            commands::verify::run(&path)?;
        }
        Commands::Compact { dry_run } => {
            let path = cli.path.ok_or("Replica path required for compact")?;
            commands::compact::run(&path, dry_run)?;
        }
        Commands::Version => {
            println!("calsync CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
