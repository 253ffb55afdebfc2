use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "walsync")]
#[command(about = "Stream PostgreSQL changes from a wal2json replication slot")]
#[command(version)]
pub struct Cli {
    /// Path to walsync.toml config file
    #[arg(short, long, global = true, default_value = "walsync.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Snapshot pending tables, then stream changes as JSON lines to stdout
    Run {
        /// Stop cleanly after this many changes
        #[arg(long)]
        max_changes: Option<u64>,
    },

    /// Verify the connection, the replication slot and the saved state
    Check,

    /// Read one table without replication and print its rows
    Read {
        /// Table to read, as schema.table
        table: String,

        /// Cursor column for an incremental read (full refresh when omitted)
        #[arg(long)]
        cursor: Option<String>,

        /// Last saved cursor value, as JSON (e.g. 42 or "2024-01-01")
        #[arg(long, requires = "cursor")]
        from: Option<String>,

        /// Rows per page
        #[arg(long, default_value = "10000")]
        batch_size: u32,
    },

    /// Inspect or reset the saved replication state
    State {
        #[command(subcommand)]
        command: StateCommands,
    },
}

#[derive(Subcommand)]
pub enum StateCommands {
    /// Print the saved state
    Show,

    /// Delete the saved state so the next run snapshots again
    Clear {
        /// Required to actually delete
        #[arg(long)]
        yes: bool,
    },
}
