use clap::{Subcommand, ValueEnum};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SyncMode {
    /// Initial bulk copy, then streaming.
    Full,
    /// Initial bulk copy only.
    Initial,
    /// Streaming only, from the saved cursors.
    Incremental,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a commented configuration template.
    Init {
        /// Output path for the template.
        #[arg(default_value = "sync.yaml")]
        path: String,

        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },

    /// Parse and validate a configuration file.
    Validate {
        /// Configuration file path.
        config: String,
    },

    /// Run data synchronization.
    Sync {
        /// Configuration file path.
        #[arg(short, long)]
        config: String,

        /// Sync mode.
        #[arg(short, long, value_enum, default_value_t = SyncMode::Full)]
        mode: SyncMode,

        /// Comma-separated subset of tables (default: all mapped tables).
        #[arg(short, long)]
        tables: Option<String>,

        /// Checkpoint database path.
        #[arg(long, default_value = checkpoint::CheckpointStore::DEFAULT_PATH)]
        checkpoints: String,
    },

    /// Show sync progress per table and target.
    Status {
        /// Configuration file path.
        #[arg(short, long)]
        config: String,

        /// Checkpoint database path.
        #[arg(long, default_value = checkpoint::CheckpointStore::DEFAULT_PATH)]
        checkpoints: String,
    },

    /// Reset initial-sync checkpoints so the next run re-copies.
    Reset {
        /// Configuration file path.
        #[arg(short, long)]
        config: String,

        /// Table to reset (default: every mapped table).
        #[arg(short, long)]
        table: Option<String>,

        /// Checkpoint database path.
        #[arg(long, default_value = checkpoint::CheckpointStore::DEFAULT_PATH)]
        checkpoints: String,
    },
}
