use checkpoint::CheckpointError;
use targets::WriteError;
use thiserror::Error;

/// Audit-log read side failures. The engine logs these and retries on the
/// next poll; they never terminate the run.
#[derive(Debug, Error)]
pub enum ReadError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to open source database {path}: {source}")]
    Open {
        path: String,
        source: rusqlite::Error,
    },
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Sync engine is already running")]
    AlreadyRunning,

    #[error("No table mapping configured for {0}")]
    MissingMapping(String),

    #[error("Source database error: {0}")]
    Source(#[from] rusqlite::Error),

    #[error("Audit read error: {0}")]
    Read(#[from] ReadError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Target write error: {0}")]
    Write(#[from] WriteError),

    #[error("Target {target} failed during initial sync of {table}: {source}")]
    InitialSyncTarget {
        target: String,
        table: String,
        #[source]
        source: WriteError,
    },
}
