use thiserror::Error;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to create checkpoint schema: {0}")]
    Schema(rusqlite::Error),

    #[error("Invalid stored state '{state}' for {table}")]
    InvalidState { table: String, state: String },
}
