use thiserror::Error;

#[derive(Debug, Error)]
pub enum CaptureError {
    /// Any SQLite failure surfaced by the wrapped connection.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to create audit schema: {0}")]
    Schema(rusqlite::Error),

    /// The audit-row insert failed. This is fatal to the business write:
    /// letting it pass would silently break the capture guarantee.
    #[error("Failed to write audit row for {operation} on {table}: {source}")]
    AuditInsert {
        table: String,
        operation: String,
        source: rusqlite::Error,
    },

    #[error("Failed to close source connection: {0}")]
    Close(rusqlite::Error),
}
