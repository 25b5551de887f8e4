pub mod audit;
pub mod event;
pub mod position;
pub mod status;

pub use audit::AuditRecord;
pub use event::{ChangeEvent, Operation, Row, RowKey};
pub use position::{InitialSyncCheckpoint, SyncPosition, SyncState};
pub use status::{SyncStatus, TableStats};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("INSERT event {0} is missing its after image")]
    InsertWithoutAfter(String),

    #[error("DELETE event {0} is missing its before image")]
    DeleteWithoutBefore(String),

    #[error("UPDATE event {0} is missing a before or after image")]
    UpdateWithoutImages(String),

    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    #[error("Unknown sync state: {0}")]
    UnknownState(String),
}
