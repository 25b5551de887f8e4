//! Durable sync-progress storage.
//!
//! Checkpoints live in their own SQLite file, never the source database, so
//! they survive source deletions and restores. Every call opens a short-lived
//! connection, executes one transaction, and closes; concurrent callers are
//! serialized by SQLite itself.

pub mod error;
pub mod store;
pub mod time;

pub use error::CheckpointError;
pub use store::{CheckpointStore, SyncErrorRecord, TableOpStats};
