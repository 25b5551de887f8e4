pub mod classifier;
pub mod connection;
pub mod error;
pub mod schema;

pub use connection::CaptureConnection;
pub use error::CaptureError;

/// Positional SQL parameter accepted by the capture connection.
pub use rusqlite::types::Value as SqlParam;
