pub mod error;
pub mod mysql;
pub mod oracle;
pub mod retry;
pub mod writer;

pub use error::WriteError;
pub use mysql::MySqlWriter;
pub use oracle::OracleWriter;
pub use retry::RetryRunner;
pub use writer::{create_writer, TargetWriter};
