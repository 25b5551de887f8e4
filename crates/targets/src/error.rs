use thiserror::Error;

/// Substrings that mark a driver error as transient. Anything else is fatal
/// and propagates without retry.
const RETRYABLE_MARKERS: [&str; 8] = [
    "connection",
    "timeout",
    "closed",
    "reset",
    "refused",
    "network",
    "temporary",
    "deadlock",
];

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("MySQL error: {0}")]
    MySql(#[from] mysql_async::Error),

    #[error("Oracle error: {0}")]
    Oracle(#[from] oracle::Error),

    #[error("Target {0} is not connected")]
    NotConnected(String),

    #[error("Invalid target configuration: {0}")]
    Configuration(String),

    #[error("Blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Retries exhausted after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<WriteError>,
    },
}

impl WriteError {
    /// Classify by message content, the taxonomy shared by both writers.
    pub fn is_retryable(&self) -> bool {
        match self {
            WriteError::RetriesExhausted { .. } => false,
            WriteError::Configuration(_) => false,
            other => {
                let message = other.to_string().to_ascii_lowercase();
                RETRYABLE_MARKERS.iter().any(|m| message.contains(m))
            }
        }
    }
}
