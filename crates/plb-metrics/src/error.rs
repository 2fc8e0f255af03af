//! Error types for the statistics history store.

use thiserror::Error;

/// Result type alias for statistics store operations.
pub type StatsResult<T> = Result<T, StatsError>;

#[derive(Debug, Error)]
pub enum StatsError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),
}
