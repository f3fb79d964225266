use thiserror::Error;

/// Errors surfaced by the database adapter. Backend-neutral so the engine can
/// run against any column-store client.
#[derive(Debug, Clone, Error)]
pub enum DbError {
    #[error("database unavailable: {0}")]
    Unavailable(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("database task failed: {0}")]
    Internal(String),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Database(#[from] DbError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("storage is closed")]
    Closed,

    /// The batch holding this write was dropped after exhausting its retries.
    #[error("write dropped after exhausting batch retries")]
    WriteDropped,
}
