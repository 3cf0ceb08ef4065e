use thiserror::Error as ThisError;

/// Errors surfaced by any [`crate::storage::Storage`] implementation.
#[derive(Debug, ThisError)]
pub enum StorageError {
    #[error("storage read failed: {0}")]
    Read(String),

    #[error("storage write failed: {0}")]
    Write(String),

    #[error("storage delete failed: {0}")]
    Delete(String),

    #[error("storage list failed: {0}")]
    List(String),

    #[error("operation '{0}' is not supported by this storage backend")]
    Unsupported(&'static str),

    #[error("config batch apply conflict: {0}")]
    BatchConflict(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
