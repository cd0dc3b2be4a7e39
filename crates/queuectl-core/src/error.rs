use thiserror::Error;

/// Errors surfaced by the queue policy layer and its storage backend.
///
/// CLI commands convert these into exit code 1 with a human-readable
/// message; the Worker loop never lets [`QueueCtlError::Storage`] escape —
/// it logs and retries after `poll_interval` instead.
#[derive(Debug, Error)]
pub enum QueueCtlError {
    #[error("{0}")]
    InvalidArgument(String),

    #[error("job '{0}' already exists")]
    AlreadyExists(String),

    #[error("job '{0}' not found")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, QueueCtlError>;
