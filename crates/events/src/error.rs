use chunkflow_core::types::DbId;
use chunkflow_db::StoreError;

/// Errors raised while emitting or subscribing to job events.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("Job not found: {0}")]
    JobNotFound(DbId),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Event serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Notification channel error: {0}")]
    Channel(#[from] sqlx::Error),
}
