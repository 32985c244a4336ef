use chunkflow_core::types::DbId;

/// Errors surfaced by [`JobStore`](crate::store::JobStore) implementations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A write could not be committed even after the retry budget was spent.
    /// State can no longer be trusted for the affected job.
    #[error("Durability error: {operation} failed after {attempts} attempts: {message}")]
    Durability {
        operation: &'static str,
        attempts: u32,
        message: String,
    },

    /// A non-transient database error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Job not found: {0}")]
    JobNotFound(DbId),

    /// A stored value could not be decoded or violates an invariant.
    #[error("Invalid stored state: {0}")]
    Invalid(String),
}

impl StoreError {
    pub fn is_durability(&self) -> bool {
        matches!(self, StoreError::Durability { .. })
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
