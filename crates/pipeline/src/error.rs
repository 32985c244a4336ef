use chunkflow_core::error::CoreError;
use chunkflow_core::types::DbId;
use chunkflow_db::StoreError;

/// Errors surfaced by the coordinator, executor, and worker pool.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The submission cannot become a job (empty input, bad settings).
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Job not found: {0}")]
    JobNotFound(DbId),

    /// Too many chunks failed and the job was stopped early.
    #[error("Job {job_id} aborted: {reason}")]
    Aborted { job_id: DbId, reason: String },

    /// The store could not durably record a transition. Fatal to the job.
    #[error("{0}")]
    Durability(String),

    #[error("Store error: {0}")]
    Store(StoreError),
}

impl EngineError {
    pub fn is_durability(&self) -> bool {
        matches!(self, EngineError::Durability(_))
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Durability { .. } => EngineError::Durability(err.to_string()),
            StoreError::JobNotFound(id) => EngineError::JobNotFound(id),
            other => EngineError::Store(other),
        }
    }
}

impl From<CoreError> for EngineError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Validation(msg) => EngineError::InvalidInput(msg),
            unreadable @ CoreError::UnreadableStored { .. } => {
                EngineError::Store(StoreError::Invalid(unreadable.to_string()))
            }
        }
    }
}
