use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chunkflow_core::types::DbId;
use chunkflow_events::EventError;
use chunkflow_pipeline::EngineError;
use serde_json::json;

/// Application-level error type for HTTP handlers.
///
/// Implements [`IntoResponse`] to produce consistent `{ "error", "code" }`
/// JSON bodies.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Event(#[from] EventError),

    /// Request body failed field validation.
    #[error("Validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

/// Convenience type alias for handler return values.
pub type AppResult<T> = Result<T, AppError>;

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            // --- Engine errors ---
            AppError::Engine(engine) => match engine {
                EngineError::InvalidInput(msg) => {
                    (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone())
                }
                EngineError::JobNotFound(id) => job_not_found(*id),
                EngineError::Aborted { .. } => {
                    (StatusCode::CONFLICT, "JOB_ABORTED", engine.to_string())
                }
                // Reported apart from processing failures; the job itself is
                // already marked failed with cause `durability`.
                EngineError::Durability(msg) => {
                    tracing::error!(error = %msg, "Durability error");
                    (
                        StatusCode::SERVICE_UNAVAILABLE,
                        "DURABILITY_ERROR",
                        "Job state could not be persisted".to_string(),
                    )
                }
                EngineError::Store(err) => internal(&err.to_string()),
            },

            // --- Event errors ---
            AppError::Event(event) => match event {
                EventError::JobNotFound(id) => job_not_found(*id),
                other => internal(&other.to_string()),
            },

            // --- Request validation ---
            AppError::Validation(errors) => {
                (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", errors.to_string())
            }
        };

        let body = json!({
            "error": message,
            "code": code,
        });

        (status, axum::Json(body)).into_response()
    }
}

fn job_not_found(id: DbId) -> (StatusCode, &'static str, String) {
    (
        StatusCode::NOT_FOUND,
        "NOT_FOUND",
        format!("Job with id {id} not found"),
    )
}

fn internal(msg: &str) -> (StatusCode, &'static str, String) {
    tracing::error!(error = %msg, "Internal error");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "INTERNAL_ERROR",
        "An internal error occurred".to_string(),
    )
}
