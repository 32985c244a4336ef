//! Handlers for the `/jobs` resource.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chunkflow_core::settings::ExecutionSettings;
use chunkflow_core::types::DbId;
use chunkflow_db::models::chunk::ChunkView;
use chunkflow_db::models::job::{JobListQuery, JobStatusView};
use chunkflow_pipeline::JobRequest;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::AppResult;
use crate::response::DataResponse;
use crate::state::AppState;

/// Request body for `POST /api/v1/jobs`.
#[derive(Debug, Deserialize, Validate)]
pub struct CreateJob {
    #[validate(length(min = 1, max = 255))]
    pub owner_ref: String,
    #[validate(length(min = 1))]
    pub input: String,
    /// Falls back to the server's default processor timeout when omitted.
    pub settings: Option<ExecutionSettings>,
}

/// Status view plus the reassembled result once the job has completed.
#[derive(Debug, Serialize)]
pub struct JobDetail {
    #[serde(flatten)]
    pub status: JobStatusView,
    pub result: Option<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Submit
// ---------------------------------------------------------------------------

/// POST /api/v1/jobs
///
/// Split the input into chunks and queue them. Returns 201 with the job's
/// status view; processing continues in the worker pool.
pub async fn submit_job(
    State(state): State<AppState>,
    Json(input): Json<CreateJob>,
) -> AppResult<impl IntoResponse> {
    input.validate()?;

    let settings = input
        .settings
        .unwrap_or_else(|| ExecutionSettings::with_timeout(state.config.engine.processor_timeout));

    let job = state
        .coordinator
        .submit(JobRequest {
            owner_ref: input.owner_ref,
            input: input.input,
            settings,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(DataResponse { data: job.status_view() })))
}

// ---------------------------------------------------------------------------
// Read
// ---------------------------------------------------------------------------

/// GET /api/v1/jobs
///
/// Filter by `owner_ref` and `status`, paginate with `limit` and `offset`.
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(params): Query<JobListQuery>,
) -> AppResult<impl IntoResponse> {
    let jobs = state.coordinator.list(&params).await?;
    let views: Vec<JobStatusView> = jobs.iter().map(|job| job.status_view()).collect();
    Ok(Json(DataResponse { data: views }))
}

/// GET /api/v1/jobs/{id}
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<DbId>,
) -> AppResult<impl IntoResponse> {
    let job = state.coordinator.status(job_id).await?;
    Ok(Json(DataResponse {
        data: JobDetail {
            status: job.status_view(),
            result: job.result,
        },
    }))
}

/// GET /api/v1/jobs/{id}/chunks
///
/// Chunk states in sequence order, without payloads or results.
pub async fn list_chunks(
    State(state): State<AppState>,
    Path(job_id): Path<DbId>,
) -> AppResult<impl IntoResponse> {
    let chunks = state.coordinator.chunks(job_id).await?;
    let views: Vec<ChunkView> = chunks.iter().map(|chunk| chunk.view()).collect();
    Ok(Json(DataResponse { data: views }))
}

// ---------------------------------------------------------------------------
// Cancel
// ---------------------------------------------------------------------------

/// POST /api/v1/jobs/{id}/cancel
///
/// Idempotent. Returns 202: waiting chunks are cancelled at once, running
/// chunks finish their attempt before the job settles.
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<DbId>,
) -> AppResult<impl IntoResponse> {
    let job = state.coordinator.cancel(job_id).await?;

    tracing::info!(job_id, status = ?job.status, "Job cancel requested");

    Ok((StatusCode::ACCEPTED, Json(DataResponse { data: job.status_view() })))
}
