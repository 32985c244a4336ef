//! Route definitions for the `/jobs` resource.

use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;

use super::request_timeout;
use crate::handlers::jobs;
use crate::state::AppState;
use crate::ws;

/// Routes mounted at `/jobs`.
///
/// ```text
/// GET    /                -> list_jobs
/// POST   /                -> submit_job
/// GET    /{id}            -> get_job
/// GET    /{id}/chunks     -> list_chunks
/// POST   /{id}/cancel     -> cancel_job
/// GET    /{id}/events     -> job_events (WebSocket upgrade, no timeout)
/// ```
pub fn router(limit: Duration) -> Router<AppState> {
    Router::new()
        .route("/", get(jobs::list_jobs).post(jobs::submit_job))
        .route("/{id}", get(jobs::get_job))
        .route("/{id}/chunks", get(jobs::list_chunks))
        .route("/{id}/cancel", post(jobs::cancel_job))
        .layer(request_timeout(limit))
        // Added after the layer so it only wraps the routes above.
        .route("/{id}/events", get(ws::job_events))
}
