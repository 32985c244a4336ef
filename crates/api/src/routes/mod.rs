pub mod health;
pub mod jobs;

use std::time::Duration;

use axum::http::StatusCode;
use axum::Router;
use tower_http::timeout::TimeoutLayer;

use crate::state::AppState;

/// Build the `/api/v1` route tree.
///
/// Route hierarchy:
///
/// ```text
/// /jobs                      list, submit
/// /jobs/{id}                 status + result
/// /jobs/{id}/chunks          per-chunk state
/// /jobs/{id}/cancel          request cancellation (POST)
/// /jobs/{id}/events          WebSocket event stream
/// ```
///
/// `limit` bounds every route except the event stream.
pub fn api_routes(limit: Duration) -> Router<AppState> {
    Router::new().nest("/jobs", jobs::router(limit))
}

/// Answer `408 Request Timeout` once a handler has run for `limit`.
pub fn request_timeout(limit: Duration) -> TimeoutLayer {
    TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, limit)
}
