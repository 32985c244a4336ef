//! HTTP surface of the job service.
//!
//! `main.rs` and the integration tests both go through [`build_app_router`],
//! so the layers exercised in tests are the ones that serve traffic.

use std::time::Duration;

use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderName, HeaderValue, Method};
use axum::Router;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::classify::{ServerErrorsAsFailures, SharedClassifier};
use tower_http::cors::CorsLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::config::ServerConfig;
use crate::routes;
use crate::state::AppState;

/// Correlates a request with the job log lines it produces.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Browsers may cache a preflight answer this long.
const PREFLIGHT_MAX_AGE: Duration = Duration::from_secs(600);

/// Assemble `/health` and `/api/v1` behind the shared layers.
///
/// Outermost first: CORS, request id assignment, tracing, request id echo,
/// panic recovery. The request timeout wraps each route group separately
/// so that `/jobs/{id}/events` sockets stay open.
pub fn build_app_router(state: AppState, config: &ServerConfig) -> Router {
    let request_timeout = Duration::from_secs(config.request_timeout_secs);

    Router::new()
        .merge(routes::health::router().layer(routes::request_timeout(request_timeout)))
        .nest("/api/v1", routes::api_routes(request_timeout))
        .layer(CatchPanicLayer::new())
        .layer(PropagateRequestIdLayer::new(request_id_header()))
        .layer(trace_layer())
        .layer(SetRequestIdLayer::new(request_id_header(), MakeRequestUuid))
        .layer(cors_layer(config))
        .with_state(state)
}

fn request_id_header() -> HeaderName {
    HeaderName::from_static(REQUEST_ID_HEADER)
}

fn trace_layer() -> TraceLayer<SharedClassifier<ServerErrorsAsFailures>> {
    TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO))
}

/// CORS for the job API: reads, submissions, cancellations and preflights.
///
/// Configured origins that are not valid header values are dropped with a
/// warning rather than failing startup.
pub fn cors_layer(config: &ServerConfig) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .cors_origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(origin = %origin, error = %e, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE, AUTHORIZATION, request_id_header()])
        .expose_headers([request_id_header()])
        .max_age(PREFLIGHT_MAX_AGE)
}
