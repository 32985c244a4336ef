use std::sync::Arc;

use chunkflow_db::JobStore;
use chunkflow_events::Notifier;
use chunkflow_pipeline::JobCoordinator;

use crate::config::ServerConfig;

/// Shared application state available to all handlers via axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    /// Durable job and chunk store.
    pub store: Arc<dyn JobStore>,
    /// Job state machine: submit, status, cancel.
    pub coordinator: Arc<JobCoordinator>,
    /// Per-job event subscriptions for the WebSocket stream.
    pub notifier: Notifier,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
}
