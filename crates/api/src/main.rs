use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chunkflow_api::config::ServerConfig;
use chunkflow_api::router::build_app_router;
use chunkflow_api::state::AppState;
use chunkflow_db::{JobStore, PgJobStore};
use chunkflow_events::{EventBus, EventSink, Notifier, PgEventRelay, PgNotifySink, ReconnectConfig};
use chunkflow_worker::telemetry::{init_tracing, shutdown_signal};
use chunkflow_worker::{runtime, HttpChunkProcessor};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing("chunkflow_api=debug,tower_http=debug");

    // --- Configuration ---
    let config = ServerConfig::from_env().context("Invalid server configuration")?;
    tracing::info!(host = %config.host, port = %config.port, "Loaded server configuration");

    // --- Database ---
    let pool = chunkflow_db::create_pool(&config.database_url, config.max_connections)
        .await
        .context("Failed to connect to database")?;
    chunkflow_db::health_check(&pool)
        .await
        .context("Database health check failed")?;
    tracing::info!("Database connection pool created");

    chunkflow_db::run_migrations(&pool)
        .await
        .context("Failed to run database migrations")?;
    tracing::info!("Database migrations applied");

    // --- Events ---
    let cancel = CancellationToken::new();
    let bus = Arc::new(EventBus::default());
    let relay_handle = tokio::spawn(PgEventRelay::run(
        pool.clone(),
        Arc::clone(&bus),
        ReconnectConfig::default(),
        cancel.clone(),
    ));

    // --- Engine ---
    let store: Arc<dyn JobStore> = Arc::new(PgJobStore::new(pool.clone(), config.engine.commit.clone()));
    // Every process publishes through NOTIFY; the relay feeds the local bus.
    let sink: Arc<dyn EventSink> = Arc::new(PgNotifySink::new(pool.clone()));
    let notifier = Notifier::new(bus, sink, Arc::clone(&store));
    let coordinator = runtime::build_coordinator(Arc::clone(&store), notifier.clone(), &config.engine)?;

    let workers_handle = match (&config.processor, config.embedded_workers) {
        (Some(processor), true) => {
            let processor = Arc::new(HttpChunkProcessor::new(processor.clone()));
            let worker_pool = runtime::build_worker_pool(
                Arc::clone(&store),
                notifier.clone(),
                Arc::clone(&coordinator),
                processor,
                &config.engine,
            );
            tracing::info!(worker_count = config.engine.worker_count, "Starting embedded workers");
            Some(tokio::spawn(worker_pool.run(cancel.clone())))
        }
        _ => None,
    };

    // --- App state ---
    let state = AppState {
        store,
        coordinator,
        notifier,
        config: Arc::new(config.clone()),
    };
    let app = build_app_router(state, &config);

    // --- Start server ---
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("Invalid HOST/PORT combination")?;
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped, shutting down background tasks");
    cancel.cancel();
    let grace = Duration::from_secs(config.shutdown_timeout_secs);
    if let Some(handle) = workers_handle {
        if tokio::time::timeout(grace, handle).await.is_err() {
            tracing::warn!("Embedded workers did not stop in time");
        }
    }
    let _ = tokio::time::timeout(Duration::from_secs(5), relay_handle).await;

    tracing::info!("Graceful shutdown complete");
    Ok(())
}
