use std::sync::Arc;

use anyhow::Context;
use chunkflow_db::{JobStore, PgJobStore};
use chunkflow_events::{EventBus, EventSink, Notifier, PgNotifySink};
use chunkflow_worker::telemetry::{init_tracing, shutdown_signal};
use chunkflow_worker::{runtime, HttpChunkProcessor, WorkerConfig};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing("chunkflow_worker=debug");

    // --- Configuration ---
    let config = WorkerConfig::from_env().context("Invalid worker configuration")?;
    tracing::info!(
        worker_count = config.engine.worker_count,
        processor_url = %config.processor.url,
        "Loaded worker configuration",
    );

    // --- Database ---
    let pool = chunkflow_db::create_pool(&config.database_url, config.max_connections)
        .await
        .context("Failed to connect to database")?;
    chunkflow_db::health_check(&pool)
        .await
        .context("Database health check failed")?;
    tracing::info!("Database connection pool created");

    // --- Engine ---
    let store: Arc<dyn JobStore> = Arc::new(PgJobStore::new(pool.clone(), config.engine.commit.clone()));
    // Events reach API subscribers through Postgres NOTIFY.
    let sink: Arc<dyn EventSink> = Arc::new(PgNotifySink::new(pool.clone()));
    let notifier = Notifier::new(Arc::new(EventBus::default()), sink, Arc::clone(&store));
    let processor = Arc::new(HttpChunkProcessor::new(config.processor.clone()));

    let coordinator = runtime::build_coordinator(Arc::clone(&store), notifier.clone(), &config.engine)?;
    let worker_pool = runtime::build_worker_pool(store, notifier, coordinator, processor, &config.engine);

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(worker_pool.run(cancel.clone()));

    shutdown_signal().await;
    cancel.cancel();
    handle.await.context("Worker pool task failed")?;

    tracing::info!("Graceful shutdown complete");
    Ok(())
}
