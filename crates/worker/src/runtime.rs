//! Engine assembly shared by the worker binary and the API's embedded
//! workers.

use std::sync::Arc;

use chunkflow_db::JobStore;
use chunkflow_events::Notifier;
use chunkflow_pipeline::{
    ChunkExecutor, ChunkProcessor, EngineConfig, EngineError, JobCoordinator, OverlapChunker,
    OverlapReassembler, PoolConfig, WorkerPool,
};

/// Coordinator using the overlapping text chunker and reassembler.
pub fn build_coordinator(
    store: Arc<dyn JobStore>,
    notifier: Notifier,
    config: &EngineConfig,
) -> Result<Arc<JobCoordinator>, EngineError> {
    let chunker = OverlapChunker::new(config.chunk_chars, config.chunk_overlap_chars);
    let coordinator = JobCoordinator::new(
        store,
        notifier,
        Arc::new(chunker),
        Arc::new(OverlapReassembler),
        config.discard_threshold,
        config.lease,
    )?;
    Ok(Arc::new(coordinator))
}

/// Worker pool executing chunks with `processor`.
pub fn build_worker_pool(
    store: Arc<dyn JobStore>,
    notifier: Notifier,
    coordinator: Arc<JobCoordinator>,
    processor: Arc<dyn ChunkProcessor>,
    config: &EngineConfig,
) -> Arc<WorkerPool> {
    let executor = Arc::new(ChunkExecutor::new(
        Arc::clone(&store),
        processor,
        notifier.clone(),
        Arc::clone(&coordinator),
        config.retry.clone(),
    ));
    Arc::new(WorkerPool::new(
        store,
        executor,
        coordinator,
        notifier,
        PoolConfig::from(config),
    ))
}
