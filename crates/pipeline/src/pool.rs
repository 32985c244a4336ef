//! Worker pool: N claim loops plus one maintenance loop.
//!
//! Each worker loop claims a chunk with `FOR UPDATE SKIP LOCKED` semantics,
//! executes it, and immediately tries the next one; it only sleeps for
//! `poll_interval` when the queue is empty. The maintenance loop re-queues
//! chunks whose retry delay has passed and recovers chunks whose lease
//! expired because their worker vanished.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use chunkflow_core::job_events::{EVENT_CHUNK_CANCELLED, EVENT_CHUNK_FAILED, EVENT_CHUNK_REQUEUED};
use chunkflow_core::status::ChunkStatus;
use chunkflow_core::types::{DbId, Timestamp};
use chunkflow_db::{ChunkChange, JobStore};
use chunkflow_events::Notifier;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::coordinator::JobCoordinator;
use crate::error::EngineError;
use crate::executor::ChunkExecutor;

/// Pool tunables, usually derived from [`EngineConfig`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub worker_count: usize,
    pub poll_interval: Duration,
    pub lease: Duration,
    pub maintenance_interval: Duration,
    /// Attempt budget applied when recovering expired leases.
    pub max_attempts: i32,
}

impl From<&EngineConfig> for PoolConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            worker_count: config.worker_count,
            poll_interval: config.poll_interval,
            lease: config.lease,
            maintenance_interval: config.maintenance_interval,
            max_attempts: config.retry.max_attempts,
        }
    }
}

pub struct WorkerPool {
    store: Arc<dyn JobStore>,
    executor: Arc<ChunkExecutor>,
    coordinator: Arc<JobCoordinator>,
    notifier: Notifier,
    config: PoolConfig,
}

impl WorkerPool {
    pub fn new(
        store: Arc<dyn JobStore>,
        executor: Arc<ChunkExecutor>,
        coordinator: Arc<JobCoordinator>,
        notifier: Notifier,
        config: PoolConfig,
    ) -> Self {
        Self {
            store,
            executor,
            coordinator,
            notifier,
            config,
        }
    }

    /// Run every loop until `cancel` fires, then wait for in-flight chunks
    /// to finish their current attempt.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        tracing::info!(
            worker_count = self.config.worker_count,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            lease_secs = self.config.lease.as_secs(),
            "Worker pool started",
        );

        let mut tasks = JoinSet::new();
        for _ in 0..self.config.worker_count {
            let pool = Arc::clone(&self);
            let cancel = cancel.clone();
            let worker_id = format!("worker-{}", uuid::Uuid::new_v4());
            tasks.spawn(async move { pool.worker_loop(worker_id, cancel).await });
        }
        {
            let pool = Arc::clone(&self);
            let cancel = cancel.clone();
            tasks.spawn(async move { pool.maintenance_loop(cancel).await });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Worker pool task panicked");
            }
        }
        tracing::info!("Worker pool stopped");
    }

    async fn worker_loop(&self, worker_id: String, cancel: CancellationToken) {
        tracing::debug!(worker_id = %worker_id, "Worker started");
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let worked = match self.run_once(&worker_id).await {
                Ok(worked) => worked,
                Err(e) => {
                    tracing::error!(worker_id = %worker_id, error = %e, "Worker cycle failed");
                    false
                }
            };
            if worked {
                continue;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
        tracing::debug!(worker_id = %worker_id, "Worker stopped");
    }

    /// Claim and execute at most one chunk. Returns whether one was claimed.
    pub async fn run_once(&self, worker_id: &str) -> Result<bool, EngineError> {
        let Some(claim) = self
            .store
            .claim_next_chunk(worker_id, self.config.lease)
            .await?
        else {
            return Ok(false);
        };
        tracing::debug!(
            worker_id,
            job_id = claim.chunk.job_id,
            chunk_id = claim.chunk.id,
            attempt = claim.chunk.attempt_count,
            "Chunk claimed",
        );
        self.executor.execute(claim).await?;
        Ok(true)
    }

    async fn maintenance_loop(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.maintenance_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.maintain(Utc::now()).await {
                        tracing::error!(error = %e, "Maintenance sweep failed");
                    }
                }
            }
        }
    }

    /// One maintenance sweep: re-queue due retries and recover expired
    /// leases, then re-aggregate every job that had a chunk reach a
    /// terminal state.
    ///
    /// Returns the number of chunks touched.
    pub async fn maintain(&self, now: Timestamp) -> Result<usize, EngineError> {
        let requeued = self.store.requeue_due_retries(now).await?;
        let reclaimed = self
            .store
            .reclaim_expired_leases(now, self.config.max_attempts)
            .await?;

        let mut finished_jobs = BTreeSet::new();
        for change in requeued.iter().chain(reclaimed.iter()) {
            if let Some(job_id) = self.announce(change).await {
                finished_jobs.insert(job_id);
            }
        }

        for job_id in finished_jobs {
            if let Err(e) = self.coordinator.on_chunk_terminal(job_id).await {
                tracing::error!(job_id, error = %e, "Re-aggregation after maintenance failed");
            }
        }

        let touched = requeued.len() + reclaimed.len();
        if touched > 0 {
            tracing::info!(
                requeued = requeued.len(),
                reclaimed = reclaimed.len(),
                "Maintenance sweep recovered chunks",
            );
        }
        Ok(touched)
    }

    /// Publish the event for a recovered chunk. Returns the job id when the
    /// chunk became terminal.
    async fn announce(&self, change: &ChunkChange) -> Option<DbId> {
        let event_type = match change.chunk.status {
            ChunkStatus::Queued => EVENT_CHUNK_REQUEUED,
            ChunkStatus::Failed => EVENT_CHUNK_FAILED,
            ChunkStatus::Cancelled => EVENT_CHUNK_CANCELLED,
            other => {
                tracing::warn!(
                    chunk_id = change.chunk.id,
                    status = other.as_str(),
                    "Unexpected chunk status after maintenance",
                );
                return None;
            }
        };
        self.notifier.chunk_changed(event_type, change).await;
        change.chunk.is_terminal().then_some(change.chunk.job_id)
    }
}
