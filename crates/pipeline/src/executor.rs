//! Chunk executor: runs one claimed chunk to its next state.
//!
//! `queued -> running -> {succeeded | retry_wait | failed | cancelled}`
//!
//! The executor never sleeps through a retry delay. A retryable failure is
//! parked in `retry_wait` with `next_retry_at` set, and the pool's
//! maintenance sweep puts it back on the queue once the delay has passed.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use chunkflow_core::chunk_error::{ChunkError, ErrorKind};
use chunkflow_core::job_events::{
    EVENT_CHUNK_CANCELLED, EVENT_CHUNK_FAILED, EVENT_CHUNK_RETRY_SCHEDULED, EVENT_CHUNK_STARTED,
    EVENT_CHUNK_SUCCEEDED,
};
use chunkflow_core::retry::{RetryDecision, RetryPolicy};
use chunkflow_core::settings::ExecutionSettings;
use chunkflow_core::types::{DbId, Timestamp};
use chunkflow_db::models::chunk::Chunk;
use chunkflow_db::{ChunkChange, JobStore};
use chunkflow_events::Notifier;

use crate::coordinator::JobCoordinator;
use crate::error::EngineError;
use crate::processor::ChunkProcessor;

/// Where a claimed chunk ended up after one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    Succeeded,
    RetryScheduled(Duration),
    Failed(ErrorKind),
    Cancelled,
    /// The claim was superseded (lease reclaimed); nothing was written.
    Stale,
}

pub struct ChunkExecutor {
    store: Arc<dyn JobStore>,
    processor: Arc<dyn ChunkProcessor>,
    notifier: Notifier,
    coordinator: Arc<JobCoordinator>,
    retry: RetryPolicy,
}

impl ChunkExecutor {
    pub fn new(
        store: Arc<dyn JobStore>,
        processor: Arc<dyn ChunkProcessor>,
        notifier: Notifier,
        coordinator: Arc<JobCoordinator>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            processor,
            notifier,
            coordinator,
            retry,
        }
    }

    /// Execute a chunk claimed with [`JobStore::claim_next_chunk`].
    ///
    /// A durability error while recording the outcome fails the owning job.
    pub async fn execute(&self, claim: ChunkChange) -> Result<ChunkOutcome, EngineError> {
        let job_id = claim.chunk.job_id;
        let result = self.run(claim).await;
        self.coordinator.guard_durability(job_id, result).await
    }

    async fn run(&self, claim: ChunkChange) -> Result<ChunkOutcome, EngineError> {
        self.notifier.chunk_changed(EVENT_CHUNK_STARTED, &claim).await;
        let chunk = claim.chunk;

        let job = self
            .store
            .find_job(chunk.job_id)
            .await?
            .ok_or(EngineError::JobNotFound(chunk.job_id))?;
        if job.is_terminal() || job.cancel_requested {
            return self.cancel(&chunk).await;
        }

        let settings = match job.execution_settings() {
            Ok(settings) => settings,
            Err(e) => {
                let error = ChunkError::invalid_payload(format!("unreadable job settings: {e}"));
                return self.give_up(&chunk, &error).await;
            }
        };

        tracing::debug!(
            job_id = chunk.job_id,
            chunk_id = chunk.id,
            sequence_index = chunk.sequence_index,
            attempt = chunk.attempt_count,
            "Processing chunk",
        );

        let timeout = call_timeout(&settings, chunk.lease_expires_at, Utc::now());
        let outcome = self.invoke(&chunk.payload, &settings, timeout).await;

        // Cancellation wins over whatever the processor returned.
        if self.cancel_requested(chunk.job_id).await? {
            return self.cancel(&chunk).await;
        }

        match outcome {
            Ok(result) => self.succeed(&chunk, &result).await,
            Err(error) => self.handle_error(&chunk, &error).await,
        }
    }

    /// Call the processor under the job's timeout.
    async fn invoke(
        &self,
        payload: &serde_json::Value,
        settings: &ExecutionSettings,
        timeout: Duration,
    ) -> Result<serde_json::Value, ChunkError> {
        match tokio::time::timeout(timeout, self.processor.process(payload, settings)).await {
            Ok(result) => result,
            Err(_) => Err(ChunkError::timeout(format!(
                "processor did not respond within {}ms",
                timeout.as_millis()
            ))),
        }
    }

    async fn cancel_requested(&self, job_id: DbId) -> Result<bool, EngineError> {
        let job = self
            .store
            .find_job(job_id)
            .await?
            .ok_or(EngineError::JobNotFound(job_id))?;
        Ok(job.is_terminal() || job.cancel_requested)
    }

    async fn succeed(&self, chunk: &Chunk, result: &serde_json::Value) -> Result<ChunkOutcome, EngineError> {
        let Some(change) = self
            .store
            .complete_chunk(chunk.id, chunk.attempt_count, result)
            .await?
        else {
            return Ok(stale(chunk));
        };
        tracing::debug!(job_id = chunk.job_id, chunk_id = chunk.id, "Chunk succeeded");
        self.notifier.chunk_changed(EVENT_CHUNK_SUCCEEDED, &change).await;
        self.coordinator.on_chunk_terminal(chunk.job_id).await?;
        Ok(ChunkOutcome::Succeeded)
    }

    async fn handle_error(&self, chunk: &Chunk, error: &ChunkError) -> Result<ChunkOutcome, EngineError> {
        match self.retry.decide(chunk.attempt_count, error.kind) {
            RetryDecision::Retry(delay) => {
                let next_retry_at =
                    Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64);
                let Some(change) = self
                    .store
                    .schedule_chunk_retry(chunk.id, chunk.attempt_count, error, next_retry_at)
                    .await?
                else {
                    return Ok(stale(chunk));
                };
                tracing::info!(
                    job_id = chunk.job_id,
                    chunk_id = chunk.id,
                    attempt = chunk.attempt_count,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Chunk retry scheduled",
                );
                self.notifier
                    .chunk_changed(EVENT_CHUNK_RETRY_SCHEDULED, &change)
                    .await;
                Ok(ChunkOutcome::RetryScheduled(delay))
            }
            RetryDecision::GiveUp => self.give_up(chunk, error).await,
        }
    }

    async fn give_up(&self, chunk: &Chunk, error: &ChunkError) -> Result<ChunkOutcome, EngineError> {
        let Some(change) = self
            .store
            .fail_chunk(chunk.id, chunk.attempt_count, error)
            .await?
        else {
            return Ok(stale(chunk));
        };
        tracing::warn!(
            job_id = chunk.job_id,
            chunk_id = chunk.id,
            attempt = chunk.attempt_count,
            error = %error,
            "Chunk failed",
        );
        self.notifier.chunk_changed(EVENT_CHUNK_FAILED, &change).await;
        self.coordinator.on_chunk_terminal(chunk.job_id).await?;
        Ok(ChunkOutcome::Failed(error.kind))
    }

    async fn cancel(&self, chunk: &Chunk) -> Result<ChunkOutcome, EngineError> {
        let Some(change) = self
            .store
            .cancel_running_chunk(chunk.id, chunk.attempt_count)
            .await?
        else {
            return Ok(stale(chunk));
        };
        tracing::debug!(job_id = chunk.job_id, chunk_id = chunk.id, "Chunk cancelled");
        self.notifier.chunk_changed(EVENT_CHUNK_CANCELLED, &change).await;
        self.coordinator.on_chunk_terminal(chunk.job_id).await?;
        Ok(ChunkOutcome::Cancelled)
    }
}

fn stale(chunk: &Chunk) -> ChunkOutcome {
    tracing::warn!(
        job_id = chunk.job_id,
        chunk_id = chunk.id,
        attempt = chunk.attempt_count,
        "Chunk claim is stale, dropping outcome",
    );
    ChunkOutcome::Stale
}

/// Processor timeout for one call, cut short so the call ends before the
/// claim's lease does.
fn call_timeout(settings: &ExecutionSettings, lease_expires_at: Option<Timestamp>, now: Timestamp) -> Duration {
    let timeout = settings.processor_timeout();
    match lease_expires_at {
        Some(expires_at) => timeout.min((expires_at - now).to_std().unwrap_or(Duration::ZERO)),
        None => timeout,
    }
}
