//! Job coordinator: owns the job state machine.
//!
//! `pending -> processing -> {completed | failed | cancelled}`
//!
//! The coordinator is the only writer of a job's aggregate fields. It never
//! trusts incremental counts: every aggregation recounts chunk rows from the
//! store and writes the result monotonically, so duplicate or reordered
//! terminal notifications are harmless.

use std::sync::Arc;
use std::time::Duration;

use chunkflow_core::chunk_error::ErrorKind;
use chunkflow_core::job_events::{
    EVENT_CHUNK_CANCELLED, EVENT_JOB_CANCELLED, EVENT_JOB_CANCEL_REQUESTED, EVENT_JOB_COMPLETED,
    EVENT_JOB_FAILED, EVENT_JOB_PROGRESS, EVENT_JOB_STARTED,
};
use chunkflow_core::progress::{
    active_percent, exceeds_discard_threshold, processed_step, validate_discard_threshold,
    STEP_REASSEMBLING,
};
use chunkflow_core::settings::ExecutionSettings;
use chunkflow_core::status::{ChunkStatus, FailureCause};
use chunkflow_core::types::DbId;
use chunkflow_db::models::chunk::Chunk;
use chunkflow_db::models::job::{ChunkTally, Job, JobListQuery, NewJob, ProgressUpdate};
use chunkflow_db::JobStore;
use chunkflow_events::Notifier;

use crate::error::EngineError;
use crate::processor::{ChunkPart, Chunker, Reassembler};

/// Failed chunks quoted individually in an error summary.
const SUMMARY_DETAIL_LIMIT: usize = 3;

/// A document submission.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub owner_ref: String,
    pub input: String,
    pub settings: ExecutionSettings,
}

pub struct JobCoordinator {
    store: Arc<dyn JobStore>,
    notifier: Notifier,
    chunker: Arc<dyn Chunker>,
    reassembler: Arc<dyn Reassembler>,
    discard_threshold: f64,
    /// Claim lease; every per-job processor timeout must fit inside it.
    lease: Duration,
}

impl JobCoordinator {
    pub fn new(
        store: Arc<dyn JobStore>,
        notifier: Notifier,
        chunker: Arc<dyn Chunker>,
        reassembler: Arc<dyn Reassembler>,
        discard_threshold: f64,
        lease: Duration,
    ) -> Result<Self, EngineError> {
        validate_discard_threshold(discard_threshold)?;
        if lease.is_zero() {
            return Err(EngineError::InvalidInput("chunk lease must be positive".to_string()));
        }
        Ok(Self {
            store,
            notifier,
            chunker,
            reassembler,
            discard_threshold,
            lease,
        })
    }

    pub fn discard_threshold(&self) -> f64 {
        self.discard_threshold
    }

    // -----------------------------------------------------------------------
    // Submission
    // -----------------------------------------------------------------------

    /// Split the input, persist the job with its chunks, and make the chunks
    /// claimable.
    pub async fn submit(&self, request: JobRequest) -> Result<Job, EngineError> {
        if request.owner_ref.trim().is_empty() {
            return Err(EngineError::InvalidInput("owner_ref must not be empty".to_string()));
        }
        request.settings.validate()?;
        // A call outliving its lease would be reclaimed and run twice.
        if request.settings.processor_timeout() >= self.lease {
            return Err(EngineError::InvalidInput(format!(
                "processor_timeout_ms must be shorter than the chunk lease ({}ms)",
                self.lease.as_millis(),
            )));
        }

        let payloads = self.chunker.split(&request.input);
        if payloads.is_empty() {
            return Err(EngineError::InvalidInput(
                "input produced zero chunks".to_string(),
            ));
        }

        let new_job = NewJob {
            owner_ref: request.owner_ref,
            settings: request.settings,
        };
        let job = self.store.create_job(&new_job, &payloads).await?;

        let result = self.start(job.id).await;
        let started = self.guard_durability(job.id, result).await?;

        tracing::info!(
            job_id = started.id,
            owner_ref = %started.owner_ref,
            total_chunks = started.total_chunks,
            "Job submitted",
        );
        Ok(started)
    }

    async fn start(&self, job_id: DbId) -> Result<Job, EngineError> {
        match self.store.start_job(job_id).await? {
            Some(job) => {
                self.notifier.job_changed(EVENT_JOB_STARTED, &job).await;
                Ok(job)
            }
            // Cancelled between insert and start.
            None => self.status(job_id).await,
        }
    }

    // -----------------------------------------------------------------------
    // Aggregation
    // -----------------------------------------------------------------------

    /// Re-aggregate after one of the job's chunks reached a terminal state.
    ///
    /// Idempotent and commutative: safe to call any number of times, in any
    /// order, from any process.
    pub async fn on_chunk_terminal(&self, job_id: DbId) -> Result<Job, EngineError> {
        let result = self.aggregate(job_id).await;
        self.guard_durability(job_id, result).await
    }

    async fn aggregate(&self, job_id: DbId) -> Result<Job, EngineError> {
        let tally = self.store.chunk_tally(job_id).await?;
        let job = self.record_tally(job_id, &tally).await?;

        if job.is_terminal() {
            return Ok(job);
        }

        if !job.cancel_requested
            && exceeds_discard_threshold(tally.failed, tally.total, self.discard_threshold)
        {
            return self.abort(job_id, &tally).await;
        }

        if tally.all_terminal() {
            return self.finalize_inner(job_id).await;
        }
        Ok(job)
    }

    /// Write the recounted aggregate fields and publish progress.
    async fn record_tally(&self, job_id: DbId, tally: &ChunkTally) -> Result<Job, EngineError> {
        let processed = tally.processed();
        let update = ProgressUpdate {
            processed_chunks: processed,
            progress_percent: active_percent(processed, tally.total),
            failed_chunk_ids: tally.failed_indexes.clone(),
            current_step: Some(processed_step(processed, tally.total)),
        };
        let job = self
            .store
            .record_progress(job_id, &update)
            .await?
            .ok_or(EngineError::JobNotFound(job_id))?;
        self.notifier.job_changed(EVENT_JOB_PROGRESS, &job).await;
        Ok(job)
    }

    /// Threshold abort: fail the job now and stop its waiting chunks.
    /// Chunks still running are cancelled by their executors.
    async fn abort(&self, job_id: DbId, tally: &ChunkTally) -> Result<Job, EngineError> {
        let chunks = self.store.list_chunks(job_id).await?;
        let summary = self.failure_summary(&chunks, tally);
        let reason = EngineError::Aborted {
            job_id,
            reason: summary.clone(),
        };
        tracing::warn!(job_id, failed = tally.failed, total = tally.total, "{reason}");

        if let Some(job) = self
            .store
            .fail_job(job_id, FailureCause::ChunkFailures, &summary)
            .await?
        {
            self.notifier.job_changed(EVENT_JOB_FAILED, &job).await;
        }

        self.cancel_waiting_chunks(job_id).await?;
        let tally = self.store.chunk_tally(job_id).await?;
        self.record_tally(job_id, &tally).await
    }

    // -----------------------------------------------------------------------
    // Finalization
    // -----------------------------------------------------------------------

    /// Move a job whose chunks are all terminal into its final state.
    ///
    /// Idempotent: a terminal job is returned unchanged, and a job with
    /// chunks still in flight is left alone.
    pub async fn finalize(&self, job_id: DbId) -> Result<Job, EngineError> {
        let result = self.finalize_inner(job_id).await;
        self.guard_durability(job_id, result).await
    }

    async fn finalize_inner(&self, job_id: DbId) -> Result<Job, EngineError> {
        let job = self.status(job_id).await?;
        if job.is_terminal() {
            return Ok(job);
        }
        let tally = self.store.chunk_tally(job_id).await?;
        if !tally.all_terminal() {
            return Ok(job);
        }

        if job.cancel_requested {
            return match self.store.cancel_job(job_id).await? {
                Some(job) => {
                    tracing::info!(job_id, "Job cancelled");
                    self.notifier.job_changed(EVENT_JOB_CANCELLED, &job).await;
                    Ok(job)
                }
                None => self.status(job_id).await,
            };
        }

        let chunks = self.store.list_chunks(job_id).await?;

        if tally.succeeded == 0
            || exceeds_discard_threshold(tally.failed, tally.total, self.discard_threshold)
        {
            let summary = self.failure_summary(&chunks, &tally);
            return self.fail(job_id, FailureCause::ChunkFailures, &summary).await;
        }

        let update = ProgressUpdate {
            processed_chunks: tally.processed(),
            progress_percent: active_percent(tally.processed(), tally.total),
            failed_chunk_ids: tally.failed_indexes.clone(),
            current_step: Some(STEP_REASSEMBLING.to_string()),
        };
        if let Some(job) = self.store.record_progress(job_id, &update).await? {
            self.notifier.job_changed(EVENT_JOB_PROGRESS, &job).await;
        }

        let parts: Vec<ChunkPart> = chunks
            .into_iter()
            .map(|c| ChunkPart {
                sequence_index: c.sequence_index,
                result: if c.status == ChunkStatus::Succeeded {
                    c.result
                } else {
                    None
                },
                payload: c.payload,
            })
            .collect();

        match self.reassembler.reassemble(&parts) {
            Ok(result) => match self.store.complete_job(job_id, &result).await? {
                Some(job) => {
                    tracing::info!(
                        job_id,
                        failed_chunks = tally.failed,
                        total_chunks = tally.total,
                        "Job completed",
                    );
                    self.notifier.job_changed(EVENT_JOB_COMPLETED, &job).await;
                    Ok(job)
                }
                None => self.status(job_id).await,
            },
            Err(message) => {
                let summary = format!("Reassembly failed: {message}");
                self.fail(job_id, FailureCause::Reassembly, &summary).await
            }
        }
    }

    async fn fail(&self, job_id: DbId, cause: FailureCause, summary: &str) -> Result<Job, EngineError> {
        match self.store.fail_job(job_id, cause, summary).await? {
            Some(job) => {
                tracing::warn!(job_id, cause = cause.as_str(), summary, "Job failed");
                self.notifier.job_changed(EVENT_JOB_FAILED, &job).await;
                Ok(job)
            }
            None => self.status(job_id).await,
        }
    }

    /// `"3 of 4 chunks failed (discard threshold 50%): chunk 0: timeout: ..."`
    fn failure_summary(&self, chunks: &[Chunk], tally: &ChunkTally) -> String {
        let mut summary = format!(
            "{} of {} chunks failed (discard threshold {}%)",
            tally.failed,
            tally.total,
            (self.discard_threshold * 100.0).round()
        );
        let details: Vec<String> = chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::Failed)
            .take(SUMMARY_DETAIL_LIMIT)
            .map(|c| {
                let kind = c.last_error_kind().map(ErrorKind::as_str).unwrap_or("unknown");
                let message = c.last_error.as_deref().unwrap_or("");
                format!("chunk {}: {kind}: {message}", c.sequence_index)
            })
            .collect();
        if !details.is_empty() {
            summary.push_str(": ");
            summary.push_str(&details.join("; "));
        }
        summary
    }

    // -----------------------------------------------------------------------
    // Cancellation
    // -----------------------------------------------------------------------

    /// Request cancellation. Idempotent; cancelling a terminal job returns
    /// it unchanged.
    ///
    /// Waiting chunks are cancelled here. Running chunks finish their
    /// current attempt and are then cancelled by their executors; the job
    /// becomes `cancelled` once every chunk is terminal.
    pub async fn cancel(&self, job_id: DbId) -> Result<Job, EngineError> {
        let result = self.cancel_inner(job_id).await;
        self.guard_durability(job_id, result).await
    }

    async fn cancel_inner(&self, job_id: DbId) -> Result<Job, EngineError> {
        let job = self
            .store
            .request_cancel(job_id)
            .await?
            .ok_or(EngineError::JobNotFound(job_id))?;
        if job.is_terminal() {
            return Ok(job);
        }
        tracing::info!(job_id, "Job cancellation requested");
        self.notifier.job_changed(EVENT_JOB_CANCEL_REQUESTED, &job).await;

        self.cancel_waiting_chunks(job_id).await?;
        self.aggregate(job_id).await
    }

    async fn cancel_waiting_chunks(&self, job_id: DbId) -> Result<(), EngineError> {
        for change in self.store.cancel_pending_chunks(job_id).await? {
            self.notifier.chunk_changed(EVENT_CHUNK_CANCELLED, &change).await;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub async fn status(&self, job_id: DbId) -> Result<Job, EngineError> {
        self.store
            .find_job(job_id)
            .await?
            .ok_or(EngineError::JobNotFound(job_id))
    }

    pub async fn chunks(&self, job_id: DbId) -> Result<Vec<Chunk>, EngineError> {
        self.status(job_id).await?;
        Ok(self.store.list_chunks(job_id).await?)
    }

    pub async fn list(&self, query: &JobListQuery) -> Result<Vec<Job>, EngineError> {
        Ok(self.store.list_jobs(query).await?)
    }

    // -----------------------------------------------------------------------
    // Durability
    // -----------------------------------------------------------------------

    /// Mark the job failed with cause `durability` if `result` is a
    /// durability error, then pass `result` through.
    pub(crate) async fn guard_durability<T>(
        &self,
        job_id: DbId,
        result: Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        if let Err(EngineError::Durability(message)) = &result {
            self.record_durability_failure(job_id, message).await;
        }
        result
    }

    /// Best effort: the store just failed, so this write may fail too.
    pub async fn record_durability_failure(&self, job_id: DbId, message: &str) {
        tracing::error!(job_id, error = message, "Durability error, failing job");
        match self
            .store
            .fail_job(job_id, FailureCause::Durability, message)
            .await
        {
            Ok(Some(job)) => self.notifier.job_changed(EVENT_JOB_FAILED, &job).await,
            Ok(None) => {}
            Err(e) => {
                tracing::error!(job_id, error = %e, "Could not record durability failure");
            }
        }
    }
}
