//! The job store abstraction.
//!
//! [`JobStore`] is the single source of truth for jobs and chunks, and the
//! chunk rows double as the durable task queue: claiming a chunk atomically
//! moves it `queued -> running` and hands it to exactly one worker.
//!
//! Two backends are provided:
//! - [`postgres::PgJobStore`]: production backend, writes go through
//!   [`with_commit_retry`](crate::commit::with_commit_retry).
//! - [`memory::MemoryStore`]: single-process backend for tests and
//!   embedded use.
//!
//! Conventions shared by every implementation:
//! - Every committed transition bumps the owning job's `revision` and
//!   returns it, so events can be ordered and de-duplicated downstream.
//! - Chunk writes made by an executor are fenced by the attempt number it
//!   claimed; a write whose precondition no longer holds returns `None`.

use std::time::Duration;

use async_trait::async_trait;
use chunkflow_core::chunk_error::{ChunkError, ErrorKind};
use chunkflow_core::status::{FailureCause, JobStatus};
use chunkflow_core::types::{DbId, Timestamp};

use crate::error::StoreResult;
use crate::models::chunk::Chunk;
use crate::models::job::{ChunkTally, Job, JobListQuery, NewJob, ProgressUpdate};

pub mod memory;
pub mod postgres;

/// A committed chunk transition and the job revision it produced.
#[derive(Debug, Clone)]
pub struct ChunkChange {
    pub chunk: Chunk,
    pub revision: i64,
}

/// Durable storage for jobs and chunks.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Verify the backend is reachable.
    async fn ping(&self) -> StoreResult<()>;

    // -- jobs ---------------------------------------------------------------

    /// Insert a `pending` job and one `queued` chunk per payload, in order,
    /// in a single transaction.
    async fn create_job(&self, new_job: &NewJob, payloads: &[serde_json::Value]) -> StoreResult<Job>;

    /// `pending -> processing`; sets `started_at`. `None` if the job was not pending.
    async fn start_job(&self, job_id: DbId) -> StoreResult<Option<Job>>;

    async fn find_job(&self, job_id: DbId) -> StoreResult<Option<Job>>;

    async fn list_jobs(&self, query: &JobListQuery) -> StoreResult<Vec<Job>>;

    /// Set the cancellation flag on a non-terminal job. Idempotent; returns
    /// the current job row (terminal jobs are returned unchanged).
    async fn request_cancel(&self, job_id: DbId) -> StoreResult<Option<Job>>;

    /// Recount the job's chunks by status.
    async fn chunk_tally(&self, job_id: DbId) -> StoreResult<ChunkTally>;

    /// Apply aggregate fields monotonically. Percent and step are only
    /// written while the job is active. `None` if the job does not exist.
    async fn record_progress(&self, job_id: DbId, update: &ProgressUpdate) -> StoreResult<Option<Job>>;

    /// `processing -> completed` with the reassembled result; percent
    /// becomes 100. `None` if the job was not processing.
    async fn complete_job(&self, job_id: DbId, result: &serde_json::Value) -> StoreResult<Option<Job>>;

    /// Non-terminal `-> failed`. `None` if the job was already terminal.
    async fn fail_job(&self, job_id: DbId, cause: FailureCause, summary: &str) -> StoreResult<Option<Job>>;

    /// Non-terminal `-> cancelled`. `None` if the job was already terminal.
    async fn cancel_job(&self, job_id: DbId) -> StoreResult<Option<Job>>;

    // -- chunks -------------------------------------------------------------

    async fn list_chunks(&self, job_id: DbId) -> StoreResult<Vec<Chunk>>;

    /// Claim the oldest queued chunk of a processing job:
    /// `queued -> running`, `attempt_count += 1`, lease set to `now + lease`.
    async fn claim_next_chunk(&self, worker_id: &str, lease: Duration) -> StoreResult<Option<ChunkChange>>;

    /// `running -> succeeded` for the claim identified by `attempt`.
    async fn complete_chunk(
        &self,
        chunk_id: DbId,
        attempt: i32,
        result: &serde_json::Value,
    ) -> StoreResult<Option<ChunkChange>>;

    /// `running -> retry_wait` with `next_retry_at` and the error recorded.
    async fn schedule_chunk_retry(
        &self,
        chunk_id: DbId,
        attempt: i32,
        error: &ChunkError,
        next_retry_at: Timestamp,
    ) -> StoreResult<Option<ChunkChange>>;

    /// `running -> failed` with the error recorded.
    async fn fail_chunk(&self, chunk_id: DbId, attempt: i32, error: &ChunkError) -> StoreResult<Option<ChunkChange>>;

    /// `running -> cancelled` after the owning job was cancelled.
    async fn cancel_running_chunk(&self, chunk_id: DbId, attempt: i32) -> StoreResult<Option<ChunkChange>>;

    /// `queued | retry_wait -> cancelled` for every such chunk of the job.
    async fn cancel_pending_chunks(&self, job_id: DbId) -> StoreResult<Vec<ChunkChange>>;

    /// `retry_wait -> queued` for every chunk whose `next_retry_at <= now`.
    /// Chunks of jobs that no longer accept work are cancelled instead.
    async fn requeue_due_retries(&self, now: Timestamp) -> StoreResult<Vec<ChunkChange>>;

    /// Recover chunks whose lease expired at or before `now`: back to
    /// `queued` when attempts remain, otherwise `failed` (`lease_expired`).
    /// Chunks of jobs that no longer accept work are cancelled instead.
    async fn reclaim_expired_leases(&self, now: Timestamp, max_attempts: i32) -> StoreResult<Vec<ChunkChange>>;
}

// ---------------------------------------------------------------------------
// Maintenance decisions shared by both backends
// ---------------------------------------------------------------------------

/// What a maintenance sweep does with a chunk it picked up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Recovery {
    Requeue,
    Fail,
    Cancel,
}

/// A job accepts work while it is processing and nobody asked to cancel it.
pub(crate) fn job_accepts_work(job: Option<&Job>) -> bool {
    job.is_some_and(|j| j.status == JobStatus::Processing && !j.cancel_requested)
}

pub(crate) fn retry_recovery(job: Option<&Job>) -> Recovery {
    if job_accepts_work(job) {
        Recovery::Requeue
    } else {
        Recovery::Cancel
    }
}

pub(crate) fn lease_recovery(job: Option<&Job>, chunk: &Chunk, max_attempts: i32) -> Recovery {
    if !job_accepts_work(job) {
        Recovery::Cancel
    } else if chunk.attempt_count < max_attempts {
        Recovery::Requeue
    } else {
        Recovery::Fail
    }
}

pub(crate) fn lease_expired_error(chunk: &Chunk) -> ChunkError {
    ChunkError::new(
        ErrorKind::LeaseExpired,
        format!(
            "lease expired while held by {}",
            chunk.claimed_by.as_deref().unwrap_or("unknown worker")
        ),
    )
}
