//! Repository for the `chunks` table.
//!
//! Chunk rows are the task queue. Writes made on behalf of an executor are
//! fenced: they only match while the chunk is still `running` under the
//! attempt number the executor claimed, so a worker whose lease was
//! reclaimed cannot overwrite newer state.

use chunkflow_core::chunk_error::ChunkError;
use chunkflow_core::status::{ChunkStatus, JobStatus, StatusId};
use chunkflow_core::types::{DbId, Timestamp};
use sqlx::PgExecutor;

use crate::models::chunk::Chunk;

/// Column list for `chunks` queries.
const COLUMNS: &str = "\
    id, job_id, sequence_index, status_id, attempt_count, payload, result, \
    last_error_kind, last_error, next_retry_at, claimed_by, lease_expires_at, \
    created_at, updated_at, finished_at";

/// Upper bound on rows handled by one maintenance sweep.
const SWEEP_BATCH: i64 = 100;

/// Provides queries for chunks.
pub struct ChunkRepo;

impl ChunkRepo {
    /// Insert one queued chunk.
    pub async fn insert<'e>(
        executor: impl PgExecutor<'e>,
        job_id: DbId,
        sequence_index: i32,
        payload: &serde_json::Value,
    ) -> Result<Chunk, sqlx::Error> {
        let query = format!(
            "INSERT INTO chunks (job_id, sequence_index, status_id, payload) \
             VALUES ($1, $2, $3, $4) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Chunk>(&query)
            .bind(job_id)
            .bind(sequence_index)
            .bind(ChunkStatus::Queued.id())
            .bind(payload)
            .fetch_one(executor)
            .await
    }

    pub async fn list_by_job<'e>(
        executor: impl PgExecutor<'e>,
        job_id: DbId,
    ) -> Result<Vec<Chunk>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM chunks WHERE job_id = $1 ORDER BY sequence_index"
        );
        sqlx::query_as::<_, Chunk>(&query)
            .bind(job_id)
            .fetch_all(executor)
            .await
    }

    /// `(sequence_index, status_id)` for every chunk of a job.
    pub async fn statuses_by_job<'e>(
        executor: impl PgExecutor<'e>,
        job_id: DbId,
    ) -> Result<Vec<(i32, StatusId)>, sqlx::Error> {
        sqlx::query_as::<_, (i32, StatusId)>(
            "SELECT sequence_index, status_id FROM chunks WHERE job_id = $1",
        )
        .bind(job_id)
        .fetch_all(executor)
        .await
    }

    /// Atomically claim the oldest queued chunk of a processing job.
    ///
    /// Uses `SELECT FOR UPDATE SKIP LOCKED` so concurrent workers, in this
    /// process or another, never claim the same row.
    pub async fn claim_next<'e>(
        executor: impl PgExecutor<'e>,
        worker_id: &str,
        lease_secs: f64,
    ) -> Result<Option<Chunk>, sqlx::Error> {
        let query = format!(
            "UPDATE chunks \
             SET status_id = $1, attempt_count = attempt_count + 1, claimed_by = $2, \
                 lease_expires_at = NOW() + make_interval(secs => $3), \
                 next_retry_at = NULL, updated_at = NOW() \
             WHERE id = ( \
                 SELECT c.id FROM chunks c \
                 JOIN jobs j ON j.id = c.job_id \
                 WHERE c.status_id = $4 AND j.status_id = $5 \
                 ORDER BY c.id \
                 LIMIT 1 \
                 FOR UPDATE OF c SKIP LOCKED \
             ) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Chunk>(&query)
            .bind(ChunkStatus::Running.id())
            .bind(worker_id)
            .bind(lease_secs)
            .bind(ChunkStatus::Queued.id())
            .bind(JobStatus::Processing.id())
            .fetch_optional(executor)
            .await
    }

    /// `running -> succeeded` for the given claim.
    pub async fn complete<'e>(
        executor: impl PgExecutor<'e>,
        id: DbId,
        attempt: i32,
        result: &serde_json::Value,
    ) -> Result<Option<Chunk>, sqlx::Error> {
        let query = format!(
            "UPDATE chunks \
             SET status_id = $3, result = $4, lease_expires_at = NULL, \
                 finished_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND attempt_count = $2 AND status_id = $5 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Chunk>(&query)
            .bind(id)
            .bind(attempt)
            .bind(ChunkStatus::Succeeded.id())
            .bind(result)
            .bind(ChunkStatus::Running.id())
            .fetch_optional(executor)
            .await
    }

    /// `running -> retry_wait` for the given claim.
    pub async fn schedule_retry<'e>(
        executor: impl PgExecutor<'e>,
        id: DbId,
        attempt: i32,
        error: &ChunkError,
        next_retry_at: Timestamp,
    ) -> Result<Option<Chunk>, sqlx::Error> {
        let query = format!(
            "UPDATE chunks \
             SET status_id = $3, last_error_kind = $4, last_error = $5, next_retry_at = $6, \
                 lease_expires_at = NULL, updated_at = NOW() \
             WHERE id = $1 AND attempt_count = $2 AND status_id = $7 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Chunk>(&query)
            .bind(id)
            .bind(attempt)
            .bind(ChunkStatus::RetryWait.id())
            .bind(error.kind.as_str())
            .bind(&error.message)
            .bind(next_retry_at)
            .bind(ChunkStatus::Running.id())
            .fetch_optional(executor)
            .await
    }

    /// `running -> failed` for the given claim.
    pub async fn fail<'e>(
        executor: impl PgExecutor<'e>,
        id: DbId,
        attempt: i32,
        error: &ChunkError,
    ) -> Result<Option<Chunk>, sqlx::Error> {
        let query = format!(
            "UPDATE chunks \
             SET status_id = $3, last_error_kind = $4, last_error = $5, \
                 lease_expires_at = NULL, finished_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND attempt_count = $2 AND status_id = $6 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Chunk>(&query)
            .bind(id)
            .bind(attempt)
            .bind(ChunkStatus::Failed.id())
            .bind(error.kind.as_str())
            .bind(&error.message)
            .bind(ChunkStatus::Running.id())
            .fetch_optional(executor)
            .await
    }

    /// `running -> cancelled` for the given claim.
    pub async fn cancel_running<'e>(
        executor: impl PgExecutor<'e>,
        id: DbId,
        attempt: i32,
    ) -> Result<Option<Chunk>, sqlx::Error> {
        let query = format!(
            "UPDATE chunks \
             SET status_id = $3, lease_expires_at = NULL, finished_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND attempt_count = $2 AND status_id = $4 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Chunk>(&query)
            .bind(id)
            .bind(attempt)
            .bind(ChunkStatus::Cancelled.id())
            .bind(ChunkStatus::Running.id())
            .fetch_optional(executor)
            .await
    }

    /// `running -> queued` after the claim's lease expired.
    pub async fn requeue_expired<'e>(
        executor: impl PgExecutor<'e>,
        id: DbId,
        attempt: i32,
        error: &ChunkError,
    ) -> Result<Option<Chunk>, sqlx::Error> {
        let query = format!(
            "UPDATE chunks \
             SET status_id = $3, last_error_kind = $4, last_error = $5, claimed_by = NULL, \
                 lease_expires_at = NULL, updated_at = NOW() \
             WHERE id = $1 AND attempt_count = $2 AND status_id = $6 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Chunk>(&query)
            .bind(id)
            .bind(attempt)
            .bind(ChunkStatus::Queued.id())
            .bind(error.kind.as_str())
            .bind(&error.message)
            .bind(ChunkStatus::Running.id())
            .fetch_optional(executor)
            .await
    }

    /// `retry_wait -> queued`.
    pub async fn requeue_retry<'e>(
        executor: impl PgExecutor<'e>,
        id: DbId,
    ) -> Result<Option<Chunk>, sqlx::Error> {
        let query = format!(
            "UPDATE chunks \
             SET status_id = $2, next_retry_at = NULL, claimed_by = NULL, updated_at = NOW() \
             WHERE id = $1 AND status_id = $3 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Chunk>(&query)
            .bind(id)
            .bind(ChunkStatus::Queued.id())
            .bind(ChunkStatus::RetryWait.id())
            .fetch_optional(executor)
            .await
    }

    /// `queued | retry_wait -> cancelled` for a single chunk.
    pub async fn cancel_waiting<'e>(
        executor: impl PgExecutor<'e>,
        id: DbId,
    ) -> Result<Option<Chunk>, sqlx::Error> {
        let query = format!(
            "UPDATE chunks \
             SET status_id = $2, next_retry_at = NULL, finished_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND status_id IN ($3, $4) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Chunk>(&query)
            .bind(id)
            .bind(ChunkStatus::Cancelled.id())
            .bind(ChunkStatus::Queued.id())
            .bind(ChunkStatus::RetryWait.id())
            .fetch_optional(executor)
            .await
    }

    /// `queued | retry_wait -> cancelled` for every such chunk of a job.
    pub async fn cancel_pending<'e>(
        executor: impl PgExecutor<'e>,
        job_id: DbId,
    ) -> Result<Vec<Chunk>, sqlx::Error> {
        let query = format!(
            "UPDATE chunks \
             SET status_id = $2, next_retry_at = NULL, finished_at = NOW(), updated_at = NOW() \
             WHERE job_id = $1 AND status_id IN ($3, $4) \
             RETURNING {COLUMNS}"
        );
        let mut chunks = sqlx::query_as::<_, Chunk>(&query)
            .bind(job_id)
            .bind(ChunkStatus::Cancelled.id())
            .bind(ChunkStatus::Queued.id())
            .bind(ChunkStatus::RetryWait.id())
            .fetch_all(executor)
            .await?;
        chunks.sort_by_key(|c| c.sequence_index);
        Ok(chunks)
    }

    /// Lock a batch of `retry_wait` chunks whose delay has elapsed.
    pub async fn lock_due_retries<'e>(
        executor: impl PgExecutor<'e>,
        now: Timestamp,
    ) -> Result<Vec<Chunk>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM chunks \
             WHERE status_id = $1 AND next_retry_at <= $2 \
             ORDER BY next_retry_at, id \
             LIMIT $3 \
             FOR UPDATE SKIP LOCKED"
        );
        sqlx::query_as::<_, Chunk>(&query)
            .bind(ChunkStatus::RetryWait.id())
            .bind(now)
            .bind(SWEEP_BATCH)
            .fetch_all(executor)
            .await
    }

    /// Lock a batch of `running` chunks whose lease has expired.
    pub async fn lock_expired_leases<'e>(
        executor: impl PgExecutor<'e>,
        now: Timestamp,
    ) -> Result<Vec<Chunk>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM chunks \
             WHERE status_id = $1 AND lease_expires_at <= $2 \
             ORDER BY lease_expires_at, id \
             LIMIT $3 \
             FOR UPDATE SKIP LOCKED"
        );
        sqlx::query_as::<_, Chunk>(&query)
            .bind(ChunkStatus::Running.id())
            .bind(now)
            .bind(SWEEP_BATCH)
            .fetch_all(executor)
            .await
    }
}
