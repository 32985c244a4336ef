//! Repository for the `jobs` table.
//!
//! Every mutating query bumps `revision` in the same statement, so the
//! returned row always carries the revision the change produced.

use chunkflow_core::progress::{
    COMPLETED_PERCENT, STEP_CANCELLED, STEP_CANCELLING, STEP_COMPLETED, STEP_FAILED,
    STEP_PROCESSING, STEP_QUEUED,
};
use chunkflow_core::status::{FailureCause, JobStatus};
use chunkflow_core::types::DbId;
use sqlx::PgExecutor;

use crate::models::job::{Job, JobListQuery, NewJob, ProgressUpdate};

/// Column list for `jobs` queries.
const COLUMNS: &str = "\
    id, owner_ref, status_id, settings, total_chunks, processed_chunks, \
    failed_chunk_ids, progress_percent, current_step, cancel_requested, \
    error_summary, failure_cause, result, revision, \
    created_at, started_at, finished_at, updated_at";

/// Provides queries for jobs.
pub struct JobRepo;

impl JobRepo {
    /// Insert a pending job expecting `total_chunks` chunks.
    pub async fn insert<'e>(
        executor: impl PgExecutor<'e>,
        input: &NewJob,
        total_chunks: i32,
    ) -> Result<Job, sqlx::Error> {
        let settings = input.settings.to_value();
        let query = format!(
            "INSERT INTO jobs (owner_ref, status_id, settings, total_chunks, current_step) \
             VALUES ($1, $2, $3, $4, $5) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Job>(&query)
            .bind(&input.owner_ref)
            .bind(JobStatus::Pending.id())
            .bind(settings)
            .bind(total_chunks)
            .bind(STEP_QUEUED)
            .fetch_one(executor)
            .await
    }

    pub async fn find_by_id<'e>(
        executor: impl PgExecutor<'e>,
        id: DbId,
    ) -> Result<Option<Job>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM jobs WHERE id = $1");
        sqlx::query_as::<_, Job>(&query)
            .bind(id)
            .fetch_optional(executor)
            .await
    }

    /// List jobs newest first, optionally filtered by owner and status.
    pub async fn list<'e>(
        executor: impl PgExecutor<'e>,
        params: &JobListQuery,
    ) -> Result<Vec<Job>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM jobs \
             WHERE ($1::TEXT IS NULL OR owner_ref = $1) \
               AND ($2::SMALLINT IS NULL OR status_id = $2) \
             ORDER BY created_at DESC, id DESC \
             LIMIT $3 OFFSET $4"
        );
        sqlx::query_as::<_, Job>(&query)
            .bind(params.owner_ref.as_deref())
            .bind(params.status.map(JobStatus::id))
            .bind(params.limit())
            .bind(params.offset())
            .fetch_all(executor)
            .await
    }

    /// `pending -> processing`.
    pub async fn start<'e>(
        executor: impl PgExecutor<'e>,
        id: DbId,
    ) -> Result<Option<Job>, sqlx::Error> {
        let query = format!(
            "UPDATE jobs \
             SET status_id = $2, started_at = NOW(), current_step = $3, \
                 revision = revision + 1, updated_at = NOW() \
             WHERE id = $1 AND status_id = $4 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Job>(&query)
            .bind(id)
            .bind(JobStatus::Processing.id())
            .bind(STEP_PROCESSING)
            .bind(JobStatus::Pending.id())
            .fetch_optional(executor)
            .await
    }

    /// Raise the cancellation flag on an active job that does not have it yet.
    pub async fn request_cancel<'e>(
        executor: impl PgExecutor<'e>,
        id: DbId,
    ) -> Result<Option<Job>, sqlx::Error> {
        let query = format!(
            "UPDATE jobs \
             SET cancel_requested = TRUE, current_step = $2, \
                 revision = revision + 1, updated_at = NOW() \
             WHERE id = $1 AND status_id IN ($3, $4) AND NOT cancel_requested \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Job>(&query)
            .bind(id)
            .bind(STEP_CANCELLING)
            .bind(JobStatus::Pending.id())
            .bind(JobStatus::Processing.id())
            .fetch_optional(executor)
            .await
    }

    /// Apply aggregate fields monotonically.
    ///
    /// `processed_chunks` and `progress_percent` take the greater of the
    /// stored and offered values, failed ids are unioned. Percent and step
    /// only move while the job is active.
    pub async fn record_progress<'e>(
        executor: impl PgExecutor<'e>,
        id: DbId,
        update: &ProgressUpdate,
    ) -> Result<Option<Job>, sqlx::Error> {
        let query = format!(
            "UPDATE jobs SET \
                 processed_chunks = GREATEST(processed_chunks, LEAST($2, total_chunks)), \
                 failed_chunk_ids = ARRAY( \
                     SELECT DISTINCT x FROM unnest(failed_chunk_ids || $3::INTEGER[]) AS t(x) ORDER BY x \
                 ), \
                 progress_percent = CASE WHEN status_id IN ($6, $7) \
                     THEN GREATEST(progress_percent, $4) ELSE progress_percent END, \
                 current_step = CASE WHEN status_id IN ($6, $7) AND $5::TEXT IS NOT NULL \
                     THEN $5 ELSE current_step END, \
                 revision = revision + 1, updated_at = NOW() \
             WHERE id = $1 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Job>(&query)
            .bind(id)
            .bind(update.processed_chunks)
            .bind(&update.failed_chunk_ids)
            .bind(update.progress_percent)
            .bind(update.current_step.as_deref())
            .bind(JobStatus::Pending.id())
            .bind(JobStatus::Processing.id())
            .fetch_optional(executor)
            .await
    }

    /// `processing -> completed` with the reassembled result.
    pub async fn complete<'e>(
        executor: impl PgExecutor<'e>,
        id: DbId,
        result: &serde_json::Value,
    ) -> Result<Option<Job>, sqlx::Error> {
        let query = format!(
            "UPDATE jobs \
             SET status_id = $2, result = $3, progress_percent = $4, current_step = $5, \
                 finished_at = NOW(), revision = revision + 1, updated_at = NOW() \
             WHERE id = $1 AND status_id = $6 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Job>(&query)
            .bind(id)
            .bind(JobStatus::Completed.id())
            .bind(result)
            .bind(COMPLETED_PERCENT)
            .bind(STEP_COMPLETED)
            .bind(JobStatus::Processing.id())
            .fetch_optional(executor)
            .await
    }

    /// Active `-> failed` with a cause and summary.
    pub async fn fail<'e>(
        executor: impl PgExecutor<'e>,
        id: DbId,
        cause: FailureCause,
        summary: &str,
    ) -> Result<Option<Job>, sqlx::Error> {
        let query = format!(
            "UPDATE jobs \
             SET status_id = $2, failure_cause = $3, error_summary = $4, current_step = $5, \
                 finished_at = NOW(), revision = revision + 1, updated_at = NOW() \
             WHERE id = $1 AND status_id IN ($6, $7) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Job>(&query)
            .bind(id)
            .bind(JobStatus::Failed.id())
            .bind(cause.as_str())
            .bind(summary)
            .bind(STEP_FAILED)
            .bind(JobStatus::Pending.id())
            .bind(JobStatus::Processing.id())
            .fetch_optional(executor)
            .await
    }

    /// Active `-> cancelled`.
    pub async fn cancel<'e>(
        executor: impl PgExecutor<'e>,
        id: DbId,
    ) -> Result<Option<Job>, sqlx::Error> {
        let query = format!(
            "UPDATE jobs \
             SET status_id = $2, cancel_requested = TRUE, current_step = $3, \
                 finished_at = NOW(), revision = revision + 1, updated_at = NOW() \
             WHERE id = $1 AND status_id IN ($4, $5) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Job>(&query)
            .bind(id)
            .bind(JobStatus::Cancelled.id())
            .bind(STEP_CANCELLED)
            .bind(JobStatus::Pending.id())
            .bind(JobStatus::Processing.id())
            .fetch_optional(executor)
            .await
    }

    /// Bump the revision for a chunk-level change and return the new value.
    pub async fn bump_revision<'e>(
        executor: impl PgExecutor<'e>,
        id: DbId,
    ) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar::<_, i64>(
            "UPDATE jobs SET revision = revision + 1, updated_at = NOW() \
             WHERE id = $1 RETURNING revision",
        )
        .bind(id)
        .fetch_one(executor)
        .await
    }
}
