//! Postgres [`JobStore`].
//!
//! Each operation runs in its own transaction inside
//! [`with_commit_retry`], so a dropped connection re-runs the whole
//! operation rather than leaving half of it applied. Chunk transitions bump
//! the owning job's revision in the same transaction.

use std::time::Duration;

use async_trait::async_trait;
use chunkflow_core::chunk_error::ChunkError;
use chunkflow_core::status::{ChunkStatus, FailureCause};
use chunkflow_core::types::{DbId, Timestamp};
use sqlx::{PgConnection, PgPool};

use super::{lease_expired_error, lease_recovery, retry_recovery, ChunkChange, JobStore, Recovery};
use crate::commit::{with_commit_retry, CommitRetryConfig};
use crate::error::{StoreError, StoreResult};
use crate::models::chunk::Chunk;
use crate::models::job::{ChunkTally, Job, JobListQuery, NewJob, ProgressUpdate};
use crate::repositories::{ChunkRepo, JobRepo};

/// Production store backed by a Postgres pool.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
    commit: CommitRetryConfig,
}

impl PgJobStore {
    pub fn new(pool: PgPool, commit: CommitRetryConfig) -> Self {
        Self { pool, commit }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Attach the revision produced by a chunk write, if the write matched.
async fn with_revision(
    conn: &mut PgConnection,
    chunk: Option<Chunk>,
) -> Result<Option<ChunkChange>, sqlx::Error> {
    match chunk {
        Some(chunk) => {
            let revision = JobRepo::bump_revision(&mut *conn, chunk.job_id).await?;
            Ok(Some(ChunkChange { chunk, revision }))
        }
        None => Ok(None),
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn ping(&self) -> StoreResult<()> {
        crate::health_check(&self.pool).await?;
        Ok(())
    }

    async fn create_job(&self, new_job: &NewJob, payloads: &[serde_json::Value]) -> StoreResult<Job> {
        if payloads.is_empty() {
            return Err(StoreError::Invalid("a job needs at least one chunk".to_string()));
        }
        let pool = &self.pool;
        with_commit_retry(&self.commit, "create_job", move || async move {
            let mut tx = pool.begin().await?;
            let job = JobRepo::insert(&mut *tx, new_job, payloads.len() as i32).await?;
            for (index, payload) in payloads.iter().enumerate() {
                ChunkRepo::insert(&mut *tx, job.id, index as i32, payload).await?;
            }
            tx.commit().await?;
            Ok(job)
        })
        .await
    }

    async fn start_job(&self, job_id: DbId) -> StoreResult<Option<Job>> {
        let pool = &self.pool;
        with_commit_retry(&self.commit, "start_job", move || async move {
            JobRepo::start(pool, job_id).await
        })
        .await
    }

    async fn find_job(&self, job_id: DbId) -> StoreResult<Option<Job>> {
        Ok(JobRepo::find_by_id(&self.pool, job_id).await?)
    }

    async fn list_jobs(&self, query: &JobListQuery) -> StoreResult<Vec<Job>> {
        Ok(JobRepo::list(&self.pool, query).await?)
    }

    async fn request_cancel(&self, job_id: DbId) -> StoreResult<Option<Job>> {
        let pool = &self.pool;
        with_commit_retry(&self.commit, "request_cancel", move || async move {
            let mut tx = pool.begin().await?;
            let job = match JobRepo::request_cancel(&mut *tx, job_id).await? {
                Some(job) => Some(job),
                None => JobRepo::find_by_id(&mut *tx, job_id).await?,
            };
            tx.commit().await?;
            Ok(job)
        })
        .await
    }

    async fn chunk_tally(&self, job_id: DbId) -> StoreResult<ChunkTally> {
        let rows = ChunkRepo::statuses_by_job(&self.pool, job_id).await?;
        let mut statuses = Vec::with_capacity(rows.len());
        for (sequence_index, status_id) in rows {
            let status = ChunkStatus::from_id(status_id)
                .ok_or_else(|| StoreError::Invalid(format!("unknown chunk status id {status_id}")))?;
            statuses.push((sequence_index, status));
        }
        Ok(ChunkTally::from_statuses(statuses))
    }

    async fn record_progress(&self, job_id: DbId, update: &ProgressUpdate) -> StoreResult<Option<Job>> {
        let pool = &self.pool;
        with_commit_retry(&self.commit, "record_progress", move || async move {
            JobRepo::record_progress(pool, job_id, update).await
        })
        .await
    }

    async fn complete_job(&self, job_id: DbId, result: &serde_json::Value) -> StoreResult<Option<Job>> {
        let pool = &self.pool;
        with_commit_retry(&self.commit, "complete_job", move || async move {
            JobRepo::complete(pool, job_id, result).await
        })
        .await
    }

    async fn fail_job(&self, job_id: DbId, cause: FailureCause, summary: &str) -> StoreResult<Option<Job>> {
        let pool = &self.pool;
        with_commit_retry(&self.commit, "fail_job", move || async move {
            JobRepo::fail(pool, job_id, cause, summary).await
        })
        .await
    }

    async fn cancel_job(&self, job_id: DbId) -> StoreResult<Option<Job>> {
        let pool = &self.pool;
        with_commit_retry(&self.commit, "cancel_job", move || async move {
            JobRepo::cancel(pool, job_id).await
        })
        .await
    }

    async fn list_chunks(&self, job_id: DbId) -> StoreResult<Vec<Chunk>> {
        Ok(ChunkRepo::list_by_job(&self.pool, job_id).await?)
    }

    async fn claim_next_chunk(&self, worker_id: &str, lease: Duration) -> StoreResult<Option<ChunkChange>> {
        let pool = &self.pool;
        let lease_secs = lease.as_secs_f64();
        with_commit_retry(&self.commit, "claim_next_chunk", move || async move {
            let mut tx = pool.begin().await?;
            let claimed = ChunkRepo::claim_next(&mut *tx, worker_id, lease_secs).await?;
            let change = with_revision(&mut *tx, claimed).await?;
            tx.commit().await?;
            Ok(change)
        })
        .await
    }

    async fn complete_chunk(
        &self,
        chunk_id: DbId,
        attempt: i32,
        result: &serde_json::Value,
    ) -> StoreResult<Option<ChunkChange>> {
        let pool = &self.pool;
        with_commit_retry(&self.commit, "complete_chunk", move || async move {
            let mut tx = pool.begin().await?;
            let chunk = ChunkRepo::complete(&mut *tx, chunk_id, attempt, result).await?;
            let change = with_revision(&mut *tx, chunk).await?;
            tx.commit().await?;
            Ok(change)
        })
        .await
    }

    async fn schedule_chunk_retry(
        &self,
        chunk_id: DbId,
        attempt: i32,
        error: &ChunkError,
        next_retry_at: Timestamp,
    ) -> StoreResult<Option<ChunkChange>> {
        let pool = &self.pool;
        with_commit_retry(&self.commit, "schedule_chunk_retry", move || async move {
            let mut tx = pool.begin().await?;
            let chunk =
                ChunkRepo::schedule_retry(&mut *tx, chunk_id, attempt, error, next_retry_at).await?;
            let change = with_revision(&mut *tx, chunk).await?;
            tx.commit().await?;
            Ok(change)
        })
        .await
    }

    async fn fail_chunk(&self, chunk_id: DbId, attempt: i32, error: &ChunkError) -> StoreResult<Option<ChunkChange>> {
        let pool = &self.pool;
        with_commit_retry(&self.commit, "fail_chunk", move || async move {
            let mut tx = pool.begin().await?;
            let chunk = ChunkRepo::fail(&mut *tx, chunk_id, attempt, error).await?;
            let change = with_revision(&mut *tx, chunk).await?;
            tx.commit().await?;
            Ok(change)
        })
        .await
    }

    async fn cancel_running_chunk(&self, chunk_id: DbId, attempt: i32) -> StoreResult<Option<ChunkChange>> {
        let pool = &self.pool;
        with_commit_retry(&self.commit, "cancel_running_chunk", move || async move {
            let mut tx = pool.begin().await?;
            let chunk = ChunkRepo::cancel_running(&mut *tx, chunk_id, attempt).await?;
            let change = with_revision(&mut *tx, chunk).await?;
            tx.commit().await?;
            Ok(change)
        })
        .await
    }

    async fn cancel_pending_chunks(&self, job_id: DbId) -> StoreResult<Vec<ChunkChange>> {
        let pool = &self.pool;
        with_commit_retry(&self.commit, "cancel_pending_chunks", move || async move {
            let mut tx = pool.begin().await?;
            let chunks = ChunkRepo::cancel_pending(&mut *tx, job_id).await?;
            let mut changes = Vec::with_capacity(chunks.len());
            for chunk in chunks {
                changes.extend(with_revision(&mut *tx, Some(chunk)).await?);
            }
            tx.commit().await?;
            Ok(changes)
        })
        .await
    }

    async fn requeue_due_retries(&self, now: Timestamp) -> StoreResult<Vec<ChunkChange>> {
        let pool = &self.pool;
        with_commit_retry(&self.commit, "requeue_due_retries", move || async move {
            let mut tx = pool.begin().await?;
            let due = ChunkRepo::lock_due_retries(&mut *tx, now).await?;
            let mut changes = Vec::with_capacity(due.len());
            for chunk in due {
                let job = JobRepo::find_by_id(&mut *tx, chunk.job_id).await?;
                let updated = match retry_recovery(job.as_ref()) {
                    Recovery::Requeue => ChunkRepo::requeue_retry(&mut *tx, chunk.id).await?,
                    Recovery::Cancel | Recovery::Fail => {
                        ChunkRepo::cancel_waiting(&mut *tx, chunk.id).await?
                    }
                };
                changes.extend(with_revision(&mut *tx, updated).await?);
            }
            tx.commit().await?;
            Ok(changes)
        })
        .await
    }

    async fn reclaim_expired_leases(&self, now: Timestamp, max_attempts: i32) -> StoreResult<Vec<ChunkChange>> {
        let pool = &self.pool;
        with_commit_retry(&self.commit, "reclaim_expired_leases", move || async move {
            let mut tx = pool.begin().await?;
            let expired = ChunkRepo::lock_expired_leases(&mut *tx, now).await?;
            let mut changes = Vec::with_capacity(expired.len());
            for chunk in expired {
                let job = JobRepo::find_by_id(&mut *tx, chunk.job_id).await?;
                let error = lease_expired_error(&chunk);
                let attempt = chunk.attempt_count;
                let updated = match lease_recovery(job.as_ref(), &chunk, max_attempts) {
                    Recovery::Requeue => {
                        ChunkRepo::requeue_expired(&mut *tx, chunk.id, attempt, &error).await?
                    }
                    Recovery::Fail => ChunkRepo::fail(&mut *tx, chunk.id, attempt, &error).await?,
                    Recovery::Cancel => {
                        ChunkRepo::cancel_running(&mut *tx, chunk.id, attempt).await?
                    }
                };
                changes.extend(with_revision(&mut *tx, updated).await?);
            }
            tx.commit().await?;
            Ok(changes)
        })
        .await
    }
}
