//! In-process [`JobStore`] backed by a mutex-guarded map.
//!
//! Implements the same transition rules as the Postgres backend: the mutex
//! plays the role of `FOR UPDATE SKIP LOCKED`, and every mutation bumps the
//! owning job's revision. Used by engine tests and single-process setups.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use chunkflow_core::chunk_error::ChunkError;
use chunkflow_core::progress::{
    COMPLETED_PERCENT, STEP_CANCELLED, STEP_CANCELLING, STEP_COMPLETED, STEP_FAILED,
    STEP_PROCESSING, STEP_QUEUED,
};
use chunkflow_core::status::{ChunkStatus, FailureCause, JobStatus};
use chunkflow_core::types::{DbId, Timestamp};
use tokio::sync::Mutex;

use super::{lease_expired_error, lease_recovery, retry_recovery, ChunkChange, JobStore, Recovery};
use crate::error::{StoreError, StoreResult};
use crate::models::chunk::Chunk;
use crate::models::job::{ChunkTally, Job, JobListQuery, NewJob, ProgressUpdate};

#[derive(Default)]
struct MemoryState {
    jobs: BTreeMap<DbId, Job>,
    chunks: BTreeMap<DbId, Chunk>,
    last_job_id: DbId,
    last_chunk_id: DbId,
    /// Number of upcoming writes that fail with a durability error.
    failing_writes: u32,
}

impl MemoryState {
    fn check_write(&mut self, operation: &'static str) -> StoreResult<()> {
        if self.failing_writes > 0 {
            self.failing_writes -= 1;
            return Err(StoreError::Durability {
                operation,
                attempts: 1,
                message: "injected write failure".to_string(),
            });
        }
        Ok(())
    }

    /// Bump the job's revision and return the new value.
    fn bump(&mut self, job_id: DbId) -> i64 {
        match self.jobs.get_mut(&job_id) {
            Some(job) => {
                job.revision += 1;
                job.updated_at = Utc::now();
                job.revision
            }
            None => 0,
        }
    }

    /// Apply `f` to the chunk when it is still running under `attempt`.
    fn fenced(
        &mut self,
        chunk_id: DbId,
        attempt: i32,
        f: impl FnOnce(&mut Chunk),
    ) -> Option<ChunkChange> {
        let chunk = self.chunks.get_mut(&chunk_id)?;
        if chunk.status != ChunkStatus::Running || chunk.attempt_count != attempt {
            return None;
        }
        f(chunk);
        chunk.updated_at = Utc::now();
        let chunk = chunk.clone();
        let revision = self.bump(chunk.job_id);
        Some(ChunkChange { chunk, revision })
    }

    /// Apply `f` to the job when its status is one of `from`.
    fn transition_job(
        &mut self,
        job_id: DbId,
        from: &[JobStatus],
        f: impl FnOnce(&mut Job),
    ) -> Option<Job> {
        let job = self.jobs.get_mut(&job_id)?;
        if !from.contains(&job.status) {
            return None;
        }
        f(job);
        job.revision += 1;
        job.updated_at = Utc::now();
        Some(job.clone())
    }

    fn cancel_waiting(&mut self, chunk_id: DbId) -> Option<ChunkChange> {
        let chunk = self.chunks.get_mut(&chunk_id)?;
        if !matches!(chunk.status, ChunkStatus::Queued | ChunkStatus::RetryWait) {
            return None;
        }
        let now = Utc::now();
        chunk.status = ChunkStatus::Cancelled;
        chunk.next_retry_at = None;
        chunk.finished_at = Some(now);
        chunk.updated_at = now;
        let chunk = chunk.clone();
        let revision = self.bump(chunk.job_id);
        Some(ChunkChange { chunk, revision })
    }
}

const ACTIVE: [JobStatus; 2] = [JobStatus::Pending, JobStatus::Processing];

/// Mutex-guarded in-memory store.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` writes fail with [`StoreError::Durability`].
    pub async fn fail_next_writes(&self, count: u32) {
        self.state.lock().await.failing_writes = count;
    }

    /// Overwrite a chunk's lease expiry, for simulating a vanished worker.
    pub async fn set_lease_expiry(&self, chunk_id: DbId, expires_at: Timestamp) {
        if let Some(chunk) = self.state.lock().await.chunks.get_mut(&chunk_id) {
            chunk.lease_expires_at = Some(expires_at);
        }
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn create_job(&self, new_job: &NewJob, payloads: &[serde_json::Value]) -> StoreResult<Job> {
        if payloads.is_empty() {
            return Err(StoreError::Invalid("a job needs at least one chunk".to_string()));
        }
        let mut state = self.state.lock().await;
        state.check_write("create_job")?;

        let now = Utc::now();
        state.last_job_id += 1;
        let job = Job {
            id: state.last_job_id,
            owner_ref: new_job.owner_ref.clone(),
            status: JobStatus::Pending,
            settings: new_job.settings.to_value(),
            total_chunks: payloads.len() as i32,
            processed_chunks: 0,
            failed_chunk_ids: Vec::new(),
            progress_percent: 0,
            current_step: Some(STEP_QUEUED.to_string()),
            cancel_requested: false,
            error_summary: None,
            failure_cause: None,
            result: None,
            revision: 0,
            created_at: now,
            started_at: None,
            finished_at: None,
            updated_at: now,
        };
        state.jobs.insert(job.id, job.clone());

        for (index, payload) in payloads.iter().enumerate() {
            state.last_chunk_id += 1;
            let chunk = Chunk {
                id: state.last_chunk_id,
                job_id: job.id,
                sequence_index: index as i32,
                status: ChunkStatus::Queued,
                attempt_count: 0,
                payload: payload.clone(),
                result: None,
                last_error_kind: None,
                last_error: None,
                next_retry_at: None,
                claimed_by: None,
                lease_expires_at: None,
                created_at: now,
                updated_at: now,
                finished_at: None,
            };
            state.chunks.insert(chunk.id, chunk);
        }
        Ok(job)
    }

    async fn start_job(&self, job_id: DbId) -> StoreResult<Option<Job>> {
        let mut state = self.state.lock().await;
        state.check_write("start_job")?;
        Ok(state.transition_job(job_id, &[JobStatus::Pending], |job| {
            job.status = JobStatus::Processing;
            job.started_at = Some(Utc::now());
            job.current_step = Some(STEP_PROCESSING.to_string());
        }))
    }

    async fn find_job(&self, job_id: DbId) -> StoreResult<Option<Job>> {
        Ok(self.state.lock().await.jobs.get(&job_id).cloned())
    }

    async fn list_jobs(&self, query: &JobListQuery) -> StoreResult<Vec<Job>> {
        let state = self.state.lock().await;
        Ok(state
            .jobs
            .values()
            .rev()
            .filter(|j| query.owner_ref.as_deref().map_or(true, |o| j.owner_ref == o))
            .filter(|j| query.status.map_or(true, |s| j.status == s))
            .skip(query.offset() as usize)
            .take(query.limit() as usize)
            .cloned()
            .collect())
    }

    async fn request_cancel(&self, job_id: DbId) -> StoreResult<Option<Job>> {
        let mut state = self.state.lock().await;
        let Some(job) = state.jobs.get(&job_id) else {
            return Ok(None);
        };
        if job.is_terminal() || job.cancel_requested {
            return Ok(Some(job.clone()));
        }
        state.check_write("request_cancel")?;
        Ok(state.transition_job(job_id, &ACTIVE, |job| {
            job.cancel_requested = true;
            job.current_step = Some(STEP_CANCELLING.to_string());
        }))
    }

    async fn chunk_tally(&self, job_id: DbId) -> StoreResult<ChunkTally> {
        let state = self.state.lock().await;
        Ok(ChunkTally::from_statuses(
            state
                .chunks
                .values()
                .filter(|c| c.job_id == job_id)
                .map(|c| (c.sequence_index, c.status)),
        ))
    }

    async fn record_progress(&self, job_id: DbId, update: &ProgressUpdate) -> StoreResult<Option<Job>> {
        let mut state = self.state.lock().await;
        state.check_write("record_progress")?;
        let Some(job) = state.jobs.get_mut(&job_id) else {
            return Ok(None);
        };

        job.processed_chunks = job
            .processed_chunks
            .max(update.processed_chunks.min(job.total_chunks));
        job.failed_chunk_ids.extend(update.failed_chunk_ids.iter().copied());
        job.failed_chunk_ids.sort_unstable();
        job.failed_chunk_ids.dedup();
        if !job.is_terminal() {
            job.progress_percent = job.progress_percent.max(update.progress_percent);
            if let Some(step) = &update.current_step {
                job.current_step = Some(step.clone());
            }
        }
        job.revision += 1;
        job.updated_at = Utc::now();
        Ok(Some(job.clone()))
    }

    async fn complete_job(&self, job_id: DbId, result: &serde_json::Value) -> StoreResult<Option<Job>> {
        let mut state = self.state.lock().await;
        state.check_write("complete_job")?;
        Ok(state.transition_job(job_id, &[JobStatus::Processing], |job| {
            job.status = JobStatus::Completed;
            job.result = Some(result.clone());
            job.progress_percent = COMPLETED_PERCENT;
            job.current_step = Some(STEP_COMPLETED.to_string());
            job.finished_at = Some(Utc::now());
        }))
    }

    async fn fail_job(&self, job_id: DbId, cause: FailureCause, summary: &str) -> StoreResult<Option<Job>> {
        let mut state = self.state.lock().await;
        state.check_write("fail_job")?;
        Ok(state.transition_job(job_id, &ACTIVE, |job| {
            job.status = JobStatus::Failed;
            job.failure_cause = Some(cause.as_str().to_string());
            job.error_summary = Some(summary.to_string());
            job.current_step = Some(STEP_FAILED.to_string());
            job.finished_at = Some(Utc::now());
        }))
    }

    async fn cancel_job(&self, job_id: DbId) -> StoreResult<Option<Job>> {
        let mut state = self.state.lock().await;
        state.check_write("cancel_job")?;
        Ok(state.transition_job(job_id, &ACTIVE, |job| {
            job.status = JobStatus::Cancelled;
            job.cancel_requested = true;
            job.current_step = Some(STEP_CANCELLED.to_string());
            job.finished_at = Some(Utc::now());
        }))
    }

    async fn list_chunks(&self, job_id: DbId) -> StoreResult<Vec<Chunk>> {
        let state = self.state.lock().await;
        let mut chunks: Vec<Chunk> = state
            .chunks
            .values()
            .filter(|c| c.job_id == job_id)
            .cloned()
            .collect();
        chunks.sort_by_key(|c| c.sequence_index);
        Ok(chunks)
    }

    async fn claim_next_chunk(&self, worker_id: &str, lease: Duration) -> StoreResult<Option<ChunkChange>> {
        let lease = chrono::Duration::from_std(lease)
            .map_err(|e| StoreError::Invalid(format!("lease out of range: {e}")))?;
        let mut state = self.state.lock().await;

        let candidate = state
            .chunks
            .values()
            .find(|c| {
                c.status == ChunkStatus::Queued
                    && state
                        .jobs
                        .get(&c.job_id)
                        .is_some_and(|j| j.status == JobStatus::Processing)
            })
            .map(|c| c.id);
        let Some(chunk_id) = candidate else {
            return Ok(None);
        };
        state.check_write("claim_next_chunk")?;

        let now = Utc::now();
        let Some(chunk) = state.chunks.get_mut(&chunk_id) else {
            return Ok(None);
        };
        chunk.status = ChunkStatus::Running;
        chunk.attempt_count += 1;
        chunk.claimed_by = Some(worker_id.to_string());
        chunk.lease_expires_at = Some(now + lease);
        chunk.next_retry_at = None;
        chunk.updated_at = now;
        let chunk = chunk.clone();
        let revision = state.bump(chunk.job_id);
        Ok(Some(ChunkChange { chunk, revision }))
    }

    async fn complete_chunk(
        &self,
        chunk_id: DbId,
        attempt: i32,
        result: &serde_json::Value,
    ) -> StoreResult<Option<ChunkChange>> {
        let mut state = self.state.lock().await;
        state.check_write("complete_chunk")?;
        Ok(state.fenced(chunk_id, attempt, |chunk| {
            chunk.status = ChunkStatus::Succeeded;
            chunk.result = Some(result.clone());
            chunk.lease_expires_at = None;
            chunk.finished_at = Some(Utc::now());
        }))
    }

    async fn schedule_chunk_retry(
        &self,
        chunk_id: DbId,
        attempt: i32,
        error: &ChunkError,
        next_retry_at: Timestamp,
    ) -> StoreResult<Option<ChunkChange>> {
        let mut state = self.state.lock().await;
        state.check_write("schedule_chunk_retry")?;
        Ok(state.fenced(chunk_id, attempt, |chunk| {
            chunk.status = ChunkStatus::RetryWait;
            chunk.last_error_kind = Some(error.kind.as_str().to_string());
            chunk.last_error = Some(error.message.clone());
            chunk.next_retry_at = Some(next_retry_at);
            chunk.lease_expires_at = None;
        }))
    }

    async fn fail_chunk(&self, chunk_id: DbId, attempt: i32, error: &ChunkError) -> StoreResult<Option<ChunkChange>> {
        let mut state = self.state.lock().await;
        state.check_write("fail_chunk")?;
        Ok(state.fenced(chunk_id, attempt, |chunk| {
            chunk.status = ChunkStatus::Failed;
            chunk.last_error_kind = Some(error.kind.as_str().to_string());
            chunk.last_error = Some(error.message.clone());
            chunk.lease_expires_at = None;
            chunk.finished_at = Some(Utc::now());
        }))
    }

    async fn cancel_running_chunk(&self, chunk_id: DbId, attempt: i32) -> StoreResult<Option<ChunkChange>> {
        let mut state = self.state.lock().await;
        state.check_write("cancel_running_chunk")?;
        Ok(state.fenced(chunk_id, attempt, |chunk| {
            chunk.status = ChunkStatus::Cancelled;
            chunk.lease_expires_at = None;
            chunk.finished_at = Some(Utc::now());
        }))
    }

    async fn cancel_pending_chunks(&self, job_id: DbId) -> StoreResult<Vec<ChunkChange>> {
        let mut state = self.state.lock().await;
        state.check_write("cancel_pending_chunks")?;
        let mut ids: Vec<(i32, DbId)> = state
            .chunks
            .values()
            .filter(|c| {
                c.job_id == job_id
                    && matches!(c.status, ChunkStatus::Queued | ChunkStatus::RetryWait)
            })
            .map(|c| (c.sequence_index, c.id))
            .collect();
        ids.sort_unstable();
        Ok(ids
            .into_iter()
            .filter_map(|(_, id)| state.cancel_waiting(id))
            .collect())
    }

    async fn requeue_due_retries(&self, now: Timestamp) -> StoreResult<Vec<ChunkChange>> {
        let mut state = self.state.lock().await;
        let due: Vec<DbId> = state
            .chunks
            .values()
            .filter(|c| {
                c.status == ChunkStatus::RetryWait && c.next_retry_at.is_some_and(|at| at <= now)
            })
            .map(|c| c.id)
            .collect();
        if due.is_empty() {
            return Ok(Vec::new());
        }
        state.check_write("requeue_due_retries")?;

        let mut changes = Vec::with_capacity(due.len());
        for chunk_id in due {
            let Some(job_id) = state.chunks.get(&chunk_id).map(|c| c.job_id) else {
                continue;
            };
            let change = match retry_recovery(state.jobs.get(&job_id)) {
                Recovery::Requeue => {
                    let Some(chunk) = state.chunks.get_mut(&chunk_id) else {
                        continue;
                    };
                    chunk.status = ChunkStatus::Queued;
                    chunk.next_retry_at = None;
                    chunk.claimed_by = None;
                    chunk.updated_at = Utc::now();
                    let chunk = chunk.clone();
                    let revision = state.bump(job_id);
                    Some(ChunkChange { chunk, revision })
                }
                Recovery::Cancel | Recovery::Fail => state.cancel_waiting(chunk_id),
            };
            changes.extend(change);
        }
        Ok(changes)
    }

    async fn reclaim_expired_leases(&self, now: Timestamp, max_attempts: i32) -> StoreResult<Vec<ChunkChange>> {
        let mut state = self.state.lock().await;
        let expired: Vec<Chunk> = state
            .chunks
            .values()
            .filter(|c| {
                c.status == ChunkStatus::Running && c.lease_expires_at.is_some_and(|at| at <= now)
            })
            .cloned()
            .collect();
        if expired.is_empty() {
            return Ok(Vec::new());
        }
        state.check_write("reclaim_expired_leases")?;

        let mut changes = Vec::with_capacity(expired.len());
        for chunk in expired {
            let error = lease_expired_error(&chunk);
            let recovery = lease_recovery(state.jobs.get(&chunk.job_id), &chunk, max_attempts);
            let change = state.fenced(chunk.id, chunk.attempt_count, |c| {
                c.last_error_kind = Some(error.kind.as_str().to_string());
                c.last_error = Some(error.message.clone());
                c.lease_expires_at = None;
                match recovery {
                    Recovery::Requeue => {
                        c.status = ChunkStatus::Queued;
                        c.claimed_by = None;
                    }
                    Recovery::Fail => {
                        c.status = ChunkStatus::Failed;
                        c.finished_at = Some(Utc::now());
                    }
                    Recovery::Cancel => {
                        c.status = ChunkStatus::Cancelled;
                        c.finished_at = Some(Utc::now());
                    }
                }
            });
            changes.extend(change);
        }
        Ok(changes)
    }
}
