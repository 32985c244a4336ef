//! Job entity, submission DTO, status view, and aggregation DTOs.

use chunkflow_core::error::CoreError;
use chunkflow_core::settings::ExecutionSettings;
use chunkflow_core::status::{ChunkStatus, FailureCause, JobStatus};
use chunkflow_core::types::{DbId, Timestamp};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A row from the `jobs` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Job {
    pub id: DbId,
    pub owner_ref: String,
    #[sqlx(rename = "status_id", try_from = "i16")]
    pub status: JobStatus,
    pub settings: serde_json::Value,
    pub total_chunks: i32,
    pub processed_chunks: i32,
    pub failed_chunk_ids: Vec<i32>,
    pub progress_percent: i16,
    pub current_step: Option<String>,
    pub cancel_requested: bool,
    pub error_summary: Option<String>,
    pub failure_cause: Option<String>,
    pub result: Option<serde_json::Value>,
    pub revision: i64,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub finished_at: Option<Timestamp>,
    pub updated_at: Timestamp,
}

impl Job {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Decode the execution settings stored at submission time.
    pub fn execution_settings(&self) -> Result<ExecutionSettings, CoreError> {
        ExecutionSettings::from_value(&self.settings)
    }

    pub fn failure_cause(&self) -> Option<FailureCause> {
        self.failure_cause.as_deref().and_then(FailureCause::parse)
    }

    /// Client-facing status projection (no payloads, no result).
    pub fn status_view(&self) -> JobStatusView {
        JobStatusView {
            job_id: self.id,
            owner_ref: self.owner_ref.clone(),
            status: self.status,
            progress_percent: self.progress_percent,
            current_step: self.current_step.clone(),
            processed_chunks: self.processed_chunks,
            total_chunks: self.total_chunks,
            failed_chunk_ids: self.failed_chunk_ids.clone(),
            cancel_requested: self.cancel_requested,
            error_summary: self.error_summary.clone(),
            failure_cause: self.failure_cause(),
            revision: self.revision,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }
}

/// What every status response and job event carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusView {
    pub job_id: DbId,
    pub owner_ref: String,
    pub status: JobStatus,
    pub progress_percent: i16,
    pub current_step: Option<String>,
    pub processed_chunks: i32,
    pub total_chunks: i32,
    pub failed_chunk_ids: Vec<i32>,
    pub cancel_requested: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_cause: Option<FailureCause>,
    pub revision: i64,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub finished_at: Option<Timestamp>,
}

/// DTO for creating a job together with its chunks.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub owner_ref: String,
    pub settings: ExecutionSettings,
}

/// Filter and pagination for job listings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobListQuery {
    pub owner_ref: Option<String>,
    pub status: Option<JobStatus>,
    /// Maximum number of results. Defaults to 50, capped at 100.
    pub limit: Option<i64>,
    /// Number of results to skip. Defaults to 0.
    pub offset: Option<i64>,
}

/// Maximum page size for job listing.
pub const MAX_LIST_LIMIT: i64 = 100;

/// Default page size for job listing.
pub const DEFAULT_LIST_LIMIT: i64 = 50;

impl JobListQuery {
    pub fn limit(&self) -> i64 {
        self.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT)
    }

    pub fn offset(&self) -> i64 {
        self.offset.unwrap_or(0).max(0)
    }
}

/// Per-status chunk counts for one job, recounted from chunk rows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkTally {
    pub total: i32,
    pub succeeded: i32,
    pub failed: i32,
    pub cancelled: i32,
    /// Sequence indexes of failed chunks, ascending.
    pub failed_indexes: Vec<i32>,
}

impl ChunkTally {
    /// Tally `(sequence_index, status)` pairs.
    pub fn from_statuses(statuses: impl IntoIterator<Item = (i32, ChunkStatus)>) -> Self {
        let mut tally = ChunkTally::default();
        for (sequence_index, status) in statuses {
            tally.total += 1;
            match status {
                ChunkStatus::Succeeded => tally.succeeded += 1,
                ChunkStatus::Failed => {
                    tally.failed += 1;
                    tally.failed_indexes.push(sequence_index);
                }
                ChunkStatus::Cancelled => tally.cancelled += 1,
                ChunkStatus::Queued | ChunkStatus::Running | ChunkStatus::RetryWait => {}
            }
        }
        tally.failed_indexes.sort_unstable();
        tally
    }

    /// Chunks in any terminal state.
    pub fn processed(&self) -> i32 {
        self.succeeded + self.failed + self.cancelled
    }

    pub fn all_terminal(&self) -> bool {
        self.total > 0 && self.processed() >= self.total
    }
}

/// Aggregate fields the coordinator writes after a chunk turns terminal.
///
/// Stores apply this monotonically: counts and percentages only grow and
/// failed ids are unioned, so an update computed from an older tally can
/// never roll a newer one back.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub processed_chunks: i32,
    pub progress_percent: i16,
    pub failed_chunk_ids: Vec<i32>,
    pub current_step: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tally_counts_terminal_states_and_sorts_failures() {
        let tally = ChunkTally::from_statuses([
            (3, ChunkStatus::Failed),
            (0, ChunkStatus::Succeeded),
            (1, ChunkStatus::Failed),
            (2, ChunkStatus::Running),
            (4, ChunkStatus::Cancelled),
            (5, ChunkStatus::RetryWait),
        ]);
        assert_eq!(tally.total, 6);
        assert_eq!(tally.succeeded, 1);
        assert_eq!(tally.failed, 2);
        assert_eq!(tally.cancelled, 1);
        assert_eq!(tally.processed(), 4);
        assert_eq!(tally.failed_indexes, vec![1, 3]);
        assert!(!tally.all_terminal());
    }

    #[test]
    fn empty_tally_is_never_all_terminal() {
        assert!(!ChunkTally::default().all_terminal());
    }

    #[test]
    fn list_query_clamps_pagination() {
        let query = JobListQuery {
            limit: Some(1000),
            offset: Some(-5),
            ..Default::default()
        };
        assert_eq!(query.limit(), MAX_LIST_LIMIT);
        assert_eq!(query.offset(), 0);
        assert_eq!(JobListQuery::default().limit(), DEFAULT_LIST_LIMIT);
    }
}
