//! Chunk entity and its client-facing view.

use chunkflow_core::chunk_error::ErrorKind;
use chunkflow_core::status::ChunkStatus;
use chunkflow_core::types::{DbId, Timestamp};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A row from the `chunks` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Chunk {
    pub id: DbId,
    pub job_id: DbId,
    pub sequence_index: i32,
    #[sqlx(rename = "status_id", try_from = "i16")]
    pub status: ChunkStatus,
    pub attempt_count: i32,
    pub payload: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub last_error_kind: Option<String>,
    pub last_error: Option<String>,
    pub next_retry_at: Option<Timestamp>,
    pub claimed_by: Option<String>,
    pub lease_expires_at: Option<Timestamp>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub finished_at: Option<Timestamp>,
}

impl Chunk {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn last_error_kind(&self) -> Option<ErrorKind> {
        self.last_error_kind.as_deref().and_then(ErrorKind::parse)
    }

    pub fn view(&self) -> ChunkView {
        ChunkView {
            chunk_id: self.id,
            job_id: self.job_id,
            sequence_index: self.sequence_index,
            status: self.status,
            attempt_count: self.attempt_count,
            last_error_kind: self.last_error_kind(),
            last_error: self.last_error.clone(),
            next_retry_at: self.next_retry_at,
            finished_at: self.finished_at,
        }
    }
}

/// Chunk state without payload or result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkView {
    pub chunk_id: DbId,
    pub job_id: DbId,
    pub sequence_index: i32,
    pub status: ChunkStatus,
    pub attempt_count: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<Timestamp>,
}
