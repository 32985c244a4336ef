//! Boundary traits for the engine's external collaborators.

use async_trait::async_trait;
use chunkflow_core::chunk_error::ChunkError;
use chunkflow_core::settings::ExecutionSettings;

/// Splits a document into ordered chunk payloads.
///
/// Must be deterministic: the same input always yields the same payloads.
pub trait Chunker: Send + Sync {
    fn split(&self, input: &str) -> Vec<serde_json::Value>;
}

/// Processes one chunk payload.
///
/// Implementations classify every failure into a [`ChunkError`] kind so the
/// retry policy can tell transient failures from permanent ones. The
/// executor bounds each call with the job's processor timeout.
#[async_trait]
pub trait ChunkProcessor: Send + Sync {
    async fn process(
        &self,
        payload: &serde_json::Value,
        settings: &ExecutionSettings,
    ) -> Result<serde_json::Value, ChunkError>;
}

/// One chunk as seen by the reassembler.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkPart {
    pub sequence_index: i32,
    pub payload: serde_json::Value,
    /// `None` when the chunk did not succeed.
    pub result: Option<serde_json::Value>,
}

/// Combines per-chunk results, in sequence order, into the job result.
pub trait Reassembler: Send + Sync {
    fn reassemble(&self, parts: &[ChunkPart]) -> Result<serde_json::Value, String>;
}
