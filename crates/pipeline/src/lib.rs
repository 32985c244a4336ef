//! The chunked job engine.
//!
//! - [`processor`]: boundary traits for the chunker, the chunk processor,
//!   and the reassembler.
//! - [`text`]: overlapping text chunker and its matching reassembler.
//! - [`executor`]: runs one claimed chunk through the processor and the
//!   retry policy.
//! - [`coordinator`]: owns the job state machine: submit, aggregate,
//!   finalize, cancel.
//! - [`pool`]: N claim loops plus the maintenance sweep.
//! - [`config`]: environment-driven engine configuration.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod pool;
pub mod processor;
pub mod text;

pub use config::{ConfigError, EngineConfig};
pub use coordinator::{JobCoordinator, JobRequest};
pub use error::EngineError;
pub use executor::{ChunkExecutor, ChunkOutcome};
pub use pool::{PoolConfig, WorkerPool};
pub use processor::{ChunkPart, ChunkProcessor, Chunker, Reassembler};
pub use text::{OverlapChunker, OverlapReassembler};
