//! Chunk worker process.
//!
//! - [`processor`]: the HTTP [`ChunkProcessor`](chunkflow_pipeline::ChunkProcessor).
//! - [`runtime`]: wiring of coordinator, executor, and pool.
//! - [`config`]: worker configuration from the environment.
//! - [`telemetry`]: tracing setup and shutdown signal handling.

pub mod config;
pub mod processor;
pub mod runtime;
pub mod telemetry;

pub use config::WorkerConfig;
pub use processor::{HttpChunkProcessor, ProcessorConfig};
