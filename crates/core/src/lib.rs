//! Pure domain layer for the chunkflow job engine.
//!
//! No I/O lives here: status enums and state machine rules, the chunk
//! error taxonomy, retry and progress arithmetic, and the execution
//! settings value handed to chunk processors.

pub mod chunk_error;
pub mod error;
pub mod job_events;
pub mod progress;
pub mod retry;
pub mod settings;
pub mod status;
pub mod types;
