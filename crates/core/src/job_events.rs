//! Event type constants for job and chunk lifecycle events.
//!
//! Used by the notifier when publishing transitions and by WebSocket
//! clients to dispatch on the `event_type` field.

/// Synthetic current-state event sent first on every subscription.
pub const EVENT_JOB_SNAPSHOT: &str = "job.snapshot";

/// Job moved from `pending` to `processing`.
pub const EVENT_JOB_STARTED: &str = "job.started";

/// Aggregate progress changed (processed count, percent, current step).
pub const EVENT_JOB_PROGRESS: &str = "job.progress";

/// Cancellation was requested; chunks are winding down.
pub const EVENT_JOB_CANCEL_REQUESTED: &str = "job.cancel_requested";

/// Job completed and its result was reassembled.
pub const EVENT_JOB_COMPLETED: &str = "job.completed";

/// Job failed (threshold abort, reassembly error, or durability error).
pub const EVENT_JOB_FAILED: &str = "job.failed";

/// Job reached `cancelled` after every chunk stopped.
pub const EVENT_JOB_CANCELLED: &str = "job.cancelled";

/// A chunk was claimed by a worker and an attempt started.
pub const EVENT_CHUNK_STARTED: &str = "chunk.started";

/// A chunk attempt failed transiently and a retry was scheduled.
pub const EVENT_CHUNK_RETRY_SCHEDULED: &str = "chunk.retry_scheduled";

/// A chunk went back on the queue (retry delay elapsed or lease expired).
pub const EVENT_CHUNK_REQUEUED: &str = "chunk.requeued";

/// A chunk succeeded.
pub const EVENT_CHUNK_SUCCEEDED: &str = "chunk.succeeded";

/// A chunk failed permanently or exhausted its retries.
pub const EVENT_CHUNK_FAILED: &str = "chunk.failed";

/// A chunk was cancelled.
pub const EVENT_CHUNK_CANCELLED: &str = "chunk.cancelled";
