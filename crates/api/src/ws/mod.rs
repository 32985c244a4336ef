//! WebSocket event stream for a single job.
//!
//! Clients connect to `/api/v1/jobs/{id}/events` and receive the job's
//! snapshot followed by every later transition as JSON text frames. The
//! server closes the socket after the terminal event.

mod job_events;

pub use job_events::{encode_event, job_events};
