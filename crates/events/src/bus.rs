//! In-process event bus backed by a `tokio::sync::broadcast` channel.
//!
//! [`EventBus`] is the local publish/subscribe hub for [`JobEvent`]s. It is
//! shared via `Arc<EventBus>` between the notifier, the Postgres relay, and
//! WebSocket subscribers.

use chrono::{DateTime, Utc};
use chunkflow_core::job_events::{
    EVENT_JOB_CANCELLED, EVENT_JOB_COMPLETED, EVENT_JOB_FAILED, EVENT_JOB_SNAPSHOT,
};
use chunkflow_core::types::DbId;
use chunkflow_db::models::chunk::ChunkView;
use chunkflow_db::models::job::{Job, JobStatusView};
use chunkflow_db::ChunkChange;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// JobEvent
// ---------------------------------------------------------------------------

/// A committed job or chunk transition.
///
/// `revision` is the job revision the transition produced. Subscribers use
/// it to order events and to drop duplicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    /// Dot-separated event name, e.g. `"chunk.succeeded"`.
    pub event_type: String,

    pub job_id: DbId,

    pub revision: i64,

    /// Job status after the transition (job-level events only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<JobStatusView>,

    /// Chunk state after the transition (chunk-level events only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<ChunkView>,

    pub timestamp: DateTime<Utc>,
}

impl JobEvent {
    /// Job-level event carrying the job's status view.
    pub fn for_job(event_type: impl Into<String>, job: &Job) -> Self {
        Self {
            event_type: event_type.into(),
            job_id: job.id,
            revision: job.revision,
            job: Some(job.status_view()),
            chunk: None,
            timestamp: Utc::now(),
        }
    }

    /// Chunk-level event for a committed chunk transition.
    pub fn for_chunk(event_type: impl Into<String>, change: &ChunkChange) -> Self {
        Self {
            event_type: event_type.into(),
            job_id: change.chunk.job_id,
            revision: change.revision,
            job: None,
            chunk: Some(change.chunk.view()),
            timestamp: Utc::now(),
        }
    }

    /// Synthetic current-state event sent first on every subscription.
    pub fn snapshot(job: &Job) -> Self {
        Self::for_job(EVENT_JOB_SNAPSHOT, job)
    }

    /// Whether this event announces the job's final state.
    ///
    /// A snapshot of an already terminal job counts as terminal.
    pub fn is_terminal(&self) -> bool {
        match self.event_type.as_str() {
            EVENT_JOB_COMPLETED | EVENT_JOB_FAILED | EVENT_JOB_CANCELLED => true,
            EVENT_JOB_SNAPSHOT => self.job.as_ref().is_some_and(|j| j.status.is_terminal()),
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Default buffer capacity for the broadcast channel.
pub const DEFAULT_CAPACITY: usize = 1024;

/// In-process fan-out event bus.
///
/// When the buffer is full the oldest unconsumed events are dropped and slow
/// receivers observe `RecvError::Lagged`; [`JobSubscription`](crate::JobSubscription)
/// recovers from that by re-reading the job from the store.
pub struct EventBus {
    sender: broadcast::Sender<JobEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    pub fn publish(&self, event: JobEvent) {
        // A send error only means there are zero receivers.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use chunkflow_core::job_events::EVENT_JOB_PROGRESS;
    use chunkflow_core::status::JobStatus;
    use serde_json::json;

    use super::*;

    fn job(status: JobStatus) -> Job {
        let now = Utc::now();
        Job {
            id: 7,
            owner_ref: "user-1".to_string(),
            status,
            settings: json!({}),
            total_chunks: 4,
            processed_chunks: 1,
            failed_chunk_ids: vec![],
            progress_percent: 25,
            current_step: Some("Processed 1 of 4 chunks".to_string()),
            cancel_requested: false,
            error_summary: None,
            failure_cause: None,
            result: None,
            revision: 3,
            created_at: now,
            started_at: Some(now),
            finished_at: None,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn publish_reaches_every_subscriber() {
        let bus = EventBus::default();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(JobEvent::for_job(EVENT_JOB_PROGRESS, &job(JobStatus::Processing)));

        let a = rx1.recv().await.unwrap();
        let b = rx2.recv().await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.revision, 3);
        assert_eq!(a.job.as_ref().map(|j| j.progress_percent), Some(25));
    }

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::default();
        bus.publish(JobEvent::snapshot(&job(JobStatus::Pending)));
        assert_eq!(bus.receiver_count(), 0);
    }

    #[test]
    fn terminal_detection() {
        let active = JobEvent::snapshot(&job(JobStatus::Processing));
        let done = JobEvent::snapshot(&job(JobStatus::Completed));
        let failed = JobEvent::for_job(EVENT_JOB_FAILED, &job(JobStatus::Failed));
        assert!(!active.is_terminal());
        assert!(done.is_terminal());
        assert!(failed.is_terminal());
    }

    #[test]
    fn job_event_serializes_without_empty_chunk() {
        let event = JobEvent::for_job(EVENT_JOB_PROGRESS, &job(JobStatus::Processing));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event_type"], "job.progress");
        assert_eq!(value["job"]["status"], "processing");
        assert!(value.get("chunk").is_none());
    }
}
