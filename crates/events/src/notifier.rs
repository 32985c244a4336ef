//! Best-effort progress notifier.
//!
//! The store is the source of truth; events are a derived view. Publishing
//! never fails the caller, and every subscription starts from a snapshot
//! read from the store so a late subscriber sees the same state a poller
//! would.

use std::sync::Arc;

use chunkflow_core::types::DbId;
use chunkflow_db::models::job::Job;
use chunkflow_db::{ChunkChange, JobStore};
use tokio::sync::broadcast::{self, error::RecvError};

use crate::bus::{EventBus, JobEvent};
use crate::error::EventError;
use crate::sink::EventSink;

/// Publishes job events and hands out per-job subscriptions.
#[derive(Clone)]
pub struct Notifier {
    bus: Arc<EventBus>,
    sink: Arc<dyn EventSink>,
    store: Arc<dyn JobStore>,
}

impl Notifier {
    /// `sink` receives published events; `bus` is what subscribers listen
    /// on. They differ when events travel through Postgres and come back
    /// via the relay.
    pub fn new(bus: Arc<EventBus>, sink: Arc<dyn EventSink>, store: Arc<dyn JobStore>) -> Self {
        Self { bus, sink, store }
    }

    /// Single-process notifier that publishes straight onto `bus`.
    pub fn local(bus: Arc<EventBus>, store: Arc<dyn JobStore>) -> Self {
        let sink: Arc<dyn EventSink> = bus.clone();
        Self::new(bus, sink, store)
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Emit `event`. Failures are logged and swallowed.
    pub async fn publish(&self, event: JobEvent) {
        if let Err(e) = self.sink.emit(&event).await {
            tracing::warn!(
                job_id = event.job_id,
                revision = event.revision,
                event_type = %event.event_type,
                error = %e,
                "Failed to publish job event",
            );
        }
    }

    pub async fn job_changed(&self, event_type: &str, job: &Job) {
        self.publish(JobEvent::for_job(event_type, job)).await;
    }

    pub async fn chunk_changed(&self, event_type: &str, change: &ChunkChange) {
        self.publish(JobEvent::for_chunk(event_type, change)).await;
    }

    /// Subscribe to one job's events.
    ///
    /// Subscribes to the bus before reading the store, so no transition
    /// committed after the snapshot can be missed.
    pub async fn subscribe(&self, job_id: DbId) -> Result<JobSubscription, EventError> {
        let receiver = self.bus.subscribe();
        let job = self
            .store
            .find_job(job_id)
            .await?
            .ok_or(EventError::JobNotFound(job_id))?;

        Ok(JobSubscription {
            job_id,
            receiver,
            store: Arc::clone(&self.store),
            pending: Some(JobEvent::snapshot(&job)),
            last_revision: None,
            finished: false,
        })
    }
}

/// Ordered, de-duplicated event stream for a single job.
///
/// Yields the snapshot first, then only events with a revision newer than
/// the last one delivered. Ends after the job's terminal event.
pub struct JobSubscription {
    job_id: DbId,
    receiver: broadcast::Receiver<JobEvent>,
    store: Arc<dyn JobStore>,
    pending: Option<JobEvent>,
    last_revision: Option<i64>,
    finished: bool,
}

impl JobSubscription {
    pub fn job_id(&self) -> DbId {
        self.job_id
    }

    /// Next event for this job, or `None` once the job is terminal or the
    /// bus is gone.
    pub async fn next(&mut self) -> Option<JobEvent> {
        if self.finished {
            return None;
        }
        if let Some(snapshot) = self.pending.take() {
            return Some(self.deliver(snapshot));
        }

        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if event.job_id == self.job_id && self.is_newer(&event) {
                        return Some(self.deliver(event));
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        job_id = self.job_id,
                        skipped,
                        "Job subscription lagged, resyncing from store",
                    );
                    if let Some(snapshot) = self.resync().await {
                        return Some(self.deliver(snapshot));
                    }
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    fn is_newer(&self, event: &JobEvent) -> bool {
        self.last_revision.map_or(true, |last| event.revision > last)
    }

    fn deliver(&mut self, event: JobEvent) -> JobEvent {
        self.last_revision = Some(event.revision);
        self.finished = event.is_terminal();
        event
    }

    async fn resync(&self) -> Option<JobEvent> {
        match self.store.find_job(self.job_id).await {
            Ok(Some(job)) => {
                let snapshot = JobEvent::snapshot(&job);
                self.is_newer(&snapshot).then_some(snapshot)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(job_id = self.job_id, error = %e, "Resync read failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chunkflow_core::job_events::{
        EVENT_CHUNK_STARTED, EVENT_JOB_COMPLETED, EVENT_JOB_PROGRESS, EVENT_JOB_SNAPSHOT,
    };
    use chunkflow_core::settings::ExecutionSettings;
    use chunkflow_db::models::job::{NewJob, ProgressUpdate};
    use chunkflow_db::MemoryStore;
    use serde_json::json;

    use super::*;

    async fn setup(capacity: usize) -> (Arc<MemoryStore>, Notifier, Job) {
        let store = Arc::new(MemoryStore::new());
        let job = store
            .create_job(
                &NewJob {
                    owner_ref: "user-1".to_string(),
                    settings: ExecutionSettings::default(),
                },
                &[json!("a"), json!("b")],
            )
            .await
            .unwrap();
        let job = store.start_job(job.id).await.unwrap().unwrap();
        let notifier = Notifier::local(Arc::new(EventBus::new(capacity)), store.clone());
        (store, notifier, job)
    }

    fn progress(processed: i32) -> ProgressUpdate {
        ProgressUpdate {
            processed_chunks: processed,
            progress_percent: (processed * 50) as i16,
            failed_chunk_ids: vec![],
            current_step: None,
        }
    }

    #[tokio::test]
    async fn snapshot_comes_first_and_matches_store() {
        let (store, notifier, job) = setup(16).await;
        let mut sub = notifier.subscribe(job.id).await.unwrap();

        let first = sub.next().await.unwrap();
        assert_eq!(first.event_type, EVENT_JOB_SNAPSHOT);
        let stored = store.find_job(job.id).await.unwrap().unwrap();
        assert_eq!(first.job, Some(stored.status_view()));
    }

    #[tokio::test]
    async fn unknown_job_is_rejected() {
        let (_store, notifier, _job) = setup(16).await;
        assert!(matches!(
            notifier.subscribe(999).await,
            Err(EventError::JobNotFound(999))
        ));
    }

    #[tokio::test]
    async fn stale_duplicate_and_foreign_events_are_dropped() {
        let (store, notifier, job) = setup(16).await;
        let mut sub = notifier.subscribe(job.id).await.unwrap();
        sub.next().await.unwrap();

        // Older than the snapshot.
        notifier.job_changed(EVENT_JOB_PROGRESS, &job).await;
        // Another job's event.
        let mut other = job.clone();
        other.id = job.id + 100;
        other.revision = 99;
        notifier.job_changed(EVENT_JOB_PROGRESS, &other).await;

        let newer = store.record_progress(job.id, &progress(1)).await.unwrap().unwrap();
        notifier.job_changed(EVENT_JOB_PROGRESS, &newer).await;
        notifier.job_changed(EVENT_JOB_PROGRESS, &newer).await;

        let claim = store
            .claim_next_chunk("w1", std::time::Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        notifier.chunk_changed(EVENT_CHUNK_STARTED, &claim).await;

        let event = sub.next().await.unwrap();
        assert_eq!(event.revision, newer.revision);
        let event = sub.next().await.unwrap();
        assert_eq!(event.event_type, EVENT_CHUNK_STARTED);
        assert_eq!(event.revision, claim.revision);
    }

    #[tokio::test]
    async fn lagged_subscription_resyncs_from_store() {
        let (store, notifier, job) = setup(2).await;
        let mut sub = notifier.subscribe(job.id).await.unwrap();
        sub.next().await.unwrap();

        let mut latest = job.clone();
        for processed in 0..5 {
            latest = store
                .record_progress(job.id, &progress(processed.min(1)))
                .await
                .unwrap()
                .unwrap();
            notifier.job_changed(EVENT_JOB_PROGRESS, &latest).await;
        }

        let resynced = sub.next().await.unwrap();
        assert_eq!(resynced.event_type, EVENT_JOB_SNAPSHOT);
        assert_eq!(resynced.revision, latest.revision);

        // Buffered events at or below the resynced revision are dropped.
        store.record_progress(job.id, &progress(1)).await.unwrap();
        let after = store.find_job(job.id).await.unwrap().unwrap();
        notifier.job_changed(EVENT_JOB_PROGRESS, &after).await;
        let next = sub.next().await.unwrap();
        assert_eq!(next.revision, after.revision);
    }

    #[tokio::test]
    async fn subscription_ends_after_terminal_event() {
        let (store, notifier, job) = setup(16).await;
        let mut sub = notifier.subscribe(job.id).await.unwrap();
        sub.next().await.unwrap();

        let done = store.complete_job(job.id, &json!({"text": "ok"})).await.unwrap().unwrap();
        notifier.job_changed(EVENT_JOB_COMPLETED, &done).await;

        let event = sub.next().await.unwrap();
        assert!(event.is_terminal());
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn terminal_snapshot_ends_immediately() {
        let (store, notifier, job) = setup(16).await;
        store.cancel_job(job.id).await.unwrap().unwrap();

        let mut sub = notifier.subscribe(job.id).await.unwrap();
        let snapshot = sub.next().await.unwrap();
        assert!(snapshot.is_terminal());
        assert!(sub.next().await.is_none());
    }
}
