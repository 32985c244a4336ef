//! End-to-end engine scenarios against the in-memory store.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use chrono::Utc;
use chunkflow_core::chunk_error::{ChunkError, ErrorKind};
use chunkflow_core::job_events::{EVENT_JOB_COMPLETED, EVENT_JOB_SNAPSHOT};
use chunkflow_core::retry::RetryPolicy;
use chunkflow_core::settings::ExecutionSettings;
use chunkflow_core::status::{ChunkStatus, FailureCause, JobStatus};
use chunkflow_db::models::job::{Job, JobListQuery, NewJob};
use chunkflow_db::{JobStore, MemoryStore};
use chunkflow_events::{EventBus, Notifier};
use chunkflow_pipeline::{
    ChunkExecutor, ChunkOutcome, ChunkProcessor, Chunker, EngineError, JobCoordinator, JobRequest,
    OverlapReassembler, PoolConfig, WorkerPool,
};
use serde_json::{json, Value};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

/// Splits on `|`, one chunk per piece, no overlap.
struct PipeChunker;

impl Chunker for PipeChunker {
    fn split(&self, input: &str) -> Vec<Value> {
        input
            .split('|')
            .filter(|piece| !piece.is_empty())
            .map(|piece| json!({ "text": piece, "overlap_chars": 0 }))
            .collect()
    }
}

enum Step {
    Fail(ChunkError),
    Hang,
}

/// Upper-cases the chunk text unless a scripted step says otherwise.
#[derive(Default)]
struct ScriptedProcessor {
    script: Mutex<HashMap<String, VecDeque<Step>>>,
    calls: Mutex<HashMap<String, usize>>,
    total_calls: AtomicUsize,
}

impl ScriptedProcessor {
    fn script(self, text: &str, steps: Vec<Step>) -> Self {
        self.script
            .lock()
            .unwrap()
            .insert(text.to_string(), steps.into());
        self
    }

    fn calls_for(&self, text: &str) -> usize {
        self.calls.lock().unwrap().get(text).copied().unwrap_or(0)
    }

    fn total_calls(&self) -> usize {
        self.total_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChunkProcessor for ScriptedProcessor {
    async fn process(&self, payload: &Value, _settings: &ExecutionSettings) -> Result<Value, ChunkError> {
        let text = payload["text"].as_str().unwrap_or_default().to_string();
        self.total_calls.fetch_add(1, Ordering::SeqCst);
        *self.calls.lock().unwrap().entry(text.clone()).or_default() += 1;

        let step = self
            .script
            .lock()
            .unwrap()
            .get_mut(&text)
            .and_then(|steps| steps.pop_front());
        match step {
            Some(Step::Fail(error)) => Err(error),
            Some(Step::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(json!({ "text": "too late" }))
            }
            None => Ok(json!({ "text": text.to_uppercase() })),
        }
    }
}

/// Blocks every call until released.
#[derive(Default)]
struct GatedProcessor {
    started: Notify,
    release: Notify,
    calls: AtomicUsize,
}

#[async_trait]
impl ChunkProcessor for GatedProcessor {
    async fn process(&self, payload: &Value, _settings: &ExecutionSettings) -> Result<Value, ChunkError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.started.notify_one();
        self.release.notified().await;
        Ok(payload.clone())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Engine {
    store: Arc<MemoryStore>,
    notifier: Notifier,
    coordinator: Arc<JobCoordinator>,
    executor: Arc<ChunkExecutor>,
    pool: Arc<WorkerPool>,
}

fn retry_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(100),
        jitter_ratio: 0.0,
    }
}

fn pool_config() -> PoolConfig {
    PoolConfig {
        worker_count: 2,
        poll_interval: Duration::from_millis(10),
        lease: Duration::from_secs(30),
        maintenance_interval: Duration::from_millis(10),
        max_attempts: retry_policy().max_attempts,
    }
}

fn engine(processor: Arc<dyn ChunkProcessor>, discard_threshold: f64) -> Engine {
    let store = Arc::new(MemoryStore::new());
    let dyn_store: Arc<dyn JobStore> = store.clone();
    let notifier = Notifier::local(Arc::new(EventBus::default()), dyn_store.clone());
    let coordinator = Arc::new(
        JobCoordinator::new(
            dyn_store.clone(),
            notifier.clone(),
            Arc::new(PipeChunker),
            Arc::new(OverlapReassembler),
            discard_threshold,
            pool_config().lease,
        )
        .unwrap(),
    );
    let executor = Arc::new(ChunkExecutor::new(
        dyn_store.clone(),
        processor,
        notifier.clone(),
        coordinator.clone(),
        retry_policy(),
    ));
    let pool = Arc::new(WorkerPool::new(
        dyn_store,
        executor.clone(),
        coordinator.clone(),
        notifier.clone(),
        pool_config(),
    ));
    Engine {
        store,
        notifier,
        coordinator,
        executor,
        pool,
    }
}

fn request(input: &str) -> JobRequest {
    JobRequest {
        owner_ref: "user-1".to_string(),
        input: input.to_string(),
        settings: ExecutionSettings::with_timeout(Duration::from_millis(50)),
    }
}

impl Engine {
    /// Run claim loops and maintenance sweeps inline until nothing is left.
    async fn drain(&self) {
        for _ in 0..100 {
            let worked = self.pool.run_once("test-worker").await.unwrap();
            if worked {
                continue;
            }
            // Pretend every retry delay has elapsed.
            let touched = self
                .pool
                .maintain(Utc::now() + chrono::Duration::hours(1))
                .await
                .unwrap();
            if touched == 0 {
                return;
            }
        }
        panic!("engine did not settle");
    }

    async fn job(&self, job_id: i64) -> Job {
        self.coordinator.status(job_id).await.unwrap()
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn all_chunks_succeed_first_time() {
    let processor = Arc::new(ScriptedProcessor::default());
    let engine = engine(processor.clone(), 0.5);

    let job = engine.coordinator.submit(request("a|b|c|d")).await.unwrap();
    assert_eq!(job.status, JobStatus::Processing);
    assert_eq!(job.total_chunks, 4);

    engine.drain().await;

    let job = engine.job(job.id).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress_percent, 100);
    assert_eq!(job.processed_chunks, 4);
    assert!(job.failed_chunk_ids.is_empty());
    assert_eq!(job.result.as_ref().unwrap()["text"], "ABCD");
    assert_eq!(processor.total_calls(), 4);

    let chunks = engine.coordinator.chunks(job.id).await.unwrap();
    assert!(chunks
        .iter()
        .all(|c| c.status == ChunkStatus::Succeeded && c.attempt_count == 1));
}

#[tokio::test]
async fn permanent_failure_within_threshold_completes_with_gap() {
    let processor = Arc::new(
        ScriptedProcessor::default()
            .script("d", vec![Step::Fail(ChunkError::invalid_payload("unparseable"))]),
    );
    let engine = engine(processor.clone(), 0.5);

    let job = engine.coordinator.submit(request("a|b|c|d")).await.unwrap();
    engine.drain().await;

    let job = engine.job(job.id).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.failed_chunk_ids, vec![3]);
    assert_eq!(job.processed_chunks, 4);

    let result = job.result.unwrap();
    assert_eq!(result["gaps"], json!([3]));
    assert!(result["text"].as_str().unwrap().starts_with("ABC"));
    assert!(result["text"].as_str().unwrap().contains("[chunk 3 missing]"));

    // Permanent errors are never retried.
    assert_eq!(processor.calls_for("d"), 1);
    let chunks = engine.coordinator.chunks(job.id).await.unwrap();
    assert_eq!(chunks[3].status, ChunkStatus::Failed);
    assert_eq!(chunks[3].last_error_kind(), Some(ErrorKind::InvalidPayload));
}

#[tokio::test(start_paused = true)]
async fn timeouts_are_retried_until_success() {
    let processor =
        Arc::new(ScriptedProcessor::default().script("c", vec![Step::Hang, Step::Hang]));
    let engine = engine(processor.clone(), 0.5);

    let job = engine.coordinator.submit(request("a|b|c|d")).await.unwrap();
    engine.drain().await;

    let job = engine.job(job.id).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.result.as_ref().unwrap()["text"], "ABCD");

    let chunks = engine.coordinator.chunks(job.id).await.unwrap();
    assert_eq!(chunks[2].status, ChunkStatus::Succeeded);
    assert_eq!(chunks[2].attempt_count, 3);
    assert_eq!(chunks[2].last_error_kind(), Some(ErrorKind::Timeout));
    assert_eq!(processor.calls_for("c"), 3);
}

#[tokio::test]
async fn cancel_after_first_chunk_cancels_the_rest() {
    let processor = Arc::new(ScriptedProcessor::default());
    let engine = engine(processor.clone(), 0.5);

    let job = engine.coordinator.submit(request("a|b|c|d")).await.unwrap();
    assert!(engine.pool.run_once("w1").await.unwrap());

    let cancelled = engine.coordinator.cancel(job.id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert_eq!(cancelled.processed_chunks, 4);

    // Nothing is claimable and the processor is never called again.
    assert!(!engine.pool.run_once("w1").await.unwrap());
    engine.drain().await;
    assert_eq!(processor.total_calls(), 1);

    let statuses: Vec<ChunkStatus> = engine
        .coordinator
        .chunks(job.id)
        .await
        .unwrap()
        .iter()
        .map(|c| c.status)
        .collect();
    assert_eq!(
        statuses,
        vec![
            ChunkStatus::Succeeded,
            ChunkStatus::Cancelled,
            ChunkStatus::Cancelled,
            ChunkStatus::Cancelled,
        ]
    );
    assert!(engine.job(job.id).await.result.is_none());
}

// ---------------------------------------------------------------------------
// Threshold abort
// ---------------------------------------------------------------------------

#[tokio::test]
async fn crossing_the_discard_threshold_aborts_the_job() {
    let processor = Arc::new(
        ScriptedProcessor::default()
            .script("a", vec![Step::Fail(ChunkError::rejected("nope"))])
            .script("b", vec![Step::Fail(ChunkError::unauthorized("bad key"))]),
    );
    let engine = engine(processor.clone(), 0.25);

    let job = engine.coordinator.submit(request("a|b|c|d")).await.unwrap();
    engine.drain().await;

    let job = engine.job(job.id).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.failure_cause(), Some(FailureCause::ChunkFailures));
    assert_eq!(job.failed_chunk_ids, vec![0, 1]);
    assert!(job.error_summary.as_deref().unwrap().starts_with("2 of 4 chunks failed"));
    assert!(job.progress_percent < 100);

    // Failed fraction at abort time is above the threshold.
    let failed = job.failed_chunk_ids.len() as f64 / job.total_chunks as f64;
    assert!(failed >= 0.25);

    // The remaining chunks never ran.
    assert_eq!(processor.total_calls(), 2);
    let chunks = engine.coordinator.chunks(job.id).await.unwrap();
    assert_eq!(chunks[2].status, ChunkStatus::Cancelled);
    assert_eq!(chunks[3].status, ChunkStatus::Cancelled);
    assert_eq!(engine.job(job.id).await.processed_chunks, 4);
}

#[tokio::test]
async fn every_chunk_failing_fails_the_job() {
    let processor = Arc::new(
        ScriptedProcessor::default().script("only", vec![Step::Fail(ChunkError::rejected("no"))]),
    );
    let engine = engine(processor, 1.0);

    let job = engine.coordinator.submit(request("only")).await.unwrap();
    engine.drain().await;

    let job = engine.job(job.id).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.failure_cause(), Some(FailureCause::ChunkFailures));
    assert!(job.error_summary.unwrap().contains("chunk 0: rejected: no"));
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn running_chunk_finishes_its_attempt_then_is_cancelled() {
    let processor = Arc::new(GatedProcessor::default());
    let engine = engine(processor.clone(), 0.5);

    let mut slow = request("a|b");
    slow.settings = ExecutionSettings::with_timeout(Duration::from_secs(20));
    let job = engine.coordinator.submit(slow).await.unwrap();
    let claim = engine
        .store
        .claim_next_chunk("w1", Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();

    let executor = engine.executor.clone();
    let running = tokio::spawn(async move { executor.execute(claim).await });
    processor.started.notified().await;

    let requested = engine.coordinator.cancel(job.id).await.unwrap();
    assert!(requested.cancel_requested);
    assert_eq!(requested.status, JobStatus::Processing);

    processor.release.notify_one();
    let outcome = running.await.unwrap().unwrap();
    assert_eq!(outcome, ChunkOutcome::Cancelled);

    let job = engine.job(job.id).await;
    assert_eq!(job.status, JobStatus::Cancelled);
    let chunks = engine.coordinator.chunks(job.id).await.unwrap();
    assert!(chunks.iter().all(|c| c.status == ChunkStatus::Cancelled));
    assert!(chunks[0].result.is_none());
    assert_eq!(processor.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cancel_during_retry_wait_is_never_requeued() {
    let processor = Arc::new(
        ScriptedProcessor::default()
            .script("a", vec![Step::Fail(ChunkError::rate_limited("slow down"))]),
    );
    let engine = engine(processor.clone(), 0.5);
    let job = engine.coordinator.submit(request("a|b")).await.unwrap();

    assert!(engine.pool.run_once("w1").await.unwrap());
    let chunks = engine.coordinator.chunks(job.id).await.unwrap();
    assert_eq!(chunks[0].status, ChunkStatus::RetryWait);

    let cancelled = engine.coordinator.cancel(job.id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);

    // The retry delay passes, but the sweep has nothing to put back.
    let touched = engine
        .pool
        .maintain(Utc::now() + chrono::Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(touched, 0);
    assert!(!engine.pool.run_once("w1").await.unwrap());

    let chunks = engine.coordinator.chunks(job.id).await.unwrap();
    assert!(chunks.iter().all(|c| c.status == ChunkStatus::Cancelled));
    assert_eq!(chunks[0].attempt_count, 1);
    assert_eq!(processor.calls_for("a"), 1);
    assert_eq!(processor.total_calls(), 1);
    assert_eq!(engine.job(job.id).await.status, JobStatus::Cancelled);
}

#[tokio::test]
async fn claim_of_cancelled_job_skips_the_processor() {
    let processor = Arc::new(ScriptedProcessor::default());
    let engine = engine(processor.clone(), 0.5);

    let job = engine.coordinator.submit(request("a|b")).await.unwrap();
    let claim = engine
        .store
        .claim_next_chunk("w1", Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    engine.coordinator.cancel(job.id).await.unwrap();

    let outcome = engine.executor.execute(claim).await.unwrap();
    assert_eq!(outcome, ChunkOutcome::Cancelled);
    assert_eq!(processor.total_calls(), 0);
    assert_eq!(engine.job(job.id).await.status, JobStatus::Cancelled);
}

#[tokio::test]
async fn cancel_is_idempotent_and_terminal_jobs_are_untouched() {
    let engine = engine(Arc::new(ScriptedProcessor::default()), 0.5);

    let job = engine.coordinator.submit(request("a|b")).await.unwrap();
    let first = engine.coordinator.cancel(job.id).await.unwrap();
    let second = engine.coordinator.cancel(job.id).await.unwrap();
    assert_eq!(first.status, JobStatus::Cancelled);
    assert_eq!(second.revision, first.revision);

    let done = engine.coordinator.submit(request("x")).await.unwrap();
    engine.drain().await;
    let completed = engine.coordinator.cancel(done.id).await.unwrap();
    assert_eq!(completed.status, JobStatus::Completed);
    assert!(!completed.cancel_requested);

    assert_matches!(
        engine.coordinator.cancel(9999).await,
        Err(EngineError::JobNotFound(9999))
    );
}

// ---------------------------------------------------------------------------
// Submission and aggregation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn empty_input_is_rejected() {
    let engine = engine(Arc::new(ScriptedProcessor::default()), 0.5);
    assert_matches!(
        engine.coordinator.submit(request("|||")).await,
        Err(EngineError::InvalidInput(_))
    );

    let mut bad = request("a");
    bad.settings = ExecutionSettings::with_timeout(Duration::ZERO);
    assert_matches!(engine.coordinator.submit(bad).await, Err(EngineError::InvalidInput(_)));
}

#[tokio::test]
async fn repeated_aggregation_is_harmless() {
    let engine = engine(Arc::new(ScriptedProcessor::default()), 0.5);
    let job = engine.coordinator.submit(request("a|b|c|d")).await.unwrap();
    assert!(engine.pool.run_once("w1").await.unwrap());

    let first = engine.coordinator.on_chunk_terminal(job.id).await.unwrap();
    let second = engine.coordinator.on_chunk_terminal(job.id).await.unwrap();
    assert_eq!(first.processed_chunks, 1);
    assert_eq!(second.processed_chunks, 1);
    assert_eq!(second.progress_percent, 25);
    assert_eq!(second.current_step.as_deref(), Some("Processed 1 of 4 chunks"));

    // Finalizing early leaves an unfinished job alone.
    let unchanged = engine.coordinator.finalize(job.id).await.unwrap();
    assert_eq!(unchanged.status, JobStatus::Processing);
}

#[tokio::test]
async fn progress_and_processed_count_never_decrease() {
    let processor = Arc::new(
        ScriptedProcessor::default()
            .script("b", vec![Step::Fail(ChunkError::rate_limited("slow down"))]),
    );
    let engine = engine(processor, 0.5);
    let job = engine.coordinator.submit(request("a|b|c|d|e")).await.unwrap();

    let mut last = engine.job(job.id).await;
    loop {
        let worked = engine.pool.run_once("w1").await.unwrap();
        if !worked {
            let touched = engine
                .pool
                .maintain(Utc::now() + chrono::Duration::hours(1))
                .await
                .unwrap();
            if touched == 0 {
                break;
            }
        }
        let current = engine.job(job.id).await;
        assert!(current.processed_chunks >= last.processed_chunks);
        assert!(current.processed_chunks <= current.total_chunks);
        assert!(current.progress_percent >= last.progress_percent);
        last = current;
    }
    assert_eq!(last.status, JobStatus::Completed);
}

// ---------------------------------------------------------------------------
// Durability
// ---------------------------------------------------------------------------

#[tokio::test]
async fn durability_error_fails_the_job_verbatim() {
    let engine = engine(Arc::new(ScriptedProcessor::default()), 0.5);
    let job = engine.coordinator.submit(request("a|b")).await.unwrap();
    let claim = engine
        .store
        .claim_next_chunk("w1", Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();

    engine.store.fail_next_writes(1).await;
    let err = engine.executor.execute(claim).await.unwrap_err();
    assert!(err.is_durability());

    let job = engine.job(job.id).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.failure_cause(), Some(FailureCause::Durability));
    assert_eq!(job.error_summary.as_deref(), Some(err.to_string().as_str()));
}

// ---------------------------------------------------------------------------
// Lease recovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn expired_lease_is_requeued_then_failed_and_stale_writes_are_dropped() {
    let processor = Arc::new(ScriptedProcessor::default());
    let engine = engine(processor.clone(), 1.0);
    let job = engine.coordinator.submit(request("a|b")).await.unwrap();

    let mut first_claim = None;
    for attempt in 1..=3 {
        let claim = engine
            .store
            .claim_next_chunk("vanished", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claim.chunk.attempt_count, attempt);
        engine
            .store
            .set_lease_expiry(claim.chunk.id, Utc::now() - chrono::Duration::seconds(1))
            .await;
        engine.pool.maintain(Utc::now()).await.unwrap();
        first_claim.get_or_insert(claim);
    }

    let chunks = engine.coordinator.chunks(job.id).await.unwrap();
    assert_eq!(chunks[0].status, ChunkStatus::Failed);
    assert_eq!(chunks[0].attempt_count, 3);
    assert_eq!(chunks[0].last_error_kind(), Some(ErrorKind::LeaseExpired));

    // The vanished worker comes back with its original claim.
    let outcome = engine.executor.execute(first_claim.unwrap()).await.unwrap();
    assert_eq!(outcome, ChunkOutcome::Stale);
    let chunks = engine.coordinator.chunks(job.id).await.unwrap();
    assert_eq!(chunks[0].status, ChunkStatus::Failed);

    engine.drain().await;
    let job = engine.job(job.id).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.failed_chunk_ids, vec![0]);
}

#[tokio::test]
async fn processor_timeout_must_fit_inside_the_lease() {
    let processor = Arc::new(GatedProcessor::default());
    let engine = engine(processor.clone(), 0.5);

    let mut long = request("a|b");
    long.settings = ExecutionSettings::with_timeout(Duration::from_secs(600));
    assert_matches!(
        engine.coordinator.submit(long).await,
        Err(EngineError::InvalidInput(msg)) if msg.contains("lease")
    );

    let mut equal = request("a|b");
    equal.settings = ExecutionSettings::with_timeout(pool_config().lease);
    assert_matches!(engine.coordinator.submit(equal).await, Err(EngineError::InvalidInput(_)));

    // Nothing was persisted, so no worker can pick a chunk up.
    let jobs = engine.store.list_jobs(&JobListQuery::default()).await.unwrap();
    assert!(jobs.is_empty());
    assert!(!engine.pool.run_once("w1").await.unwrap());
    assert_eq!(processor.calls.load(Ordering::SeqCst), 0);

    let mut short = request("a|b");
    short.settings = ExecutionSettings::with_timeout(pool_config().lease - Duration::from_secs(1));
    assert!(engine.coordinator.submit(short).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn stored_long_timeout_is_cut_at_the_lease() {
    let processor = Arc::new(ScriptedProcessor::default().script("a", vec![Step::Hang]));
    let engine = engine(processor.clone(), 0.5);

    // A job persisted under a longer lease than the one workers now use.
    let new_job = NewJob {
        owner_ref: "user-1".to_string(),
        settings: ExecutionSettings::with_timeout(Duration::from_secs(600)),
    };
    let job = engine
        .store
        .create_job(&new_job, &[json!({ "text": "a", "overlap_chars": 0 })])
        .await
        .unwrap();
    engine.store.start_job(job.id).await.unwrap();

    let claim = engine
        .store
        .claim_next_chunk("w1", Duration::from_secs(2))
        .await
        .unwrap()
        .unwrap();
    let outcome = engine.executor.execute(claim).await.unwrap();
    assert_matches!(outcome, ChunkOutcome::RetryScheduled(_));

    // The call gave up before the lease ran out, so the sweep has no
    // running chunk to reclaim and hand to a second worker.
    let chunks = engine.coordinator.chunks(job.id).await.unwrap();
    assert_eq!(chunks[0].status, ChunkStatus::RetryWait);
    assert_eq!(chunks[0].last_error_kind(), Some(ErrorKind::Timeout));
    assert_eq!(processor.calls_for("a"), 1);
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

#[tokio::test]
async fn late_subscriber_snapshot_matches_store() {
    let engine = engine(Arc::new(ScriptedProcessor::default()), 0.5);
    let job = engine.coordinator.submit(request("a|b|c")).await.unwrap();
    assert!(engine.pool.run_once("w1").await.unwrap());

    let mut sub = engine.notifier.subscribe(job.id).await.unwrap();
    let snapshot = sub.next().await.unwrap();
    let stored = engine.job(job.id).await;
    assert_eq!(snapshot.event_type, EVENT_JOB_SNAPSHOT);
    assert_eq!(snapshot.job, Some(stored.status_view()));
    assert_eq!(snapshot.revision, stored.revision);
}

#[tokio::test]
async fn events_arrive_in_commit_order_and_end_at_completion() {
    let engine = engine(Arc::new(ScriptedProcessor::default()), 0.5);
    let job = engine.coordinator.submit(request("a|b|c")).await.unwrap();
    let mut sub = engine.notifier.subscribe(job.id).await.unwrap();

    engine.drain().await;

    let mut revisions = Vec::new();
    let mut last_type = String::new();
    while let Some(event) = sub.next().await {
        revisions.push(event.revision);
        last_type = event.event_type;
    }
    assert_eq!(last_type, EVENT_JOB_COMPLETED);
    assert!(revisions.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(revisions.last().copied(), Some(engine.job(job.id).await.revision));
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pool_runs_jobs_to_completion() {
    let processor = Arc::new(
        ScriptedProcessor::default()
            .script("b", vec![Step::Fail(ChunkError::connection_reset("reset"))]),
    );
    let engine = engine(processor.clone(), 0.5);

    let cancel = CancellationToken::new();
    let running = tokio::spawn(engine.pool.clone().run(cancel.clone()));

    let job = engine.coordinator.submit(request("a|b|c|d|e|f")).await.unwrap();
    let mut sub = engine.notifier.subscribe(job.id).await.unwrap();
    let finished = tokio::time::timeout(Duration::from_secs(10), async {
        let mut last = None;
        while let Some(event) = sub.next().await {
            last = Some(event);
        }
        last
    })
    .await
    .unwrap()
    .unwrap();
    assert!(finished.is_terminal());

    cancel.cancel();
    running.await.unwrap();

    let job = engine.job(job.id).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.result.unwrap()["text"], "ABCDEF");
    assert_eq!(processor.calls_for("b"), 2);
}
