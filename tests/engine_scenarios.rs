//! End-to-end scheduler scenarios against mock backends.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use genforge::backend::{
    BackendConfig, BackendFactory, BackendIdentity, ChatRequest, ChatResponse, ChunkStream,
    ModelBackend,
};
use genforge::conversation::ConversationConfig;
use genforge::error::{BackendError, StorageError};
use genforge::pipeline::{PhaseConfig, PhaseKind, PipelineConfig};
use genforge::retry::RetryPolicy;
use genforge::scheduler::{
    EngineEvent, GenerationEngine, GenerationRecord, JobConfig, ResultStatus, WorkInput, WorkItem,
};
use genforge::storage::{MemorySink, RecordSink};

/// Mock backend with per-prompt failure scripting and concurrency tracking.
struct TestBackend {
    /// Number of calls seen per prompt; used to fail the first N attempts
    /// of each item.
    attempts: Mutex<HashMap<String, usize>>,
    /// Fail this many initial attempts per prompt with a retryable error.
    fail_first: usize,
    /// While set, every call fails with a non-retryable error.
    broken: AtomicBool,
    calls: AtomicUsize,
    current: AtomicUsize,
    max_concurrent: AtomicUsize,
    delay: Duration,
}

impl TestBackend {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            attempts: Mutex::new(HashMap::new()),
            fail_first: 0,
            broken: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
            current: AtomicUsize::new(0),
            max_concurrent: AtomicUsize::new(0),
            delay: Duration::from_millis(10),
        })
    }

    fn failing_first_attempt() -> Arc<Self> {
        Arc::new(Self {
            attempts: Mutex::new(HashMap::new()),
            fail_first: 1,
            broken: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
            current: AtomicUsize::new(0),
            max_concurrent: AtomicUsize::new(0),
            delay: Duration::from_millis(10),
        })
    }

    fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            attempts: Mutex::new(HashMap::new()),
            fail_first: 0,
            broken: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
            current: AtomicUsize::new(0),
            max_concurrent: AtomicUsize::new(0),
            delay,
        })
    }

    async fn respond(&self, request: &ChatRequest) -> Result<String, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let current = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(current, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.current.fetch_sub(1, Ordering::SeqCst);

        if self.broken.load(Ordering::SeqCst) {
            return Err(BackendError::Api {
                code: 400,
                message: "permanently rejected".to_string(),
            });
        }

        let prompt = request
            .messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let attempt = {
            let mut attempts = self.attempts.lock().expect("attempts lock");
            let entry = attempts.entry(prompt.clone()).or_insert(0);
            *entry += 1;
            *entry
        };
        if attempt <= self.fail_first {
            return Err(BackendError::RateLimited("first attempt rejected".to_string()));
        }

        Ok(format!("<think>reasoning for {}</think>answer", prompt))
    }
}

#[async_trait]
impl ModelBackend for TestBackend {
    fn identity(&self) -> BackendIdentity {
        BackendIdentity {
            provider: "mock".to_string(),
            model: "test".to_string(),
        }
    }

    async fn invoke(&self, request: ChatRequest) -> Result<ChatResponse, BackendError> {
        let content = self.respond(&request).await?;
        Ok(ChatResponse {
            model: "test".to_string(),
            content,
        })
    }

    async fn invoke_stream(&self, request: ChatRequest) -> Result<ChunkStream, BackendError> {
        let content = self.respond(&request).await?;
        let chunks: Vec<Result<String, BackendError>> = content
            .as_bytes()
            .chunks(8)
            .map(|c| Ok(String::from_utf8_lossy(c).to_string()))
            .collect();
        Ok(Box::pin(futures::stream::iter(chunks)))
    }
}

struct TestFactory(Arc<TestBackend>);

impl BackendFactory for TestFactory {
    fn create(&self, _config: &BackendConfig) -> Result<Arc<dyn ModelBackend>, BackendError> {
        Ok(self.0.clone())
    }
}

fn backend_config() -> BackendConfig {
    BackendConfig::openai_compatible("http://localhost:4000", "test", None)
}

fn writer_only_job(retries: u32) -> JobConfig {
    JobConfig::new(PipelineConfig::new(
        PhaseConfig::new(PhaseKind::Writer, backend_config())
            .with_retry(RetryPolicy::new(retries, Duration::from_millis(1))),
    ))
}

fn topics(n: usize) -> Vec<WorkItem> {
    (0..n)
        .map(|i| WorkItem::new(WorkInput::Topic(format!("topic {}", i))))
        .collect()
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn engine(
    config: JobConfig,
    backend: Arc<TestBackend>,
) -> (GenerationEngine, Arc<MemorySink>) {
    init_tracing();
    let sink = Arc::new(MemorySink::new());
    let engine = GenerationEngine::with_factory(
        config,
        sink.clone() as Arc<dyn RecordSink>,
        &TestFactory(backend),
    )
    .expect("engine");
    (engine, sink)
}

#[tokio::test]
async fn bounded_pool_retries_each_item_once_and_completes_all() {
    let backend = TestBackend::failing_first_attempt();
    let config = writer_only_job(1).with_concurrency(2);
    let (engine, sink) = engine(config, backend.clone());

    engine.start(topics(5), false).await.expect("start");
    let stats = engine.join().await;

    // 5 items, each one failed attempt plus one successful retry.
    assert_eq!(backend.calls.load(Ordering::SeqCst), 10);
    assert!(backend.max_concurrent.load(Ordering::SeqCst) <= 2);
    assert_eq!(stats.succeeded, 5);
    assert_eq!(stats.failed, 0);
    assert_eq!(sink.len(), 5);
}

#[tokio::test]
async fn writer_only_job_is_one_call_per_item() {
    let backend = TestBackend::new();
    let (engine, _sink) = engine(writer_only_job(0), backend.clone());

    engine.start(topics(3), false).await.expect("start");
    engine.join().await;

    assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    for record in engine.records() {
        assert_eq!(record.status, ResultStatus::Success);
        assert!(record.reasoning.starts_with("reasoning for topic"));
        assert_eq!(record.answer, "answer");
        assert_eq!(record.phases.len(), 1);
    }
}

#[tokio::test]
async fn two_follow_ups_produce_three_turns() {
    let backend = TestBackend::new();
    let conversation = ConversationConfig::new(backend_config())
        .with_follow_up_count(2)
        .with_retry(RetryPolicy::new(0, Duration::from_millis(1)));
    let config = writer_only_job(0).with_conversation(conversation);
    let (engine, sink) = engine(config, backend.clone());

    engine.start(topics(1), false).await.expect("start");
    let stats = engine.join().await;

    assert_eq!(stats.succeeded, 1);
    let records = sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].turns.len(), 3);
    assert_eq!(records[0].turns[0].query, "topic 0");
    for turn in &records[0].turns {
        assert!(!turn.answer.is_empty());
    }
    // 3 assistant turns + 2 simulated-user follow-ups.
    assert_eq!(backend.calls.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn halted_item_leaves_no_record_and_no_completion() {
    let backend = TestBackend::with_delay(Duration::from_secs(30));
    let config = writer_only_job(0).with_concurrency(1);
    let (engine, sink) = engine(config, backend);

    let items = topics(1);
    let id = items[0].id;
    engine.start(items, false).await.expect("start");

    // Wait until the item is in flight, then halt it.
    for _ in 0..100 {
        if engine.streaming_state(id).is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    engine.halt_item(id).expect("halt");
    let stats = engine.join().await;

    assert_eq!(stats.completed, 0);
    assert!(engine.record(id).is_none());
    assert!(sink.is_empty());
}

#[tokio::test]
async fn retry_all_failed_converges_without_double_counting() {
    let backend = TestBackend::new();
    backend.broken.store(true, Ordering::SeqCst);
    let (engine, sink) = engine(writer_only_job(0).with_concurrency(2), backend.clone());

    engine.start(topics(4), false).await.expect("start");
    let stats = engine.join().await;
    assert_eq!(stats.failed, 4);
    assert_eq!(stats.completed, 4);

    // Fix the backend and retry everything that failed.
    backend.broken.store(false, Ordering::SeqCst);
    let retried = engine.retry_all_failed();
    assert_eq!(retried, 4);
    let stats = engine.join().await;

    // Replaced records, not duplicates.
    assert_eq!(stats.total, 4);
    assert_eq!(stats.completed, 4);
    assert_eq!(stats.succeeded, 4);
    assert_eq!(stats.failed, 0);
    assert_eq!(sink.len(), 4);
    for record in engine.records() {
        assert_eq!(record.status, ResultStatus::Success);
    }
}

#[tokio::test]
async fn pause_holds_dispatch_and_resume_releases_it() {
    let backend = TestBackend::with_delay(Duration::from_millis(40));
    let config = writer_only_job(0).with_concurrency(1);
    let (engine, _sink) = engine(config, backend);

    engine.start(topics(4), false).await.expect("start");
    engine.pause().expect("pause");
    tokio::time::sleep(Duration::from_millis(200)).await;

    // At most the item already in flight finished while paused.
    assert!(engine.progress().completed <= 1);

    engine.resume().expect("resume");
    let stats = engine.join().await;
    assert_eq!(stats.completed, 4);
    assert_eq!(stats.succeeded, 4);
}

#[tokio::test]
async fn streaming_state_is_observable_mid_item() {
    let backend = TestBackend::with_delay(Duration::from_millis(150));
    let config = writer_only_job(0).with_concurrency(1);
    let (engine, _sink) = engine(config, backend);

    let items = topics(1);
    let id = items[0].id;
    engine.start(items, false).await.expect("start");

    let mut saw_in_flight = false;
    for _ in 0..200 {
        if let Some(state) = engine.streaming_state(id) {
            assert_eq!(state.item_id, id);
            assert!(state.worker_slot.is_some());
            saw_in_flight = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(saw_in_flight);

    engine.join().await;
    // The slot is removed once the item completes.
    assert!(engine.streaming_state(id).is_none());
    assert!(engine.record(id).is_some());
}

#[tokio::test]
async fn event_channel_carries_snapshots_progress_and_terminal_events() {
    let backend = TestBackend::new();
    let (engine, _sink) = engine(writer_only_job(0).with_concurrency(1), backend);

    let mut events = engine.subscribe();
    let items = topics(1);
    let id = items[0].id;
    engine.start(items, false).await.expect("start");
    engine.join().await;

    let mut saw_snapshot = false;
    let mut saw_progress = false;
    let mut saw_finished = false;
    let mut saw_job_finished = false;
    while let Ok(event) = events.try_recv() {
        match event {
            EngineEvent::Snapshot(state) => {
                assert_eq!(state.item_id, id);
                saw_snapshot = true;
            }
            EngineEvent::Progress(_) => saw_progress = true,
            EngineEvent::ItemFinished(record) => {
                assert_eq!(record.item_id, id);
                saw_finished = true;
            }
            EngineEvent::ItemHalted(_) => panic!("nothing was halted"),
            EngineEvent::JobFinished(stats) => {
                assert_eq!(stats.succeeded, 1);
                saw_job_finished = true;
            }
        }
    }
    assert!(saw_snapshot);
    assert!(saw_progress);
    assert!(saw_finished);
    assert!(saw_job_finished);
}

/// Sink that rejects its first N persists, then delegates to memory.
struct FlakySink {
    inner: MemorySink,
    failures_left: AtomicUsize,
}

#[async_trait]
impl RecordSink for FlakySink {
    async fn persist(&self, record: &GenerationRecord) -> Result<(), StorageError> {
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(StorageError::PersistFailed("disk full".to_string()));
        }
        self.inner.persist(record).await
    }
}

#[tokio::test]
async fn storage_failure_keeps_success_and_retry_storage_repairs_it() {
    init_tracing();
    let backend = TestBackend::new();
    let sink = Arc::new(FlakySink {
        inner: MemorySink::new(),
        failures_left: AtomicUsize::new(1),
    });
    let engine = GenerationEngine::with_factory(
        writer_only_job(0),
        sink.clone() as Arc<dyn RecordSink>,
        &TestFactory(backend.clone()),
    )
    .expect("engine");

    engine.start(topics(1), false).await.expect("start");
    let stats = engine.join().await;

    // Generation succeeded even though the persist did not.
    assert_eq!(stats.succeeded, 1);
    let record = &engine.records()[0];
    assert_eq!(record.status, ResultStatus::Success);
    assert!(record.storage_failed);
    assert_eq!(sink.inner.len(), 0);
    assert_eq!(backend.calls.load(Ordering::SeqCst), 1);

    // Storage-only retry re-persists without another model call.
    assert_eq!(engine.retry_storage().await, 1);
    assert_eq!(sink.inner.len(), 1);
    assert!(!engine.records()[0].storage_failed);
    assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn halting_one_item_leaves_its_sibling_running() {
    let backend = TestBackend::with_delay(Duration::from_millis(150));
    let config = writer_only_job(0).with_concurrency(2);
    let (engine, sink) = engine(config, backend);

    let items = topics(2);
    let halted = items[0].id;
    let sibling = items[1].id;
    engine.start(items, false).await.expect("start");

    // Wait until both items are in flight.
    for _ in 0..200 {
        if engine.streaming_states().len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    engine.halt_item(halted).expect("halt");
    let stats = engine.join().await;

    // The halted item vanishes without a record; its sibling completes.
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.succeeded, 1);
    assert!(engine.record(halted).is_none());
    let record = engine.record(sibling).expect("sibling record");
    assert_eq!(record.status, ResultStatus::Success);
    assert_eq!(sink.len(), 1);
}
