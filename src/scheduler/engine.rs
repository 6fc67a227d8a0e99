//! The generation engine: a bounded worker pool over a queue of work items.
//!
//! Workers pull items, run them through the pipeline (or the conversation
//! driver), and hand finished records to the sink. The engine exposes the
//! operator controls: pause/resume, stop, per-item halt, and retry of
//! failed items. Every in-flight item owns a [`StreamingSlot`] so partial
//! output is observable while it streams.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{BackendFactory, HttpBackendFactory};
use crate::conversation::{ConversationDriver, ConversationOutcome};
use crate::error::EngineError;
use crate::pipeline::{PipelineError, PipelineOutput, PipelineRunner};
use crate::prefetch::{PagedSource, PrefetchManager, PrefetchStatus};
use crate::storage::RecordSink;

use super::events::{self, EngineEvent};
use super::job::{
    GenerationRecord, JobConfig, ResultStatus, StreamingSlot, StreamingState, WorkInput, WorkItem,
};
use super::progress::{ProgressCounters, ProgressStats};

/// Orchestrates one generation job.
pub struct GenerationEngine {
    inner: Arc<EngineInner>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

/// What a worker ran for one item.
enum ItemOutput {
    Pipeline(PipelineOutput),
    Conversation(ConversationOutcome),
}

struct EngineInner {
    config: JobConfig,
    runner: Option<PipelineRunner>,
    driver: Option<ConversationDriver>,
    sink: Arc<dyn RecordSink>,
    counters: ProgressCounters,
    /// Streaming state of in-flight items; entries exist only while the
    /// item is being processed.
    slots: Mutex<HashMap<Uuid, Arc<StreamingSlot>>>,
    /// Terminal records by item id.
    records: Mutex<HashMap<Uuid, GenerationRecord>>,
    /// Original inputs by item id, kept so failed items can be re-run.
    inputs: Mutex<HashMap<Uuid, WorkInput>>,
    queue: Mutex<VecDeque<WorkItem>>,
    queue_notify: Notify,
    feeding_done: AtomicBool,
    paused_tx: watch::Sender<bool>,
    paused_rx: watch::Receiver<bool>,
    cancel: tokio_util::sync::CancellationToken,
    events: broadcast::Sender<EngineEvent>,
    running: AtomicBool,
}

impl GenerationEngine {
    /// Create an engine backed by real HTTP adapters.
    pub fn new(config: JobConfig, sink: Arc<dyn RecordSink>) -> Result<Self, EngineError> {
        Self::with_factory(config, sink, &HttpBackendFactory)
    }

    /// Create an engine with a custom backend factory.
    pub fn with_factory(
        config: JobConfig,
        sink: Arc<dyn RecordSink>,
        factory: &dyn BackendFactory,
    ) -> Result<Self, EngineError> {
        config.validate()?;

        let (runner, driver) = match &config.conversation {
            Some(conversation) => (
                None,
                Some(ConversationDriver::new(conversation.clone(), factory)?),
            ),
            None => (
                Some(PipelineRunner::new(config.pipeline.clone(), factory)?),
                None,
            ),
        };

        let (paused_tx, paused_rx) = watch::channel(false);
        let (events, _) = events::channel();

        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                runner,
                driver,
                sink,
                counters: ProgressCounters::new(),
                slots: Mutex::new(HashMap::new()),
                records: Mutex::new(HashMap::new()),
                inputs: Mutex::new(HashMap::new()),
                queue: Mutex::new(VecDeque::new()),
                queue_notify: Notify::new(),
                feeding_done: AtomicBool::new(false),
                paused_tx,
                paused_rx,
                cancel: tokio_util::sync::CancellationToken::new(),
                events,
                running: AtomicBool::new(false),
            }),
            handles: Mutex::new(Vec::new()),
        })
    }

    /// Start processing a fixed batch of items.
    ///
    /// With `append` set, records and counters from a previous run on this
    /// engine are kept and the new items extend them; otherwise the run
    /// starts from a clean slate.
    pub async fn start(&self, items: Vec<WorkItem>, append: bool) -> Result<(), EngineError> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(EngineError::AlreadyRunning);
        }
        if let Err(e) = self.inner.preflight().await {
            self.inner.running.store(false, Ordering::SeqCst);
            return Err(e);
        }
        if !append {
            self.inner.clear_previous_run();
        }
        info!(items = items.len(), concurrency = self.inner.config.concurrency, append, "Job starting");
        self.inner.counters.add_total(items.len());
        {
            let mut queue = self.inner.queue.lock().expect("queue lock");
            queue.extend(items);
        }
        self.inner.feeding_done.store(true, Ordering::SeqCst);
        self.inner.queue_notify.notify_waiters();
        self.spawn_workers();
        Ok(())
    }

    /// Start processing items streamed from a paged source.
    ///
    /// Items are fed through a [`PrefetchManager`], so the source stays at
    /// most one buffer ahead of the workers.
    pub async fn start_source<S: PagedSource>(
        &self,
        source: S,
        append: bool,
    ) -> Result<(), EngineError> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(EngineError::AlreadyRunning);
        }
        if let Err(e) = self.inner.preflight().await {
            self.inner.running.store(false, Ordering::SeqCst);
            return Err(e);
        }
        if !append {
            self.inner.clear_previous_run();
        }
        info!(concurrency = self.inner.config.concurrency, append, "Job starting from paged source");

        self.inner.feeding_done.store(false, Ordering::SeqCst);
        let inner = Arc::clone(&self.inner);
        let feeder = tokio::spawn(async move {
            let mut prefetch = PrefetchManager::spawn(source);
            loop {
                tokio::select! {
                    _ = inner.cancel.cancelled() => break,
                    row = prefetch.next() => match row {
                        Some(row) => inner.enqueue(WorkItem::new(WorkInput::Row(row))),
                        None => break,
                    }
                }
            }
            if let PrefetchStatus::Error(message) = prefetch.status() {
                warn!(error = %message, "Source failed; job continues with the items already fetched");
            }
            inner.feeding_done.store(true, Ordering::SeqCst);
            inner.queue_notify.notify_waiters();
        });

        self.handles.lock().expect("handles lock").push(feeder);
        self.spawn_workers();
        Ok(())
    }

    /// Pause dispatch. In-flight items run to completion; no new item is
    /// picked up until [`GenerationEngine::resume`].
    pub fn pause(&self) -> Result<(), EngineError> {
        if !self.inner.running.load(Ordering::SeqCst) {
            return Err(EngineError::NotRunning);
        }
        info!("Job paused");
        self.inner.paused_tx.send_replace(true);
        Ok(())
    }

    /// Resume dispatch after a pause.
    pub fn resume(&self) -> Result<(), EngineError> {
        if !self.inner.running.load(Ordering::SeqCst) {
            return Err(EngineError::NotRunning);
        }
        info!("Job resumed");
        self.inner.paused_tx.send_replace(false);
        Ok(())
    }

    /// Stop the job: cancels every in-flight item and stops dispatch.
    pub fn stop(&self) {
        info!("Job stopping");
        self.inner.cancel.cancel();
        self.inner.queue_notify.notify_waiters();
    }

    /// Halt one in-flight item. The item produces no record and the
    /// completed count is unchanged.
    pub fn halt_item(&self, item_id: Uuid) -> Result<(), EngineError> {
        let slots = self.inner.slots.lock().expect("slots lock");
        match slots.get(&item_id) {
            Some(slot) => {
                info!(item_id = %item_id, "Halting item");
                slot.halt();
                Ok(())
            }
            None => Err(EngineError::UnknownItem(item_id)),
        }
    }

    /// Re-run one failed item. Its previous record is rolled out of the
    /// counters when the re-run begins, and the new record replaces it.
    pub fn retry_item(&self, item_id: Uuid) -> Result<(), EngineError> {
        let is_failed = {
            let records = self.inner.records.lock().expect("records lock");
            records
                .get(&item_id)
                .map(|r| r.status.is_failure())
                .unwrap_or(false)
        };
        if !is_failed {
            return Err(EngineError::NothingToRetry(item_id));
        }
        let input = {
            let inputs = self.inner.inputs.lock().expect("inputs lock");
            inputs
                .get(&item_id)
                .cloned()
                .ok_or(EngineError::NothingToRetry(item_id))?
        };

        info!(item_id = %item_id, "Retrying failed item");
        self.inner.enqueue(
            WorkItem {
                id: item_id,
                slot: None,
                input,
                retry: false,
            }
            .as_retry(),
        );
        self.ensure_workers();
        Ok(())
    }

    /// Re-run every failed item. Returns how many were enqueued.
    pub fn retry_all_failed(&self) -> usize {
        let failed: Vec<Uuid> = {
            let records = self.inner.records.lock().expect("records lock");
            records
                .values()
                .filter(|r| r.status.is_failure())
                .map(|r| r.item_id)
                .collect()
        };
        let count = failed.len();
        for item_id in failed {
            // Ignore races where another retry got there first.
            let _ = self.retry_item(item_id);
        }
        info!(count, "Retrying all failed items");
        count
    }

    /// Re-persist records whose generation succeeded but whose storage
    /// handoff failed. Returns how many were repaired.
    pub async fn retry_storage(&self) -> usize {
        let pending: Vec<GenerationRecord> = {
            let records = self.inner.records.lock().expect("records lock");
            records
                .values()
                .filter(|r| r.storage_failed)
                .cloned()
                .collect()
        };

        let mut repaired = 0;
        for mut record in pending {
            match self.inner.sink.persist(&record).await {
                Ok(()) => {
                    record.storage_failed = false;
                    self.inner
                        .records
                        .lock()
                        .expect("records lock")
                        .insert(record.item_id, record);
                    repaired += 1;
                }
                Err(e) => warn!(item_id = %record.item_id, error = %e, "Storage retry failed"),
            }
        }
        repaired
    }

    /// Wait for every worker (and the feeder, if any) to finish, then
    /// publish the final stats.
    pub async fn join(&self) -> ProgressStats {
        loop {
            let batch: Vec<JoinHandle<()>> = {
                let mut handles = self.handles.lock().expect("handles lock");
                std::mem::take(&mut *handles)
            };
            if batch.is_empty() {
                break;
            }
            for handle in batch {
                let _ = handle.await;
            }
        }
        self.inner.running.store(false, Ordering::SeqCst);

        let stats = self.inner.counters.snapshot();
        info!(
            completed = stats.completed,
            succeeded = stats.succeeded,
            failed = stats.failed,
            "Job finished"
        );
        let _ = self.inner.events.send(EngineEvent::JobFinished(stats));
        stats
    }

    /// Current progress counters.
    pub fn progress(&self) -> ProgressStats {
        self.inner.counters.snapshot()
    }

    /// Streaming snapshot of one in-flight item.
    pub fn streaming_state(&self, item_id: Uuid) -> Option<StreamingState> {
        let slots = self.inner.slots.lock().expect("slots lock");
        slots.get(&item_id).map(|slot| slot.snapshot())
    }

    /// Streaming snapshots of every in-flight item.
    pub fn streaming_states(&self) -> Vec<StreamingState> {
        let slots = self.inner.slots.lock().expect("slots lock");
        slots.values().map(|slot| slot.snapshot()).collect()
    }

    /// Terminal record for one item, if it has finished.
    pub fn record(&self, item_id: Uuid) -> Option<GenerationRecord> {
        let records = self.inner.records.lock().expect("records lock");
        records.get(&item_id).cloned()
    }

    /// All terminal records so far.
    pub fn records(&self) -> Vec<GenerationRecord> {
        let records = self.inner.records.lock().expect("records lock");
        records.values().cloned().collect()
    }

    /// Subscribe to engine events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    fn spawn_workers(&self) {
        let mut handles = self.handles.lock().expect("handles lock");
        for worker_id in 0..self.inner.config.concurrency {
            let inner = Arc::clone(&self.inner);
            handles.push(tokio::spawn(worker_loop(inner, worker_id)));
        }
    }

    /// Spawn a fresh worker batch if none is alive, so retries enqueued
    /// after a job drained still get processed.
    fn ensure_workers(&self) {
        let respawn = {
            let mut handles = self.handles.lock().expect("handles lock");
            handles.retain(|h| !h.is_finished());
            handles.is_empty()
        };
        if respawn {
            debug!("No live workers; spawning a fresh batch for retries");
            self.inner.running.store(true, Ordering::SeqCst);
            self.spawn_workers();
        }
    }
}

async fn worker_loop(inner: Arc<EngineInner>, worker_id: usize) {
    let mut paused = inner.paused_rx.clone();
    loop {
        if inner.cancel.is_cancelled() {
            break;
        }

        if !wait_while_paused(&inner, &mut paused).await {
            break;
        }

        let Some(item) = inner.next_item().await else {
            break;
        };
        // A pause may have landed while this worker was parked waiting for
        // work; the gate holds the pulled item until resume.
        if !wait_while_paused(&inner, &mut paused).await {
            break;
        }
        inner.process_item(item.with_slot(worker_id)).await;

        if !inner.config.sleep_time.is_zero() {
            tokio::select! {
                _ = inner.cancel.cancelled() => break,
                _ = tokio::time::sleep(inner.config.sleep_time) => {}
            }
        }
    }
    debug!(worker_id, "Worker exiting");
}

/// Pause gate: hold while the job is paused, never mid-item. Returns false
/// when the job was cancelled instead of resumed.
async fn wait_while_paused(inner: &EngineInner, paused: &mut watch::Receiver<bool>) -> bool {
    while *paused.borrow() {
        tokio::select! {
            _ = inner.cancel.cancelled() => return false,
            changed = paused.changed() => {
                if changed.is_err() {
                    return false;
                }
            }
        }
    }
    true
}

impl EngineInner {
    /// Forget the previous run's records, inputs and counters; used when a
    /// job starts without append mode.
    fn clear_previous_run(&self) {
        self.records.lock().expect("records lock").clear();
        self.inputs.lock().expect("inputs lock").clear();
        self.counters.reset();
    }

    /// Probe every backend the job will use; an offline backend fails the
    /// job once, before any worker starts.
    async fn preflight(&self) -> Result<(), EngineError> {
        let probed = match (&self.runner, &self.driver) {
            (Some(runner), _) => runner.probe_backends().await,
            (None, Some(driver)) => driver.probe_backends().await,
            (None, None) => Ok(()),
        };
        probed.map_err(EngineError::Offline)
    }

    fn enqueue(&self, item: WorkItem) {
        self.counters.add_total(if item.retry { 0 } else { 1 });
        let mut queue = self.queue.lock().expect("queue lock");
        queue.push_back(item);
        drop(queue);
        self.queue_notify.notify_waiters();
    }

    /// Pull the next item, waiting while the queue is empty but the source
    /// is still feeding.
    async fn next_item(&self) -> Option<WorkItem> {
        loop {
            if self.cancel.is_cancelled() {
                return None;
            }

            // Register interest before checking state, so a push between
            // the check and the await still wakes us.
            let notified = self.queue_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.queue.lock().expect("queue lock").pop_front() {
                return Some(item);
            }
            if self.feeding_done.load(Ordering::SeqCst) {
                return None;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = &mut notified => {}
            }
        }
    }

    async fn process_item(&self, item: WorkItem) {
        let turn_total = self
            .config
            .conversation
            .as_ref()
            .map(|c| c.turn_total())
            .unwrap_or(1);
        let slot = Arc::new(
            StreamingSlot::new(item.id, turn_total, self.cancel.child_token())
                .with_publisher(self.events.clone())
                .with_worker(item.slot),
        );
        self.slots
            .lock()
            .expect("slots lock")
            .insert(item.id, Arc::clone(&slot));
        self.inputs
            .lock()
            .expect("inputs lock")
            .insert(item.id, item.input.clone());
        self.counters.worker_started();

        // A re-run replaces the old record: roll it out of the counters
        // before the new attempt so progress never double counts.
        if item.retry {
            let previous = self.records.lock().expect("records lock").remove(&item.id);
            if let Some(previous) = previous {
                self.counters
                    .rollback(previous.status == ResultStatus::Success);
            }
        }

        let query = item.input.as_prompt_text();
        let outcome =
            tokio::time::timeout(self.config.item_timeout, self.run_item(&query, &slot)).await;

        let record = match outcome {
            Ok(Ok(output)) => Some(success_record(item.id, &query, output)),
            Ok(Err(PipelineError::Cancelled)) => {
                info!(item_id = %item.id, "Item halted; no record produced");
                let _ = self.events.send(EngineEvent::ItemHalted(item.id));
                None
            }
            Ok(Err(e)) => {
                warn!(item_id = %item.id, error = %e, "Item failed");
                let mut record =
                    GenerationRecord::failure(item.id, ResultStatus::Error, e.to_string());
                record.query = query.clone();
                Some(record)
            }
            Err(_elapsed) => {
                warn!(item_id = %item.id, timeout = ?self.config.item_timeout, "Item timed out");
                slot.halt();
                let mut record = GenerationRecord::failure(
                    item.id,
                    ResultStatus::TimedOut,
                    format!("exceeded item timeout of {:?}", self.config.item_timeout),
                );
                record.query = query.clone();
                Some(record)
            }
        };

        self.slots.lock().expect("slots lock").remove(&item.id);

        if let Some(mut record) = record {
            if let Err(e) = self.sink.persist(&record).await {
                warn!(item_id = %record.item_id, error = %e, "Storage handoff failed");
                record.storage_failed = true;
            }
            match record.status {
                ResultStatus::Success => self.counters.record_success(),
                ResultStatus::TimedOut | ResultStatus::Error => self.counters.record_failure(),
            }
            self.records
                .lock()
                .expect("records lock")
                .insert(record.item_id, record.clone());
            let _ = self.events.send(EngineEvent::ItemFinished(record));
            let _ = self
                .events
                .send(EngineEvent::Progress(self.counters.snapshot()));
        }

        self.counters.worker_finished();
    }

    async fn run_item(
        &self,
        query: &str,
        slot: &StreamingSlot,
    ) -> Result<ItemOutput, PipelineError> {
        if let Some(driver) = &self.driver {
            driver.run(query, slot).await.map(ItemOutput::Conversation)
        } else {
            let runner = self
                .runner
                .as_ref()
                .expect("engine always has a runner or a driver");
            runner.run(query, slot).await.map(ItemOutput::Pipeline)
        }
    }
}

fn success_record(item_id: Uuid, query: &str, output: ItemOutput) -> GenerationRecord {
    let mut record = GenerationRecord::new(item_id, ResultStatus::Success);
    record.query = query.to_string();
    match output {
        ItemOutput::Pipeline(output) => {
            record.reasoning = output.reasoning;
            record.answer = output.answer;
            record.phases = output.phases;
            record.provenance = Some(output.provenance);
        }
        ItemOutput::Conversation(outcome) => {
            if let Some(last) = outcome.turns.last() {
                record.reasoning = last.reasoning.clone();
                record.answer = last.answer.clone();
            }
            record.turns = outcome.turns;
            record.provenance = Some(outcome.provenance);
        }
    }
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{
        BackendConfig, BackendIdentity, ChatRequest, ChatResponse, ChunkStream, ModelBackend,
    };
    use crate::error::BackendError;
    use crate::pipeline::{PhaseConfig, PhaseKind, PipelineConfig};
    use crate::retry::RetryPolicy;
    use crate::storage::MemorySink;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct FixedBackend {
        content: String,
        calls: AtomicUsize,
        delay: Duration,
    }

    #[async_trait]
    impl ModelBackend for FixedBackend {
        fn identity(&self) -> BackendIdentity {
            BackendIdentity {
                provider: "mock".to_string(),
                model: "fixed".to_string(),
            }
        }

        async fn invoke(&self, _request: ChatRequest) -> Result<ChatResponse, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(ChatResponse {
                model: "fixed".to_string(),
                content: self.content.clone(),
            })
        }

        async fn invoke_stream(&self, request: ChatRequest) -> Result<ChunkStream, BackendError> {
            let response = self.invoke(request).await?;
            Ok(Box::pin(futures::stream::iter(vec![Ok(response.content)])))
        }
    }

    struct FixedFactory(Arc<FixedBackend>);

    impl BackendFactory for FixedFactory {
        fn create(
            &self,
            _config: &BackendConfig,
        ) -> Result<Arc<dyn ModelBackend>, BackendError> {
            Ok(self.0.clone())
        }
    }

    fn job_config() -> JobConfig {
        let backend = BackendConfig::openai_compatible("http://localhost:4000", "m", None);
        JobConfig::new(PipelineConfig::new(
            PhaseConfig::new(PhaseKind::Writer, backend)
                .with_retry(RetryPolicy::new(0, Duration::from_millis(1))),
        ))
    }

    fn engine_with(
        config: JobConfig,
        backend: Arc<FixedBackend>,
    ) -> (GenerationEngine, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let engine = GenerationEngine::with_factory(
            config,
            sink.clone() as Arc<dyn RecordSink>,
            &FixedFactory(backend),
        )
        .expect("engine");
        (engine, sink)
    }

    fn items(n: usize) -> Vec<WorkItem> {
        (0..n)
            .map(|i| WorkItem::new(WorkInput::Topic(format!("topic {}", i))))
            .collect()
    }

    #[tokio::test]
    async fn processes_every_item_and_persists_records() {
        let backend = Arc::new(FixedBackend {
            content: "<think>r</think>a".to_string(),
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
        });
        let (engine, sink) = engine_with(job_config(), backend.clone());

        engine.start(items(4), false).await.expect("start");
        let stats = engine.join().await;

        assert_eq!(stats.total, 4);
        assert_eq!(stats.completed, 4);
        assert_eq!(stats.succeeded, 4);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 4);
        assert_eq!(sink.len(), 4);

        for record in engine.records() {
            assert_eq!(record.status, ResultStatus::Success);
            assert_eq!(record.reasoning, "r");
            assert_eq!(record.answer, "a");
        }
    }

    #[tokio::test]
    async fn append_keeps_previous_records_and_fresh_start_clears_them() {
        let backend = Arc::new(FixedBackend {
            content: "<think>r</think>a".to_string(),
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
        });
        let (engine, _sink) = engine_with(job_config(), backend);

        engine.start(items(2), false).await.expect("start");
        engine.join().await;
        assert_eq!(engine.records().len(), 2);

        engine.start(items(1), true).await.expect("append start");
        engine.join().await;
        assert_eq!(engine.records().len(), 3);
        assert_eq!(engine.progress().total, 3);

        engine.start(items(1), false).await.expect("fresh start");
        engine.join().await;
        assert_eq!(engine.records().len(), 1);
        assert_eq!(engine.progress().total, 1);
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let backend = Arc::new(FixedBackend {
            content: "a".to_string(),
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
        });
        let (engine, _sink) = engine_with(job_config(), backend);

        engine.start(items(1), false).await.expect("start");
        assert!(matches!(
            engine.start(items(1), false).await,
            Err(EngineError::AlreadyRunning)
        ));
        engine.join().await;
    }

    #[tokio::test]
    async fn pause_requires_a_running_job() {
        let backend = Arc::new(FixedBackend {
            content: "a".to_string(),
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
        });
        let (engine, _sink) = engine_with(job_config(), backend);
        assert!(matches!(engine.pause(), Err(EngineError::NotRunning)));
    }

    #[tokio::test]
    async fn stop_cancels_without_recording_pending_items() {
        let backend = Arc::new(FixedBackend {
            content: "a".to_string(),
            calls: AtomicUsize::new(0),
            delay: Duration::from_secs(30),
        });
        let (engine, sink) = engine_with(job_config().with_concurrency(1), backend);

        engine.start(items(3), false).await.expect("start");
        tokio::time::sleep(Duration::from_millis(50)).await;
        engine.stop();
        let stats = engine.join().await;

        // The in-flight item was cancelled, the queued ones never ran.
        assert_eq!(stats.completed, 0);
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn item_timeout_produces_a_timed_out_record() {
        let backend = Arc::new(FixedBackend {
            content: "a".to_string(),
            calls: AtomicUsize::new(0),
            delay: Duration::from_secs(30),
        });
        let config = job_config().with_item_timeout(Duration::from_millis(50));
        let (engine, _sink) = engine_with(config, backend);

        engine.start(items(1), false).await.expect("start");
        let stats = engine.join().await;

        assert_eq!(stats.failed, 1);
        let record = &engine.records()[0];
        assert_eq!(record.status, ResultStatus::TimedOut);
        assert!(record.error.as_deref().unwrap_or("").contains("timeout"));
    }

    #[tokio::test]
    async fn retry_item_rejects_successful_records() {
        let backend = Arc::new(FixedBackend {
            content: "fine".to_string(),
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
        });
        let (engine, _sink) = engine_with(job_config(), backend);

        let batch = items(1);
        let id = batch[0].id;
        engine.start(batch, false).await.expect("start");
        engine.join().await;

        assert!(matches!(
            engine.retry_item(id),
            Err(EngineError::NothingToRetry(_))
        ));
    }

    struct OfflineBackend;

    #[async_trait]
    impl ModelBackend for OfflineBackend {
        fn identity(&self) -> BackendIdentity {
            BackendIdentity {
                provider: "local".to_string(),
                model: "down".to_string(),
            }
        }

        async fn invoke(&self, _request: ChatRequest) -> Result<ChatResponse, BackendError> {
            Err(BackendError::Offline("daemon down".to_string()))
        }

        async fn invoke_stream(&self, _request: ChatRequest) -> Result<ChunkStream, BackendError> {
            Err(BackendError::Offline("daemon down".to_string()))
        }

        async fn probe(&self) -> Result<(), BackendError> {
            Err(BackendError::Offline("daemon down".to_string()))
        }
    }

    struct OfflineFactory;

    impl BackendFactory for OfflineFactory {
        fn create(
            &self,
            _config: &BackendConfig,
        ) -> Result<Arc<dyn ModelBackend>, BackendError> {
            Ok(Arc::new(OfflineBackend))
        }
    }

    #[tokio::test]
    async fn offline_backend_fails_the_job_before_any_worker_starts() {
        let sink = Arc::new(MemorySink::new());
        let engine = GenerationEngine::with_factory(
            job_config(),
            sink.clone() as Arc<dyn RecordSink>,
            &OfflineFactory,
        )
        .expect("engine");

        let err = engine
            .start(items(3), false)
            .await
            .expect_err("offline backend must fail the start");
        assert!(matches!(err, EngineError::Offline(BackendError::Offline(_))));

        // One job-level error, not one error record per item.
        assert!(engine.records().is_empty());
        assert!(sink.is_empty());
        assert_eq!(engine.progress().total, 0);

        // The failed start releases the running gate.
        assert!(matches!(
            engine.start(items(1), false).await,
            Err(EngineError::Offline(_))
        ));
    }

    struct OneRowSource {
        delay: Duration,
    }

    #[async_trait]
    impl crate::prefetch::PagedSource for OneRowSource {
        async fn fetch_page(
            &mut self,
            _page: usize,
        ) -> Result<crate::prefetch::Page, crate::error::SourceError> {
            tokio::time::sleep(self.delay).await;
            Ok(crate::prefetch::Page::last(vec![serde_json::json!({
                "q": "late row"
            })]))
        }
    }

    #[tokio::test]
    async fn pause_holds_items_that_arrive_while_workers_are_parked() {
        let backend = Arc::new(FixedBackend {
            content: "<think>r</think>a".to_string(),
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
        });
        let (engine, _sink) = engine_with(job_config(), backend.clone());

        // Workers park on the empty queue while the source is still slow.
        let source = OneRowSource {
            delay: Duration::from_millis(80),
        };
        engine.start_source(source, false).await.expect("start");
        engine.pause().expect("pause");

        // The row arrives while paused; no worker may pick it up.
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
        assert_eq!(engine.progress().completed, 0);

        engine.resume().expect("resume");
        let stats = engine.join().await;
        assert_eq!(stats.completed, 1);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn halt_unknown_item_is_an_error() {
        let backend = Arc::new(FixedBackend {
            content: "a".to_string(),
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
        });
        let (engine, _sink) = engine_with(job_config(), backend);
        assert!(matches!(
            engine.halt_item(Uuid::new_v4()),
            Err(EngineError::UnknownItem(_))
        ));
    }
}
