//! Job, work-item and result definitions for the scheduler.
//!
//! - [`JobConfig`]: one configured generation run
//! - [`WorkItem`]: one input unit pulled from the data source
//! - [`GenerationRecord`]: the terminal output record per item
//! - [`StreamingSlot`]: live, observable state of one in-flight item

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::backend::BackendIdentity;
use crate::conversation::{ConversationConfig, ConversationTurn};
use crate::error::ConfigError;
use crate::pipeline::{PhaseRecord, PipelineConfig};
use crate::retry::RetryPolicy;

use super::events::EngineEvent;

/// Configuration for one generation job.
#[derive(Debug, Clone)]
pub struct JobConfig {
    /// Maximum number of concurrently in-flight items.
    pub concurrency: usize,
    /// Item-level retry budget, shared with the backend call path.
    pub retry: RetryPolicy,
    /// Inter-dispatch delay per worker, to respect external rate limits.
    pub sleep_time: Duration,
    /// Deadline for one item's full pipeline or conversation run.
    pub item_timeout: Duration,
    /// Ordered phase configuration.
    pub pipeline: PipelineConfig,
    /// When set, items run the multi-turn conversation state machine
    /// instead of the single-pass pipeline.
    pub conversation: Option<ConversationConfig>,
}

impl JobConfig {
    /// Create a job config with default scheduling parameters.
    pub fn new(pipeline: PipelineConfig) -> Self {
        Self {
            concurrency: 2,
            retry: RetryPolicy::default(),
            sleep_time: Duration::ZERO,
            item_timeout: Duration::from_secs(600),
            pipeline,
            conversation: None,
        }
    }

    /// Set the concurrency limit.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the inter-dispatch sleep.
    pub fn with_sleep_time(mut self, sleep_time: Duration) -> Self {
        self.sleep_time = sleep_time;
        self
    }

    /// Set the per-item timeout.
    pub fn with_item_timeout(mut self, timeout: Duration) -> Self {
        self.item_timeout = timeout;
        self
    }

    /// Run items as multi-turn conversations.
    pub fn with_conversation(mut self, conversation: ConversationConfig) -> Self {
        self.conversation = Some(conversation);
        self
    }

    /// Validate the configuration before any worker starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        self.pipeline.validate()
    }
}

/// Raw input for one work item.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum WorkInput {
    /// A topic string to generate from.
    Topic(String),
    /// A structured row pulled from a dataset source.
    Row(serde_json::Value),
    /// A manually supplied text block.
    Text(String),
}

impl WorkInput {
    /// Text representation handed to the pipeline as `{input}`.
    pub fn as_prompt_text(&self) -> String {
        match self {
            WorkInput::Topic(topic) => topic.clone(),
            WorkInput::Text(text) => text.clone(),
            WorkInput::Row(row) => row.to_string(),
        }
    }
}

/// One unit of work: an input plus its identity and worker slot.
///
/// Consumed exactly once; never mutated after dispatch except for the
/// retry marker attached when an operator re-runs it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    /// Stable identifier correlating dispatch, streaming state, result
    /// and any later retry.
    pub id: Uuid,
    /// Worker slot this item was dispatched to; `None` until a worker
    /// picks it up.
    #[serde(default)]
    pub slot: Option<usize>,
    /// The raw input.
    pub input: WorkInput,
    /// Set when the item is a user-triggered re-run of a failed item.
    pub retry: bool,
}

impl WorkItem {
    /// Create a fresh item with a generated id.
    pub fn new(input: WorkInput) -> Self {
        Self {
            id: Uuid::new_v4(),
            slot: None,
            input,
            retry: false,
        }
    }

    /// Assign the worker slot at dispatch time.
    pub fn with_slot(mut self, slot: usize) -> Self {
        self.slot = Some(slot);
        self
    }

    /// Mark this item as an operator-initiated retry, keeping its id so
    /// the new record replaces the old one. The worker slot is cleared;
    /// the re-run is dispatched to whichever worker is free.
    pub fn as_retry(mut self) -> Self {
        self.retry = true;
        self.slot = None;
        self
    }
}

/// Terminal status of a generation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    /// The item produced validated output.
    Success,
    /// The item's retry budget or deadline was exhausted.
    TimedOut,
    /// The item failed with a non-retryable or exhausted error.
    Error,
}

impl ResultStatus {
    /// Whether an operator retry applies to this status.
    pub fn is_failure(&self) -> bool {
        matches!(self, ResultStatus::TimedOut | ResultStatus::Error)
    }
}

/// Terminal output record for one work item.
///
/// Immutable once created, except for operator-initiated retry (which
/// replaces the record) and the storage flag (which tracks the external
/// persistence collaborator, not generation).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRecord {
    /// Id of the work item this record belongs to.
    pub item_id: Uuid,
    /// Terminal status.
    pub status: ResultStatus,
    /// Primary query text (single-pass jobs).
    pub query: String,
    /// Reasoning segment of the output.
    pub reasoning: String,
    /// Final answer segment of the output.
    pub answer: String,
    /// Ordered turns for multi-turn jobs; empty otherwise.
    pub turns: Vec<ConversationTurn>,
    /// Error detail when `status` is not success.
    pub error: Option<String>,
    /// Backend that produced the terminal content, when known.
    pub provenance: Option<BackendIdentity>,
    /// Per-phase intermediate snippets when pipeline mode was used.
    pub phases: Vec<PhaseRecord>,
    /// Set when generation succeeded but the persistence collaborator
    /// failed; storage can then be retried without re-running the model.
    pub storage_failed: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl GenerationRecord {
    /// Create an empty record shell for the given item and status.
    pub fn new(item_id: Uuid, status: ResultStatus) -> Self {
        Self {
            item_id,
            status,
            query: String::new(),
            reasoning: String::new(),
            answer: String::new(),
            turns: Vec::new(),
            error: None,
            provenance: None,
            phases: Vec::new(),
            storage_failed: false,
            created_at: Utc::now(),
        }
    }

    /// Create a failed record with error detail.
    pub fn failure(item_id: Uuid, status: ResultStatus, error: impl Into<String>) -> Self {
        let mut record = Self::new(item_id, status);
        record.error = Some(error.into());
        record
    }
}

/// Transient, observable state of one in-flight item.
///
/// Observers only ever receive clones of this snapshot, never a live
/// reference, so a consumer can render an in-progress item without tearing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingState {
    /// Id of the in-flight item.
    pub item_id: Uuid,
    /// Worker slot processing the item.
    #[serde(default)]
    pub worker_slot: Option<usize>,
    /// Name of the phase currently executing.
    pub phase: String,
    /// Partial reasoning text accumulated so far.
    pub reasoning: String,
    /// Partial answer text accumulated so far.
    pub answer: String,
    /// Current turn index (multi-turn jobs only).
    pub turn_index: u32,
    /// Total turns planned (multi-turn jobs only).
    pub turn_total: u32,
}

/// Owner of one item's streaming state and cancellation handle.
///
/// Lives only while the item is in flight; the scheduler removes it on
/// completion, halt, or abort. The inner mutex guards short copy-only
/// critical sections, so a std mutex is used rather than an async one.
#[derive(Debug)]
pub struct StreamingSlot {
    state: Mutex<StreamingState>,
    cancel: CancellationToken,
    publisher: Option<broadcast::Sender<EngineEvent>>,
}

impl StreamingSlot {
    /// Create a slot for an item, with its cancellation token parented to
    /// the job-level token.
    pub fn new(item_id: Uuid, turn_total: u32, cancel: CancellationToken) -> Self {
        Self {
            state: Mutex::new(StreamingState {
                item_id,
                worker_slot: None,
                phase: "idle".to_string(),
                reasoning: String::new(),
                answer: String::new(),
                turn_index: 0,
                turn_total,
            }),
            cancel,
            publisher: None,
        }
    }

    /// Publish a [`EngineEvent::Snapshot`] on every state change.
    pub fn with_publisher(mut self, events: broadcast::Sender<EngineEvent>) -> Self {
        self.publisher = Some(events);
        self
    }

    /// Record the worker slot processing this item.
    pub fn with_worker(self, slot: Option<usize>) -> Self {
        self.state
            .lock()
            .expect("streaming state lock poisoned")
            .worker_slot = slot;
        self
    }

    /// Immutable point-in-time copy for observers.
    pub fn snapshot(&self) -> StreamingState {
        self.state.lock().expect("streaming state lock poisoned").clone()
    }

    /// Record the phase currently executing.
    pub fn set_phase(&self, phase: &str) {
        let snapshot = {
            let mut state = self.state.lock().expect("streaming state lock poisoned");
            state.phase = phase.to_string();
            state.clone()
        };
        self.publish(snapshot);
    }

    /// Replace the partial reasoning/answer text.
    pub fn update_partial(&self, reasoning: &str, answer: &str) {
        let snapshot = {
            let mut state = self.state.lock().expect("streaming state lock poisoned");
            state.reasoning.clear();
            state.reasoning.push_str(reasoning);
            state.answer.clear();
            state.answer.push_str(answer);
            state.clone()
        };
        self.publish(snapshot);
    }

    /// Advance the turn index and clear per-turn partial text.
    pub fn begin_turn(&self, index: u32) {
        let snapshot = {
            let mut state = self.state.lock().expect("streaming state lock poisoned");
            state.turn_index = index;
            state.reasoning.clear();
            state.answer.clear();
            state.clone()
        };
        self.publish(snapshot);
    }

    fn publish(&self, snapshot: StreamingState) {
        if let Some(events) = &self.publisher {
            // Dropped when no observer is subscribed.
            let _ = events.send(EngineEvent::Snapshot(snapshot));
        }
    }

    /// The cancellation token owning this item.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cancel exactly this item.
    pub fn halt(&self) {
        self.cancel.cancel();
    }
}
