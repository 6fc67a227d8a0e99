//! Job scheduling: a bounded worker pool with operator controls.
//!
//! The [`GenerationEngine`] owns the worker pool, the progress counters,
//! the per-item streaming slots, and the terminal record map. Observers
//! follow a job through [`EngineEvent`]s or by polling
//! [`GenerationEngine::progress`] and the streaming snapshots.

mod engine;
mod events;
mod job;
mod progress;

pub use engine::GenerationEngine;
pub use events::EngineEvent;
pub use job::{
    GenerationRecord, JobConfig, ResultStatus, StreamingSlot, StreamingState, WorkInput, WorkItem,
};
pub use progress::{ProgressCounters, ProgressStats};
