//! genforge: Generation orchestration engine for LLM dataset synthesis.
//!
//! This library provides the pieces for running large batches of model
//! generations: provider backends, retry policy, streaming response
//! parsing, a multi-phase pipeline, multi-turn conversations, a bounded
//! worker pool with operator controls, and prefetching over paged sources.

// Core modules
pub mod backend;
pub mod conversation;
pub mod error;
pub mod pipeline;
pub mod prefetch;
pub mod retry;
pub mod scheduler;
pub mod storage;
pub mod stream;

// Re-export commonly used error types
pub use error::{
    BackendError, ConfigError, EngineError, SourceError, StorageError, ValidationError,
};
