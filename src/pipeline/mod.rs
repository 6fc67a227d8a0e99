//! Multi-phase generation pipeline.
//!
//! One work item flows through an ordered chain of phases
//! (meta → retrieval → derivation → writer → rewriter); every phase except
//! the writer is optional. Pre-writer phases build up context, the writer
//! produces the terminal reasoning/answer content, and the rewriter
//! optionally replaces the reasoning segment afterwards.

mod config;
mod runner;

pub use config::{PhaseConfig, PhaseKind, PipelineConfig};
pub use runner::{PhaseRecord, PipelineError, PipelineOutput, PipelineRunner};

pub(crate) use runner::call_with_retry;
