//! Phase pipeline configuration.
//!
//! A pipeline is an ordered chain of named phases. The order is fixed
//! (meta → retrieval → derivation → writer → rewriter); configuration only
//! decides which phases are enabled and how each one calls its backend.
//! The writer phase is mandatory: it is the terminal content producer.

use serde::{Deserialize, Serialize};

use crate::backend::BackendConfig;
use crate::error::ConfigError;
use crate::retry::RetryPolicy;

/// The named phases, in their fixed execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKind {
    /// Up-front analysis of the input item.
    Meta,
    /// Evidence / supporting-material gathering.
    Retrieval,
    /// Derivation of intermediate conclusions.
    Derivation,
    /// Terminal content producer. Always present.
    Writer,
    /// Optional post-pass that replaces the writer's reasoning segment.
    Rewriter,
}

impl PhaseKind {
    /// All phases in execution order.
    pub const ORDER: [PhaseKind; 5] = [
        PhaseKind::Meta,
        PhaseKind::Retrieval,
        PhaseKind::Derivation,
        PhaseKind::Writer,
        PhaseKind::Rewriter,
    ];

    /// Stable lowercase name, used in logs and streaming snapshots.
    pub fn name(&self) -> &'static str {
        match self {
            PhaseKind::Meta => "meta",
            PhaseKind::Retrieval => "retrieval",
            PhaseKind::Derivation => "derivation",
            PhaseKind::Writer => "writer",
            PhaseKind::Rewriter => "rewriter",
        }
    }

    /// The JSON field a structured response for this phase must carry.
    pub fn output_key(&self) -> &'static str {
        match self {
            PhaseKind::Meta => "analysis",
            PhaseKind::Retrieval => "evidence",
            PhaseKind::Derivation => "derivation",
            PhaseKind::Writer | PhaseKind::Rewriter => "content",
        }
    }
}

impl std::fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Configuration for a single phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseConfig {
    /// Which phase this configures.
    pub kind: PhaseKind,
    /// Disabled phases are skipped entirely.
    pub enabled: bool,
    /// Backend target for this phase's calls.
    pub backend: BackendConfig,
    /// Prompt template; `{input}` and `{context}` are substituted.
    pub prompt_template: String,
    /// Whether the phase output must be a JSON object carrying the
    /// phase's output key.
    pub structured_output: bool,
    /// Retry budget for this phase's backend calls and validation.
    pub retry: RetryPolicy,
}

impl PhaseConfig {
    /// Create an enabled phase with the default template.
    pub fn new(kind: PhaseKind, backend: BackendConfig) -> Self {
        Self {
            kind,
            enabled: true,
            backend,
            prompt_template: "{input}\n\n{context}".to_string(),
            structured_output: false,
            retry: RetryPolicy::default(),
        }
    }

    /// Set the prompt template.
    pub fn with_prompt_template(mut self, template: impl Into<String>) -> Self {
        self.prompt_template = template.into();
        self
    }

    /// Require a structured (JSON) response from this phase.
    pub fn with_structured_output(mut self) -> Self {
        self.structured_output = true;
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Enable or disable the phase.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Render the prompt for this phase.
    ///
    /// `{input}` is the original work item text; `{context}` is the
    /// accumulated output of every prior phase.
    pub fn render_prompt(&self, input: &str, context: &str) -> String {
        self.prompt_template
            .replace("{input}", input)
            .replace("{context}", context)
    }
}

/// Ordered configuration for the whole pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    phases: Vec<PhaseConfig>,
    /// When set, the rewriter may also replace the answer segment. Off by
    /// default: the rewriter's only permitted effect is replacing the
    /// reasoning segment, the answer is preserved byte-for-byte.
    pub rewriter_may_rewrite_answer: bool,
}

impl PipelineConfig {
    /// Create a pipeline with just a writer phase.
    pub fn new(writer: PhaseConfig) -> Self {
        let mut writer = writer;
        writer.kind = PhaseKind::Writer;
        Self {
            phases: vec![writer],
            rewriter_may_rewrite_answer: false,
        }
    }

    /// Add or replace the configuration for one phase. Phases are kept in
    /// their fixed execution order regardless of insertion order.
    pub fn with_phase(mut self, phase: PhaseConfig) -> Self {
        self.phases.retain(|p| p.kind != phase.kind);
        self.phases.push(phase);
        self.phases.sort_by_key(|p| {
            PhaseKind::ORDER
                .iter()
                .position(|k| *k == p.kind)
                .unwrap_or(usize::MAX)
        });
        self
    }

    /// Allow the rewriter to replace the answer segment as well.
    pub fn allow_answer_rewrite(mut self) -> Self {
        self.rewriter_may_rewrite_answer = true;
        self
    }

    /// Look up one phase's configuration.
    pub fn phase(&self, kind: PhaseKind) -> Option<&PhaseConfig> {
        self.phases.iter().find(|p| p.kind == kind)
    }

    /// Enabled phases before the writer, in execution order.
    pub fn enabled_pre_writer(&self) -> impl Iterator<Item = &PhaseConfig> {
        self.phases
            .iter()
            .filter(|p| p.enabled && !matches!(p.kind, PhaseKind::Writer | PhaseKind::Rewriter))
    }

    /// The writer phase, if configured.
    pub fn writer(&self) -> Option<&PhaseConfig> {
        self.phase(PhaseKind::Writer)
    }

    /// The rewriter phase, if configured and enabled.
    pub fn enabled_rewriter(&self) -> Option<&PhaseConfig> {
        self.phase(PhaseKind::Rewriter).filter(|p| p.enabled)
    }

    /// Check the writer-mandatory invariant.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.writer() {
            Some(writer) if writer.enabled => Ok(()),
            _ => Err(ConfigError::WriterDisabled),
        }
    }
}
