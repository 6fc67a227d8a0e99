//! Phase pipeline runner.
//!
//! Executes the configured phase chain over one work item: each phase
//! receives the original input plus every prior phase's output, and the
//! writer's text is split into reasoning and answer segments. Structured
//! phases are schema-validated; a phase whose validation keeps failing is
//! degraded to its raw text rather than aborting the whole item.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::backend::{
    parse_tool_or_json, BackendFactory, BackendIdentity, ChatMessage, ChatRequest, ModelBackend,
};
use crate::error::{BackendError, ConfigError, ValidationError};
use crate::retry::RetryPolicy;
use crate::scheduler::StreamingSlot;
use crate::stream::StreamParser;

use super::config::{PhaseConfig, PhaseKind, PipelineConfig};

/// Errors surfaced by a pipeline run.
///
/// `Cancelled` is control flow, not a failure: the scheduler never records
/// it in a result.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Backend call failed in '{phase}': {source}")]
    Backend {
        phase: String,
        #[source]
        source: BackendError,
    },

    #[error("Run was cancelled")]
    Cancelled,
}

impl PipelineError {
    /// The underlying backend error, if any.
    pub fn backend_error(&self) -> Option<&BackendError> {
        match self {
            PipelineError::Backend { source, .. } => Some(source),
            PipelineError::Cancelled => None,
        }
    }
}

/// Output snippet retained for one executed phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseRecord {
    /// Which phase produced this output.
    pub kind: PhaseKind,
    /// The phase's output text (extracted field for structured phases,
    /// raw text after a degraded fallback).
    pub output: String,
    /// Whether the output passed schema validation. Always true for
    /// unstructured phases.
    pub validated: bool,
    /// Model that produced the output.
    pub model: String,
}

/// Final result of running the pipeline over one item.
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    /// Reasoning segment of the terminal content.
    pub reasoning: String,
    /// Final answer segment.
    pub answer: String,
    /// Per-phase intermediate snippets, in execution order.
    pub phases: Vec<PhaseRecord>,
    /// Identity of the backend that produced the terminal content.
    pub provenance: BackendIdentity,
}

/// State machine executing the phase chain for one item.
pub struct PipelineRunner {
    config: PipelineConfig,
    backends: HashMap<PhaseKind, Arc<dyn ModelBackend>>,
}

impl PipelineRunner {
    /// Build a runner, resolving one backend per enabled phase.
    pub fn new(
        config: PipelineConfig,
        factory: &dyn BackendFactory,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let mut backends = HashMap::new();
        for kind in PhaseKind::ORDER {
            if let Some(phase) = config.phase(kind) {
                if phase.enabled {
                    backends.insert(kind, factory.create(&phase.backend)?);
                }
            }
        }

        Ok(Self { config, backends })
    }

    /// Probe every resolved backend once, so a job fails up front instead
    /// of erroring item by item against a dead endpoint.
    pub(crate) async fn probe_backends(&self) -> Result<(), BackendError> {
        for backend in self.backends.values() {
            backend.probe().await?;
        }
        Ok(())
    }

    /// Run the full phase chain over one input.
    ///
    /// Cancellation is checked before every phase and at every streamed
    /// chunk via the slot's token.
    pub async fn run(
        &self,
        input: &str,
        slot: &StreamingSlot,
    ) -> Result<PipelineOutput, PipelineError> {
        let mut phases: Vec<PhaseRecord> = Vec::new();
        let mut context = String::new();

        for phase in self.config.enabled_pre_writer() {
            if slot.cancel_token().is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            let record = self.run_context_phase(phase, input, &context, slot).await?;
            if !context.is_empty() {
                context.push_str("\n\n");
            }
            context.push_str(&format!("[{}]\n{}", record.kind, record.output));
            phases.push(record);
        }

        let writer = self
            .config
            .writer()
            .expect("validated config always has a writer");
        let (mut reasoning, mut answer, writer_record) =
            self.run_writer(writer, input, &context, slot).await?;
        let provenance = self.backend_for(PhaseKind::Writer).identity();
        phases.push(writer_record);

        if let Some(rewriter) = self.config.enabled_rewriter() {
            if slot.cancel_token().is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            match self
                .run_rewriter(rewriter, input, &reasoning, &answer, slot)
                .await
            {
                Ok((new_reasoning, new_answer, record)) => {
                    reasoning = new_reasoning;
                    if let Some(rewritten) = new_answer {
                        answer = rewritten;
                    }
                    phases.push(record);
                }
                Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
                Err(e) => {
                    // The writer already produced terminal content; a
                    // failed rewrite pass degrades to the writer output.
                    warn!(error = %e, "Rewriter pass failed, keeping writer output");
                }
            }
        }

        Ok(PipelineOutput {
            reasoning,
            answer,
            phases,
            provenance,
        })
    }

    fn backend_for(&self, kind: PhaseKind) -> &Arc<dyn ModelBackend> {
        self.backends
            .get(&kind)
            .expect("backend resolved for every enabled phase")
    }

    /// Run one pre-writer phase: call, validate, degrade on repeated
    /// validation failure.
    async fn run_context_phase(
        &self,
        phase: &PhaseConfig,
        input: &str,
        context: &str,
        slot: &StreamingSlot,
    ) -> Result<PhaseRecord, PipelineError> {
        slot.set_phase(phase.kind.name());
        let backend = self.backend_for(phase.kind);
        let request = phase_request(phase, phase.render_prompt(input, context));
        let model = backend.identity().model;

        let mut last_raw = String::new();
        for attempt in 0..=phase.retry.max_retries {
            let invoked = tokio::select! {
                biased;
                _ = slot.cancel_token().cancelled() => return Err(PipelineError::Cancelled),
                invoked = backend.invoke(request.clone()) => invoked,
            };
            let response = match invoked {
                Ok(response) => response,
                Err(e) => {
                    retry_or_bail(phase, attempt, e, slot).await?;
                    continue;
                }
            };

            last_raw = response.content;
            if !phase.structured_output {
                return Ok(PhaseRecord {
                    kind: phase.kind,
                    output: last_raw,
                    validated: true,
                    model,
                });
            }

            match validate_structured(&last_raw, phase.kind.output_key()) {
                Ok(extracted) => {
                    return Ok(PhaseRecord {
                        kind: phase.kind,
                        output: extracted,
                        validated: true,
                        model,
                    });
                }
                Err(e) => {
                    warn!(
                        phase = %phase.kind,
                        attempt = attempt + 1,
                        error = %e,
                        "Structured output failed validation"
                    );
                }
            }
        }

        // Validation budget exhausted: degrade to the raw text instead of
        // aborting the item.
        debug!(phase = %phase.kind, "Falling back to raw unvalidated phase output");
        Ok(PhaseRecord {
            kind: phase.kind,
            output: last_raw,
            validated: false,
            model,
        })
    }

    /// Run the writer phase with streaming, feeding partial reasoning and
    /// answer into the slot as chunks arrive.
    async fn run_writer(
        &self,
        phase: &PhaseConfig,
        input: &str,
        context: &str,
        slot: &StreamingSlot,
    ) -> Result<(String, String, PhaseRecord), PipelineError> {
        if slot.cancel_token().is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        slot.set_phase(phase.kind.name());
        let backend = self.backend_for(PhaseKind::Writer);
        let request = phase_request(phase, phase.render_prompt(input, context));
        let model = backend.identity().model;

        let mut last_raw = String::new();
        for attempt in 0..=phase.retry.max_retries {
            let opened = tokio::select! {
                biased;
                _ = slot.cancel_token().cancelled() => return Err(PipelineError::Cancelled),
                opened = backend.invoke_stream(request.clone()) => opened,
            };
            let mut stream = match opened {
                Ok(stream) => stream,
                Err(e) => {
                    retry_or_bail(phase, attempt, e, slot).await?;
                    continue;
                }
            };

            // A mid-stream failure discards this attempt's partial text so
            // a retry starts from a clean parser.
            let mut parser = StreamParser::default();
            let mut stream_failure: Option<BackendError> = None;
            loop {
                tokio::select! {
                    biased;
                    _ = slot.cancel_token().cancelled() => return Err(PipelineError::Cancelled),
                    next = stream.next() => match next {
                        Some(Ok(chunk)) => {
                            let snap = parser.feed(&chunk);
                            slot.update_partial(&snap.reasoning, &snap.answer);
                        }
                        Some(Err(e)) => {
                            stream_failure = Some(e);
                            break;
                        }
                        None => break,
                    }
                }
            }

            if let Some(e) = stream_failure {
                retry_or_bail(phase, attempt, e, slot).await?;
                continue;
            }

            last_raw = parser.accumulated().to_string();
            let text = if phase.structured_output {
                match validate_structured(&last_raw, phase.kind.output_key()) {
                    Ok(extracted) => extracted,
                    Err(e) => {
                        warn!(
                            attempt = attempt + 1,
                            error = %e,
                            "Writer structured output failed validation"
                        );
                        if attempt < phase.retry.max_retries {
                            continue;
                        }
                        break;
                    }
                }
            } else {
                last_raw.clone()
            };

            let parsed = StreamParser::parse_complete(&text);
            slot.update_partial(&parsed.reasoning, &parsed.answer);
            let record = PhaseRecord {
                kind: PhaseKind::Writer,
                output: text,
                validated: true,
                model,
            };
            return Ok((parsed.reasoning, parsed.answer, record));
        }

        // Writer validation exhausted: degrade to the raw text split.
        debug!("Falling back to raw unvalidated writer output");
        let parsed = StreamParser::parse_complete(&last_raw);
        slot.update_partial(&parsed.reasoning, &parsed.answer);
        let record = PhaseRecord {
            kind: PhaseKind::Writer,
            output: last_raw,
            validated: false,
            model,
        };
        Ok((parsed.reasoning, parsed.answer, record))
    }

    /// Run the rewriter pass: replaces only the reasoning segment. The
    /// answer is preserved byte-for-byte unless the pipeline config
    /// explicitly allows rewriting it.
    async fn run_rewriter(
        &self,
        phase: &PhaseConfig,
        input: &str,
        reasoning: &str,
        answer: &str,
        slot: &StreamingSlot,
    ) -> Result<(String, Option<String>, PhaseRecord), PipelineError> {
        slot.set_phase(phase.kind.name());
        let backend = self.backend_for(PhaseKind::Rewriter);
        let context = format!("Reasoning:\n{}\n\nAnswer:\n{}", reasoning, answer);
        let request = phase_request(phase, phase.render_prompt(input, &context));
        let model = backend.identity().model;

        let response =
            call_with_retry(backend.as_ref(), request, &phase.retry, phase.kind.name(), slot)
                .await?;

        let parsed = StreamParser::parse_complete(&response.content);
        // A delimited rewrite carries both segments; an undelimited one is
        // the new reasoning in its entirety.
        let new_reasoning = if parsed.reasoning.is_empty() {
            parsed.answer.clone()
        } else {
            parsed.reasoning.clone()
        };
        let new_answer = (self.config.rewriter_may_rewrite_answer
            && !parsed.reasoning.is_empty()
            && !parsed.answer.is_empty())
        .then(|| parsed.answer.clone());

        let record = PhaseRecord {
            kind: PhaseKind::Rewriter,
            output: response.content,
            validated: true,
            model,
        };
        Ok((new_reasoning, new_answer, record))
    }
}

/// Invoke a backend with the phase's retry policy, sleeping between
/// attempts and aborting promptly on cancellation.
pub(crate) async fn call_with_retry(
    backend: &dyn ModelBackend,
    request: ChatRequest,
    policy: &RetryPolicy,
    label: &str,
    slot: &StreamingSlot,
) -> Result<crate::backend::ChatResponse, PipelineError> {
    let mut attempt = 0;
    loop {
        let invoked = tokio::select! {
            biased;
            _ = slot.cancel_token().cancelled() => return Err(PipelineError::Cancelled),
            invoked = backend.invoke(request.clone()) => invoked,
        };
        match invoked {
            Ok(response) => return Ok(response),
            Err(e) => {
                if !policy.should_retry(attempt, &e) {
                    return Err(PipelineError::Backend {
                        phase: label.to_string(),
                        source: e,
                    });
                }
                backoff_or_cancel(policy, attempt, slot).await?;
                attempt += 1;
            }
        }
    }
}

/// Decide whether one failed attempt is retried; sleeps the backoff on
/// retry, returns the error otherwise.
async fn retry_or_bail(
    phase: &PhaseConfig,
    attempt: u32,
    error: BackendError,
    slot: &StreamingSlot,
) -> Result<(), PipelineError> {
    if !phase.retry.should_retry(attempt, &error) {
        return Err(PipelineError::Backend {
            phase: phase.kind.to_string(),
            source: error,
        });
    }
    warn!(
        phase = %phase.kind,
        attempt = attempt + 1,
        error = %error,
        "Transient backend failure, will retry"
    );
    backoff_or_cancel(&phase.retry, attempt, slot).await
}

async fn backoff_or_cancel(
    policy: &RetryPolicy,
    attempt: u32,
    slot: &StreamingSlot,
) -> Result<(), PipelineError> {
    let delay = policy.delay_with_jitter(attempt);
    tokio::select! {
        biased;
        _ = slot.cancel_token().cancelled() => Err(PipelineError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

/// Validate structured phase output: must be a JSON object carrying the
/// phase's output key as a string.
fn validate_structured(raw: &str, key: &str) -> Result<String, ValidationError> {
    let value = parse_tool_or_json(raw)?;
    value
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| ValidationError::MissingField(key.to_string()))
}

fn phase_request(phase: &PhaseConfig, prompt: String) -> ChatRequest {
    let mut request = ChatRequest::new("", vec![ChatMessage::user(prompt)]);
    request.temperature = phase.backend.temperature;
    request.max_tokens = phase.backend.max_tokens;
    request.structured = phase.structured_output;
    request
}
