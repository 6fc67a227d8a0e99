//! Multi-turn streaming conversation driver.
//!
//! Runs one work item as a conversation: the model answers the initial
//! query, a simulated user asks a follow-up, and the exchange repeats until
//! `follow_up_count` follow-ups have been answered. Each assistant response
//! streams through a per-turn state machine
//! (idle → waiting_for_response → extracting_reasoning → extracting_answer
//! → idle) so observers always know where an in-flight turn stands.

use std::sync::Arc;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::{BackendConfig, BackendFactory, BackendIdentity, ChatMessage, ChatRequest, ModelBackend};
use crate::error::{BackendError, ConfigError};
use crate::pipeline::{call_with_retry, PipelineError};
use crate::retry::RetryPolicy;
use crate::scheduler::StreamingSlot;
use crate::stream::{StreamParser, StreamSnapshot};

/// Default prompt for the simulated user producing follow-up questions.
const DEFAULT_FOLLOW_UP_TEMPLATE: &str = "You are the user in this conversation. \
Given the assistant's last answer, reply with exactly one natural follow-up \
question and nothing else.\n\nAnswer:\n{answer}";

/// Where a streaming turn currently stands.
///
/// Transitions are strictly forward within one turn; a finished turn
/// returns to `Idle` before the next one begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnPhase {
    /// No request in flight.
    Idle,
    /// Request sent, no chunk received yet.
    WaitingForResponse,
    /// Chunks arriving inside an unterminated reasoning segment.
    ExtractingReasoning,
    /// Reasoning closed (or absent); chunks now extend the answer.
    ExtractingAnswer,
}

impl TurnPhase {
    /// Stable lowercase name, used in streaming snapshots.
    pub fn name(&self) -> &'static str {
        match self {
            TurnPhase::Idle => "idle",
            TurnPhase::WaitingForResponse => "waiting_for_response",
            TurnPhase::ExtractingReasoning => "extracting_reasoning",
            TurnPhase::ExtractingAnswer => "extracting_answer",
        }
    }

    /// Derive the extraction phase from the parser's current split.
    pub fn from_snapshot(snapshot: &StreamSnapshot) -> Self {
        if snapshot.reasoning_complete || snapshot.reasoning.is_empty() {
            TurnPhase::ExtractingAnswer
        } else {
            TurnPhase::ExtractingReasoning
        }
    }
}

impl std::fmt::Display for TurnPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Configuration for conversation-mode generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationConfig {
    /// Backend answering as the assistant.
    pub backend: BackendConfig,
    /// Number of simulated-user follow-ups after the initial query. The
    /// conversation therefore runs `follow_up_count + 1` assistant turns.
    pub follow_up_count: u32,
    /// Backend generating follow-up questions; the assistant backend is
    /// reused when unset.
    #[serde(default)]
    pub follow_up_backend: Option<BackendConfig>,
    /// Prompt template for the simulated user; `{answer}` and `{query}`
    /// are substituted from the preceding turn.
    pub follow_up_template: String,
    /// Optional system prompt opening the conversation.
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Retry budget for each backend call in the conversation.
    pub retry: RetryPolicy,
}

impl ConversationConfig {
    /// Create a config with no follow-ups and default prompts.
    pub fn new(backend: BackendConfig) -> Self {
        Self {
            backend,
            follow_up_count: 0,
            follow_up_backend: None,
            follow_up_template: DEFAULT_FOLLOW_UP_TEMPLATE.to_string(),
            system_prompt: None,
            retry: RetryPolicy::default(),
        }
    }

    /// Set the number of follow-up exchanges.
    pub fn with_follow_up_count(mut self, count: u32) -> Self {
        self.follow_up_count = count;
        self
    }

    /// Use a separate backend for the simulated user.
    pub fn with_follow_up_backend(mut self, backend: BackendConfig) -> Self {
        self.follow_up_backend = Some(backend);
        self
    }

    /// Set the simulated-user prompt template.
    pub fn with_follow_up_template(mut self, template: impl Into<String>) -> Self {
        self.follow_up_template = template.into();
        self
    }

    /// Set the system prompt.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Total assistant turns this conversation will run.
    pub fn turn_total(&self) -> u32 {
        self.follow_up_count + 1
    }
}

/// One completed exchange: the user query and the assistant's split output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    /// Zero-based turn index.
    pub index: u32,
    /// The user query this turn answered.
    pub query: String,
    /// Reasoning segment of the assistant response.
    pub reasoning: String,
    /// Answer segment of the assistant response.
    pub answer: String,
}

/// Result of a finished conversation.
#[derive(Debug, Clone)]
pub struct ConversationOutcome {
    /// All completed turns, in order.
    pub turns: Vec<ConversationTurn>,
    /// Number of completed state-machine cycles (idle back to idle). Equal
    /// to the turn count for an uninterrupted conversation.
    pub cycles: u32,
    /// Identity of the assistant backend.
    pub provenance: BackendIdentity,
}

/// Drives one conversation to completion.
pub struct ConversationDriver {
    config: ConversationConfig,
    assistant: Arc<dyn ModelBackend>,
    simulated_user: Arc<dyn ModelBackend>,
}

impl ConversationDriver {
    /// Resolve the backends this conversation needs.
    pub fn new(
        config: ConversationConfig,
        factory: &dyn BackendFactory,
    ) -> Result<Self, ConfigError> {
        let assistant = factory.create(&config.backend)?;
        let simulated_user = match &config.follow_up_backend {
            Some(backend) => factory.create(backend)?,
            None => Arc::clone(&assistant),
        };
        Ok(Self {
            config,
            assistant,
            simulated_user,
        })
    }

    /// Probe the conversation's backends once before a job dispatches.
    pub(crate) async fn probe_backends(&self) -> Result<(), BackendError> {
        self.assistant.probe().await?;
        if self.config.follow_up_backend.is_some() {
            self.simulated_user.probe().await?;
        }
        Ok(())
    }

    /// Run the full conversation for one initial query.
    ///
    /// Cancellation is honored between chunks; a cancelled conversation
    /// yields no outcome at all.
    pub async fn run(
        &self,
        initial_query: &str,
        slot: &StreamingSlot,
    ) -> Result<ConversationOutcome, PipelineError> {
        let mut messages: Vec<ChatMessage> = Vec::new();
        if let Some(system) = &self.config.system_prompt {
            messages.push(ChatMessage::system(system.clone()));
        }

        let total = self.config.turn_total();
        let mut turns: Vec<ConversationTurn> = Vec::with_capacity(total as usize);
        let mut cycles = 0u32;
        let mut query = initial_query.to_string();

        for index in 0..total {
            slot.begin_turn(index);
            messages.push(ChatMessage::user(query.clone()));

            let (reasoning, answer, full_text) =
                self.stream_assistant_turn(&messages, slot).await?;
            messages.push(ChatMessage::assistant(full_text));

            turns.push(ConversationTurn {
                index,
                query: query.clone(),
                reasoning,
                answer,
            });
            slot.set_phase(TurnPhase::Idle.name());
            cycles += 1;

            if index + 1 < total {
                query = self.next_follow_up(turns.last().expect("turn just pushed"), slot).await?;
                debug!(turn = index + 1, "Simulated user follow-up generated");
            }
        }

        Ok(ConversationOutcome {
            turns,
            cycles,
            provenance: self.assistant.identity(),
        })
    }

    /// Stream one assistant response, tracking the per-chunk state machine
    /// and feeding partial text into the slot.
    async fn stream_assistant_turn(
        &self,
        messages: &[ChatMessage],
        slot: &StreamingSlot,
    ) -> Result<(String, String, String), PipelineError> {
        let request = self.assistant_request(messages);

        let mut attempt = 0;
        loop {
            if slot.cancel_token().is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            slot.set_phase(TurnPhase::WaitingForResponse.name());

            match self.stream_once(request.clone(), slot).await {
                Ok(done) => return Ok(done),
                Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
                Err(PipelineError::Backend { phase, source }) => {
                    if !self.config.retry.should_retry(attempt, &source) {
                        return Err(PipelineError::Backend { phase, source });
                    }
                    let delay = self.config.retry.delay_with_jitter(attempt);
                    tokio::select! {
                        biased;
                        _ = slot.cancel_token().cancelled() => return Err(PipelineError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// One streaming attempt; a mid-stream failure surfaces as a backend
    /// error so the attempt can be retried from a clean parser.
    async fn stream_once(
        &self,
        request: ChatRequest,
        slot: &StreamingSlot,
    ) -> Result<(String, String, String), PipelineError> {
        let opened = tokio::select! {
            biased;
            _ = slot.cancel_token().cancelled() => return Err(PipelineError::Cancelled),
            opened = self.assistant.invoke_stream(request) => opened,
        };
        let mut stream = opened.map_err(|source| PipelineError::Backend {
            phase: TurnPhase::WaitingForResponse.name().to_string(),
            source,
        })?;

        let mut parser = StreamParser::default();
        let mut phase = TurnPhase::WaitingForResponse;
        loop {
            tokio::select! {
                biased;
                _ = slot.cancel_token().cancelled() => return Err(PipelineError::Cancelled),
                next = stream.next() => match next {
                    Some(Ok(chunk)) => {
                        let snapshot = parser.feed(&chunk);
                        let next_phase = TurnPhase::from_snapshot(&snapshot);
                        if next_phase != phase {
                            slot.set_phase(next_phase.name());
                            phase = next_phase;
                        }
                        slot.update_partial(&snapshot.reasoning, &snapshot.answer);
                    }
                    Some(Err(source)) => {
                        return Err(PipelineError::Backend {
                            phase: phase.name().to_string(),
                            source,
                        });
                    }
                    None => break,
                }
            }
        }

        let full_text = parser.accumulated().to_string();
        let parsed = parser.finish();
        slot.update_partial(&parsed.reasoning, &parsed.answer);
        Ok((parsed.reasoning, parsed.answer, full_text))
    }

    /// Ask the simulated user for the next question.
    async fn next_follow_up(
        &self,
        last_turn: &ConversationTurn,
        slot: &StreamingSlot,
    ) -> Result<String, PipelineError> {
        let prompt = self
            .config
            .follow_up_template
            .replace("{answer}", &last_turn.answer)
            .replace("{query}", &last_turn.query);
        let request = ChatRequest::new(String::new(), vec![ChatMessage::user(prompt)]);

        let response = call_with_retry(
            self.simulated_user.as_ref(),
            request,
            &self.config.retry,
            "follow_up",
            slot,
        )
        .await?;
        Ok(response.content.trim().to_string())
    }

    fn assistant_request(&self, messages: &[ChatMessage]) -> ChatRequest {
        let mut request = ChatRequest::new(String::new(), messages.to_vec());
        request.temperature = self.config.backend.temperature;
        request.max_tokens = self.config.backend.max_tokens;
        request
    }
}
