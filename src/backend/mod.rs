//! Backend adapters for heterogeneous model providers.
//!
//! Every provider is normalized behind the [`ModelBackend`] trait: a request
//! goes in, either a complete response or a stream of text chunks comes out.
//! Differences in request shape, streaming format, and auth are absorbed
//! here and never propagated further into the engine.

pub mod local;
pub mod openai;

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::error::{BackendError, ValidationError};

pub use local::LocalDaemonBackend;
pub use openai::ChatCompletionsBackend;

/// Default per-request timeout for provider HTTP calls.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// A stream of normalized text chunks from a provider.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<String, BackendError>> + Send>>;

/// A message in a conversation with a model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Role of the message sender ("system", "user", "assistant").
    pub role: String,
    /// Content of the message.
    pub content: String,
}

impl ChatMessage {
    /// Create a new system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    /// Create a new user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    /// Create a new assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Request for text generation from a model backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Model identifier to use for generation.
    pub model: String,
    /// Conversation messages.
    pub messages: Vec<ChatMessage>,
    /// Sampling temperature.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Maximum number of tokens to generate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Whether the caller expects a JSON object back.
    #[serde(default)]
    pub structured: bool,
}

impl ChatRequest {
    /// Create a new request with default sampling parameters.
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: None,
            max_tokens: None,
            structured: false,
        }
    }

    /// Set the sampling temperature.
    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Set the maximum tokens to generate.
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Request a structured (JSON object) response.
    pub fn structured(mut self) -> Self {
        self.structured = true;
        self
    }
}

/// A complete (non-streamed) response from a backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    /// Model that produced the response.
    pub model: String,
    /// Full response text.
    pub content: String,
}

/// Provenance of a backend, attached to generation records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendIdentity {
    /// Provider name ("openai-compatible", "local").
    pub provider: String,
    /// Model identifier.
    pub model: String,
}

/// Uniform interface to a model provider.
///
/// `invoke` returns the full response in one piece; `invoke_stream` yields
/// normalized text chunks as they arrive. Implementations classify transport
/// and HTTP failures into the [`BackendError`] taxonomy so the retry policy
/// can distinguish fatal from transient failures.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Provider and model identity for provenance tracking.
    fn identity(&self) -> BackendIdentity;

    /// Perform a complete request/response call.
    async fn invoke(&self, request: ChatRequest) -> Result<ChatResponse, BackendError>;

    /// Perform a streaming call, yielding text chunks as they arrive.
    async fn invoke_stream(&self, request: ChatRequest) -> Result<ChunkStream, BackendError>;

    /// Preflight liveness check, run once before a job dispatches any work.
    ///
    /// Hosted providers answer per call and have nothing useful to probe;
    /// local daemons override this so an offline daemon fails the job once
    /// instead of producing one error record per item.
    async fn probe(&self) -> Result<(), BackendError> {
        Ok(())
    }
}

/// Which kind of provider a [`BackendConfig`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Any OpenAI-chat-completions-compatible endpoint (native or proxy).
    OpenAiCompatible,
    /// A locally hosted daemon with a liveness probe.
    LocalDaemon,
}

/// Configuration for one backend target: provider, model, credentials,
/// endpoint. Credentials and base URLs come from configuration or the
/// environment, never from code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Provider kind.
    pub provider: ProviderKind,
    /// Model identifier.
    pub model: String,
    /// API key, if the provider requires one.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Base URL of the endpoint.
    pub base_url: String,
    /// Sampling temperature applied to every request.
    #[serde(default)]
    pub temperature: Option<f64>,
    /// Token cap applied to every request.
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

impl BackendConfig {
    /// Create a config for an OpenAI-compatible endpoint.
    pub fn openai_compatible(
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
    ) -> Self {
        Self {
            provider: ProviderKind::OpenAiCompatible,
            model: model.into(),
            api_key,
            base_url: base_url.into(),
            temperature: None,
            max_tokens: None,
        }
    }

    /// Create a config for a local daemon backend.
    pub fn local_daemon(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: ProviderKind::LocalDaemon,
            model: model.into(),
            api_key: None,
            base_url: base_url.into(),
            temperature: None,
            max_tokens: None,
        }
    }

    /// Read an OpenAI-compatible config from the environment.
    ///
    /// Reads `GENFORGE_API_BASE` (required), `GENFORGE_API_KEY` (optional)
    /// and `GENFORGE_MODEL` (required).
    pub fn from_env() -> Result<Self, BackendError> {
        let base_url = std::env::var("GENFORGE_API_BASE")
            .map_err(|_| BackendError::MissingBaseUrl("openai-compatible".into()))?;
        let model = std::env::var("GENFORGE_MODEL")
            .map_err(|_| BackendError::MissingBaseUrl("openai-compatible".into()))?;
        let api_key = std::env::var("GENFORGE_API_KEY").ok();
        Ok(Self::openai_compatible(base_url, model, api_key))
    }

    /// Set the temperature for every request issued through this backend.
    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Set the max token cap for every request issued through this backend.
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Construct the adapter this config describes.
    pub fn build(&self) -> Result<Arc<dyn ModelBackend>, BackendError> {
        match self.provider {
            ProviderKind::OpenAiCompatible => Ok(Arc::new(ChatCompletionsBackend::new(
                self.base_url.clone(),
                self.model.clone(),
                self.api_key.clone(),
            ))),
            ProviderKind::LocalDaemon => Ok(Arc::new(LocalDaemonBackend::new(
                self.base_url.clone(),
                self.model.clone(),
            ))),
        }
    }
}

/// Creates backend adapters from configuration.
///
/// The engine resolves every [`BackendConfig`] through a factory so tests
/// and embedders can substitute their own transports.
pub trait BackendFactory: Send + Sync {
    /// Build (or reuse) an adapter for the given target.
    fn create(&self, config: &BackendConfig) -> Result<Arc<dyn ModelBackend>, BackendError>;
}

/// Default factory: builds real HTTP adapters.
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpBackendFactory;

impl BackendFactory for HttpBackendFactory {
    fn create(&self, config: &BackendConfig) -> Result<Arc<dyn ModelBackend>, BackendError> {
        config.build()
    }
}

/// Extract a structured JSON payload from raw model output.
///
/// Models frequently wrap JSON in markdown fences or preface it with prose.
/// This scans for the first balanced top-level object and parses it.
pub fn parse_tool_or_json(raw: &str) -> Result<serde_json::Value, ValidationError> {
    let trimmed = strip_code_fences(raw);

    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if value.is_object() {
            return Ok(value);
        }
    }

    // Fall back to scanning for the first balanced object.
    let Some(start) = trimmed.find('{') else {
        return Err(ValidationError::NotJson("no object found".into()));
    };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in trimmed[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    let candidate = &trimmed[start..start + offset + ch.len_utf8()];
                    return serde_json::from_str(candidate)
                        .map_err(|e| ValidationError::NotJson(e.to_string()));
                }
            }
            _ => {}
        }
    }

    Err(ValidationError::NotJson("unbalanced object".into()))
}

/// Strip a leading/trailing markdown code fence if present.
fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop an optional language tag on the fence line.
    let rest = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    rest.strip_suffix("```").unwrap_or(rest).trim()
}
