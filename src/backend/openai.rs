//! OpenAI-chat-completions-compatible backend adapter.
//!
//! Works against any endpoint speaking the `/chat/completions` shape: the
//! native API, OpenRouter-style aggregators, or custom proxies. Auth is a
//! bearer key when configured. Streaming uses server-sent events with
//! `data:` lines terminated by a `[DONE]` sentinel.

use std::time::Duration;

use async_stream::try_stream;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::BackendError;

use super::{
    BackendIdentity, ChatRequest, ChatResponse, ChunkStream, ModelBackend,
    DEFAULT_REQUEST_TIMEOUT,
};

/// Adapter for OpenAI-compatible chat-completion endpoints.
pub struct ChatCompletionsBackend {
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl ChatCompletionsBackend {
    /// Create a new adapter for the given endpoint and model.
    pub fn new(base_url: String, model: String, api_key: Option<String>) -> Self {
        Self {
            client: build_http_client(DEFAULT_REQUEST_TIMEOUT),
            base_url,
            model,
            api_key,
        }
    }

    /// Base URL this adapter talks to.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    fn apply_auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.header("Authorization", format!("Bearer {}", key)),
            None => builder,
        }
    }

    async fn send(&self, body: &ApiRequest) -> Result<reqwest::Response, BackendError> {
        let response = self
            .apply_auth(self.client.post(self.endpoint()))
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let code = status.as_u16();
        let text = response
            .text()
            .await
            .unwrap_or_else(|_| "failed to read error body".to_string());
        Err(classify_status(code, text))
    }
}

/// Build the shared HTTP client used by provider adapters.
pub(crate) fn build_http_client(timeout: Duration) -> Client {
    Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_default()
}

/// Map a reqwest transport error onto the backend taxonomy.
pub(crate) fn classify_transport_error(err: reqwest::Error) -> BackendError {
    if err.is_timeout() {
        BackendError::Timeout(DEFAULT_REQUEST_TIMEOUT)
    } else if err.is_decode() {
        BackendError::MalformedResponse(err.to_string())
    } else {
        BackendError::Network(err.to_string())
    }
}

/// Map an HTTP status code and body onto the backend taxonomy.
pub(crate) fn classify_status(code: u16, body: String) -> BackendError {
    let message = match serde_json::from_str::<ApiErrorResponse>(&body) {
        Ok(parsed) => parsed.error.message,
        Err(_) => body,
    };
    match code {
        401 | 403 => BackendError::Auth(message),
        429 => BackendError::RateLimited(message),
        _ => BackendError::Api { code, message },
    }
}

#[async_trait]
impl ModelBackend for ChatCompletionsBackend {
    fn identity(&self) -> BackendIdentity {
        BackendIdentity {
            provider: "openai-compatible".to_string(),
            model: self.model.clone(),
        }
    }

    async fn invoke(&self, request: ChatRequest) -> Result<ChatResponse, BackendError> {
        let body = ApiRequest::from_chat(&self.model, request, false);
        let response = self.send(&body).await?;

        let api: ApiResponse = response
            .json()
            .await
            .map_err(|e| BackendError::MalformedResponse(e.to_string()))?;

        let content = api
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| BackendError::MalformedResponse("response had no choices".into()))?;

        Ok(ChatResponse {
            model: api.model,
            content,
        })
    }

    async fn invoke_stream(&self, request: ChatRequest) -> Result<ChunkStream, BackendError> {
        let body = ApiRequest::from_chat(&self.model, request, true);
        let response = self.send(&body).await?;

        let mut bytes = response.bytes_stream();
        let stream = try_stream! {
            let mut pending = String::new();
            while let Some(chunk) = bytes.next().await {
                let chunk = chunk.map_err(classify_transport_error)?;
                pending.push_str(&String::from_utf8_lossy(&chunk));

                // SSE events are newline-delimited; keep the trailing
                // partial line in the buffer for the next chunk.
                while let Some(newline) = pending.find('\n') {
                    let line = pending[..newline].trim().to_string();
                    pending.drain(..=newline);
                    if let Some(text) = parse_sse_line(&line)? {
                        yield text;
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

/// Parse one SSE line into an optional text delta.
///
/// Returns `Ok(None)` for keep-alives, the `[DONE]` sentinel, and deltas
/// with no content field.
fn parse_sse_line(line: &str) -> Result<Option<String>, BackendError> {
    let Some(payload) = line.strip_prefix("data:") else {
        return Ok(None);
    };
    let payload = payload.trim();
    if payload.is_empty() || payload == "[DONE]" {
        return Ok(None);
    }

    let event: StreamEvent = serde_json::from_str(payload)
        .map_err(|e| BackendError::MalformedResponse(format!("bad stream event: {}", e)))?;

    Ok(event
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)
        .filter(|s| !s.is_empty()))
}

#[derive(Debug, Serialize)]
struct ApiRequest {
    model: String,
    messages: Vec<super::ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
    stream: bool,
}

impl ApiRequest {
    fn from_chat(default_model: &str, request: ChatRequest, stream: bool) -> Self {
        let model = if request.model.is_empty() {
            default_model.to_string()
        } else {
            request.model
        };
        Self {
            model,
            messages: request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            response_format: request.structured.then(|| ResponseFormat {
                format_type: "json_object".to_string(),
            }),
            stream,
        }
    }
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    model: String,
    choices: Vec<ApiChoice>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct StreamEvent {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ApiErrorResponse {
    pub(crate) error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ApiErrorDetail {
    pub(crate) message: String,
}
