//! Local daemon backend adapter.
//!
//! Talks to a locally hosted model server exposing the same chat-completions
//! shape (Ollama and llama.cpp both serve an OpenAI-compatible endpoint).
//! No auth. The daemon additionally exposes a liveness probe so the
//! scheduler can surface "offline" once, instead of turning every call into
//! a hard error.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::BackendError;

use super::openai::{build_http_client, ChatCompletionsBackend};
use super::{BackendIdentity, ChatRequest, ChatResponse, ChunkStream, ModelBackend};

/// Timeout for the liveness probe; deliberately short so an offline daemon
/// is detected before any generation work is dispatched.
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Adapter for a locally hosted model daemon.
pub struct LocalDaemonBackend {
    inner: ChatCompletionsBackend,
    probe_client: reqwest::Client,
    base_url: String,
}

impl LocalDaemonBackend {
    /// Create a new adapter for the daemon at `base_url`.
    pub fn new(base_url: String, model: String) -> Self {
        Self {
            inner: ChatCompletionsBackend::new(base_url.clone(), model, None),
            probe_client: build_http_client(PROBE_TIMEOUT),
            base_url,
        }
    }

}

#[async_trait]
impl ModelBackend for LocalDaemonBackend {
    fn identity(&self) -> BackendIdentity {
        BackendIdentity {
            provider: "local".to_string(),
            model: self.inner.identity().model,
        }
    }

    async fn invoke(&self, request: ChatRequest) -> Result<ChatResponse, BackendError> {
        self.inner.invoke(request).await.map_err(localize_error)
    }

    async fn invoke_stream(&self, request: ChatRequest) -> Result<ChunkStream, BackendError> {
        self.inner
            .invoke_stream(request)
            .await
            .map_err(localize_error)
    }

    /// Lightweight liveness probe against the daemon's model-listing
    /// endpoint. `Err(BackendError::Offline)` when it does not answer.
    async fn probe(&self) -> Result<(), BackendError> {
        let url = format!("{}/models", self.base_url.trim_end_matches('/'));
        let response = self
            .probe_client
            .get(&url)
            .send()
            .await
            .map_err(|e| BackendError::Offline(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(BackendError::Offline(format!(
                "probe returned status {}",
                response.status()
            )))
        }
    }
}

/// A connection failure to a local daemon means the daemon is down, not
/// that the network is flaky; report it as offline so the scheduler stops
/// dispatching instead of retrying forever.
fn localize_error(err: BackendError) -> BackendError {
    match err {
        BackendError::Network(msg) => BackendError::Offline(msg),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ChatMessage;

    #[test]
    fn identity_reports_local_provider() {
        let backend = LocalDaemonBackend::new("http://localhost:11434/v1".into(), "llama".into());
        let identity = backend.identity();
        assert_eq!(identity.provider, "local");
        assert_eq!(identity.model, "llama");
    }

    #[test]
    fn network_errors_become_offline() {
        let err = localize_error(BackendError::Network("connection refused".into()));
        assert!(matches!(err, BackendError::Offline(_)));

        // Other kinds pass through untouched.
        let err = localize_error(BackendError::RateLimited("busy".into()));
        assert!(matches!(err, BackendError::RateLimited(_)));
    }

    #[tokio::test]
    async fn probe_reports_offline_when_unreachable() {
        let backend = LocalDaemonBackend::new("http://localhost:65535/v1".into(), "llama".into());
        let result = backend.probe().await;
        assert!(matches!(result, Err(BackendError::Offline(_))));
    }

    #[tokio::test]
    async fn invoke_reports_offline_when_unreachable() {
        let backend = LocalDaemonBackend::new("http://localhost:65535/v1".into(), "llama".into());
        let result = backend
            .invoke(ChatRequest::new("", vec![ChatMessage::user("hi")]))
            .await;
        assert!(matches!(result, Err(BackendError::Offline(_))));
    }
}
