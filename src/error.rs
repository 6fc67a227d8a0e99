//! Error types for the generation engine.
//!
//! Defines error types for each major subsystem:
//! - Backend calls (auth, rate limits, transport, malformed bodies)
//! - Structured-output validation
//! - Persistence handoff
//! - Paged data sources
//! - Job-level configuration and engine control
//!
//! Cancellation is deliberately not represented here: halting an item or
//! stopping a job is a control action, never an error.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur when calling a model backend.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Authentication or authorization failure. Never retried.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// The provider rejected the request due to rate limiting or quota.
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Transport-level failure (connect, DNS, TLS, reset).
    #[error("Network error: {0}")]
    Network(String),

    /// The call exceeded its deadline.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// The provider returned a body that could not be decoded.
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// A local daemon backend is not reachable at all.
    #[error("Local backend offline: {0}")]
    Offline(String),

    /// The provider returned a non-success status with a structured message.
    #[error("API error ({code}): {message}")]
    Api { code: u16, message: String },

    /// No API key was configured for a provider that requires one.
    #[error("Missing API key for provider '{0}'")]
    MissingApiKey(String),

    /// No base URL was configured for a provider that requires one.
    #[error("Missing base URL for provider '{0}'")]
    MissingBaseUrl(String),
}

impl BackendError {
    /// Whether the retry policy may re-attempt a call that failed with this
    /// error. Authentication and configuration failures are always final.
    pub fn is_retryable(&self) -> bool {
        match self {
            BackendError::RateLimited(_)
            | BackendError::Network(_)
            | BackendError::Timeout(_)
            | BackendError::MalformedResponse(_) => true,
            BackendError::Api { code, .. } => *code == 429 || *code >= 500,
            BackendError::Auth(_)
            | BackendError::Offline(_)
            | BackendError::MissingApiKey(_)
            | BackendError::MissingBaseUrl(_) => false,
        }
    }
}

/// Errors raised when validating structured phase output.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// The output was not valid JSON at all.
    #[error("Output is not valid JSON: {0}")]
    NotJson(String),

    /// The output parsed but is not a JSON object.
    #[error("Output is not a JSON object")]
    NotObject,

    /// A required field was absent or had the wrong type.
    #[error("Missing or invalid field '{0}' in structured output")]
    MissingField(String),
}

/// Errors from the persistence collaborator.
///
/// Kept separate from generation status so storage can be retried without
/// re-running the model call.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to persist record: {0}")]
    PersistFailed(String),

    #[error("No record found for item '{0}'")]
    RecordNotFound(uuid::Uuid),
}

/// Errors from a paged remote data source.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Failed to fetch page {page}: {message}")]
    FetchFailed { page: usize, message: String },

    #[error("Source truncated page {page} mid-transfer: {message}")]
    Truncated { page: usize, message: String },
}

/// Configuration errors, reported once before any worker starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Concurrency must be at least 1")]
    ZeroConcurrency,

    #[error("Writer phase must be enabled: it is the terminal content producer")]
    WriterDisabled,

    #[error("Phase '{0}' configured out of order")]
    PhaseOutOfOrder(String),

    #[error("Missing environment variable: {0}")]
    MissingEnv(String),

    #[error("Backend configuration invalid: {0}")]
    Backend(#[from] BackendError),
}

/// Job-level errors surfaced by the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Job is already running")]
    AlreadyRunning,

    #[error("No job is running")]
    NotRunning,

    /// A backend failed its preflight probe; no worker was started.
    #[error("No live backend: {0}")]
    Offline(#[source] BackendError),

    #[error("No failed record found for item '{0}'")]
    NothingToRetry(uuid::Uuid),

    #[error("No in-flight item '{0}'")]
    UnknownItem(uuid::Uuid),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_errors_are_never_retryable() {
        assert!(!BackendError::Auth("bad key".into()).is_retryable());
        assert!(!BackendError::MissingApiKey("openai".into()).is_retryable());
        assert!(!BackendError::Offline("connection refused".into()).is_retryable());
    }

    #[test]
    fn transient_errors_are_retryable() {
        assert!(BackendError::RateLimited("quota".into()).is_retryable());
        assert!(BackendError::Network("reset".into()).is_retryable());
        assert!(BackendError::Timeout(Duration::from_secs(30)).is_retryable());
        assert!(BackendError::MalformedResponse("bad json".into()).is_retryable());
    }

    #[test]
    fn api_errors_retry_only_server_side() {
        assert!(BackendError::Api {
            code: 429,
            message: "slow down".into()
        }
        .is_retryable());
        assert!(BackendError::Api {
            code: 503,
            message: "overloaded".into()
        }
        .is_retryable());
        assert!(!BackendError::Api {
            code: 400,
            message: "bad request".into()
        }
        .is_retryable());
        assert!(!BackendError::Api {
            code: 401,
            message: "unauthorized".into()
        }
        .is_retryable());
    }
}
