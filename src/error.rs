//! Error types for Inbox Sweep.

use std::time::Duration;

use crate::pipeline::types::Categorization;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Provider {provider} timed out after {timeout:?}")]
    Timeout { provider: String, timeout: Duration },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LlmError {
    /// Whether a second attempt could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RequestFailed { .. }
            | Self::RateLimited { .. }
            | Self::InvalidResponse { .. }
            | Self::Timeout { .. }
            | Self::Json(_) => true,
            Self::AuthFailed { .. } => false,
        }
    }
}

/// Sender reputation cache errors.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Sender store unavailable: {reason}")]
    Unavailable { reason: String },
}

/// Per-record resolution failures.
///
/// None of these abort a `categorize` call. They are logged and the
/// affected records degrade to `unknown`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ResolutionError {
    #[error("Invalid record {email_id}: {reason}")]
    InvalidRecord { email_id: String, reason: String },

    #[error("LLM transport failure: {reason}")]
    LlmTransportFailure { reason: String },

    #[error("LLM response missing entry for {email_id}")]
    LlmPartialResponse { email_id: String },

    #[error("LLM batch of {records} record(s) failed after {attempts} attempt(s): {reason}")]
    LlmBatchFailure {
        records: usize,
        attempts: u32,
        reason: String,
    },

    #[error("Sender cache unavailable: {reason}")]
    CacheUnavailable { reason: String },
}

/// Pipeline-level errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Neither the classification service nor the sender cache could be
    /// reached. `partial` still holds one result per input record; only the
    /// heuristic tier contributed confident categories.
    #[error("Classification unavailable: {reason}")]
    Unavailable {
        reason: String,
        partial: Box<Categorization>,
    },
}
