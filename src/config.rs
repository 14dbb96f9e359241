//! Configuration types.

use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Largest batch the classification service accepts in one request.
pub const MAX_BATCH_SIZE: usize = 50;

/// Tuning knobs for the categorization pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Results below this confidence escalate to the next tier.
    pub confidence_threshold: f32,
    /// Minimum LLM confidence required to assign `personal` or `important`.
    pub protected_floor: f32,
    /// Records per LLM call.
    pub max_batch_size: usize,
    /// LLM calls allowed in flight at once for a single invocation.
    pub max_concurrent_batches: usize,
    /// Timeout applied to each LLM call individually.
    pub llm_timeout: Duration,
    /// Pause before the single retry of a failed LLM call.
    pub retry_backoff: Duration,
    /// Max tokens for the classification response.
    pub max_tokens: u32,
    /// Temperature for classification.
    pub temperature: f32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.7,
            protected_floor: 0.8,
            max_batch_size: MAX_BATCH_SIZE,
            max_concurrent_batches: 1,
            llm_timeout: Duration::from_secs(30),
            retry_backoff: Duration::from_millis(500),
            max_tokens: 4096,
            temperature: 0.0,
        }
    }
}

impl PipelineConfig {
    /// Build a config from `INBOX_SWEEP_*` environment variables, falling
    /// back to defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            confidence_threshold: env_or("INBOX_SWEEP_CONFIDENCE_THRESHOLD", defaults.confidence_threshold)?,
            protected_floor: env_or("INBOX_SWEEP_PROTECTED_FLOOR", defaults.protected_floor)?,
            max_batch_size: env_or("INBOX_SWEEP_MAX_BATCH_SIZE", defaults.max_batch_size)?,
            max_concurrent_batches: env_or(
                "INBOX_SWEEP_MAX_CONCURRENT_BATCHES",
                defaults.max_concurrent_batches,
            )?,
            llm_timeout: Duration::from_secs(env_or(
                "INBOX_SWEEP_LLM_TIMEOUT_SECS",
                defaults.llm_timeout.as_secs(),
            )?),
            retry_backoff: Duration::from_millis(env_or(
                "INBOX_SWEEP_RETRY_BACKOFF_MS",
                defaults.retry_backoff.as_millis() as u64,
            )?),
            max_tokens: env_or("INBOX_SWEEP_MAX_TOKENS", defaults.max_tokens)?,
            temperature: env_or("INBOX_SWEEP_TEMPERATURE", defaults.temperature)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values the pipeline cannot honor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) || self.confidence_threshold == 0.0 {
            return Err(invalid(
                "confidence_threshold",
                format!("must be in (0, 1], got {}", self.confidence_threshold),
            ));
        }
        if !(0.0..=1.0).contains(&self.protected_floor) {
            return Err(invalid(
                "protected_floor",
                format!("must be in [0, 1], got {}", self.protected_floor),
            ));
        }
        if self.max_batch_size == 0 || self.max_batch_size > MAX_BATCH_SIZE {
            return Err(invalid(
                "max_batch_size",
                format!("must be in 1..={MAX_BATCH_SIZE}, got {}", self.max_batch_size),
            ));
        }
        if self.max_concurrent_batches == 0 {
            return Err(invalid("max_concurrent_batches", "must be at least 1".into()));
        }
        if self.llm_timeout.is_zero() {
            return Err(invalid("llm_timeout", "must be non-zero".into()));
        }
        Ok(())
    }
}

/// Supported LLM backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmBackend {
    Anthropic,
    OpenAi,
}

impl FromStr for LlmBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "anthropic" => Ok(Self::Anthropic),
            "openai" => Ok(Self::OpenAi),
            other => Err(invalid(
                "INBOX_SWEEP_LLM_BACKEND",
                format!("unknown backend '{other}' (expected anthropic or openai)"),
            )),
        }
    }
}

/// Configuration for creating an LLM provider.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub backend: LlmBackend,
    pub api_key: secrecy::SecretString,
    pub model: String,
}

impl LlmConfig {
    /// Read backend, key and model from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let backend = match std::env::var("INBOX_SWEEP_LLM_BACKEND") {
            Ok(raw) => raw.parse()?,
            Err(_) => LlmBackend::Anthropic,
        };

        let (key_var, default_model) = match backend {
            LlmBackend::Anthropic => ("ANTHROPIC_API_KEY", "claude-3-5-haiku-latest"),
            LlmBackend::OpenAi => ("OPENAI_API_KEY", "gpt-4o-mini"),
        };

        let api_key = std::env::var(key_var)
            .map_err(|_| ConfigError::MissingEnvVar(key_var.to_string()))?;
        let model =
            std::env::var("INBOX_SWEEP_MODEL").unwrap_or_else(|_| default_model.to_string());

        Ok(Self {
            backend,
            api_key: secrecy::SecretString::from(api_key),
            model,
        })
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|_| {
            invalid(key, format!("could not parse '{raw}'"))
        }),
        Err(_) => Ok(default),
    }
}

fn invalid(key: &str, message: String) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message,
    }
}
