//! LLM Provider Abstraction
//!
//! A trait-based abstraction over inference providers, enabling support
//! for multiple backends (Anthropic, OpenAI-compatible, mock). The
//! executor consumes whole responses and needs the provider-reported
//! token counts for the cost ledger, so the interface is deliberately
//! non-streaming.

pub mod anthropic;
pub mod mock;
pub mod openai;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

pub use anthropic::AnthropicProvider;
pub use mock::{MockProvider, MockResponse};
pub use openai::OpenAiProvider;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur during LLM operations.
///
/// The retry policy keys off [`LlmError::is_retryable`]: timeouts, rate
/// limits, transport failures and 5xx responses are transient; anything
/// else (bad key, invalid request) is permanent and fails the step.
#[derive(Debug, Error)]
pub enum LlmError {
    /// API key not found or invalid
    #[error("API key error: {0}")]
    ApiKey(String),

    /// HTTP transport failed before a response was produced
    #[error("HTTP error: {0}")]
    Http(String),

    /// Rate limit exceeded
    #[error("Rate limit exceeded")]
    RateLimit { retry_after_ms: Option<u64> },

    /// The call exceeded its wall-clock budget
    #[error("Request timed out")]
    Timeout,

    /// Provider returned a non-success status
    #[error("{provider} returned {status}: {message}")]
    Provider {
        provider: String,
        status: u16,
        message: String,
    },

    /// Response body did not have the expected shape
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl LlmError {
    /// Whether the step retry policy may retry this failure.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(_) | Self::RateLimit { .. } | Self::Timeout => true,
            Self::Provider { status, .. } => *status >= 500,
            Self::ApiKey(_) | Self::InvalidResponse(_) | Self::Serialization(_) => false,
        }
    }
}

impl From<serde_json::Error> for LlmError {
    fn from(e: serde_json::Error) -> Self {
        LlmError::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            LlmError::Timeout
        } else {
            LlmError::Http(e.to_string())
        }
    }
}

// =============================================================================
// Request/Response Types
// =============================================================================

/// One inference request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Provider-specific model identifier.
    pub model: String,
    /// Optional system prompt.
    pub system: Option<String>,
    /// The rendered user prompt.
    pub prompt: String,
    /// Sampling temperature.
    pub temperature: f32,
    /// Maximum tokens to generate; the provider default applies if None.
    pub max_tokens: Option<u32>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system: None,
            prompt: prompt.into(),
            temperature: 0.2,
            max_tokens: None,
        }
    }

    pub fn system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// One inference response with provider-reported usage.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub text: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
}

// =============================================================================
// Provider Trait
// =============================================================================

/// Trait for LLM providers.
///
/// Implementations must be thread-safe; one request is in flight per
/// worker at a time, but many workers share a provider.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider key as referenced by model configuration
    /// (e.g. "anthropic", "openai").
    fn name(&self) -> &str;

    /// Whether the provider is configured and ready.
    fn is_ready(&self) -> bool;

    /// Execute one request and return the full response.
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError>;
}

// =============================================================================
// Registry
// =============================================================================

/// Maps the `provider` column of model configuration to a client.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn LlmProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn LlmProvider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    pub fn with(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.register(provider);
        self
    }

    /// Look up the client for a configured provider key.
    pub fn get(&self, name: &str) -> Option<Arc<dyn LlmProvider>> {
        self.providers.get(name).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}
