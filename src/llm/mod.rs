//! LLM gateway: the one path through which rendered prompts reach a
//! text-generation provider.
//!
//! The gateway owns a circuit breaker keyed to the provider; repeated
//! provider failures open the circuit and subsequent calls fail fast.
//! Responses can optionally be constrained to a JSON schema, in which case
//! the provider is asked for `application/json` output.

pub mod breaker;
pub mod gemini;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, Instrument};

use crate::prompts::PromptPair;
use crate::telemetry::genai;
use breaker::{BreakerError, CircuitBreaker};

/// Consecutive failures before the provider circuit opens.
const BREAKER_THRESHOLD: u32 = 5;
/// How long the circuit stays open before a half-open probe.
const BREAKER_COOLDOWN: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("llm circuit breaker is open")]
    CircuitOpen,

    #[error("llm request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("llm provider returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("llm rate limited: {0}")]
    RateLimited(String),

    #[error("invalid llm response: {0}")]
    InvalidResponse(String),

    #[error("llm provider not configured")]
    NotConfigured,
}

/// A fully assembled provider request.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub model: String,
    pub system: Option<String>,
    pub user: String,
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<i32>,
    pub stop_sequences: Vec<String>,
    /// When set, the provider must return JSON conforming to this schema.
    pub response_schema: Option<serde_json::Value>,
}

/// A text-generation backend. One real implementation talks to Gemini;
/// tests substitute stubs.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, request: GenerationRequest) -> Result<String, LlmError>;
}

/// Shared LLM entry point: prompt pair in, trimmed text out.
pub struct LlmGateway {
    provider: Arc<dyn TextGenerator>,
    breaker: CircuitBreaker,
}

impl LlmGateway {
    pub fn new(provider: Arc<dyn TextGenerator>) -> Self {
        let breaker = CircuitBreaker::new(
            format!("{}-client", provider.name()),
            BREAKER_THRESHOLD,
            BREAKER_COOLDOWN,
        );
        Self { provider, breaker }
    }

    /// Invoke the provider with the prompt's model configuration applied,
    /// optionally constraining the response to `schema`.
    pub async fn generate(
        &self,
        prompt: &PromptPair,
        schema: Option<serde_json::Value>,
    ) -> Result<String, LlmError> {
        let structured = schema.is_some();
        let request = GenerationRequest {
            model: prompt.config.model.clone(),
            system: (!prompt.system.is_empty()).then(|| prompt.system.clone()),
            user: prompt.user.clone(),
            temperature: prompt.config.temperature,
            max_output_tokens: prompt.config.max_output_tokens,
            stop_sequences: prompt.config.stop_sequences.clone().unwrap_or_default(),
            response_schema: schema,
        };

        debug!(
            model = %request.model,
            structured,
            provider = self.provider.name(),
            "calling LLM"
        );

        let span = genai::start_chat_span(&request.model, self.provider.name());
        let model = request.model.clone();
        let text = async {
            self.breaker
                .execute(|| self.provider.generate(request))
                .await
                .map_err(|e| match e {
                    BreakerError::Open => LlmError::CircuitOpen,
                    BreakerError::Inner(inner) => inner,
                })
        }
        .instrument(span)
        .await?;

        debug!(model = %model, structured, "LLM responded");
        Ok(text.trim().to_string())
    }
}
