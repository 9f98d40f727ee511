//! LLM provider abstraction.
//!
//! Defines the [`Chatter`] trait and shared request/response types. The
//! concrete implementation is [`anthropic::AnthropicChatter`] over the
//! `/v1/messages` API. [`RetryingChatter`] wraps any chatter with the
//! configured retry budget for rate-limited and transient failures.
//!
//! No caller operates on unvalidated LLM text: structured responses go
//! through [`parse_json_response`], which extracts the JSON payload and
//! deserializes it against the caller's schema type.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cancel::CancelSignal;
use crate::limits::Backoff;

pub mod anthropic;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Conversation participant role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    /// System instruction.
    System,
    /// Human/user turn.
    User,
    /// Model turn.
    Assistant,
}

/// One message in a chat exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Author role.
    pub role: ChatRole,
    /// Plain-text content.
    pub content: String,
}

impl ChatMessage {
    /// Build a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    /// Build a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }
}

/// A chat completion request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Conversation including the final user message.
    pub messages: Vec<ChatMessage>,
    /// Maximum response tokens.
    pub max_tokens: u32,
    /// JSON Schema the response must conform to, when the caller expects
    /// structured output. Providers fold it into the instruction; callers
    /// still validate with [`parse_json_response`].
    pub response_schema: Option<serde_json::Value>,
}

/// A chat completion response.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    /// Concatenated text content.
    pub text: String,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors returned by chat providers.
///
/// `RateLimited` and `Transient` are retried internally up to the budget;
/// `InvalidRequest` and `Parse` are surfaced immediately.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// Provider throttled the request (HTTP 429).
    #[error("llm rate limited: {0}")]
    RateLimited(String),

    /// Retryable network/5xx failure.
    #[error("llm transient failure: {0}")]
    Transient(String),

    /// The request itself was rejected (4xx other than 429).
    #[error("llm invalid request: {0}")]
    InvalidRequest(String),

    /// The response did not match the expected shape.
    #[error("llm response parse error: {0}")]
    Parse(String),
}

impl ChatError {
    /// Whether the retry wrapper should try again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited(_) | Self::Transient(_))
    }
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Core chat interface.
///
/// Implementations must be `Send + Sync` for shared use across async
/// task boundaries.
#[async_trait]
pub trait Chatter: Send + Sync {
    /// Request a completion.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError`] on API, network, or parse failure.
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, ChatError>;
}

#[async_trait]
impl<T: Chatter + ?Sized> Chatter for std::sync::Arc<T> {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, ChatError> {
        (**self).chat(request).await
    }
}

// ---------------------------------------------------------------------------
// Retry wrapper
// ---------------------------------------------------------------------------

/// Wraps a [`Chatter`] with bounded retry on retryable errors.
///
/// Non-retryable errors and budget exhaustion surface the last error
/// unchanged. Cancellation aborts between attempts and in-flight waits.
pub struct RetryingChatter<C> {
    inner: C,
    budget: u32,
    backoff: Backoff,
}

impl<C: Chatter> RetryingChatter<C> {
    /// Wrap `inner` with the given retry budget.
    pub fn new(inner: C, budget: u32) -> Self {
        Self {
            inner,
            budget,
            backoff: Backoff::standard(),
        }
    }

    /// Request a completion, retrying rate-limited and transient failures.
    ///
    /// # Errors
    ///
    /// Returns the final [`ChatError`] once the budget is exhausted, or
    /// [`ChatError::Transient`] immediately on cancellation.
    pub async fn chat(
        &self,
        request: &ChatRequest,
        cancel: &CancelSignal,
    ) -> Result<ChatResponse, ChatError> {
        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(ChatError::Transient("cancelled".to_owned()));
            }

            let result = tokio::select! {
                r = self.inner.chat(request) => r,
                () = cancel.cancelled() => {
                    return Err(ChatError::Transient("cancelled".to_owned()));
                }
            };

            match result {
                Ok(response) => return Ok(response),
                Err(err) if err.is_retryable() && attempt < self.budget => {
                    let delay = self.backoff.delay(attempt);
                    warn!(
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "llm call failed, backing off"
                    );
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = cancel.cancelled() => {
                            return Err(ChatError::Transient("cancelled".to_owned()));
                        }
                    }
                    attempt = attempt.saturating_add(1);
                }
                Err(err) => return Err(err),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Structured output validation
// ---------------------------------------------------------------------------

/// Extract and deserialize the JSON payload from an LLM response.
///
/// Models often wrap JSON in prose or code fences; this takes the
/// outermost `{...}` or `[...]` span and validates it against `T`.
///
/// # Errors
///
/// Returns [`ChatError::Parse`] when no JSON span exists or it does not
/// deserialize into `T`.
pub fn parse_json_response<T: DeserializeOwned>(text: &str) -> Result<T, ChatError> {
    let span = extract_json_span(text)
        .ok_or_else(|| ChatError::Parse("no JSON object in response".to_owned()))?;
    let parsed = serde_json::from_str(span).map_err(|e| {
        debug!(error = %e, "llm json failed schema validation");
        ChatError::Parse(format!("schema mismatch: {e}"))
    })?;
    Ok(parsed)
}

/// The outermost JSON object or array span in `text`, if any.
fn extract_json_span(text: &str) -> Option<&str> {
    let obj = text.find('{').and_then(|start| {
        text.rfind('}')
            .filter(|&end| end > start)
            .map(|end| (start, end))
    });
    let arr = text.find('[').and_then(|start| {
        text.rfind(']')
            .filter(|&end| end > start)
            .map(|end| (start, end))
    });
    // Prefer whichever opens first.
    let (start, end) = match (obj, arr) {
        (Some(o), Some(a)) => {
            if o.0 < a.0 {
                o
            } else {
                a
            }
        }
        (Some(o), None) => o,
        (None, Some(a)) => a,
        (None, None) => return None,
    };
    text.get(start..=end)
}
