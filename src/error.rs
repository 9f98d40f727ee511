//! Crate-level error kinds surfaced to callers.
//!
//! Component modules keep their own `thiserror` enums; everything that
//! crosses the facade boundary converges on [`CoreError`] so callers get
//! a machine-readable kind plus a human-readable cause.

use thiserror::Error;

/// Machine-readable error surfaced by every public operation.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Missing or revoked credential; the user must reconnect the provider.
    #[error("reconnect required: {0}")]
    AuthRequired(String),

    /// A duplicate in-flight workflow exists for the same key.
    #[error("busy: {0}")]
    Busy(String),

    /// Provider or LLM throttled us past the internal retry budget.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Retryable failure that exhausted its backoff budget.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Schema or argument violation; never retried.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A sync conflict awaits user resolution.
    #[error("sync conflict on task {0}")]
    Conflict(String),

    /// The referenced entity does not exist for this user.
    #[error("not found: {0}")]
    NotFound(String),

    /// Storage or internal failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Shorthand for [`CoreError::InvalidRequest`].
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Shorthand for [`CoreError::Internal`].
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Stable kind tag for logs and API payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AuthRequired(_) => "auth_required",
            Self::Busy(_) => "busy",
            Self::RateLimited(_) => "rate_limited",
            Self::Transient(_) => "transient",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Conflict(_) => "conflict",
            Self::NotFound(_) => "not_found",
            Self::Internal(_) => "internal",
        }
    }

    /// Whether a caller could reasonably retry the same call later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Busy(_) | Self::RateLimited(_) | Self::Transient(_)
        )
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(e: sqlx::Error) -> Self {
        Self::Internal(format!("database error: {e}"))
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Internal(format!("serialization error: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags_stable() {
        assert_eq!(CoreError::AuthRequired("x".into()).kind(), "auth_required");
        assert_eq!(CoreError::Busy("x".into()).kind(), "busy");
        assert_eq!(CoreError::Conflict("t1".into()).kind(), "conflict");
    }

    #[test]
    fn test_retryability() {
        assert!(CoreError::RateLimited("x".into()).is_retryable());
        assert!(CoreError::Transient("x".into()).is_retryable());
        assert!(!CoreError::InvalidRequest("x".into()).is_retryable());
        assert!(!CoreError::AuthRequired("x".into()).is_retryable());
    }
}
