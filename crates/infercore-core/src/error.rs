//! Error kind taxonomy for the inference core's public surface.
//!
//! Internal glue code returns `anyhow::Result`; anything crossing a
//! component boundary that a caller or an audit record needs to
//! classify is a [`CoreError`].

use std::time::Duration;

use thiserror::Error;

/// One entry of the §7 error kind taxonomy. Variant names are the
/// `kind` values that appear in audit records and metrics tags.
#[derive(Debug, Error, Clone)]
pub enum CoreError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("tenant unauthenticated")]
    Unauthenticated,

    #[error("tenant forbidden")]
    Forbidden,

    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("invalid model format: {0}")]
    InvalidFormat(String),

    #[error("invalid grammar: {0}")]
    InvalidGrammar(String),

    #[error("quota exceeded")]
    QuotaExceeded { retry_after: Duration },

    #[error("busy")]
    Busy,

    #[error("timeout")]
    Timeout,

    #[error("no device available for request")]
    DeviceUnavailable,

    #[error("runner init failed: {0}")]
    RunnerInitFailed(String),

    #[error("prompt evaluation failed: {0}")]
    PromptEvalFailed(String),

    #[error("decode failed: {0}")]
    DecodeFailed(String),

    #[error("tensor shape mismatch: {0}")]
    TensorShapeMismatch(String),

    #[error("circuit open for runner {0}")]
    CircuitOpen(String),

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Whether local recovery (bounded backoff / re-selection) applies.
    /// `RUNNER_INIT_FAILED` and `CIRCUIT_OPEN` are "not retryable at this
    /// runner" but are handled by the orchestrator as fallback triggers
    /// rather than plain retries, so they report `false` here.
    pub fn retryable(&self) -> bool {
        matches!(self, CoreError::Busy | CoreError::Timeout)
            || matches!(self, CoreError::PromptEvalFailed(_) | CoreError::DecodeFailed(_))
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            CoreError::QuotaExceeded { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    /// Stable surface status code, per §7's table. The core never emits
    /// this over a transport itself (out of scope) but every surface
    /// adapter (e.g. `infercore-api`'s `ApiErrorResponse`) must agree.
    pub fn surface_status(&self) -> u16 {
        match self {
            CoreError::BadRequest(_) => 400,
            CoreError::Unauthenticated => 401,
            CoreError::Forbidden => 403,
            CoreError::ModelNotFound(_) => 404,
            CoreError::InvalidFormat(_) => 422,
            CoreError::InvalidGrammar(_) => 400,
            CoreError::QuotaExceeded { .. } => 429,
            CoreError::Busy => 503,
            CoreError::Timeout => 504,
            CoreError::DeviceUnavailable => 503,
            CoreError::RunnerInitFailed(_) => 500,
            CoreError::PromptEvalFailed(_) | CoreError::DecodeFailed(_) => 500,
            CoreError::TensorShapeMismatch(_) => 400,
            CoreError::CircuitOpen(_) => 500,
            CoreError::Cancelled => 499,
            CoreError::Internal(_) => 500,
        }
    }

    /// Semantic kind name used in audit records and `{tenant, model,
    /// runner, errorKind}` metric tags.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::BadRequest(_) => "BAD_REQUEST",
            CoreError::Unauthenticated => "UNAUTHENTICATED",
            CoreError::Forbidden => "FORBIDDEN",
            CoreError::ModelNotFound(_) => "MODEL_NOT_FOUND",
            CoreError::InvalidFormat(_) => "INVALID_FORMAT",
            CoreError::InvalidGrammar(_) => "INVALID_GRAMMAR",
            CoreError::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
            CoreError::Busy => "BUSY",
            CoreError::Timeout => "TIMEOUT",
            CoreError::DeviceUnavailable => "DEVICE_UNAVAILABLE",
            CoreError::RunnerInitFailed(_) => "RUNNER_INIT_FAILED",
            CoreError::PromptEvalFailed(_) => "PROMPT_EVAL_FAILED",
            CoreError::DecodeFailed(_) => "DECODE_FAILED",
            CoreError::TensorShapeMismatch(_) => "TENSOR_SHAPE_MISMATCH",
            CoreError::CircuitOpen(_) => "CIRCUIT_OPEN",
            CoreError::Cancelled => "CANCELLED",
            CoreError::Internal(_) => "INTERNAL",
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_exceeded_carries_retry_after() {
        let err = CoreError::QuotaExceeded { retry_after: Duration::from_secs(30) };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(30)));
        assert_eq!(err.surface_status(), 429);
        assert!(!err.retryable());
    }

    #[test]
    fn busy_and_timeout_are_retryable() {
        assert!(CoreError::Busy.retryable());
        assert!(CoreError::Timeout.retryable());
        assert!(!CoreError::BadRequest("x".into()).retryable());
    }

    #[test]
    fn kind_names_match_taxonomy() {
        assert_eq!(CoreError::ModelNotFound("m".into()).kind(), "MODEL_NOT_FOUND");
        assert_eq!(CoreError::CircuitOpen("r".into()).kind(), "CIRCUIT_OPEN");
    }
}
