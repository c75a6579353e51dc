//! Wire error shape plus the `CoreError -> ApiErrorResponse` mapping.
//!
//! User-visible responses carry `{errorCode, message, requestId,
//! retryAfterSeconds?}` with no stack traces or internal identifiers —
//! `from_core_error` only ever copies the `Display` message of the
//! offending `CoreError`, never a `Debug` dump.

use salvo::prelude::*;
use serde::{Deserialize, Serialize};

use infercore_core::error::CoreError;

/// Wire error response: `{errorCode, message, requestId,
/// retryAfterSeconds?}` per §7.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ApiErrorResponse {
    pub error_code: String,
    pub message: String,
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
}

impl ApiErrorResponse {
    pub fn new(error_code: impl Into<String>, message: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self {
            error_code: error_code.into(),
            message: message.into(),
            request_id: request_id.into(),
            retry_after_seconds: None,
        }
    }

    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after_seconds = Some(seconds);
        self
    }

    /// Build from a [`CoreError`], preserving `kind()` as `errorCode` and
    /// `surface_status()` for the transport status. The message carries
    /// only `CoreError`'s `Display` text (no `{:?}`), which already
    /// avoids embedding native-handle addresses or stack traces.
    pub fn from_core_error(err: &CoreError, request_id: impl Into<String>) -> Self {
        let mut resp = Self::new(err.kind(), err.to_string(), request_id);
        if let Some(retry_after) = err.retry_after() {
            resp.retry_after_seconds = Some(retry_after.as_secs());
        }
        resp
    }

    pub fn status_code(&self, err: &CoreError) -> StatusCode {
        StatusCode::from_u16(err.surface_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn maps_quota_exceeded_with_retry_after() {
        let err = CoreError::QuotaExceeded { retry_after: Duration::from_secs(42) };
        let resp = ApiErrorResponse::from_core_error(&err, "req-1");
        assert_eq!(resp.error_code, "QUOTA_EXCEEDED");
        assert_eq!(resp.retry_after_seconds, Some(42));
        assert_eq!(resp.status_code(&err), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn message_never_carries_debug_formatting() {
        let err = CoreError::Internal("boom".into());
        let resp = ApiErrorResponse::from_core_error(&err, "req-2");
        assert_eq!(resp.message, "internal error: boom");
        assert!(!resp.message.contains("Internal("));
    }
}
