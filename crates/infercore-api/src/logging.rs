//! Structured logging for wide-format canonical log lines.
//!
//! One module per event category, each function a single `tracing`
//! call carrying every field the event needs, using this crate's
//! tenant/model/runner vocabulary.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Process lifecycle events.
pub mod lifecycle {
    pub fn server_startup(binary: &str, version: &str) {
        tracing::info!(event = "server_startup", binary = %binary, version = %version, "server starting");
    }

    pub fn config_loaded(config_path: &str) {
        tracing::info!(event = "config_loaded", config_path = %config_path, "configuration loaded");
    }

    pub fn plugin_loaded(plugin_name: &str, success: bool) {
        if success {
            tracing::info!(event = "plugin_loaded", plugin_name = %plugin_name, success = true, "plugin loaded");
        } else {
            tracing::warn!(event = "plugin_loaded", plugin_name = %plugin_name, success = false, "plugin failed to load");
        }
    }

    pub fn server_binding(address: &str) {
        tracing::info!(event = "server_binding", address = %address, "server binding");
    }

    pub fn server_shutdown(signal: &str) {
        tracing::info!(event = "server_shutdown", signal = %signal, "server shutting down");
    }
}

/// Pool (C5) and model-load events.
pub mod model {
    pub fn manifest_resolved(tenant_id: &str, model_id: &str, version: &str) {
        tracing::info!(
            event = "manifest_resolved",
            tenant_id = %tenant_id,
            model_id = %model_id,
            version = %version,
            "manifest resolved"
        );
    }

    pub fn runner_constructed(tenant_id: &str, model_id: &str, runner_name: &str, duration_ms: u64) {
        tracing::info!(
            event = "runner_constructed",
            tenant_id = %tenant_id,
            model_id = %model_id,
            runner_name = %runner_name,
            duration_ms = duration_ms,
            "runner instance constructed"
        );
    }

    pub fn runner_evicted(tenant_id: &str, model_id: &str, runner_name: &str, reason: &str) {
        tracing::info!(
            event = "runner_evicted",
            tenant_id = %tenant_id,
            model_id = %model_id,
            runner_name = %runner_name,
            reason = %reason,
            "runner instance evicted"
        );
    }
}

/// Per-request context accumulated across the orchestrator's flow and
/// flushed as one canonical log line at COMPLETE/FAILED. Split between
/// a single-shot call and a streamed one.
#[derive(Debug)]
pub struct RequestLog {
    pub request_id: String,
    pub tenant_id: String,
    pub model_id: String,
    start_time: Instant,
    pub stream: bool,
    pub max_tokens: usize,
    pub runner_name: Option<String>,
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub error_kind: Option<String>,
}

impl RequestLog {
    pub fn new(request_id: impl Into<String>, tenant_id: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            tenant_id: tenant_id.into(),
            model_id: model_id.into(),
            start_time: Instant::now(),
            stream: false,
            max_tokens: 0,
            runner_name: None,
            input_tokens: 0,
            output_tokens: 0,
            error_kind: None,
        }
    }

    pub fn duration_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }

    /// Emit the canonical "request complete" line. `finish_reason` is one
    /// of the §7 error `kind()` strings, or `"ok"` on success.
    pub fn emit_canonical_log(&self, finish_reason: &str) {
        tracing::info!(
            event = "request_complete",
            canonical = true,
            timestamp_ms = now_ms(),
            request_id = %self.request_id,
            tenant_id = %self.tenant_id,
            model_id = %self.model_id,
            runner_name = ?self.runner_name,
            stream = self.stream,
            max_tokens = self.max_tokens,
            input_tokens = self.input_tokens,
            output_tokens = self.output_tokens,
            duration_ms = self.duration_ms(),
            finish_reason = %finish_reason,
            error_kind = ?self.error_kind,
            "request completed"
        );
    }
}

/// Error events, one function per §7 taxonomy failure point that this
/// layer (as opposed to the core's own metrics) additionally logs.
pub mod errors {
    pub fn request_validation(request_id: &str, error: &str) {
        tracing::warn!(event = "request_validation_failed", request_id = %request_id, error = %error, "request validation failed");
    }

    pub fn runner_init_failed(tenant_id: &str, model_id: &str, runner_name: &str, error: &str) {
        tracing::error!(
            event = "runner_init_failed",
            tenant_id = %tenant_id,
            model_id = %model_id,
            runner_name = %runner_name,
            error = %error,
            "runner construction failed"
        );
    }

    pub fn quota_exceeded(tenant_id: &str, resource: &str) {
        tracing::warn!(event = "quota_exceeded", tenant_id = %tenant_id, resource = %resource, "quota exceeded");
    }

    pub fn circuit_opened(runner_name: &str, consecutive_failures: u32) {
        tracing::warn!(
            event = "circuit_opened",
            runner_name = %runner_name,
            consecutive_failures = consecutive_failures,
            "circuit breaker opened"
        );
    }

    pub fn audit_persist_failed(request_id: &str, error: &str) {
        tracing::warn!(event = "audit_persist_failed", request_id = %request_id, error = %error, "audit record persist failed");
    }
}

/// Install a `tracing_subscriber` JSON-formatted global subscriber
/// driven by `RUST_LOG`/`INFERCORE_LOG`. Kept tiny and infallible-by-
/// default (falls back to `info` if the env filter fails to parse).
pub fn init_subscriber() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_env("INFERCORE_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = fmt().json().with_env_filter(filter).try_init();
}
