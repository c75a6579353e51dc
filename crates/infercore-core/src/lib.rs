//! Multi-tenant local LLM/ML inference serving core.
//!
//! A request names a model and generation parameters; the core selects a
//! runner capable of executing that model on available hardware, resolves
//! (or warms) a runner instance bound to that model/tenant, enforces quota
//! and concurrency limits, drives the runner's generation loop, and returns
//! a single response, a streamed sequence of chunks, or a batch of
//! responses.
//!
//! Transport (HTTP/gRPC), durable config/secret stores, the model registry
//! and artifact downloader, FFI glue beyond the [`backend::RunnerBackend`]
//! boundary, observability exporters, and chat-template rendering are
//! external collaborators; this crate specifies only the interfaces it
//! consumes from them.

use std::{collections::HashMap, time::Duration};

use derivative::Derivative;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod backend;
pub mod bulkhead;
pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod hardware;
pub mod metrics;
pub mod orchestrator;
pub mod plugins;
pub mod pool;
pub mod quota;
pub mod run;
pub mod sampler;
pub mod selection;

pub use error::{CoreError, CoreResult};

/// A device kind a runner may target and the hardware probe may report.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeviceKind {
    Cpu,
    Cuda,
    Metal,
    Rocm,
    Tpu,
    Npu,
    Other(String),
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceKind::Cpu => write!(f, "CPU"),
            DeviceKind::Cuda => write!(f, "CUDA"),
            DeviceKind::Metal => write!(f, "METAL"),
            DeviceKind::Rocm => write!(f, "ROCM"),
            DeviceKind::Tpu => write!(f, "TPU"),
            DeviceKind::Npu => write!(f, "NPU"),
            DeviceKind::Other(s) => write!(f, "{s}"),
        }
    }
}

/// Model artifact format a runner may support and a manifest may carry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ArtifactFormat {
    Gguf,
    TfLite,
    Onnx,
    Other(String),
}

/// Stable, immutable per-request tenant view: identity plus preferences.
/// Created once per request from the tenant registry (external
/// collaborator); never mutated after construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantContext {
    pub tenant_id: String,
    pub preferred_device: Option<DeviceKind>,
    pub cost_sensitive: bool,
    pub active: bool,
}

impl TenantContext {
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self { tenant_id: tenant_id.into(), preferred_device: None, cost_sensitive: false, active: true }
    }
}

/// Immutable per-attempt request envelope: identity, retry bookkeeping,
/// deadline. Constructed once by the orchestrator at the top of `infer`
/// and threaded unchanged through selection, pooling, and generation.
#[derive(Debug, Clone, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
pub struct RequestContext {
    #[derivative(Default(value = "Uuid::new_v4().to_string()"))]
    pub request_id: String,
    #[derivative(Default(value = "\"default\".into()"))]
    pub tenant_id: String,
    #[derivative(Default(value = "1"))]
    pub attempt: u32,
    #[derivative(Default(value = "3"))]
    pub max_attempts: u32,
    #[derivative(Default(value = "Duration::from_secs(60)"))]
    pub timeout: Duration,
    pub dry_run: bool,
    pub preferred_device: Option<DeviceKind>,
    pub cost_sensitive: bool,
}

impl RequestContext {
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self { tenant_id: tenant_id.into(), ..Default::default() }
    }
}

/// Conversational message role. The principal runner's chat-template
/// renderer (an injected pure function, out of scope here) accepts all
/// four; the core itself is agnostic to their semantics beyond ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

/// One or many stop strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StopSequences {
    One(String),
    Many(Vec<String>),
}

impl StopSequences {
    pub fn as_slice(&self) -> Vec<&str> {
        match self {
            StopSequences::One(s) => vec![s.as_str()],
            StopSequences::Many(v) => v.iter().map(String::as_str).collect(),
        }
    }
}

/// Recognized generation knobs (§6 "Recognized parameters"). Every field
/// carries the documented default so an absent key behaves identically to
/// an explicit default value.
#[derive(Debug, Clone, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct Parameters {
    pub prompt: Option<String>,
    #[derivative(Default(value = "128"))]
    pub max_tokens: usize,
    #[derivative(Default(value = "0.8"))]
    pub temperature: f32,
    #[derivative(Default(value = "40"))]
    pub top_k: usize,
    #[derivative(Default(value = "0.95"))]
    pub top_p: f32,
    #[derivative(Default(value = "0.05"))]
    pub min_p: f32,
    #[derivative(Default(value = "1.0"))]
    pub typical_p: f32,
    #[derivative(Default(value = "1.1"))]
    pub repeat_penalty: f32,
    #[derivative(Default(value = "64"))]
    pub repeat_last_n: i64,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
    pub mirostat: u8,
    #[derivative(Default(value = "5.0"))]
    pub mirostat_tau: f32,
    #[derivative(Default(value = "0.1"))]
    pub mirostat_eta: f32,
    pub grammar: Option<String>,
    pub json_mode: bool,
    pub stop: Option<StopSequences>,
    #[derivative(Default(value = "-1"))]
    pub seed: i64,
    pub stream: bool,
    #[derivative(Default(value = "120_000"))]
    pub inference_timeout_ms: u64,
}

/// A single inference request: either `messages` (rendered via the
/// injected chat template) or a raw `prompt`, plus generation knobs.
#[derive(Debug, Clone, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
pub struct InferenceRequest {
    pub model_id: String,
    pub messages: Option<Vec<Message>>,
    pub prompt: Option<String>,
    pub parameters: Parameters,
    pub stop: Option<StopSequences>,
    pub stream: bool,
}

/// A model artifact's on-disk/remote descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactDescriptor {
    pub uri: String,
    pub checksum: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
pub struct ResourceRequirements {
    pub min_memory_mb: u64,
}

/// Durable, versioned model metadata; the core treats this as an
/// immutable snapshot supplied by the model registry (external
/// collaborator).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelManifest {
    pub model_id: String,
    pub tenant_id: String,
    pub version: String,
    pub artifacts: HashMap<ArtifactFormat, ArtifactDescriptor>,
    pub resource_requirements: ResourceRequirements,
    pub supported_formats: Vec<ArtifactFormat>,
}

/// What a runner implementation declares about itself, independent of
/// any one model: format/device support and capability bits consulted by
/// selection (C3).
#[derive(Debug, Clone, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
pub struct RunnerCapabilities {
    pub streaming: bool,
    pub batching: bool,
    pub quantization: bool,
    pub max_batch_size: usize,
    pub supported_delegates: Vec<String>,
    pub max_context_tokens: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerMetadata {
    pub name: String,
    pub framework: String,
    pub supported_formats: Vec<ArtifactFormat>,
    pub supported_devices: Vec<DeviceKind>,
    pub capabilities: RunnerCapabilities,
}

/// Generation-phase execution status (§3 `ExecutionToken`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExecutionStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

/// Phase boundary names consulted by the plugin registry (C9) and used
/// as human-readable stage labels on an `ExecutionToken`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Phase {
    Prepare,
    Tokenize,
    Route,
    Sample,
    Execute,
    Stream,
    Complete,
}

/// Tracks one execution's progress through the orchestrator. Mutated
/// only through [`ExecutionToken::transition`], which returns a new
/// value; prior states are not retained (no undo, no history chain).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionToken {
    pub execution_id: String,
    pub phase: Phase,
    pub status: ExecutionStatus,
    pub attempt: u32,
    pub variables: HashMap<String, serde_json::Value>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ExecutionToken {
    pub fn new(execution_id: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
            phase: Phase::Prepare,
            status: ExecutionStatus::Pending,
            attempt: 1,
            variables: HashMap::new(),
            metadata: HashMap::new(),
        }
    }

    /// Returns a new token advanced to `phase`/`status`; `self` is
    /// consumed so the prior state cannot be observed again.
    pub fn transition(mut self, phase: Phase, status: ExecutionStatus) -> Self {
        self.phase = phase;
        self.status = status;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceResponse {
    pub request_id: String,
    pub model_id: String,
    pub content: String,
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub tokens_used: usize,
    pub duration_ms: u64,
    pub runner_name: Option<String>,
    pub structured_output: Option<serde_json::Value>,
}

/// One piece of a streamed response. `is_final=true` appears exactly
/// once, as the last chunk; any error aborts the stream before it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChunk {
    pub request_id: String,
    pub sequence_number: u64,
    pub delta: String,
    pub is_final: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// A request submitted for asynchronous execution. Results (success or
/// error) are retained for a bounded period after completion (default
/// 24h; see `orchestrator::AsyncJobStore`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsyncJob {
    pub job_id: String,
    pub request: InferenceRequest,
    pub status: JobStatus,
    pub result: Option<InferenceResponse>,
    pub error: Option<String>,
    pub submitted_at_ms: u64,
    pub completed_at_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_context_defaults_are_sane() {
        let ctx = RequestContext::new("acme");
        assert_eq!(ctx.tenant_id, "acme");
        assert_eq!(ctx.attempt, 1);
        assert_eq!(ctx.max_attempts, 3);
        assert_eq!(ctx.timeout, Duration::from_secs(60));
        assert!(!ctx.request_id.is_empty());
    }

    #[test]
    fn parameters_defaults_match_recognized_options_table() {
        let p = Parameters::default();
        assert_eq!(p.max_tokens, 128);
        assert!((p.temperature - 0.8).abs() < f32::EPSILON);
        assert_eq!(p.top_k, 40);
        assert!((p.top_p - 0.95).abs() < f32::EPSILON);
        assert!((p.min_p - 0.05).abs() < f32::EPSILON);
        assert!((p.repeat_penalty - 1.1).abs() < f32::EPSILON);
        assert_eq!(p.repeat_last_n, 64);
        assert_eq!(p.seed, -1);
        assert_eq!(p.inference_timeout_ms, 120_000);
    }

    #[test]
    fn execution_token_transition_consumes_prior_state() {
        let token = ExecutionToken::new("exec-1");
        let token = token.transition(Phase::Route, ExecutionStatus::Processing);
        assert_eq!(token.phase, Phase::Route);
        assert_eq!(token.status, ExecutionStatus::Processing);
        assert_eq!(token.attempt, 1);
    }

    #[test]
    fn stop_sequences_as_slice_handles_both_shapes() {
        let one = StopSequences::One("\n".into());
        assert_eq!(one.as_slice(), vec!["\n"]);
        let many = StopSequences::Many(vec!["a".into(), "b".into()]);
        assert_eq!(many.as_slice(), vec!["a", "b"]);
    }
}
