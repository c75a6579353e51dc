//! Runner backend capability set.
//!
//! Dynamic dispatch over runner kinds is a closed set of implementations
//! behind one capability trait: the selection policy (C3) operates on
//! [`RunnerMetadata`] values and never touches an implementation
//! directly. One struct owns the native handles; generation drives it
//! through `&mut` access serialized by a lock.

pub mod gguf;
pub mod litert;
pub mod onnx;
pub mod remote;

use std::sync::Arc;

use async_trait::async_trait;
use derivative::Derivative;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::Semaphore;

use crate::{
    error::CoreError, pool::PoolKey, pool::PooledResource, sampler::grammar::TokenVocabulary,
    CoreResult, Message, RunnerMetadata,
};

/// Runner-instance construction knobs (§4.6 "runner configuration
/// (threads, batch size, GPU layers)").
#[derive(Debug, Derivative, Clone)]
#[derivative(Default)]
pub struct RunnerInstanceConfig {
    #[derivative(Default(value = "4096"))]
    pub n_ctx: u32,
    #[derivative(Default(value = "512"))]
    pub n_batch: u32,
    pub n_threads: u32,
    pub gpu_layers: u32,
    #[derivative(Default(value = "true"))]
    pub mmap: bool,
    pub mlock: bool,
    pub main_gpu: u32,
    pub offload_kqv: bool,
    /// Bypasses the §4.6 large-model GPU-layer clamp when set.
    pub gpu_layers_override: bool,
}

/// The mutable per-instance native state: model context plus KV cache.
/// Exactly the `{model, context}` pair §3 names for `RunnerInstance`.
/// Not `Sync` by itself — access is always serialized through the
/// `tokio::sync::Mutex` that [`RunnerInstance`] wraps it in.
pub trait GenerationContext: Send {
    /// Effective batch size this context was created with (already
    /// clipped to whatever runtime cap the backend enforces).
    fn n_batch(&self) -> usize;

    /// Drops all accumulated KV cache state. Called once per request in
    /// stateless mode (§9: session-mode is out of scope, so every
    /// request clears unconditionally).
    fn kv_cache_clear(&mut self);

    /// Decodes `tokens` at the given absolute `positions`, requesting
    /// logits only for the indices where `logits_at[i]` is true. One
    /// `decode` call per prompt chunk and per generated token, per
    /// §4.6's invariant.
    fn decode(&mut self, tokens: &[u32], positions: &[i64], logits_at: &[bool]) -> CoreResult<()>;

    /// Logits for the token at batch index `index` of the most recent
    /// `decode` call that requested them.
    fn get_logits(&self, index: usize) -> CoreResult<Vec<f32>>;
}

/// What a runner implementation knows independent of any one loaded
/// model: its metadata/capabilities, its tokenizer, and how to build a
/// fresh [`GenerationContext`] for a given model artifact.
#[async_trait]
pub trait RunnerBackend: Send + Sync {
    fn metadata(&self) -> &RunnerMetadata;

    fn vocabulary(&self) -> &dyn TokenVocabulary;

    /// Tokenizes `text`. `add_bos` and `parse_special` are the backend's
    /// own BOS-prepending and special-token-parsing switches (§4.6
    /// phase 2: BOS is suppressed when the rendered prompt already
    /// carries chat special tokens).
    fn tokenize(&self, text: &str, add_bos: bool, parse_special: bool) -> CoreResult<Vec<u32>>;

    /// Raw bytes for one token's piece. Returned as bytes rather than a
    /// `String` because a single token's piece is not always a UTF-8
    /// boundary on its own — the generation loop buffers bytes across
    /// tokens before flushing valid prefixes.
    fn token_to_piece(&self, token: u32) -> Vec<u8>;

    fn is_end_of_generation(&self, token: u32) -> bool;

    /// Model-family default chat template, used when the injected
    /// renderer (external collaborator, §1) yields an empty prompt.
    fn default_chat_template(&self, messages: &[Message]) -> String;

    /// Total on-disk size of the loaded model artifact, consulted by
    /// the §4.6 large-model GPU-layer clamp.
    fn model_size_bytes(&self) -> u64;

    async fn new_context(&self, config: &RunnerInstanceConfig) -> CoreResult<Box<dyn GenerationContext>>;
}

/// A pooled, bound-to-one-key runner instance (§3 `RunnerInstance`).
/// Owned exclusively by the warm pool; every other component borrows it
/// for the scope of one `infer` call. `gate` is the per-instance
/// bounded-concurrency permit (§5: default 1, since GGUF is not
/// re-entrant); a backend that declares itself re-entrant may construct
/// an instance with a larger gate.
pub struct RunnerInstance {
    pub key: PoolKey,
    pub runner_name: String,
    pub backend: Arc<dyn RunnerBackend>,
    pub context: AsyncMutex<Box<dyn GenerationContext>>,
    pub gate: Semaphore,
}

impl RunnerInstance {
    pub async fn new(key: PoolKey, backend: Arc<dyn RunnerBackend>, config: &RunnerInstanceConfig, max_concurrent: usize) -> CoreResult<Self> {
        let context = backend.new_context(config).await?;
        Ok(Self {
            runner_name: key.runner_name.clone(),
            key,
            backend,
            context: AsyncMutex::new(context),
            gate: Semaphore::new(max_concurrent.max(1)),
        })
    }
}

impl PooledResource for RunnerInstance {
    /// Native handles are dropped along with `self`; there is nothing
    /// left to release explicitly once the `Box<dyn GenerationContext>`
    /// goes out of scope. Implementations whose native handle needs an
    /// explicit teardown call (rather than relying on `Drop`) should do
    /// it in their `GenerationContext`'s own `Drop` impl — the pool's
    /// eviction discipline (§4.5) only needs `release` to return
    /// promptly, not to block on it.
    fn release(&self) -> Result<(), String> {
        tracing::info!(event = "runner_instance_released", runner = %self.runner_name, tenant_id = %self.key.tenant_id, model_id = %self.key.model_id, "runner instance native handles released");
        Ok(())
    }
}

/// Validates a model artifact's magic header (§6: "the loader refuses
/// files with wrong magic and fails `INVALID_FORMAT`").
pub fn check_magic(bytes: &[u8], expected: &[u8], format_name: &str) -> CoreResult<()> {
    if bytes.len() < expected.len() || &bytes[..expected.len()] != expected {
        return Err(CoreError::InvalidFormat(format!("expected {format_name} magic {expected:?}, file header did not match")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_mismatch_is_invalid_format() {
        let err = check_magic(b"JUNK0000", b"GGUF", "GGUF").unwrap_err();
        assert_eq!(err.kind(), "INVALID_FORMAT");
    }

    #[test]
    fn magic_match_passes() {
        assert!(check_magic(b"GGUF\x03\x00\x00\x00", b"GGUF", "GGUF").is_ok());
    }

    #[test]
    fn short_file_is_invalid_format() {
        assert!(check_magic(b"GG", b"GGUF", "GGUF").is_err());
    }
}
