//! ONNX Runtime backend. `ModelManifest.artifacts` names `ONNX` as a
//! format alongside the GGUF/llama.cpp principal and LiteRT/TFLite
//! secondary runners. `ort` is the idiomatic Rust ONNX Runtime binding,
//! so a real implementation would depend on it directly; kept
//! format/metadata-only here for the same reason as `litert.rs` —
//! wiring a concrete session-execution path is beyond this core's
//! principal/secondary runner scope, and slots cleanly into the closed
//! set of `RunnerBackend` implementations when it is needed.

use async_trait::async_trait;

use crate::{
    backend::{GenerationContext, RunnerBackend, RunnerInstanceConfig},
    error::CoreError,
    sampler::grammar::TokenVocabulary,
    ArtifactFormat, CoreResult, DeviceKind, Message, RunnerCapabilities, RunnerMetadata,
};

struct EmptyVocab;
impl TokenVocabulary for EmptyVocab {
    fn vocab_size(&self) -> usize {
        0
    }
    fn token_bytes(&self, _id: u32) -> &[u8] {
        &[]
    }
}

pub struct OnnxBackend {
    metadata: RunnerMetadata,
}

impl OnnxBackend {
    pub fn new() -> Self {
        Self {
            metadata: RunnerMetadata {
                name: "onnx".into(),
                framework: "onnxruntime".into(),
                supported_formats: vec![ArtifactFormat::Onnx],
                supported_devices: vec![DeviceKind::Cpu, DeviceKind::Cuda, DeviceKind::Rocm],
                capabilities: RunnerCapabilities {
                    streaming: false,
                    batching: true,
                    quantization: true,
                    max_batch_size: 32,
                    supported_delegates: vec!["cuda".into(), "tensorrt".into()],
                    max_context_tokens: 0,
                },
            },
        }
    }
}

impl Default for OnnxBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RunnerBackend for OnnxBackend {
    fn metadata(&self) -> &RunnerMetadata {
        &self.metadata
    }

    fn vocabulary(&self) -> &dyn TokenVocabulary {
        &EmptyVocab
    }

    fn tokenize(&self, _text: &str, _add_bos: bool, _parse_special: bool) -> CoreResult<Vec<u32>> {
        Err(CoreError::Internal("onnx backend has no wired tokenizer".into()))
    }

    fn token_to_piece(&self, _token: u32) -> Vec<u8> {
        Vec::new()
    }

    fn is_end_of_generation(&self, _token: u32) -> bool {
        true
    }

    fn default_chat_template(&self, _messages: &[Message]) -> String {
        String::new()
    }

    fn model_size_bytes(&self) -> u64 {
        0
    }

    async fn new_context(&self, _config: &RunnerInstanceConfig) -> CoreResult<Box<dyn GenerationContext>> {
        Err(CoreError::RunnerInitFailed("onnx backend is not wired to a native session in this build".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_onnx_format_support() {
        let backend = OnnxBackend::new();
        assert_eq!(backend.metadata().supported_formats, vec![ArtifactFormat::Onnx]);
    }
}
