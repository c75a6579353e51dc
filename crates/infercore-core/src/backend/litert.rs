//! LiteRT/TFLite backend, the secondary runner. No maintained Rust
//! LiteRT binding exists yet (unlike `llama-cpp-2` for GGUF or `ort`
//! for ONNX), so this stays a format/metadata-only implementation — it
//! participates in selection (C3) and reports accurate capabilities,
//! but `new_context` fails `RUNNER_INIT_FAILED`, which the
//! orchestrator's router treats as "try the next candidate" rather
//! than a hard error. Wiring a real delegate is future work once a
//! maintained LiteRT crate exists.

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

pub struct LiteRtBackend {
    metadata: RunnerMetadata,
}

impl LiteRtBackend {
    pub fn new() -> Self {
        Self {
            metadata: RunnerMetadata {
                name: "litert".into(),
                framework: "litert".into(),
                supported_formats: vec![ArtifactFormat::TfLite],
                supported_devices: vec![DeviceKind::Cpu, DeviceKind::Npu, DeviceKind::Tpu],
                capabilities: RunnerCapabilities {
                    streaming: false,
                    batching: false,
                    quantization: true,
                    max_batch_size: 1,
                    supported_delegates: vec!["xnnpack".into(), "nnapi".into()],
                    max_context_tokens: 0,
                },
            },
        }
    }
}

impl Default for LiteRtBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RunnerBackend for LiteRtBackend {
    fn metadata(&self) -> &RunnerMetadata {
        &self.metadata
    }

    fn vocabulary(&self) -> &dyn TokenVocabulary {
        &EmptyVocab
    }

    fn tokenize(&self, _text: &str, _add_bos: bool, _parse_special: bool) -> CoreResult<Vec<u32>> {
        Err(CoreError::Internal("litert backend has no wired tokenizer".into()))
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
        Err(CoreError::RunnerInitFailed("litert backend is not wired to a native delegate in this build".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_tflite_format_support() {
        let backend = LiteRtBackend::new();
        assert_eq!(backend.metadata().supported_formats, vec![ArtifactFormat::TfLite]);
    }
}
