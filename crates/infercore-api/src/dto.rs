//! Wire DTOs for the core's data model.
//!
//! One `ToSchema`-derived request/response pair per entrypoint, each
//! with a fallible/infallible `From`/`TryFrom` conversion to and from
//! the matching `infercore_core` type. The core itself never depends on
//! these — a transport layer (out of scope for both crates) would sit
//! on top, parsing bytes into these DTOs before handing them to
//! `infercore_core::orchestrator::Orchestrator`.

use salvo::oapi::ToSchema;
use serde::{Deserialize, Serialize};

use infercore_core::{InferenceRequest, InferenceResponse, Message, Parameters, Role, StopSequences, StreamChunk};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum MessageRoleDto {
    System,
    User,
    Assistant,
    Tool,
}

impl From<MessageRoleDto> for Role {
    fn from(value: MessageRoleDto) -> Self {
        match value {
            MessageRoleDto::System => Role::System,
            MessageRoleDto::User => Role::User,
            MessageRoleDto::Assistant => Role::Assistant,
            MessageRoleDto::Tool => Role::Tool,
        }
    }
}

impl From<Role> for MessageRoleDto {
    fn from(value: Role) -> Self {
        match value {
            Role::System => MessageRoleDto::System,
            Role::User => MessageRoleDto::User,
            Role::Assistant => MessageRoleDto::Assistant,
            Role::Tool => MessageRoleDto::Tool,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct MessageDto {
    pub role: MessageRoleDto,
    pub content: String,
}

impl From<MessageDto> for Message {
    fn from(value: MessageDto) -> Self {
        Message { role: value.role.into(), content: value.content }
    }
}

/// Wire shape of `stop`: either a bare string or a list, matching §6's
/// "string or list of stop strings".
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(untagged)]
pub enum StopDto {
    One(String),
    Many(Vec<String>),
}

impl From<StopDto> for StopSequences {
    fn from(value: StopDto) -> Self {
        match value {
            StopDto::One(s) => StopSequences::One(s),
            StopDto::Many(v) => StopSequences::Many(v),
        }
    }
}

/// Wire shape of the recognized `parameters` map (§6's table). Every
/// field is optional on the wire; absent keys fall back to
/// `Parameters::default()`'s documented defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct ParametersDto {
    pub prompt: Option<String>,
    pub max_tokens: Option<usize>,
    pub temperature: Option<f32>,
    pub top_k: Option<usize>,
    pub top_p: Option<f32>,
    pub min_p: Option<f32>,
    pub typical_p: Option<f32>,
    pub repeat_penalty: Option<f32>,
    pub repeat_last_n: Option<i64>,
    pub frequency_penalty: Option<f32>,
    pub presence_penalty: Option<f32>,
    pub mirostat: Option<u8>,
    pub mirostat_tau: Option<f32>,
    pub mirostat_eta: Option<f32>,
    pub grammar: Option<String>,
    pub json_mode: Option<bool>,
    pub stop: Option<StopDto>,
    pub seed: Option<i64>,
    pub stream: Option<bool>,
    pub inference_timeout_ms: Option<u64>,
}

impl From<ParametersDto> for Parameters {
    fn from(dto: ParametersDto) -> Self {
        let defaults = Parameters::default();
        Parameters {
            prompt: dto.prompt,
            max_tokens: dto.max_tokens.unwrap_or(defaults.max_tokens),
            temperature: dto.temperature.unwrap_or(defaults.temperature),
            top_k: dto.top_k.unwrap_or(defaults.top_k),
            top_p: dto.top_p.unwrap_or(defaults.top_p),
            min_p: dto.min_p.unwrap_or(defaults.min_p),
            typical_p: dto.typical_p.unwrap_or(defaults.typical_p),
            repeat_penalty: dto.repeat_penalty.unwrap_or(defaults.repeat_penalty),
            repeat_last_n: dto.repeat_last_n.unwrap_or(defaults.repeat_last_n),
            frequency_penalty: dto.frequency_penalty.unwrap_or(defaults.frequency_penalty),
            presence_penalty: dto.presence_penalty.unwrap_or(defaults.presence_penalty),
            mirostat: dto.mirostat.unwrap_or(defaults.mirostat),
            mirostat_tau: dto.mirostat_tau.unwrap_or(defaults.mirostat_tau),
            mirostat_eta: dto.mirostat_eta.unwrap_or(defaults.mirostat_eta),
            grammar: dto.grammar,
            json_mode: dto.json_mode.unwrap_or(defaults.json_mode),
            stop: dto.stop.map(Into::into),
            seed: dto.seed.unwrap_or(defaults.seed),
            stream: dto.stream.unwrap_or(defaults.stream),
            inference_timeout_ms: dto.inference_timeout_ms.unwrap_or(defaults.inference_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct InferenceRequestDto {
    pub model_id: String,
    #[serde(default)]
    pub messages: Option<Vec<MessageDto>>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub parameters: ParametersDto,
    #[serde(default)]
    pub stop: Option<StopDto>,
    #[serde(default)]
    pub stream: bool,
}

impl From<InferenceRequestDto> for InferenceRequest {
    fn from(dto: InferenceRequestDto) -> Self {
        InferenceRequest {
            model_id: dto.model_id,
            messages: dto.messages.map(|ms| ms.into_iter().map(Into::into).collect()),
            prompt: dto.prompt,
            parameters: dto.parameters.into(),
            stop: dto.stop.map(Into::into),
            stream: dto.stream,
        }
    }
}

/// Token usage: `inputTokens`/`outputTokens`/`tokensUsed`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, ToSchema)]
pub struct UsageDto {
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub tokens_used: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct InferenceResponseDto {
    pub request_id: String,
    pub model_id: String,
    pub content: String,
    pub usage: UsageDto,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runner_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured_output: Option<serde_json::Value>,
}

impl From<InferenceResponse> for InferenceResponseDto {
    fn from(resp: InferenceResponse) -> Self {
        InferenceResponseDto {
            request_id: resp.request_id,
            model_id: resp.model_id,
            content: resp.content,
            usage: UsageDto {
                input_tokens: resp.input_tokens,
                output_tokens: resp.output_tokens,
                tokens_used: resp.tokens_used,
            },
            duration_ms: resp.duration_ms,
            runner_name: resp.runner_name,
            structured_output: resp.structured_output,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StreamChunkDto {
    pub request_id: String,
    pub sequence_number: u64,
    pub delta: String,
    pub is_final: bool,
}

impl From<StreamChunk> for StreamChunkDto {
    fn from(chunk: StreamChunk) -> Self {
        StreamChunkDto {
            request_id: chunk.request_id,
            sequence_number: chunk.sequence_number,
            delta: chunk.delta,
            is_final: chunk.is_final,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dto_parameters_fall_back_to_recognized_defaults() {
        let dto = ParametersDto::default();
        let params: Parameters = dto.into();
        assert_eq!(params.max_tokens, 128);
        assert_eq!(params.top_k, 40);
        assert_eq!(params.seed, -1);
    }

    #[test]
    fn dto_parameters_preserve_explicit_overrides() {
        let dto = ParametersDto { temperature: Some(0.0), max_tokens: Some(8), ..Default::default() };
        let params: Parameters = dto.into();
        assert_eq!(params.temperature, 0.0);
        assert_eq!(params.max_tokens, 8);
        assert_eq!(params.top_p, 0.95);
    }

    #[test]
    fn inference_response_maps_usage_fields() {
        let resp = InferenceResponse {
            request_id: "r1".into(),
            model_id: "m1".into(),
            content: "hi".into(),
            input_tokens: 3,
            output_tokens: 2,
            tokens_used: 5,
            duration_ms: 10,
            runner_name: Some("gguf".into()),
            structured_output: None,
        };
        let dto: InferenceResponseDto = resp.into();
        assert_eq!(dto.usage.tokens_used, 5);
        assert_eq!(dto.runner_name.as_deref(), Some("gguf"));
    }
}
