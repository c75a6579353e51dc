//! Generation Loop (C6) — the principal runner's tokenize -> prompt
//! decode -> sample -> detokenize cycle.
//!
//! The per-token loop (sample -> detokenize -> stop-substring scan ->
//! buffer append -> batch reconfigure -> decode) runs against the
//! [`crate::backend::RunnerBackend`]/[`crate::backend::GenerationContext`]
//! trait pair. The byte-buffer "safe prefix" flushing scheme keeps
//! provisionally-unsafe trailing bytes back in case they are a partial
//! UTF-8 sequence or a partial stop-string match, and only emits the
//! unambiguous head.

use std::{
    sync::{atomic::{AtomicBool, Ordering}, Arc},
    time::Instant,
};

use crate::{
    backend::RunnerInstance,
    config::PoolConfig,
    error::CoreError,
    sampler::{build_grammar, SamplerChain},
    CoreResult, InferenceRequest, InferenceResponse, Message, Parameters, RequestContext, StopSequences, StreamChunk,
};

/// An injected pure function rendering a prompt from a message list
/// (§1: "the chat-template renderer (assumed available as a pure
/// function `render(template, messages) -> prompt`)"). The core never
/// embeds a template engine itself (§9).
pub type TemplateRenderer = dyn Fn(&[Message]) -> CoreResult<String> + Send + Sync;

/// Markers that indicate a rendered prompt already carries chat special
/// tokens, so BOS should not be prepended a second time (§4.6 phase 2).
const SPECIAL_TOKEN_MARKERS: &[&str] = &["<|im_start|>", "<|start_header_id|>", "[INST]", "<s>", "<|user|>", "<|assistant|>"];

/// Shared flag a caller flips to request cooperative cancellation (§5:
/// "a caller-initiated cancel signals the loop via a boolean observed at
/// the same check points" as the deadline). Checked at the same points
/// the deadline is: before the concurrency gate, before each prompt
/// chunk, and before each generated token.
pub type CancelSignal = Arc<AtomicBool>;

fn is_cancelled(cancel: Option<&CancelSignal>) -> bool {
    cancel.map(|c| c.load(Ordering::Relaxed)).unwrap_or(false)
}

fn prompt_has_special_tokens(prompt: &str) -> bool {
    SPECIAL_TOKEN_MARKERS.iter().any(|marker| prompt.contains(marker))
}

/// Resolves the raw prompt text per §4.6 phase 1: `parameters.prompt`
/// supersedes everything, then the request's raw `prompt`, then a
/// rendered `messages` prompt (falling back to the backend's default
/// template if rendering yields nothing).
fn render_prompt(instance: &RunnerInstance, request: &InferenceRequest, renderer: Option<&TemplateRenderer>) -> CoreResult<String> {
    if let Some(prompt) = &request.parameters.prompt {
        return Ok(prompt.clone());
    }
    if let Some(prompt) = &request.prompt {
        return Ok(prompt.clone());
    }
    if let Some(messages) = &request.messages {
        let rendered = match renderer {
            Some(render) => render(messages)?,
            None => String::new(),
        };
        if rendered.trim().is_empty() {
            return Ok(instance.backend.default_chat_template(messages));
        }
        return Ok(rendered);
    }
    Ok(String::new())
}

/// §5: "deadline computed as `min(now + request.timeout, now +
/// configured_max)`" — `configured_max` is the request's own
/// `inference_timeout_ms` knob.
fn compute_deadline(ctx: &RequestContext, parameters: &Parameters) -> Instant {
    let param_timeout = std::time::Duration::from_millis(parameters.inference_timeout_ms);
    Instant::now() + ctx.timeout.min(param_timeout)
}

/// Finds the earliest complete match of any stop string in `buffer`,
/// scanning byte-by-byte so a match split across token boundaries is
/// still caught. Returns `(split_point, matched)`; `buffer[..split_point]`
/// is always safe to flush — it definitely does not contain (a prefix
/// of) any stop string beyond what's already accounted for.
fn scan_stop(buffer: &[u8], stops: &[&str]) -> (usize, bool) {
    if stops.is_empty() {
        return (buffer.len(), false);
    }

    stops
        .iter()
        .filter(|s| !s.is_empty())
        .map(|stop| {
            let stop = stop.as_bytes();
            let mut index_safe = 0usize;
            let mut index_unsafe = 0usize;
            while index_unsafe < buffer.len() {
                let index_stop = index_unsafe - index_safe;
                if index_stop >= stop.len() {
                    return (index_safe, true);
                }
                let matches = buffer[index_unsafe] == stop[index_stop];
                index_unsafe += 1;
                if !matches {
                    index_safe = index_unsafe;
                }
            }
            (index_safe, index_unsafe - index_safe >= stop.len())
        })
        .min_by(|a, b| match (a.1, b.1) {
            (true, false) => std::cmp::Ordering::Less,
            (false, true) => std::cmp::Ordering::Greater,
            _ => a.0.cmp(&b.0),
        })
        .unwrap_or((buffer.len(), false))
}

/// Only the longest safe-to-flush UTF-8 prefix of `buffer` is ever
/// returned; anything past the last valid boundary stays buffered for
/// the next token (a multi-byte codepoint may still be split across
/// decode steps even though each piece's bytes individually are valid).
fn utf8_safe_prefix(buffer: &[u8]) -> usize {
    match std::str::from_utf8(buffer) {
        Ok(_) => buffer.len(),
        Err(err) => err.valid_up_to(),
    }
}

struct GenerationOutcome {
    content: String,
    output_tokens: usize,
}

/// Runs phases 1-5 of §4.6 against an already-resolved `instance`.
/// `sender` is `Some` for the streaming entrypoint ([`generate_stream`])
/// and `None` for the blocking one ([`generate`]); chunks are emitted
/// identically either way, just discarded when there is no sender.
async fn run_inner(
    instance: &RunnerInstance,
    request: &InferenceRequest,
    ctx: &RequestContext,
    renderer: Option<&TemplateRenderer>,
    sender: Option<&flume::Sender<CoreResult<StreamChunk>>>,
    cancel: Option<&CancelSignal>,
) -> CoreResult<InferenceResponse> {
    let started = Instant::now();
    let parameters = &request.parameters;
    let deadline = compute_deadline(ctx, parameters);
    let streaming = sender.is_some();
    let mut sequence_number: u64 = 0;

    if is_cancelled(cancel) {
        return Err(CoreError::Cancelled);
    }

    // Phase 1: prepare. Acquire the instance's bounded-concurrency gate
    // (default 1 — GGUF is not re-entrant, §5), bounded by the request's
    // own timeout; exhaustion is BUSY, not TIMEOUT, because nothing has
    // started running yet.
    let _permit = match tokio::time::timeout(ctx.timeout, instance.gate.acquire()).await {
        Ok(Ok(permit)) => permit,
        Ok(Err(_)) => return Err(CoreError::Internal("generation gate closed".into())),
        Err(_) => return Err(CoreError::Busy),
    };

    let mut gctx = instance.context.lock().await;
    // Every request is stateless (§9: session-mode is out of scope).
    gctx.kv_cache_clear();

    let raw_prompt = render_prompt(instance, request, renderer)?;

    // Phase 2: tokenize.
    let add_bos = !prompt_has_special_tokens(&raw_prompt);
    let prompt_tokens = instance.backend.tokenize(&raw_prompt, add_bos, true)?;
    let input_tokens = prompt_tokens.len();

    if prompt_tokens.is_empty() {
        if let Some(sender) = sender {
            let _ = sender.send(Ok(StreamChunk { request_id: ctx.request_id.clone(), sequence_number: 0, delta: String::new(), is_final: true }));
        }
        return Ok(InferenceResponse {
            request_id: ctx.request_id.clone(),
            model_id: request.model_id.clone(),
            content: String::new(),
            input_tokens: 0,
            output_tokens: 0,
            tokens_used: 0,
            duration_ms: started.elapsed().as_millis() as u64,
            runner_name: Some(instance.runner_name.clone()),
            structured_output: None,
        });
    }

    // Phase 3: prompt evaluation, N_batch tokens per decode call, logits
    // requested only on the last token of each chunk (§4.6).
    let n_batch = gctx.n_batch().min(128).max(1);
    let mut position: i64 = 0;
    let mut last_logits_index = 0usize;
    for chunk in prompt_tokens.chunks(n_batch) {
        if Instant::now() >= deadline {
            return Err(CoreError::Timeout);
        }
        if is_cancelled(cancel) {
            return Err(CoreError::Cancelled);
        }
        let positions: Vec<i64> = (0..chunk.len() as i64).map(|i| position + i).collect();
        let logits_at: Vec<bool> = (0..chunk.len()).map(|i| i == chunk.len() - 1).collect();
        gctx.decode(chunk, &positions, &logits_at).map_err(|err| match err {
            CoreError::DecodeFailed(msg) => CoreError::PromptEvalFailed(msg),
            other => other,
        })?;
        position += chunk.len() as i64;
        last_logits_index = chunk.len() - 1;
    }

    let outcome = if parameters.max_tokens == 0 {
        // §8 boundary: "max_tokens = 0 => empty content, no decode calls
        // in the generation loop" — the prompt-eval decodes above are
        // unavoidable, but the per-token loop itself never runs.
        GenerationOutcome { content: String::new(), output_tokens: 0 }
    } else {
        generate_tokens(
            &mut **gctx,
            instance,
            parameters,
            &prompt_tokens,
            last_logits_index,
            position,
            deadline,
            ctx,
            streaming,
            sender,
            &mut sequence_number,
            cancel,
        )?
    };

    if let Some(sender) = sender {
        let _ = sender.send(Ok(StreamChunk { request_id: ctx.request_id.clone(), sequence_number, delta: String::new(), is_final: true }));
    }

    Ok(InferenceResponse {
        request_id: ctx.request_id.clone(),
        model_id: request.model_id.clone(),
        content: outcome.content,
        input_tokens,
        output_tokens: outcome.output_tokens,
        tokens_used: input_tokens + outcome.output_tokens,
        duration_ms: started.elapsed().as_millis() as u64,
        runner_name: Some(instance.runner_name.clone()),
        structured_output: None,
    })
}

/// Phase 4: the per-token sample/decode loop. Takes `&mut dyn
/// GenerationContext` rather than the `MutexGuard` directly so it stays
/// agnostic to the lock type holding it.
#[allow(clippy::too_many_arguments)]
fn generate_tokens(
    gctx: &mut dyn crate::backend::GenerationContext,
    instance: &RunnerInstance,
    parameters: &Parameters,
    prompt_tokens: &[u32],
    mut logits_index: usize,
    mut position: i64,
    deadline: Instant,
    ctx: &RequestContext,
    streaming: bool,
    sender: Option<&flume::Sender<CoreResult<StreamChunk>>>,
    sequence_number: &mut u64,
    cancel: Option<&CancelSignal>,
) -> CoreResult<GenerationOutcome> {
    let stop_strings: Vec<String> = request_stop_strings(parameters);
    let stop_refs: Vec<&str> = stop_strings.iter().map(String::as_str).collect();

    let grammar = build_grammar(instance.backend.vocabulary(), parameters)?;
    let mut sampler = SamplerChain::new(parameters, grammar, prompt_tokens);

    let mut content = String::new();
    let mut buffer: Vec<u8> = Vec::new();
    let mut output_tokens = 0usize;

    loop {
        if Instant::now() >= deadline {
            return Err(CoreError::Timeout);
        }
        if is_cancelled(cancel) {
            return Err(CoreError::Cancelled);
        }

        let mut logits = gctx.get_logits(logits_index)?;
        let token = sampler.sample(&mut logits);
        output_tokens += 1;

        let is_eog = instance.backend.is_end_of_generation(token);
        if !is_eog {
            buffer.extend_from_slice(&instance.backend.token_to_piece(token));
        }

        let (stop_split, stop_matched) = scan_stop(&buffer, &stop_refs);
        let max_reached = output_tokens >= parameters.max_tokens;

        if is_eog || stop_matched || max_reached {
            let flush_to = if stop_matched { stop_split } else { buffer.len() };
            let piece = String::from_utf8_lossy(&buffer[..flush_to]).into_owned();
            if !piece.is_empty() {
                content.push_str(&piece);
                if let Some(sender) = sender {
                    let chunk = StreamChunk { request_id: ctx.request_id.clone(), sequence_number: *sequence_number, delta: piece, is_final: false };
                    *sequence_number += 1;
                    if sender.send(Ok(chunk)).is_err() {
                        break;
                    }
                }
            }
            break;
        }

        let safe_to = utf8_safe_prefix(&buffer[..stop_split]);
        if safe_to > 0 {
            let piece = String::from_utf8_lossy(&buffer[..safe_to]).into_owned();
            content.push_str(&piece);
            if streaming {
                if let Some(sender) = sender {
                    let chunk = StreamChunk { request_id: ctx.request_id.clone(), sequence_number: *sequence_number, delta: piece, is_final: false };
                    *sequence_number += 1;
                    if sender.send(Ok(chunk)).is_err() {
                        break;
                    }
                }
            }
            buffer.drain(..safe_to);
        }

        gctx.decode(&[token], &[position], &[true]).map_err(|err| match err {
            CoreError::DecodeFailed(msg) => CoreError::DecodeFailed(msg),
            other => other,
        })?;
        position += 1;
        logits_index = 0;
    }

    Ok(GenerationOutcome { content, output_tokens })
}

fn request_stop_strings(parameters: &Parameters) -> Vec<String> {
    match &parameters.stop {
        None => Vec::new(),
        Some(StopSequences::One(s)) => vec![s.clone()],
        Some(StopSequences::Many(v)) => v.clone(),
    }
}

/// Blocking entrypoint: runs the loop to completion and returns the
/// final [`InferenceResponse`]. `cancel`, if given, lets a caller request
/// cooperative cancellation from another task.
pub async fn generate(
    instance: &RunnerInstance,
    request: &InferenceRequest,
    ctx: &RequestContext,
    renderer: Option<&TemplateRenderer>,
    cancel: Option<&CancelSignal>,
) -> CoreResult<InferenceResponse> {
    run_inner(instance, request, ctx, renderer, None, cancel).await
}

/// Streaming entrypoint: spawns the loop on a background task and
/// returns a receiver of chunks immediately. Any error aborts the
/// stream before an `is_final` chunk is ever sent (§6).
pub fn generate_stream(
    instance: Arc<RunnerInstance>,
    request: InferenceRequest,
    ctx: RequestContext,
    renderer: Option<Arc<TemplateRenderer>>,
    cancel: Option<CancelSignal>,
) -> flume::Receiver<CoreResult<StreamChunk>> {
    let (tx, rx) = flume::bounded(64);
    let tx_for_task = tx.clone();
    tokio::spawn(async move {
        let renderer_ref = renderer.as_deref();
        if let Err(err) = run_inner(&instance, &request, &ctx, renderer_ref, Some(&tx_for_task), cancel.as_ref()).await {
            let _ = tx_for_task.send(Err(err));
        }
    });
    rx
}

/// Default pool-construction parallelism knob re-exported for
/// convenience by callers wiring up a `Pool<RunnerInstance>` (§4.5).
pub fn default_pool_config() -> PoolConfig {
    PoolConfig::default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_stop_finds_match_split_across_calls() {
        let buffer = b"apple\nmore";
        let (split, matched) = scan_stop(buffer, &["\n"]);
        assert!(matched);
        assert_eq!(&buffer[..split], b"apple");
    }

    #[test]
    fn scan_stop_with_no_stops_never_matches() {
        let (split, matched) = scan_stop(b"hello", &[]);
        assert!(!matched);
        assert_eq!(split, 5);
    }

    #[test]
    fn scan_stop_picks_earliest_of_multiple_stops() {
        let buffer = b"foo STOP1 bar STOP2";
        let (split, matched) = scan_stop(buffer, &["STOP2", "STOP1"]);
        assert!(matched);
        assert_eq!(&buffer[..split], b"foo ");
    }

    #[test]
    fn utf8_safe_prefix_holds_back_incomplete_multibyte_sequence() {
        let bytes = "héllo".as_bytes();
        let truncated = &bytes[..bytes.len() - 1];
        let safe = utf8_safe_prefix(truncated);
        assert!(safe < truncated.len());
    }

    #[test]
    fn utf8_safe_prefix_is_full_length_for_valid_utf8() {
        let bytes = "hello".as_bytes();
        assert_eq!(utf8_safe_prefix(bytes), bytes.len());
    }

    #[test]
    fn request_stop_strings_handles_both_shapes() {
        let mut parameters = Parameters::default();
        parameters.stop = Some(StopSequences::One("\n".into()));
        assert_eq!(request_stop_strings(&parameters), vec!["\n".to_string()]);
        parameters.stop = Some(StopSequences::Many(vec!["a".into(), "b".into()]));
        assert_eq!(request_stop_strings(&parameters), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn prompt_special_token_detection() {
        assert!(prompt_has_special_tokens("<|im_start|>user\nhi<|im_end|>"));
        assert!(!prompt_has_special_tokens("The capital of France is"));
    }
}
