//! `StreamChunk -> salvo::sse::SseEvent` adaptation.
//!
//! One SSE event per chunk, named `chunk`, plus a final sentinel `done`
//! event once `is_final` is observed.

use salvo::sse::SseEvent;

use crate::dto::StreamChunkDto;
use infercore_core::StreamChunk;

/// Build the SSE event for one chunk. `isFinal=true` chunks (§6: appears
/// exactly once, as the last event) are additionally followed by a
/// sentinel `done` event so clients that only look at event names (not
/// payload fields) can still detect stream end.
pub fn chunk_to_event(chunk: StreamChunk) -> Vec<SseEvent> {
    let is_final = chunk.is_final;
    let dto: StreamChunkDto = chunk.into();
    let data = serde_json::to_string(&dto).unwrap_or_default();
    let mut events = vec![SseEvent::default().name("chunk").text(data)];
    if is_final {
        events.push(SseEvent::default().name("done").text("{}"));
    }
    events
}

/// Adapt an error into a terminal SSE event, matching §6: "any error
/// aborts the stream before `isFinal`". Emitted in place of the final
/// `chunk`/`done` pair.
pub fn error_to_event(error: &crate::error::ApiErrorResponse) -> SseEvent {
    let data = serde_json::to_string(error).unwrap_or_default();
    SseEvent::default().name("error").text(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_final_chunk_emits_single_event() {
        let chunk = StreamChunk { request_id: "r1".into(), sequence_number: 0, delta: "hi".into(), is_final: false };
        let events = chunk_to_event(chunk);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn final_chunk_emits_chunk_then_done() {
        let chunk = StreamChunk { request_id: "r1".into(), sequence_number: 4, delta: "".into(), is_final: true };
        let events = chunk_to_event(chunk);
        assert_eq!(events.len(), 2);
    }
}
