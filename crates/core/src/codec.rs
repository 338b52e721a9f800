//! Event Codec (§4.1): reads the foreign upstream's line-oriented SSE stream
//! into typed frames, and writes native `StreamEvent`s as SSE frames for the
//! client.

use bytes::Bytes;
use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt};

use crate::protocol::foreign::ChatCompletionChunk;
use crate::protocol::native::StreamEvent;

pub const DONE_SENTINEL: &str = "[DONE]";

/// A single decoded frame from the foreign stream, or its logical
/// terminator. Malformed JSON and transport errors are swallowed here (they
/// are non-fatal per §4.1) and simply produce no item.
#[derive(Debug)]
pub enum ForeignFrame {
    Chunk(ChatCompletionChunk),
    Done,
}

/// Splits `byte_stream` into SSE frames (line-buffering handled by
/// `eventsource-stream`) and decodes each `data:` payload, recognizing the
/// `[DONE]` sentinel and skipping frames that fail to parse.
pub fn decode_foreign_stream<S, E>(byte_stream: S) -> impl Stream<Item = ForeignFrame>
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    byte_stream.eventsource().filter_map(|result| async move {
        match result {
            Ok(event) => {
                let data = event.data.trim();
                if data.is_empty() {
                    return None;
                }
                if data == DONE_SENTINEL {
                    return Some(ForeignFrame::Done);
                }
                match serde_json::from_str::<ChatCompletionChunk>(data) {
                    Ok(chunk) => Some(ForeignFrame::Chunk(chunk)),
                    Err(err) => {
                        log::debug!("skipping malformed upstream frame: {err}");
                        None
                    }
                }
            }
            Err(err) => {
                log::warn!("upstream SSE transport error: {err}");
                None
            }
        }
    })
}

/// Formats a native event as a single SSE frame: `event: <name>\n` followed
/// by `data: <compact json>\n\n`. Written in one piece so the caller can
/// flush after each frame without letting small frames batch.
pub fn encode_native_event(event: &StreamEvent) -> String {
    let name = event.event_name();
    let data = serde_json::to_string(event).expect("StreamEvent always serializes");
    format!("event: {name}\ndata: {data}\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::native::{MessageDeltaPayload, MessageDeltaUsage, StopReason};

    #[test]
    fn encodes_message_stop_with_no_body_fields() {
        let frame = encode_native_event(&StreamEvent::MessageStop);
        assert_eq!(frame, "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n");
    }

    #[test]
    fn encodes_message_delta() {
        let frame = encode_native_event(&StreamEvent::MessageDelta {
            delta: MessageDeltaPayload {
                stop_reason: Some(StopReason::EndTurn),
                stop_sequence: None,
            },
            usage: MessageDeltaUsage { output_tokens: 2 },
        });
        assert!(frame.starts_with("event: message_delta\ndata: "));
        assert!(frame.ends_with("\n\n"));
        assert!(frame.contains("\"stop_reason\":\"end_turn\""));
    }
}
