//! Streaming Translator (§4.3): the state machine that turns a foreign delta
//! stream into the native SSE event sequence.

use indexmap::IndexMap;
use itertools::Itertools;

use crate::protocol::foreign::{ChatCompletionChunk, ChunkDelta};
use crate::protocol::native::{
    BlockDelta, BlockStart, ContentBlock, MessageDeltaPayload, MessageDeltaUsage,
    MessageStartPayload, StopReason, StreamErrorPayload, StreamEvent, Usage,
};

#[derive(Debug, Clone)]
struct ToolMeta {
    native_index: u32,
    id: String,
    name: Option<String>,
}

/// Per-request accumulator driving the translation from foreign deltas to
/// native events. One instance per streaming request; not reused.
///
/// Native block indices are allocated in opening order, independent of the
/// foreign stream's own tool-call index numbering: text (if any) claims
/// whichever native index is free when it first appears, and each distinct
/// foreign tool-call index gets the next native index the first time it is
/// seen. This keeps a text block and a tool-call block from ever claiming
/// the same native index, which plain index passthrough cannot guarantee
/// (the foreign protocol's tool-call indices start at 0 independently of
/// whether text was already streaming).
pub struct StreamingTranslator {
    message_id: String,
    model: String,
    started: bool,
    next_native_index: u32,
    text_index: Option<u32>,
    saw_tool_call: bool,
    /// Foreign tool-call index -> accumulated raw JSON argument text.
    tool_args: IndexMap<u32, String>,
    /// Foreign tool-call index -> identity + native block index.
    tool_meta: IndexMap<u32, ToolMeta>,
    text_buf: String,
    thinking_buf: String,
    usage: Option<Usage>,
    last_finish_reason: Option<String>,
}

/// What the translator learned about the request once the stream closed;
/// the Orchestrator folds this into the observation record's merged content.
#[derive(Debug, Clone, Default)]
pub struct TerminalSummary {
    pub text: String,
    pub thinking: String,
    pub tool_calls: Vec<CompletedToolCall>,
    pub stop_reason: Option<StopReason>,
    pub usage: Usage,
}

#[derive(Debug, Clone)]
pub struct CompletedToolCall {
    pub id: String,
    pub name: Option<String>,
    pub arguments: String,
}

/// Either the request fails outright (no preamble was ever sent, so a
/// pre-stream error is still possible) or it continues.
pub enum FrameOutcome {
    Events(Vec<StreamEvent>),
    FatalBeforeStart(String),
}

impl StreamingTranslator {
    pub fn new(message_id: String, model: String) -> Self {
        StreamingTranslator {
            message_id,
            model,
            started: false,
            next_native_index: 0,
            text_index: None,
            saw_tool_call: false,
            tool_args: IndexMap::new(),
            tool_meta: IndexMap::new(),
            text_buf: String::new(),
            thinking_buf: String::new(),
            usage: None,
            last_finish_reason: None,
        }
    }

    fn alloc_native_index(&mut self) -> u32 {
        let index = self.next_native_index;
        self.next_native_index += 1;
        index
    }

    fn carries_content(chunk: &ChatCompletionChunk) -> bool {
        chunk.choices.iter().any(|choice| {
            choice.delta.content.as_deref().is_some_and(|s| !s.is_empty())
                || choice.delta.reasoning.as_deref().is_some_and(|s| !s.is_empty())
                || choice.delta.tool_calls.as_ref().is_some_and(|calls| !calls.is_empty())
        })
    }

    fn preamble(&mut self, events: &mut Vec<StreamEvent>) {
        events.push(StreamEvent::MessageStart {
            message: MessageStartPayload {
                id: self.message_id.clone(),
                kind: "message",
                role: "assistant",
                model: self.model.clone(),
                content: Vec::new(),
                stop_reason: None,
                stop_sequence: None,
                usage: Usage::default(),
            },
        });
        events.push(StreamEvent::Ping);
        self.started = true;
    }

    /// Processes one foreign frame, returning the native events it produces.
    pub fn process_frame(&mut self, chunk: ChatCompletionChunk) -> FrameOutcome {
        if let Some(error) = &chunk.error {
            if !self.started {
                return FrameOutcome::FatalBeforeStart(error.message.clone());
            }
            return FrameOutcome::Events(vec![StreamEvent::Error {
                error: StreamErrorPayload { kind: "api_error".to_string(), message: error.message.clone() },
            }]);
        }

        let mut events = Vec::new();

        if !self.started && Self::carries_content(&chunk) {
            self.preamble(&mut events);
        }

        if let Some(usage) = chunk.usage {
            self.usage = Some(Usage { input_tokens: usage.prompt_tokens, output_tokens: usage.completion_tokens });
        }

        for choice in &chunk.choices {
            self.apply_delta(&choice.delta, &mut events);
            if let Some(reason) = &choice.finish_reason {
                self.last_finish_reason = Some(reason.clone());
            }
        }

        FrameOutcome::Events(events)
    }

    fn apply_delta(&mut self, delta: &ChunkDelta, events: &mut Vec<StreamEvent>) {
        if let Some(content) = delta.content.as_deref() {
            if !content.is_empty() {
                let index = self.open_text_block_if_needed(events);
                events.push(StreamEvent::ContentBlockDelta {
                    index,
                    delta: BlockDelta::TextDelta { text: content.to_string() },
                });
                self.text_buf.push_str(content);
            }
        }

        if let Some(reasoning) = delta.reasoning.as_deref() {
            if !reasoning.is_empty() {
                let index = self.open_text_block_if_needed(events);
                events.push(StreamEvent::ContentBlockDelta {
                    index,
                    delta: BlockDelta::ThinkingDelta { thinking: reasoning.to_string() },
                });
                self.thinking_buf.push_str(reasoning);
            }
        }

        if let Some(tool_calls) = &delta.tool_calls {
            for call in tool_calls {
                self.apply_tool_delta(call, events);
            }
        }
    }

    fn open_text_block_if_needed(&mut self, events: &mut Vec<StreamEvent>) -> u32 {
        if let Some(index) = self.text_index {
            return index;
        }
        let index = self.alloc_native_index();
        self.text_index = Some(index);
        events.push(StreamEvent::ContentBlockStart {
            index,
            content_block: BlockStart::Text { text: String::new() },
        });
        index
    }

    fn apply_tool_delta(
        &mut self,
        call: &crate::protocol::foreign::ToolCallDelta,
        events: &mut Vec<StreamEvent>,
    ) {
        let foreign_index = call.index;
        if !self.tool_meta.contains_key(&foreign_index) {
            let native_index = self.alloc_native_index();
            let id = call.id.clone().unwrap_or_else(|| synth_tool_id(foreign_index));
            let name = call.function.name.clone();
            if name.is_none() {
                log::warn!("tool-call index {foreign_index} opened without a name");
            }
            self.tool_meta.insert(foreign_index, ToolMeta { native_index, id: id.clone(), name: name.clone() });
            self.tool_args.insert(foreign_index, String::new());
            self.saw_tool_call = true;
            events.push(StreamEvent::ContentBlockStart {
                index: native_index,
                content_block: BlockStart::ToolUse { id, name, input: serde_json::json!({}) },
            });
        }

        let native_index = self.tool_meta.get(&foreign_index).expect("just inserted above").native_index;
        let new_args = call.function.arguments.as_deref().unwrap_or("");
        let existing = self.tool_args.get(&foreign_index).cloned().unwrap_or_default();
        if new_args.len() > existing.len() {
            let delta_text = &new_args[existing.len()..];
            events.push(StreamEvent::ContentBlockDelta {
                index: native_index,
                delta: BlockDelta::InputJsonDelta { partial_json: delta_text.to_string() },
            });
            self.tool_args.insert(foreign_index, new_args.to_string());
        } else if new_args.len() < existing.len() {
            log::warn!("tool-call index {foreign_index} arguments shrank, discarding frame");
        }
    }

    /// Called on the `[DONE]` sentinel. Emits the closing events and returns
    /// the terminal summary for the observation record.
    pub fn finish(mut self) -> (Vec<StreamEvent>, TerminalSummary) {
        let opened = self
            .text_index
            .into_iter()
            .chain(self.tool_meta.values().map(|meta| meta.native_index));
        let mut events: Vec<StreamEvent> = opened
            .sorted()
            .map(|index| StreamEvent::ContentBlockStop { index })
            .collect();

        let stop_reason = if self.saw_tool_call {
            StopReason::ToolUse
        } else {
            map_finish_reason(self.last_finish_reason.as_deref())
        };

        let output_tokens = self
            .usage
            .map(|u| u.output_tokens)
            .unwrap_or_else(|| fallback_token_count(&self.text_buf) + fallback_token_count(&self.thinking_buf));

        events.push(StreamEvent::MessageDelta {
            delta: MessageDeltaPayload { stop_reason: Some(stop_reason), stop_sequence: None },
            usage: MessageDeltaUsage { output_tokens },
        });
        events.push(StreamEvent::MessageStop);

        let tool_calls = self
            .tool_args
            .into_iter()
            .map(|(foreign_index, arguments)| {
                let meta = self.tool_meta.swap_remove(&foreign_index);
                CompletedToolCall {
                    id: meta.as_ref().map(|m| m.id.clone()).unwrap_or_else(|| synth_tool_id(foreign_index)),
                    name: meta.and_then(|m| m.name),
                    arguments,
                }
            })
            .collect();

        let summary = TerminalSummary {
            text: self.text_buf,
            thinking: self.thinking_buf,
            tool_calls,
            stop_reason: Some(stop_reason),
            usage: Usage { input_tokens: self.usage.map(|u| u.input_tokens).unwrap_or(0), output_tokens },
        };

        (events, summary)
    }
}

fn synth_tool_id(index: u32) -> String {
    format!("call_synth_{index}")
}

fn fallback_token_count(text: &str) -> u32 {
    text.split_whitespace().count() as u32
}

fn map_finish_reason(reason: Option<&str>) -> StopReason {
    match reason {
        Some("stop") => StopReason::EndTurn,
        Some("length") => StopReason::MaxTokens,
        Some("tool_calls") | Some("function_call") => StopReason::ToolUse,
        Some("content_filter") | Some("safety") => StopReason::StopSequence,
        other => {
            if other.is_some() {
                log::warn!("unrecognized finish_reason {other:?}, defaulting to end_turn");
            }
            StopReason::EndTurn
        }
    }
}

impl TerminalSummary {
    /// Builds the native content blocks equivalent to this summary, for
    /// populating the observation record's merged content.
    pub fn content_blocks(&self) -> Vec<ContentBlock> {
        let mut blocks = Vec::new();
        if !self.text.trim().is_empty() {
            blocks.push(ContentBlock::Text {
                text: self.text.clone(),
                unknown: Default::default(),
            });
        }
        for call in &self.tool_calls {
            let input = serde_json::from_str(&call.arguments).unwrap_or_else(|err| {
                let err = crate::error::TranslateError::MalformedToolArguments(err.to_string());
                log::warn!("{err}");
                serde_json::json!({})
            });
            blocks.push(ContentBlock::ToolUse {
                id: call.id.clone(),
                name: call.name.clone().unwrap_or_default(),
                input,
                unknown: Default::default(),
            });
        }
        blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::foreign::{ChatUsage, ChunkChoice, FunctionCallDelta, ToolCallDelta};

    fn text_chunk(text: &str) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: None,
            model: None,
            choices: vec![ChunkChoice {
                index: 0,
                delta: ChunkDelta { content: Some(text.to_string()), reasoning: None, tool_calls: None },
                finish_reason: None,
            }],
            usage: None,
            error: None,
        }
    }

    fn finish_chunk(reason: &str, usage: Option<ChatUsage>) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: None,
            model: None,
            choices: vec![ChunkChoice {
                index: 0,
                delta: ChunkDelta::default(),
                finish_reason: Some(reason.to_string()),
            }],
            usage,
            error: None,
        }
    }

    fn tool_chunk(index: u32, id: Option<&str>, name: Option<&str>, arguments: &str) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: None,
            model: None,
            choices: vec![ChunkChoice {
                index: 0,
                delta: ChunkDelta {
                    content: None,
                    reasoning: None,
                    tool_calls: Some(vec![ToolCallDelta {
                        index,
                        id: id.map(str::to_string),
                        function: FunctionCallDelta {
                            name: name.map(str::to_string),
                            arguments: Some(arguments.to_string()),
                        },
                    }]),
                },
                finish_reason: None,
            }],
            usage: None,
            error: None,
        }
    }

    fn events_of(outcome: FrameOutcome) -> Vec<StreamEvent> {
        match outcome {
            FrameOutcome::Events(events) => events,
            FrameOutcome::FatalBeforeStart(msg) => panic!("unexpected fatal: {msg}"),
        }
    }

    /// S1 — text-only translation.
    #[test]
    fn s1_text_only() {
        let mut t = StreamingTranslator::new("msg_1".to_string(), "model-x".to_string());
        let mut all = Vec::new();
        all.extend(events_of(t.process_frame(text_chunk("Hi"))));
        all.extend(events_of(t.process_frame(text_chunk(" world"))));
        all.extend(events_of(t.process_frame(finish_chunk(
            "stop",
            Some(ChatUsage { prompt_tokens: 0, completion_tokens: 2, total_tokens: 2 }),
        ))));
        let (close_events, summary) = t.finish();
        all.extend(close_events);

        let names: Vec<&str> = all.iter().map(|e| e.event_name()).collect();
        assert_eq!(
            names,
            vec![
                "message_start",
                "ping",
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
        assert_eq!(summary.text, "Hi world");
        assert_eq!(summary.stop_reason, Some(StopReason::EndTurn));
        assert_eq!(summary.usage.output_tokens, 2);
    }

    /// S2 — tool call reconstruction.
    #[test]
    fn s2_tool_call() {
        let mut t = StreamingTranslator::new("msg_1".to_string(), "model-x".to_string());
        let mut all = Vec::new();

        all.extend(events_of(t.process_frame(tool_chunk(0, Some("c1"), Some("lookup"), ""))));
        for args in ["{\"q\"", "{\"q\":\"x\"", "{\"q\":\"x\"}"] {
            all.extend(events_of(t.process_frame(tool_chunk(0, None, None, args))));
        }
        all.extend(events_of(t.process_frame(finish_chunk("tool_calls", None))));
        let (close_events, summary) = t.finish();
        all.extend(close_events);

        let names: Vec<&str> = all.iter().map(|e| e.event_name()).collect();
        assert_eq!(
            names,
            vec![
                "message_start",
                "ping",
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
        assert_eq!(summary.tool_calls.len(), 1);
        assert_eq!(summary.tool_calls[0].arguments, "{\"q\":\"x\"}");
        assert_eq!(summary.stop_reason, Some(StopReason::ToolUse));
    }

    /// S3 — interleaved text and tool call: both blocks get distinct native
    /// indices and both get an explicit stop at termination.
    #[test]
    fn s3_interleaved_text_and_tool() {
        let mut t = StreamingTranslator::new("msg_1".to_string(), "model-x".to_string());
        let mut all = Vec::new();

        all.extend(events_of(t.process_frame(text_chunk("A"))));
        all.extend(events_of(t.process_frame(tool_chunk(1, Some("c1"), Some("f"), "{}"))));
        all.extend(events_of(t.process_frame(text_chunk("B"))));
        all.extend(events_of(t.process_frame(finish_chunk("tool_calls", None))));
        let (close_events, summary) = t.finish();
        all.extend(close_events);

        let stops: Vec<u32> = all
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ContentBlockStop { index } => Some(*index),
                _ => None,
            })
            .collect();
        assert_eq!(stops, vec![0, 1]);
        assert_eq!(summary.text, "AB");
        assert_eq!(summary.tool_calls.len(), 1);
    }

    /// Tool-call-seen overrides a `stop` finish reason (open question 2).
    #[test]
    fn tool_call_overrides_stop_finish_reason() {
        let mut t = StreamingTranslator::new("msg_1".to_string(), "model-x".to_string());
        let _ = t.process_frame(tool_chunk(0, Some("c1"), Some("f"), "{}"));
        let _ = t.process_frame(finish_chunk("stop", None));
        let (_, summary) = t.finish();
        assert_eq!(summary.stop_reason, Some(StopReason::ToolUse));
    }

    #[test]
    fn empty_frame_does_not_trigger_preamble() {
        let mut t = StreamingTranslator::new("msg_1".to_string(), "model-x".to_string());
        let metadata_only = ChatCompletionChunk {
            id: None,
            model: None,
            choices: vec![],
            usage: Some(ChatUsage { prompt_tokens: 5, completion_tokens: 0, total_tokens: 5 }),
            error: None,
        };
        let events = events_of(t.process_frame(metadata_only));
        assert!(events.is_empty());
        assert!(!t.started);
    }

    #[test]
    fn continuation_frame_keeps_openers_name() {
        let mut t = StreamingTranslator::new("msg_1".to_string(), "model-x".to_string());
        let _ = t.process_frame(tool_chunk(0, Some("c1"), Some("lookup"), ""));
        let _ = t.process_frame(tool_chunk(0, None, Some("different_name"), "{}"));
        let _ = t.process_frame(finish_chunk("tool_calls", None));
        let (_, summary) = t.finish();
        assert_eq!(summary.tool_calls[0].name.as_deref(), Some("lookup"));
    }
}
