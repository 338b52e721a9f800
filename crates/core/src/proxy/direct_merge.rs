//! Reconstructs a `MergedContent` summary from the native SSE events that
//! pass through in Direct mode, where the upstream already speaks the
//! native protocol and there is no streaming translator driving the shape
//! (§4.5 step 2).

use indexmap::IndexMap;
use serde_json::Value;

use crate::store::record::MergedContent;

#[derive(Debug, Default)]
pub struct DirectMergeAccumulator {
    buffer: String,
    text: String,
    tool_calls: IndexMap<u32, ToolCallAcc>,
    output_tokens: Option<u32>,
}

#[derive(Debug, Clone, Default)]
struct ToolCallAcc {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

impl DirectMergeAccumulator {
    /// Feeds newly-received upstream bytes; call repeatedly as chunks
    /// arrive, then `finish()` once at stream end.
    pub fn ingest(&mut self, bytes: &[u8]) {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));

        while let Some(pos) = self.buffer.find("\n\n") {
            let frame: String = self.buffer.drain(..pos + 2).collect();
            self.ingest_frame(&frame);
        }
    }

    fn ingest_frame(&mut self, frame: &str) {
        for line in frame.lines() {
            let Some(data) = line.strip_prefix("data:") else { continue };
            let data = data.trim();
            if data.is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(data) {
                Ok(value) => self.ingest_event(&value),
                Err(err) => log::debug!("skipping malformed native event during merge: {err}"),
            }
        }
    }

    fn ingest_event(&mut self, value: &Value) {
        match value.get("type").and_then(Value::as_str) {
            Some("content_block_start") => {
                let Some(index) = value.get("index").and_then(Value::as_u64) else { return };
                let Some(block) = value.get("content_block") else { return };
                if block.get("type").and_then(Value::as_str) == Some("tool_use") {
                    self.tool_calls.insert(
                        index as u32,
                        ToolCallAcc {
                            id: block.get("id").and_then(Value::as_str).map(str::to_string),
                            name: block.get("name").and_then(Value::as_str).map(str::to_string),
                            arguments: String::new(),
                        },
                    );
                }
            }
            Some("content_block_delta") => {
                let Some(index) = value.get("index").and_then(Value::as_u64) else { return };
                let Some(delta) = value.get("delta") else { return };
                match delta.get("type").and_then(Value::as_str) {
                    Some("text_delta") | Some("thinking_delta") => {
                        if let Some(text) = delta.get("text").or_else(|| delta.get("thinking")).and_then(Value::as_str) {
                            self.text.push_str(text);
                        }
                    }
                    Some("input_json_delta") => {
                        if let Some(partial) = delta.get("partial_json").and_then(Value::as_str) {
                            self.tool_calls.entry(index as u32).or_default().arguments.push_str(partial);
                        }
                    }
                    _ => {}
                }
            }
            Some("message_delta") => {
                if let Some(tokens) = value.pointer("/usage/output_tokens").and_then(Value::as_u64) {
                    self.output_tokens = Some(tokens as u32);
                }
            }
            _ => {}
        }
    }

    pub fn finish(self, now_ms: u64) -> MergedContent {
        let tool_calls = self
            .tool_calls
            .into_values()
            .map(|acc| {
                let input = serde_json::from_str(&acc.arguments).unwrap_or(Value::Null);
                serde_json::json!({ "id": acc.id, "name": acc.name, "input": input })
            })
            .collect();

        MergedContent {
            total_characters: self.text.chars().count(),
            complete_text: self.text,
            tool_calls,
            message_complete: true,
            timestamp_ms: now_ms,
        }
    }

    pub fn output_tokens(&self) -> Option<u32> {
        self.output_tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_text_across_chunks() {
        let mut acc = DirectMergeAccumulator::default();
        acc.ingest(b"event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hi\"}}\n\n");
        acc.ingest(b"event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\" there\"}}\n\n");
        let merged = acc.finish(0);
        assert_eq!(merged.complete_text, "Hi there");
    }

    #[test]
    fn accumulates_tool_call_arguments() {
        let mut acc = DirectMergeAccumulator::default();
        acc.ingest(b"data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"tool_use\",\"id\":\"t1\",\"name\":\"f\",\"input\":{}}}\n\n");
        acc.ingest(b"data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\"{}\"}}\n\n");
        let merged = acc.finish(0);
        assert_eq!(merged.tool_calls.len(), 1);
    }
}
