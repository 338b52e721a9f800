//! Request Translator (§4.2): native Messages request -> foreign chat
//! request.

use std::collections::HashSet;

use serde_json::Value;

use crate::config::Config;
use crate::protocol::foreign::{ChatFunctionDef, ChatMessage, ChatRequest, ChatRole, ChatTool, FunctionCall, ToolCall};
use crate::protocol::native::{ContentBlock, MessageContent, MessagesRequest, Role, SystemPrompt};

/// Tool names never forwarded upstream.
const BLOCKED_TOOLS: &[&str] = &["BatchTool"];

pub fn translate_request(req: &MessagesRequest, config: &Config) -> ChatRequest {
    let mut messages = Vec::new();

    if let Some(system) = &req.system {
        match system {
            SystemPrompt::Text(text) => {
                if !text.trim().is_empty() {
                    messages.push(ChatMessage {
                        role: ChatRole::System,
                        content: Some(text.clone()),
                        tool_calls: None,
                        tool_call_id: None,
                    });
                }
            }
            SystemPrompt::Blocks(blocks) => {
                for block in blocks {
                    if let Some(text) = block.text() {
                        if !text.trim().is_empty() {
                            messages.push(ChatMessage {
                                role: ChatRole::System,
                                content: Some(text.to_string()),
                                tool_calls: None,
                                tool_call_id: None,
                            });
                        }
                    }
                }
            }
        }
    }

    for message in &req.messages {
        translate_message(message, &mut messages);
    }

    let tools = req
        .tools
        .iter()
        .filter(|tool| !BLOCKED_TOOLS.contains(&tool.name.as_str()))
        .map(|tool| ChatTool {
            kind: "function",
            function: ChatFunctionDef {
                name: tool.name.clone(),
                description: tool.description.clone(),
                parameters: clean_schema(&tool.input_schema),
            },
        })
        .collect();

    ChatRequest {
        model: config.resolve_model(req.model.as_deref()),
        messages,
        tools,
        max_tokens: req.max_tokens,
        temperature: Some(req.temperature.unwrap_or(1.0)),
        top_p: req.top_p,
        stop: req.stop_sequences.clone(),
        stream: req.stream,
    }
}

fn translate_message(message: &crate::protocol::native::InputMessage, out: &mut Vec<ChatMessage>) {
    let role = match message.role {
        Role::User => ChatRole::User,
        Role::Assistant => ChatRole::Assistant,
    };

    let blocks: Vec<ContentBlock> = match &message.content {
        MessageContent::Text(text) => {
            if !text.is_empty() {
                out.push(ChatMessage {
                    role,
                    content: Some(text.clone()),
                    tool_calls: None,
                    tool_call_id: None,
                });
            }
            return;
        }
        MessageContent::Blocks(blocks) => blocks.clone(),
    };

    let mut tool_calls = Vec::new();
    let mut tool_results: Vec<ChatMessage> = Vec::new();
    let mut text_parts = Vec::new();

    for block in &blocks {
        match block {
            ContentBlock::Text { text, .. } => {
                if !text.is_empty() {
                    text_parts.push(text.clone());
                }
            }
            ContentBlock::ToolUse { id, name, input, .. } => {
                tool_calls.push(ToolCall {
                    id: id.clone(),
                    kind: "function".to_string(),
                    function: FunctionCall {
                        name: name.clone(),
                        arguments: input.to_string(),
                    },
                });
            }
            ContentBlock::ToolResult { tool_use_id, content, text, .. } => {
                if tool_use_id.is_empty() {
                    log::warn!("{}", crate::error::TranslateError::MissingToolUseId);
                    continue;
                }
                let content = text
                    .clone()
                    .or_else(|| content.as_ref().map(value_to_plain_text));
                tool_results.push(ChatMessage {
                    role: ChatRole::Tool,
                    content,
                    tool_calls: None,
                    tool_call_id: Some(tool_use_id.clone()),
                });
            }
        }
    }

    let text = if text_parts.is_empty() { None } else { Some(text_parts.join(" ")) };
    let calls = if tool_calls.is_empty() { None } else { Some(tool_calls) };

    if text.is_some() || calls.is_some() {
        out.push(ChatMessage { role, content: text, tool_calls: calls, tool_call_id: None });
    }
    out.extend(tool_results);
}

fn value_to_plain_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Walks a JSON schema tree, dropping `format: "uri"` on string nodes (the
/// upstream's validator rejects it) while preserving everything else.
/// Cycle-safe: a node's own address is tracked during descent so a
/// self-referential schema is returned unchanged on revisit instead of
/// recursing forever.
pub fn clean_schema(schema: &Value) -> Value {
    let mut visited = HashSet::new();
    clean_schema_inner(schema, &mut visited)
}

fn clean_schema_inner(schema: &Value, visited: &mut HashSet<usize>) -> Value {
    let Value::Object(map) = schema else {
        return schema.clone();
    };

    let addr = map as *const _ as usize;
    if !visited.insert(addr) {
        return schema.clone();
    }

    let mut out = serde_json::Map::new();
    for (key, value) in map {
        if key == "format"
            && value.as_str() == Some("uri")
            && map.get("type").and_then(Value::as_str) == Some("string")
        {
            continue;
        }
        let cleaned = match key.as_str() {
            "properties" | "patternProperties" => clean_schema_map(value, visited),
            "items" | "additionalProperties" => clean_schema_inner(value, visited),
            "anyOf" | "allOf" | "oneOf" => clean_schema_array(value, visited),
            _ => value.clone(),
        };
        out.insert(key.clone(), cleaned);
    }
    Value::Object(out)
}

fn clean_schema_map(value: &Value, visited: &mut HashSet<usize>) -> Value {
    let Value::Object(map) = value else {
        return value.clone();
    };
    let mut out = serde_json::Map::new();
    for (key, v) in map {
        out.insert(key.clone(), clean_schema_inner(v, visited));
    }
    Value::Object(out)
}

fn clean_schema_array(value: &Value, visited: &mut HashSet<usize>) -> Value {
    let Value::Array(items) = value else {
        return value.clone();
    };
    Value::Array(items.iter().map(|item| clean_schema_inner(item, visited)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn drops_uri_format_on_string() {
        let schema = json!({
            "type": "object",
            "properties": {
                "u": {"type": "string", "format": "uri"},
                "n": {"type": "integer"}
            },
            "required": ["u"]
        });
        let cleaned = clean_schema(&schema);
        assert_eq!(
            cleaned,
            json!({
                "type": "object",
                "properties": {
                    "u": {"type": "string"},
                    "n": {"type": "integer"}
                },
                "required": ["u"]
            })
        );
    }

    #[test]
    fn is_idempotent() {
        let schema = json!({"type": "string", "format": "uri"});
        let once = clean_schema(&schema);
        let twice = clean_schema(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn preserves_non_uri_format() {
        let schema = json!({"type": "string", "format": "date-time"});
        assert_eq!(clean_schema(&schema), schema);
    }

    #[test]
    fn model_resolution_via_config() {
        let config = Config::default();
        let req = MessagesRequest {
            model: Some("claude-3-5-sonnet-20241022".to_string()),
            system: None,
            messages: vec![],
            tools: vec![],
            max_tokens: 100,
            temperature: None,
            top_p: None,
            stop_sequences: None,
            stream: false,
        };
        let out = translate_request(&req, &config);
        assert_eq!(out.model, "anthropic/claude-3.5-sonnet");
        assert_eq!(out.temperature, Some(1.0));
    }

    #[test]
    fn full_translation_snapshot() {
        let config = Config::default();
        let req = MessagesRequest {
            model: Some("claude-3-5-haiku-20241022".to_string()),
            system: Some(SystemPrompt::Text("be terse".to_string())),
            messages: vec![InputMessage {
                role: Role::User,
                content: MessageContent::Text("what's the weather in Lyon?".to_string()),
            }],
            tools: vec![ToolDefinition {
                name: "get_weather".to_string(),
                description: Some("fetch current weather for a city".to_string()),
                input_schema: json!({
                    "type": "object",
                    "properties": {"city": {"type": "string", "format": "uri"}},
                    "required": ["city"]
                }),
            }],
            max_tokens: 256,
            temperature: None,
            top_p: None,
            stop_sequences: None,
            stream: false,
        };
        let out = translate_request(&req, &config);

        // Project away `serde_json::Value` (whose Debug field order isn't
        // worth pinning in a snapshot) and keep the shape a snapshot is
        // actually good at catching: roles, content, and tool wiring.
        let roles: Vec<_> = out.messages.iter().map(|m| (m.role, m.content.clone())).collect();
        insta::assert_debug_snapshot!(roles, @r#"
        [
            (
                System,
                Some(
                    "be terse",
                ),
            ),
            (
                User,
                Some(
                    "what's the weather in Lyon?",
                ),
            ),
        ]
        "#);

        assert_eq!(out.model, "anthropic/claude-3.5-haiku");
        assert_eq!(out.tools.len(), 1);
        assert_eq!(out.tools[0].function.name, "get_weather");
        assert_eq!(out.tools[0].function.parameters["properties"]["city"].get("format"), None);
    }
}
