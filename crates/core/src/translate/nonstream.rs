//! Non-streaming translation (§4.3, "Non-streaming translation" subsection):
//! a foreign chat completion object -> the native reply shape.

use crate::protocol::foreign::ChatCompletionResponse;
use crate::protocol::native::{ContentBlock, MessagesReply, Role, StopReason, Usage};

pub fn translate_response(response: &ChatCompletionResponse, requested_model: &str) -> MessagesReply {
    let choice = response.choices.first();

    let mut content = Vec::new();
    if let Some(choice) = choice {
        if let Some(text) = &choice.message.content {
            if !text.trim().is_empty() {
                content.push(ContentBlock::Text { text: text.clone(), unknown: Default::default() });
            }
        }
        if let Some(tool_calls) = &choice.message.tool_calls {
            for call in tool_calls {
                let input = serde_json::from_str(&call.function.arguments).unwrap_or_else(|err| {
                    log::warn!("malformed tool-call arguments in non-streaming reply: {err}");
                    serde_json::json!({})
                });
                content.push(ContentBlock::ToolUse {
                    id: call.id.clone(),
                    name: call.function.name.clone(),
                    input,
                    unknown: Default::default(),
                });
            }
        }
    }

    let stop_reason = choice.and_then(|c| c.finish_reason.as_deref()).map(map_finish_reason);

    let usage = response
        .usage
        .map(|u| Usage { input_tokens: u.prompt_tokens, output_tokens: u.completion_tokens })
        .unwrap_or_default();

    MessagesReply {
        id: derive_message_id(response.id.as_deref()),
        kind: "message".to_string(),
        role: Role::Assistant,
        model: response.model.clone().unwrap_or_else(|| requested_model.to_string()),
        content,
        stop_reason,
        stop_sequence: None,
        usage,
    }
}

fn derive_message_id(foreign_id: Option<&str>) -> String {
    match foreign_id {
        Some(id) if id.starts_with("chatcmpl") => format!("msg{}", &id["chatcmpl".len()..]),
        Some(id) => id.to_string(),
        None => format!("msg_{}", uuid::Uuid::new_v4().simple()),
    }
}

fn map_finish_reason(reason: &str) -> StopReason {
    match reason {
        "stop" => StopReason::EndTurn,
        "length" => StopReason::MaxTokens,
        "tool_calls" | "function_call" => StopReason::ToolUse,
        "content_filter" | "safety" => StopReason::StopSequence,
        other => {
            log::warn!("unrecognized finish_reason {other:?}, defaulting to end_turn");
            StopReason::EndTurn
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::foreign::{ChatChoice, ChatChoiceMessage, ChatUsage};

    #[test]
    fn translates_text_reply() {
        let response = ChatCompletionResponse {
            id: Some("chatcmpl-abc123".to_string()),
            model: Some("anthropic/claude-3.5-sonnet".to_string()),
            choices: vec![ChatChoice {
                index: 0,
                message: ChatChoiceMessage { content: Some("hello".to_string()), tool_calls: None },
                finish_reason: Some("stop".to_string()),
            }],
            usage: Some(ChatUsage { prompt_tokens: 3, completion_tokens: 1, total_tokens: 4 }),
        };
        let reply = translate_response(&response, "claude-3-5-sonnet-20241022");
        assert_eq!(reply.id, "msg-abc123");
        assert_eq!(reply.stop_reason, Some(StopReason::EndTurn));
        assert_eq!(reply.usage.output_tokens, 1);
        match &reply.content[0] {
            ContentBlock::Text { text, .. } => assert_eq!(text, "hello"),
            _ => panic!("expected text block"),
        }
    }
}
