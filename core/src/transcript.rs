//! Normalized turn transcript.
//!
//! Assistant turns keep the provider-native message (`raw_message`) as the
//! sole source of truth for round-tripping; `derived_text` exists for UI,
//! logging and block parsing only and must never be used to reconstruct the
//! assistant turn on the wire.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::error::DomainOsErr;
use crate::error::Result;
use crate::util::truncate_bytes;

/// Per-result byte guard for tool outputs.
pub const TOOL_RESULT_MAX_BYTES: usize = 75 * 1024;
/// Cumulative transcript byte guard.
pub const TRANSCRIPT_MAX_BYTES: usize = 400 * 1024;

/// Why the provider stopped. Transport and API errors are a separate
/// channel and never appear here.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    ToolUse,
    EndTurn,
    MaxTokens,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: JsonValue,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnthropicContentBlock {
    Text { text: String },
    ToolUse {
        id: String,
        name: String,
        input: JsonValue,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatCompletionFunction {
    pub name: String,
    /// JSON-encoded arguments, exactly as the API returns them.
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatCompletionToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub function: ChatCompletionFunction,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatCompletionMessage {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ChatCompletionToolCall>>,
}

/// Opaque provider-native assistant message, tagged per wire shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum NativeAssistantMessage {
    Anthropic(Vec<AnthropicContentBlock>),
    OpenAiStyle(ChatCompletionMessage),
}

impl NativeAssistantMessage {
    /// Text for UI and block parsing. Not a wire format.
    pub fn derived_text(&self) -> String {
        match self {
            NativeAssistantMessage::Anthropic(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    AnthropicContentBlock::Text { text } => Some(text.as_str()),
                    AnthropicContentBlock::ToolUse { .. } => None,
                })
                .collect::<Vec<_>>()
                .join(""),
            NativeAssistantMessage::OpenAiStyle(message) => {
                message.content.clone().unwrap_or_default()
            }
        }
    }
}

/// Normalized response from a tool-capable provider round.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolUseResponse {
    pub stop_reason: StopReason,
    pub text_content: String,
    pub tool_calls: Vec<ToolCall>,
    pub raw_assistant_message: NativeAssistantMessage,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TranscriptItem {
    User {
        content: String,
    },
    Assistant {
        raw_message: NativeAssistantMessage,
        derived_text: Option<String>,
        tool_calls: Vec<ToolCall>,
    },
    Tool {
        tool_call_id: String,
        tool_name: String,
        content: String,
    },
}

impl TranscriptItem {
    fn byte_len(&self) -> usize {
        match self {
            TranscriptItem::User { content } => content.len(),
            TranscriptItem::Assistant { derived_text, .. } => {
                derived_text.as_deref().map(str::len).unwrap_or(0)
            }
            TranscriptItem::Tool { content, .. } => content.len(),
        }
    }
}

/// Every assistant message carrying tool calls must be followed by exactly
/// one tool message per call, in order, before any further user or
/// assistant message.
pub fn validate_transcript(items: &[TranscriptItem]) -> Result<()> {
    let mut idx = 0;
    while idx < items.len() {
        let TranscriptItem::Assistant { tool_calls, .. } = &items[idx] else {
            idx += 1;
            continue;
        };
        for (call_offset, call) in tool_calls.iter().enumerate() {
            match items.get(idx + 1 + call_offset) {
                Some(TranscriptItem::Tool { tool_call_id, .. }) if tool_call_id == &call.id => {}
                other => {
                    return Err(DomainOsErr::Validation(format!(
                        "tool call {} expects a matching tool result at position {}, found {:?}",
                        call.id,
                        idx + 1 + call_offset,
                        other.map(kind_of),
                    )));
                }
            }
        }
        idx += 1 + tool_calls.len();
    }
    Ok(())
}

fn kind_of(item: &TranscriptItem) -> &'static str {
    match item {
        TranscriptItem::User { .. } => "user",
        TranscriptItem::Assistant { .. } => "assistant",
        TranscriptItem::Tool { .. } => "tool",
    }
}

const RESULT_TRUNCATION_NOTICE: &str =
    "[tool result truncated: size guard exceeded; stopping tool rounds]";

/// Enforce the per-result and cumulative byte guards in place. Returns true
/// when a guard fired and the loop must stop offering tools.
pub fn enforce_size_guards(items: &mut [TranscriptItem]) -> bool {
    let mut stop = false;
    let mut cumulative: usize = 0;
    for item in items.iter_mut() {
        if let TranscriptItem::Tool { content, .. } = item {
            if content.len() > TOOL_RESULT_MAX_BYTES {
                let mut replacement =
                    truncate_bytes(content, TOOL_RESULT_MAX_BYTES - RESULT_TRUNCATION_NOTICE.len() - 1)
                        .to_string();
                replacement.push('\n');
                replacement.push_str(RESULT_TRUNCATION_NOTICE);
                *content = replacement;
                stop = true;
            }
        }
        cumulative += item.byte_len();
        if cumulative > TRANSCRIPT_MAX_BYTES {
            if let TranscriptItem::Tool { content, .. } = item {
                *content = RESULT_TRUNCATION_NOTICE.to_string();
            }
            stop = true;
        }
    }
    stop
}

/// Plain role/content message for the non-tool `chat_complete` fallback.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PlainMessage {
    pub role: String,
    pub content: String,
}

/// Flatten the transcript for providers that reject tool fields. Each tool
/// result becomes its own user message; results are never merged.
pub fn flatten_for_chat(items: &[TranscriptItem]) -> Vec<PlainMessage> {
    items
        .iter()
        .map(|item| match item {
            TranscriptItem::User { content } => PlainMessage {
                role: "user".to_string(),
                content: content.clone(),
            },
            TranscriptItem::Assistant {
                raw_message,
                derived_text,
                ..
            } => PlainMessage {
                role: "assistant".to_string(),
                content: derived_text
                    .clone()
                    .unwrap_or_else(|| raw_message.derived_text()),
            },
            TranscriptItem::Tool {
                tool_name, content, ..
            } => PlainMessage {
                role: "user".to_string(),
                content: format!("Tool result ({tool_name}): {content}"),
            },
        })
        .collect()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn assistant_with_calls(calls: &[(&str, &str)]) -> TranscriptItem {
        let tool_calls: Vec<ToolCall> = calls
            .iter()
            .map(|(id, name)| ToolCall {
                id: id.to_string(),
                name: name.to_string(),
                arguments: json!({}),
            })
            .collect();
        let blocks = tool_calls
            .iter()
            .map(|c| AnthropicContentBlock::ToolUse {
                id: c.id.clone(),
                name: c.name.clone(),
                input: json!({}),
            })
            .collect();
        TranscriptItem::Assistant {
            raw_message: NativeAssistantMessage::Anthropic(blocks),
            derived_text: None,
            tool_calls,
        }
    }

    fn tool(id: &str, name: &str, content: &str) -> TranscriptItem {
        TranscriptItem::Tool {
            tool_call_id: id.to_string(),
            tool_name: name.to_string(),
            content: content.to_string(),
        }
    }

    #[test]
    fn derived_text_concatenates_anthropic_text_blocks() {
        let raw = NativeAssistantMessage::Anthropic(vec![
            AnthropicContentBlock::Text {
                text: "Hello ".to_string(),
            },
            AnthropicContentBlock::ToolUse {
                id: "t1".to_string(),
                name: "gmail_search".to_string(),
                input: json!({"query": "q"}),
            },
            AnthropicContentBlock::Text {
                text: "world".to_string(),
            },
        ]);
        assert_eq!(raw.derived_text(), "Hello world");
    }

    #[test]
    fn valid_transcript_passes() {
        let items = vec![
            TranscriptItem::User {
                content: "hi".to_string(),
            },
            assistant_with_calls(&[("c1", "gmail_search"), ("c2", "gtasks_list")]),
            tool("c1", "gmail_search", "r1"),
            tool("c2", "gtasks_list", "r2"),
            assistant_with_calls(&[]),
        ];
        validate_transcript(&items).unwrap();
    }

    #[test]
    fn out_of_order_tool_results_fail_validation() {
        let items = vec![
            assistant_with_calls(&[("c1", "a"), ("c2", "b")]),
            tool("c2", "b", "r2"),
            tool("c1", "a", "r1"),
        ];
        assert!(validate_transcript(&items).is_err());
    }

    #[test]
    fn missing_tool_result_fails_validation() {
        let items = vec![
            assistant_with_calls(&[("c1", "a")]),
            TranscriptItem::User {
                content: "next".to_string(),
            },
        ];
        assert!(validate_transcript(&items).is_err());
    }

    #[test]
    fn oversized_tool_result_is_truncated_and_stops() {
        let mut items = vec![tool("c1", "a", &"x".repeat(TOOL_RESULT_MAX_BYTES + 10))];
        assert!(enforce_size_guards(&mut items));
        let TranscriptItem::Tool { content, .. } = &items[0] else {
            panic!("expected tool item");
        };
        assert!(content.len() <= TOOL_RESULT_MAX_BYTES);
        assert!(content.ends_with(RESULT_TRUNCATION_NOTICE));
    }

    #[test]
    fn small_transcripts_pass_guards_unchanged() {
        let mut items = vec![
            TranscriptItem::User {
                content: "hi".to_string(),
            },
            tool("c1", "a", "small"),
        ];
        assert!(!enforce_size_guards(&mut items));
    }

    #[test]
    fn flatten_keeps_one_user_message_per_tool_result() {
        let items = vec![
            TranscriptItem::User {
                content: "question".to_string(),
            },
            assistant_with_calls(&[("c1", "gmail_search"), ("c2", "gtasks_list")]),
            tool("c1", "gmail_search", "r1"),
            tool("c2", "gtasks_list", "r2"),
        ];
        let flat = flatten_for_chat(&items);
        assert_eq!(flat.len(), 4);
        assert_eq!(flat[2].role, "user");
        assert_eq!(flat[2].content, "Tool result (gmail_search): r1");
        assert_eq!(flat[3].content, "Tool result (gtasks_list): r2");
    }

    #[test]
    fn openai_native_message_round_trips_through_serde() {
        let message = ChatCompletionMessage {
            role: "assistant".to_string(),
            content: None,
            tool_calls: Some(vec![ChatCompletionToolCall {
                id: "call_1".to_string(),
                kind: "function".to_string(),
                function: ChatCompletionFunction {
                    name: "gmail_search".to_string(),
                    arguments: "{\"query\":\"invoices\"}".to_string(),
                },
            }]),
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["tool_calls"][0]["type"], "function");
        let back: ChatCompletionMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, message);
    }
}
