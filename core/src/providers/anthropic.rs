//! Adapter for the Anthropic Messages API.

use bytes::Bytes;
use eventsource_stream::Eventsource;
use futures::Stream;
use futures::StreamExt;
use futures::TryStreamExt;
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::debug;
use tracing::trace;

use super::ChatStream;
use super::ModelClient;
use super::REQUEST_MAX_RETRIES;
use crate::error::DomainOsErr;
use crate::error::Result;
use crate::error::is_tools_not_supported_message;
use crate::tools::ToolDefinition;
use crate::transcript::AnthropicContentBlock;
use crate::transcript::NativeAssistantMessage;
use crate::transcript::PlainMessage;
use crate::transcript::StopReason;
use crate::transcript::ToolCall;
use crate::transcript::ToolUseResponse;
use crate::transcript::TranscriptItem;
use crate::util::backoff;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 4096;
const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

fn messages_url(client: &ModelClient) -> String {
    format!(
        "{}/v1/messages",
        client.provider.base_url.trim_end_matches('/')
    )
}

/// Build the wire messages. Assistant turns re-serialize their captured
/// content blocks verbatim; consecutive tool results collapse into one user
/// message of `tool_result` blocks, which is the shape the API requires.
fn transcript_messages_json(transcript: &[TranscriptItem]) -> Result<Vec<JsonValue>> {
    let mut out: Vec<JsonValue> = Vec::new();
    let mut pending_results: Vec<JsonValue> = Vec::new();

    let flush =
        |pending: &mut Vec<JsonValue>, out: &mut Vec<JsonValue>| {
            if !pending.is_empty() {
                out.push(json!({"role": "user", "content": std::mem::take(pending)}));
            }
        };

    for item in transcript {
        match item {
            TranscriptItem::User { content } => {
                flush(&mut pending_results, &mut out);
                out.push(json!({
                    "role": "user",
                    "content": [{"type": "text", "text": content}],
                }));
            }
            TranscriptItem::Assistant { raw_message, .. } => {
                flush(&mut pending_results, &mut out);
                match raw_message {
                    NativeAssistantMessage::Anthropic(blocks) => {
                        out.push(json!({
                            "role": "assistant",
                            "content": serde_json::to_value(blocks)?,
                        }));
                    }
                    NativeAssistantMessage::OpenAiStyle(_) => {
                        return Err(DomainOsErr::Validation(
                            "openai-native assistant message in an anthropic transcript"
                                .to_string(),
                        ));
                    }
                }
            }
            TranscriptItem::Tool {
                tool_call_id,
                content,
                ..
            } => {
                pending_results.push(json!({
                    "type": "tool_result",
                    "tool_use_id": tool_call_id,
                    "content": content,
                }));
            }
        }
    }
    flush(&mut pending_results, &mut out);
    Ok(out)
}

fn plain_messages_json(messages: &[PlainMessage]) -> Vec<JsonValue> {
    messages
        .iter()
        .map(|m| json!({"role": m.role, "content": [{"type": "text", "text": m.content}]}))
        .collect()
}

fn tools_json(tools: &[ToolDefinition]) -> Vec<JsonValue> {
    tools
        .iter()
        .map(|t| {
            json!({
                "name": t.name,
                "description": t.description,
                "input_schema": t.input_schema_value(),
            })
        })
        .collect()
}

async fn post_with_retries(
    client: &ModelClient,
    payload: &JsonValue,
    stream: bool,
) -> Result<reqwest::Response> {
    let url = messages_url(client);
    debug!("POST to {url}");
    let api_key = client.provider.api_key();

    let mut attempt: u64 = 0;
    loop {
        attempt += 1;
        let mut req = client
            .http
            .post(&url)
            .header("anthropic-version", ANTHROPIC_VERSION);
        if let Some(key) = &api_key {
            req = req.header("x-api-key", key.clone());
        }
        if stream {
            req = req.header(reqwest::header::ACCEPT, "text/event-stream");
        }
        let res = req.json(payload).send().await;

        match res {
            Ok(resp) if resp.status().is_success() => return Ok(resp),
            Ok(resp) => {
                let status = resp.status();
                if !(status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()) {
                    let body = resp.text().await.unwrap_or_default();
                    if is_tools_not_supported_message(&body) && payload.get("tools").is_some() {
                        return Err(client.tools_not_supported(&body));
                    }
                    return Err(DomainOsErr::UnexpectedStatus(status, body));
                }
                if attempt > REQUEST_MAX_RETRIES {
                    return Err(DomainOsErr::RetryLimit(status));
                }
                tokio::time::sleep(backoff(attempt)).await;
            }
            Err(e) => {
                if attempt > REQUEST_MAX_RETRIES {
                    return Err(e.into());
                }
                tokio::time::sleep(backoff(attempt)).await;
            }
        }
    }
}

pub(super) async fn create_tool_use_message(
    client: &ModelClient,
    system_prompt: &str,
    transcript: &[TranscriptItem],
    tools: &[ToolDefinition],
) -> Result<ToolUseResponse> {
    let payload = json!({
        "model": client.model,
        "max_tokens": MAX_TOKENS,
        "system": system_prompt,
        "messages": transcript_messages_json(transcript)?,
        "tools": tools_json(tools),
    });

    let resp = post_with_retries(client, &payload, false).await?;
    let body: JsonValue = resp.json().await?;
    trace!("anthropic response: {body:?}");

    let raw_blocks = body
        .get("content")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| DomainOsErr::Stream("response carried no content".to_string()))?;

    let mut blocks: Vec<AnthropicContentBlock> = Vec::new();
    for block in raw_blocks {
        match block.get("type").and_then(JsonValue::as_str) {
            Some("text") | Some("tool_use") => {
                blocks.push(serde_json::from_value(block.clone())?);
            }
            // thinking blocks and other additions are not round-tripped
            _ => {}
        }
    }

    let stop_reason = match body.get("stop_reason").and_then(JsonValue::as_str) {
        Some("tool_use") => StopReason::ToolUse,
        Some("max_tokens") => StopReason::MaxTokens,
        _ => StopReason::EndTurn,
    };

    let text_content: String = blocks
        .iter()
        .filter_map(|b| match b {
            AnthropicContentBlock::Text { text } => Some(text.as_str()),
            AnthropicContentBlock::ToolUse { .. } => None,
        })
        .collect();

    let tool_calls: Vec<ToolCall> = blocks
        .iter()
        .filter_map(|b| match b {
            AnthropicContentBlock::ToolUse { id, name, input } => Some(ToolCall {
                id: id.clone(),
                name: name.clone(),
                arguments: input.clone(),
            }),
            AnthropicContentBlock::Text { .. } => None,
        })
        .collect();

    Ok(ToolUseResponse {
        stop_reason,
        text_content,
        tool_calls,
        raw_assistant_message: NativeAssistantMessage::Anthropic(blocks),
    })
}

pub(super) async fn chat_complete(
    client: &ModelClient,
    system_prompt: &str,
    messages: &[PlainMessage],
) -> Result<String> {
    let payload = json!({
        "model": client.model,
        "max_tokens": MAX_TOKENS,
        "system": system_prompt,
        "messages": plain_messages_json(messages),
    });
    let resp = post_with_retries(client, &payload, false).await?;
    let body: JsonValue = resp.json().await?;
    let text = body
        .get("content")
        .and_then(JsonValue::as_array)
        .map(|blocks| {
            blocks
                .iter()
                .filter_map(|b| {
                    (b.get("type").and_then(JsonValue::as_str) == Some("text"))
                        .then(|| b.get("text").and_then(JsonValue::as_str))
                        .flatten()
                })
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();
    Ok(text)
}

pub(super) async fn stream_chat(
    client: &ModelClient,
    system_prompt: &str,
    messages: &[PlainMessage],
) -> Result<ChatStream> {
    let payload = json!({
        "model": client.model,
        "max_tokens": MAX_TOKENS,
        "system": system_prompt,
        "messages": plain_messages_json(messages),
        "stream": true,
    });
    let resp = post_with_retries(client, &payload, true).await?;
    let (tx, rx) = mpsc::channel::<Result<String>>(16);
    let stream = resp.bytes_stream().map_err(DomainOsErr::Reqwest);
    tokio::spawn(process_anthropic_sse(stream, tx));
    Ok(ChatStream { rx })
}

/// Forward `content_block_delta` text deltas until `message_stop`.
async fn process_anthropic_sse<S>(stream: S, tx: mpsc::Sender<Result<String>>)
where
    S: Stream<Item = Result<Bytes>> + Unpin,
{
    let mut stream = stream.eventsource();
    loop {
        let sse = match timeout(STREAM_IDLE_TIMEOUT, stream.next()).await {
            Ok(Some(Ok(ev))) => ev,
            Ok(Some(Err(e))) => {
                let _ = tx.send(Err(DomainOsErr::Stream(e.to_string()))).await;
                return;
            }
            Ok(None) => return,
            Err(_) => {
                let _ = tx
                    .send(Err(DomainOsErr::Stream(
                        "idle timeout waiting for SSE".to_string(),
                    )))
                    .await;
                return;
            }
        };

        let chunk: JsonValue = match serde_json::from_str(&sse.data) {
            Ok(v) => v,
            Err(_) => continue,
        };
        trace!("anthropic sse chunk: {chunk:?}");

        match chunk.get("type").and_then(JsonValue::as_str) {
            Some("content_block_delta") => {
                if let Some(text) = chunk
                    .get("delta")
                    .and_then(|d| d.get("text"))
                    .and_then(JsonValue::as_str)
                {
                    if tx.send(Ok(text.to_string())).await.is_err() {
                        return;
                    }
                }
            }
            Some("message_stop") => return,
            Some("error") => {
                let message = chunk
                    .get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(JsonValue::as_str)
                    .unwrap_or("stream error");
                let _ = tx.send(Err(DomainOsErr::Stream(message.to_string()))).await;
                return;
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn consecutive_tool_results_collapse_into_one_user_message() {
        let transcript = vec![
            TranscriptItem::User {
                content: "go".to_string(),
            },
            TranscriptItem::Assistant {
                raw_message: NativeAssistantMessage::Anthropic(vec![
                    AnthropicContentBlock::ToolUse {
                        id: "t1".to_string(),
                        name: "gmail_search".to_string(),
                        input: json!({"query": "a"}),
                    },
                    AnthropicContentBlock::ToolUse {
                        id: "t2".to_string(),
                        name: "gtasks_list".to_string(),
                        input: json!({}),
                    },
                ]),
                derived_text: None,
                tool_calls: vec![],
            },
            TranscriptItem::Tool {
                tool_call_id: "t1".to_string(),
                tool_name: "gmail_search".to_string(),
                content: "r1".to_string(),
            },
            TranscriptItem::Tool {
                tool_call_id: "t2".to_string(),
                tool_name: "gtasks_list".to_string(),
                content: "r2".to_string(),
            },
        ];
        let messages = transcript_messages_json(&transcript).unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[2]["role"], "user");
        let results = messages[2]["content"].as_array().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["tool_use_id"], "t1");
        assert_eq!(results[1]["tool_use_id"], "t2");
    }

    #[test]
    fn assistant_blocks_round_trip_verbatim() {
        let blocks = vec![
            AnthropicContentBlock::Text {
                text: "thinking aloud".to_string(),
            },
            AnthropicContentBlock::ToolUse {
                id: "t1".to_string(),
                name: "advisory_read".to_string(),
                input: json!({"id": "a1"}),
            },
        ];
        let transcript = vec![TranscriptItem::Assistant {
            raw_message: NativeAssistantMessage::Anthropic(blocks),
            derived_text: Some("thinking aloud".to_string()),
            tool_calls: vec![],
        }];
        let messages = transcript_messages_json(&transcript).unwrap();
        assert_eq!(messages[0]["content"][0]["type"], "text");
        assert_eq!(messages[0]["content"][1]["type"], "tool_use");
        assert_eq!(messages[0]["content"][1]["input"]["id"], "a1");
    }
}
