//! Adapter for the OpenAI-style Chat Completions API (also used by Ollama
//! through a custom base URL).

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
use crate::transcript::ChatCompletionMessage;
use crate::transcript::PlainMessage;
use crate::transcript::StopReason;
use crate::transcript::NativeAssistantMessage;
use crate::transcript::ToolCall;
use crate::transcript::ToolUseResponse;
use crate::transcript::TranscriptItem;
use crate::util::backoff;

const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

fn completions_url(client: &ModelClient) -> String {
    format!(
        "{}/chat/completions",
        client.provider.base_url.trim_end_matches('/')
    )
}

fn plain_messages_json(system_prompt: &str, messages: &[PlainMessage]) -> Vec<JsonValue> {
    let mut out = vec![json!({"role": "system", "content": system_prompt})];
    for m in messages {
        out.push(json!({"role": m.role, "content": m.content}));
    }
    out
}

/// Build the wire messages from the normalized transcript. The captured
/// native `ChatCompletionMessage` is re-serialized verbatim; nothing is
/// reconstructed from derived text.
fn transcript_messages_json(system_prompt: &str, transcript: &[TranscriptItem]) -> Result<Vec<JsonValue>> {
    let mut out = vec![json!({"role": "system", "content": system_prompt})];
    for item in transcript {
        match item {
            TranscriptItem::User { content } => {
                out.push(json!({"role": "user", "content": content}));
            }
            TranscriptItem::Assistant { raw_message, .. } => match raw_message {
                NativeAssistantMessage::OpenAiStyle(message) => {
                    out.push(serde_json::to_value(message)?);
                }
                NativeAssistantMessage::Anthropic(_) => {
                    return Err(DomainOsErr::Validation(
                        "anthropic-native assistant message in an openai transcript".to_string(),
                    ));
                }
            },
            TranscriptItem::Tool {
                tool_call_id,
                content,
                ..
            } => {
                out.push(json!({
                    "role": "tool",
                    "tool_call_id": tool_call_id,
                    "content": content,
                }));
            }
        }
    }
    Ok(out)
}

fn tools_json(tools: &[ToolDefinition]) -> Vec<JsonValue> {
    tools
        .iter()
        .map(|t| {
            json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.input_schema_value(),
                }
            })
        })
        .collect()
}

async fn post_with_retries(
    client: &ModelClient,
    payload: &JsonValue,
    stream: bool,
) -> Result<reqwest::Response> {
    let url = completions_url(client);
    debug!("POST to {url}");
    let api_key = client.provider.api_key();

    let mut attempt: u64 = 0;
    loop {
        attempt += 1;
        let mut req = client.http.post(&url);
        if let Some(key) = &api_key {
            req = req.bearer_auth(key.clone());
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
                    if is_tools_not_supported_message(&body)
                        && payload.get("tools").is_some()
                    {
                        return Err(client.tools_not_supported(&body));
                    }
                    return Err(DomainOsErr::UnexpectedStatus(status, body));
                }
                if attempt > REQUEST_MAX_RETRIES {
                    return Err(DomainOsErr::RetryLimit(status));
                }
                let retry_after = resp
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse::<u64>().ok())
                    .map(Duration::from_secs);
                tokio::time::sleep(retry_after.unwrap_or_else(|| backoff(attempt))).await;
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
        "messages": transcript_messages_json(system_prompt, transcript)?,
        "tools": tools_json(tools),
        "tool_choice": "auto",
    });

    let resp = post_with_retries(client, &payload, false).await?;
    let body: JsonValue = resp.json().await?;
    trace!("chat completion response: {body:?}");

    let choice = body
        .get("choices")
        .and_then(|c| c.get(0))
        .ok_or_else(|| DomainOsErr::Stream("response carried no choices".to_string()))?;

    let message: ChatCompletionMessage = serde_json::from_value(
        choice
            .get("message")
            .cloned()
            .ok_or_else(|| DomainOsErr::Stream("choice carried no message".to_string()))?,
    )?;

    let stop_reason = match choice.get("finish_reason").and_then(JsonValue::as_str) {
        Some("tool_calls") => StopReason::ToolUse,
        Some("length") => StopReason::MaxTokens,
        _ => StopReason::EndTurn,
    };

    let mut tool_calls: Vec<ToolCall> = Vec::new();
    for call in message.tool_calls.iter().flatten() {
        // malformed arguments mean the model emitted something that is not a
        // real tool call; treat the model as tool-incapable
        let arguments: JsonValue =
            serde_json::from_str(&call.function.arguments).map_err(|e| {
                client.tools_not_supported(&format!(
                    "invalid tool call arguments from model: {e}"
                ))
            })?;
        tool_calls.push(ToolCall {
            id: call.id.clone(),
            name: call.function.name.clone(),
            arguments,
        });
    }

    Ok(ToolUseResponse {
        stop_reason,
        text_content: message.content.clone().unwrap_or_default(),
        tool_calls,
        raw_assistant_message: NativeAssistantMessage::OpenAiStyle(message),
    })
}

pub(super) async fn chat_complete(
    client: &ModelClient,
    system_prompt: &str,
    messages: &[PlainMessage],
) -> Result<String> {
    let payload = json!({
        "model": client.model,
        "messages": plain_messages_json(system_prompt, messages),
    });
    let resp = post_with_retries(client, &payload, false).await?;
    let body: JsonValue = resp.json().await?;
    Ok(body
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(JsonValue::as_str)
        .unwrap_or_default()
        .to_string())
}

pub(super) async fn stream_chat(
    client: &ModelClient,
    system_prompt: &str,
    messages: &[PlainMessage],
) -> Result<ChatStream> {
    let payload = json!({
        "model": client.model,
        "messages": plain_messages_json(system_prompt, messages),
        "stream": true,
    });
    let resp = post_with_retries(client, &payload, true).await?;
    let (tx, rx) = mpsc::channel::<Result<String>>(16);
    let stream = resp.bytes_stream().map_err(DomainOsErr::Reqwest);
    tokio::spawn(process_chat_sse(stream, tx));
    Ok(ChatStream { rx })
}

/// Lightweight SSE processor for the Chat Completions streaming format;
/// forwards assistant content deltas as plain text chunks.
async fn process_chat_sse<S>(stream: S, tx: mpsc::Sender<Result<String>>)
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

        if sse.data.trim() == "[DONE]" {
            return;
        }
        let chunk: JsonValue = match serde_json::from_str(&sse.data) {
            Ok(v) => v,
            Err(_) => continue,
        };
        trace!("chat sse chunk: {chunk:?}");

        let Some(choice) = chunk.get("choices").and_then(|c| c.get(0)) else {
            continue;
        };
        if let Some(content) = choice
            .get("delta")
            .and_then(|d| d.get("content"))
            .and_then(JsonValue::as_str)
        {
            if tx.send(Ok(content.to_string())).await.is_err() {
                return;
            }
        }
        if choice
            .get("finish_reason")
            .and_then(JsonValue::as_str)
            .is_some()
        {
            return;
        }
    }
}
