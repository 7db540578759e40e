//! Provider-agnostic tool-use loop.
//!
//! Drives up to `max_rounds` of createToolUseMessage / execute / append
//! cycles for one chat turn, with transcript validation and size guards
//! between rounds, a capability-cache bypass for models that cannot or will
//! not call tools, and a flattened `chat_complete` fallback when a provider
//! rejects tool fields mid-turn.

use std::collections::HashSet;
use std::time::Duration;

use futures::StreamExt;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use crate::blocks::advisory::AdvisoryBlockParse;
use crate::blocks::advisory::parse_advisory_fences;
use crate::blocks::decision::DecisionParse;
use crate::blocks::decision::parse_decision_blocks;
use crate::blocks::kb_update::KbUpdateParse;
use crate::blocks::kb_update::parse_kb_update_blocks;
use crate::blocks::minimal::MinimalBlockParse;
use crate::blocks::minimal::ParsedGapFlag;
use crate::blocks::minimal::ParsedStop;
use crate::blocks::minimal::parse_gap_flag_blocks;
use crate::blocks::minimal::parse_stop_blocks;
use crate::config::Settings;
use crate::error::DomainOsErr;
use crate::error::Result;
use crate::providers::ModelClient;
use crate::providers::ToolCapability;
use crate::providers::WireApi;
use crate::tools::ToolDefinition;
use crate::tools::ToolRouter;
use crate::tools::sanitize_tool_output;
use crate::transcript::AnthropicContentBlock;
use crate::transcript::ChatCompletionMessage;
use crate::transcript::NativeAssistantMessage;
use crate::transcript::PlainMessage;
use crate::transcript::StopReason;
use crate::transcript::ToolCall;
use crate::transcript::TranscriptItem;
use crate::transcript::enforce_size_guards;
use crate::transcript::flatten_for_chat;
use crate::transcript::validate_transcript;

const ROWYS_VIOLATION: &str = "error: messageId not found in prior search results";
/// Consecutive tool-less turns before a (provider, model) is marked
/// `not_observed`.
const NOT_OBSERVED_THRESHOLD: u32 = 2;

#[derive(Debug, Clone)]
pub struct ToolLoopOptions {
    pub max_rounds: usize,
    pub per_round_timeout: Duration,
    /// Attempt the loop even when the capability cache says `not_observed`.
    pub force_tool_attempt: bool,
    pub allow_gmail: bool,
}

impl ToolLoopOptions {
    pub fn from_settings(settings: &Settings, force_tool_attempt: bool, allow_gmail: bool) -> Self {
        Self {
            max_rounds: settings.max_tool_rounds,
            per_round_timeout: Duration::from_secs(settings.per_round_timeout_secs),
            force_tool_attempt,
            allow_gmail,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnTelemetry {
    pub rounds: usize,
    pub tool_calls_executed: usize,
    pub bypassed_tool_loop: bool,
    pub fallback_used: bool,
    pub guard_truncated: bool,
}

/// Everything the block parsers found in the final assistant text.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedBlocks {
    pub kb_updates: KbUpdateParse,
    pub decisions: DecisionParse,
    pub gap_flags: MinimalBlockParse<ParsedGapFlag>,
    pub stops: MinimalBlockParse<ParsedStop>,
    pub advisory: AdvisoryBlockParse,
}

/// Run every block family over the final assistant text. Parsers only ever
/// see final text, never intermediate tool-round text.
pub fn parse_structured_blocks(final_text: &str) -> ParsedBlocks {
    ParsedBlocks {
        kb_updates: parse_kb_update_blocks(final_text),
        decisions: parse_decision_blocks(final_text),
        gap_flags: parse_gap_flag_blocks(final_text),
        stops: parse_stop_blocks(final_text),
        advisory: parse_advisory_fences(final_text),
    }
}

#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub final_text: String,
    pub transcript: Vec<TranscriptItem>,
    pub telemetry: TurnTelemetry,
    pub blocks: ParsedBlocks,
}

/// Seed the transcript from persisted history. Prior assistant turns only
/// survive as text, so they are re-wrapped in a text-only native message of
/// the current wire shape.
fn seed_transcript(history: &[PlainMessage], wire: WireApi) -> Vec<TranscriptItem> {
    history
        .iter()
        .map(|m| {
            if m.role == "assistant" {
                let raw = match wire {
                    WireApi::AnthropicMessages => {
                        NativeAssistantMessage::Anthropic(vec![AnthropicContentBlock::Text {
                            text: m.content.clone(),
                        }])
                    }
                    WireApi::OpenAiChat => {
                        NativeAssistantMessage::OpenAiStyle(ChatCompletionMessage {
                            role: "assistant".to_string(),
                            content: Some(m.content.clone()),
                            tool_calls: None,
                        })
                    }
                };
                TranscriptItem::Assistant {
                    raw_message: raw,
                    derived_text: Some(m.content.clone()),
                    tool_calls: vec![],
                }
            } else {
                TranscriptItem::User {
                    content: m.content.clone(),
                }
            }
        })
        .collect()
}

fn text_only_assistant(text: &str, wire: WireApi) -> TranscriptItem {
    match wire {
        WireApi::AnthropicMessages => TranscriptItem::Assistant {
            raw_message: NativeAssistantMessage::Anthropic(vec![AnthropicContentBlock::Text {
                text: text.to_string(),
            }]),
            derived_text: Some(text.to_string()),
            tool_calls: vec![],
        },
        WireApi::OpenAiChat => TranscriptItem::Assistant {
            raw_message: NativeAssistantMessage::OpenAiStyle(ChatCompletionMessage {
                role: "assistant".to_string(),
                content: Some(text.to_string()),
                tool_calls: None,
            }),
            derived_text: Some(text.to_string()),
            tool_calls: vec![],
        },
    }
}

#[allow(clippy::too_many_arguments)]
pub async fn run_chat_turn(
    client: &ModelClient,
    router: &ToolRouter,
    system_prompt: &str,
    history: &[PlainMessage],
    user_text: &str,
    tools: &[ToolDefinition],
    options: &ToolLoopOptions,
    cancel: &CancellationToken,
    mut on_chunk: impl FnMut(&str),
) -> Result<TurnOutcome> {
    let key = client.capability_key();
    let capability = client.capabilities.get(&key);
    let wire = client.provider.wire_api;

    let bypass = tools.is_empty()
        || capability == ToolCapability::NotSupported
        || (capability == ToolCapability::NotObserved && !options.force_tool_attempt);

    if bypass {
        debug!(capability = ?capability, "bypassing tool loop");
        let mut messages: Vec<PlainMessage> = history.to_vec();
        messages.push(PlainMessage {
            role: "user".to_string(),
            content: user_text.to_string(),
        });
        let mut stream = client.chat(system_prompt, &messages).await?;
        let mut final_text = String::new();
        while let Some(chunk) = stream.next().await {
            if cancel.is_cancelled() {
                return Err(DomainOsErr::Cancelled);
            }
            let chunk = chunk?;
            on_chunk(&chunk);
            final_text.push_str(&chunk);
        }
        let mut transcript = seed_transcript(history, wire);
        transcript.push(TranscriptItem::User {
            content: user_text.to_string(),
        });
        transcript.push(text_only_assistant(&final_text, wire));
        let blocks = parse_structured_blocks(&final_text);
        return Ok(TurnOutcome {
            final_text,
            transcript,
            telemetry: TurnTelemetry {
                bypassed_tool_loop: true,
                ..Default::default()
            },
            blocks,
        });
    }

    let mut transcript = seed_transcript(history, wire);
    transcript.push(TranscriptItem::User {
        content: user_text.to_string(),
    });

    let mut telemetry = TurnTelemetry::default();
    let mut rowys_allowed: HashSet<String> = HashSet::new();
    let mut any_tool_ran = false;
    let mut final_text = String::new();

    for _round in 0..options.max_rounds {
        if cancel.is_cancelled() {
            return Err(DomainOsErr::Cancelled);
        }
        validate_transcript(&transcript)?;
        if enforce_size_guards(&mut transcript) {
            telemetry.guard_truncated = true;
        }

        telemetry.rounds += 1;
        // each adapter clones the input schemas per round, so a provider can
        // never mutate the registered tool definitions
        let round = timeout(
            options.per_round_timeout,
            client.create_tool_use_message(system_prompt, &transcript, tools),
        )
        .await;

        let response = match round {
            Err(_) => return Err(DomainOsErr::Timeout(options.per_round_timeout)),
            Ok(Err(DomainOsErr::ToolsNotSupported(e))) => {
                warn!("provider rejected tools; downgrading: {e}");
                client.capabilities.set(&key, ToolCapability::NotSupported);
                telemetry.fallback_used = true;
                let flat = flatten_for_chat(&transcript);
                final_text = client.chat_complete(system_prompt, &flat).await?;
                on_chunk(&final_text);
                transcript.push(text_only_assistant(&final_text, wire));
                break;
            }
            Ok(Err(e)) => return Err(e),
            Ok(Ok(response)) => response,
        };

        let derived = response.text_content.clone();
        transcript.push(TranscriptItem::Assistant {
            raw_message: response.raw_assistant_message.clone(),
            derived_text: Some(derived.clone()),
            tool_calls: response.tool_calls.clone(),
        });

        match response.stop_reason {
            StopReason::EndTurn | StopReason::MaxTokens => {
                on_chunk(&derived);
                final_text = derived;
                break;
            }
            StopReason::ToolUse => {
                // keep the latest text so an exhausted round budget still
                // yields whatever the model last said
                final_text = derived;
                for call in &response.tool_calls {
                    let result = authorize_and_execute(
                        router,
                        call,
                        &mut rowys_allowed,
                        options.allow_gmail,
                    )
                    .await;
                    let sanitized = sanitize_tool_output(&result);
                    transcript.push(TranscriptItem::Tool {
                        tool_call_id: call.id.clone(),
                        tool_name: call.name.clone(),
                        content: sanitized,
                    });
                    any_tool_ran = true;
                    telemetry.tool_calls_executed += 1;
                }
                if telemetry.guard_truncated {
                    // the stop flag set by the size guard ends the loop; the
                    // transcript keeps the truncation notice for the record
                    break;
                }
            }
        }
    }

    if any_tool_ran {
        client.capabilities.set(&key, ToolCapability::Supported);
        client.capabilities.reset_not_observed(&key);
    } else if !telemetry.fallback_used {
        let idle = client.capabilities.increment_not_observed(&key);
        if idle >= NOT_OBSERVED_THRESHOLD {
            client.capabilities.set(&key, ToolCapability::NotObserved);
        }
    }

    // Parsers consume the final derived text; raw_message stays authoritative
    // for round-tripping.
    let blocks = parse_structured_blocks(&final_text);
    Ok(TurnOutcome {
        final_text,
        transcript,
        telemetry,
        blocks,
    })
}

/// Authorization and dispatch for one tool call. Violations come back as
/// error tool-results, never as exceptions.
async fn authorize_and_execute(
    router: &ToolRouter,
    call: &ToolCall,
    rowys_allowed: &mut HashSet<String>,
    allow_gmail: bool,
) -> String {
    if call.name.starts_with("gmail_") {
        if !allow_gmail {
            return "error: gmail tools are not enabled for this domain".to_string();
        }
        let Some(gmail) = router.gmail() else {
            return "error: no gmail executor registered".to_string();
        };
        return match call.name.as_str() {
            "gmail_search" => {
                let query = call
                    .arguments
                    .get("query")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                match gmail.search(query).await {
                    Ok(output) => {
                        rowys_allowed.extend(output.message_ids);
                        output.content
                    }
                    Err(e) => format!("error: {e}"),
                }
            }
            "gmail_read" => {
                let message_id = call
                    .arguments
                    .get("messageId")
                    .or_else(|| call.arguments.get("message_id"))
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                // ROWYS: a read is only permitted for ids surfaced by a
                // search within this turn
                if !rowys_allowed.contains(message_id) {
                    return ROWYS_VIOLATION.to_string();
                }
                match gmail.read(message_id).await {
                    Ok(content) => content,
                    Err(e) => format!("error: {e}"),
                }
            }
            other => format!("error: unknown gmail tool {other}"),
        };
    }

    match router.lookup(&call.name) {
        Some(executor) => executor.execute(call).await,
        None => format!("error: no executor registered for tool {}", call.name),
    }
}
