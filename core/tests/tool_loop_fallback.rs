//! End-to-end tool-loop behavior against a mock OpenAI-style server.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;

use async_trait::async_trait;
use domainos_core::CapabilityCache;
use domainos_core::ModelClient;
use domainos_core::ProviderInfo;
use domainos_core::Settings;
use domainos_core::ToolCapability;
use domainos_core::ToolLoopOptions;
use domainos_core::WireApi;
use domainos_core::run_chat_turn;
use domainos_core::tools::JsonSchema;
use domainos_core::tools::ToolDefinition;
use domainos_core::tools::ToolExecutor;
use domainos_core::tools::ToolRouter;
use domainos_core::transcript::ToolCall;
use domainos_core::transcript::TranscriptItem;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::Mock;
use wiremock::MockServer;
use wiremock::ResponseTemplate;
use wiremock::matchers::body_string_contains;
use wiremock::matchers::method;
use wiremock::matchers::path;

fn client_for(server: &MockServer, cache: CapabilityCache) -> ModelClient {
    ModelClient::new(
        ProviderInfo {
            name: "openai".to_string(),
            base_url: server.uri(),
            env_key: None,
            wire_api: WireApi::OpenAiChat,
        },
        "test-model",
        cache,
    )
}

fn lookup_tool() -> ToolDefinition {
    ToolDefinition {
        name: "kb_lookup".to_string(),
        description: "look up a KB entry".to_string(),
        input_schema: JsonSchema::Object {
            properties: Default::default(),
            required: None,
            additional_properties: Some(false),
        },
    }
}

struct StaticExecutor;

#[async_trait]
impl ToolExecutor for StaticExecutor {
    async fn execute(&self, _call: &ToolCall) -> String {
        "kb entry: vendor notes".to_string()
    }
}

fn options() -> ToolLoopOptions {
    ToolLoopOptions::from_settings(&Settings::default(), false, false)
}

/// Scenario: the model rejects tool fields. The loop flips the capability
/// cache, falls back to a flattened completion, and subsequent turns bypass
/// the tool loop entirely.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tools_not_supported_falls_back_and_caches() {
    let server = MockServer::start().await;

    // any request offering tools is rejected with the provider's phrasing
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_string_contains("\"tools\""))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": {"message": "This model does not support tools"}
        })))
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;

    // the streaming bypass used by later turns
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_string_contains("\"stream\":true"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_raw(
                    "data: {\"choices\":[{\"delta\":{\"content\":\"bypassed reply\"}}]}\n\n\
                     data: [DONE]\n\n",
                    "text/event-stream",
                ),
        )
        .with_priority(2)
        .mount(&server)
        .await;

    // the flattened fallback completion
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": "```gap-flag\ncategory: docs\ndescription: missing runbook\n```\n"
                },
                "finish_reason": "stop"
            }]
        })))
        .with_priority(5)
        .mount(&server)
        .await;

    let cache = CapabilityCache::new();
    let client = client_for(&server, cache.clone());
    let router = ToolRouter::new();
    let cancel = CancellationToken::new();

    let outcome = run_chat_turn(
        &client,
        &router,
        "system prompt",
        &[],
        "flag anything missing",
        &[lookup_tool()],
        &options(),
        &cancel,
        |_| {},
    )
    .await
    .unwrap();

    assert!(outcome.telemetry.fallback_used);
    assert!(!outcome.telemetry.bypassed_tool_loop);
    assert_eq!(
        cache.get(&client.capability_key()),
        ToolCapability::NotSupported
    );
    // the final text still went through the block parsers
    assert_eq!(outcome.blocks.gap_flags.accepted.len(), 1);
    assert_eq!(outcome.blocks.gap_flags.accepted[0].category, "documentation");

    // second turn on the same (provider, model): no tool attempt at all
    let outcome = run_chat_turn(
        &client,
        &router,
        "system prompt",
        &[],
        "and now?",
        &[lookup_tool()],
        &options(),
        &cancel,
        |_| {},
    )
    .await
    .unwrap();
    assert!(outcome.telemetry.bypassed_tool_loop);
    assert_eq!(outcome.final_text, "bypassed reply");
}

/// A complete tool round: tool_use stop, executor runs, next round ends the
/// turn. The transcript keeps the call/result pairing invariant.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tool_round_executes_and_orders_transcript() {
    let server = MockServer::start().await;

    // once the transcript carries a tool result, the model finishes
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_string_contains("\"role\":\"tool\""))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": {"role": "assistant", "content": "the vendor notes say hello"},
                "finish_reason": "stop"
            }]
        })))
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "kb_lookup", "arguments": "{\"topic\":\"vendor\"}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }]
        })))
        .with_priority(5)
        .expect(1)
        .mount(&server)
        .await;

    let cache = CapabilityCache::new();
    let client = client_for(&server, cache.clone());
    let mut router = ToolRouter::new();
    router.register("kb_lookup", Arc::new(StaticExecutor));
    let cancel = CancellationToken::new();

    let outcome = run_chat_turn(
        &client,
        &router,
        "system prompt",
        &[],
        "look up the vendor notes",
        &[lookup_tool()],
        &options(),
        &cancel,
        |_| {},
    )
    .await
    .unwrap();

    assert_eq!(outcome.final_text, "the vendor notes say hello");
    assert_eq!(outcome.telemetry.rounds, 2);
    assert_eq!(outcome.telemetry.tool_calls_executed, 1);
    assert_eq!(cache.get(&client.capability_key()), ToolCapability::Supported);

    // assistant-with-calls is followed by exactly its tool results, in order
    let kinds: Vec<&str> = outcome
        .transcript
        .iter()
        .map(|item| match item {
            TranscriptItem::User { .. } => "user",
            TranscriptItem::Assistant { .. } => "assistant",
            TranscriptItem::Tool { .. } => "tool",
        })
        .collect();
    assert_eq!(kinds, vec!["user", "assistant", "tool", "assistant"]);
    let TranscriptItem::Tool {
        tool_call_id,
        content,
        ..
    } = &outcome.transcript[2]
    else {
        panic!("expected tool item");
    };
    assert_eq!(tool_call_id, "call_1");
    assert_eq!(content, "kb entry: vendor notes");
}

/// Two consecutive turns where the model never calls a tool flip the
/// capability to `not_observed`; with `force_tool_attempt` unset the third
/// turn bypasses the loop.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn idle_tool_turns_mark_not_observed() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_string_contains("\"stream\":true"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_raw("data: [DONE]\n\n", "text/event-stream"),
        )
        .with_priority(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": {"role": "assistant", "content": "no tools needed"},
                "finish_reason": "stop"
            }]
        })))
        .with_priority(5)
        .mount(&server)
        .await;

    let cache = CapabilityCache::new();
    let client = client_for(&server, cache.clone());
    let router = ToolRouter::new();
    let cancel = CancellationToken::new();

    for _ in 0..2 {
        let outcome = run_chat_turn(
            &client,
            &router,
            "system",
            &[],
            "just chat",
            &[lookup_tool()],
            &options(),
            &cancel,
            |_| {},
        )
        .await
        .unwrap();
        assert!(!outcome.telemetry.bypassed_tool_loop);
    }
    assert_eq!(
        cache.get(&client.capability_key()),
        ToolCapability::NotObserved
    );

    let outcome = run_chat_turn(
        &client,
        &router,
        "system",
        &[],
        "third turn",
        &[lookup_tool()],
        &options(),
        &cancel,
        |_| {},
    )
    .await
    .unwrap();
    assert!(outcome.telemetry.bypassed_tool_loop);
}
