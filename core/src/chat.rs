//! One full chat turn over a domain.
//!
//! Glues the subsystems together: status snapshot and prompt assembly, the
//! tool loop, block parsing on the final text, routing of persistable
//! artifacts into the store, audit entries, and turn telemetry. The GUI
//! shell calls this once per user message.

use std::sync::Arc;

use chrono::DateTime;
use chrono::Utc;
use domainos_protocol::AuditEntry;
use domainos_protocol::ChatMessage;
use domainos_protocol::ChatRole;
use domainos_protocol::Decision;
use domainos_protocol::DecisionStatus;
use domainos_protocol::GapFlag;
use domainos_protocol::GapFlagStatus;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::advisory::AdvisoryParseResult;
use crate::advisory::parse_advisory_blocks;
use crate::blocks::kb_update::KbUpdateParse;
use crate::config::Settings;
use crate::error::Result;
use crate::prompt::PromptInputs;
use crate::prompt::build_system_prompt;
use crate::providers::ModelClient;
use crate::status::build_domain_status;
use crate::status::render_status_briefing;
use crate::store::Store;
use crate::tool_loop::ToolLoopOptions;
use crate::tool_loop::TurnTelemetry;
use crate::tool_loop::run_chat_turn;
use crate::tools::ToolDefinition;
use crate::tools::ToolRouter;
use crate::transcript::PlainMessage;
use crate::util::new_id;

const HISTORY_WINDOW: usize = 40;

#[derive(Debug, Clone)]
pub struct ChatTurnResult {
    pub final_text: String,
    pub telemetry: TurnTelemetry,
    /// Accepted and rejected kb-update proposals; application to disk waits
    /// for user confirmation in the shell.
    pub kb_updates: KbUpdateParse,
    /// Decision ids persisted this turn.
    pub decisions_recorded: Vec<String>,
    /// Gap flag ids raised this turn.
    pub gap_flags_raised: Vec<String>,
    pub advisory: AdvisoryParseResult,
    pub stops: Vec<crate::blocks::minimal::ParsedStop>,
    pub warnings: Vec<String>,
}

#[allow(clippy::too_many_arguments)]
pub async fn run_domain_chat_turn(
    store: &Arc<Store>,
    client: &ModelClient,
    router: &ToolRouter,
    settings: &Settings,
    domain_id: &str,
    session_id: Option<&str>,
    user_text: &str,
    tools: &[ToolDefinition],
    cancel: &CancellationToken,
    now: DateTime<Utc>,
    on_chunk: impl FnMut(&str),
) -> Result<ChatTurnResult> {
    let domain = store.get_domain(domain_id)?;

    // context for the system prompt
    let status = build_domain_status(store, domain_id, now)?;
    let status_briefing = render_status_briefing(&status);
    let summary = store.get_conversation_summary(domain_id)?;

    let mut sibling_digests: Vec<(String, String)> = Vec::new();
    for rel in store.outgoing_relationships(domain_id)? {
        let Ok(sibling) = store.get_domain(&rel.sibling_domain_id) else {
            continue;
        };
        match tokio::fs::read_to_string(sibling.kb_path.join("kb_digest.md")).await {
            Ok(digest) => sibling_digests.push((sibling.name, digest)),
            Err(e) => warn!(sibling = %sibling.id, "sibling digest unreadable: {e}"),
        }
    }

    let inputs = PromptInputs {
        kb_files: store.list_kb_files(domain_id)?,
        protocols: store.list_protocols(domain_id)?,
        shared_protocols: store.enabled_shared_protocols()?,
        sibling_digests,
        status_briefing: Some(status_briefing),
        conversation_summary: summary.map(|s| s.summary_text),
        advisory_protocol: None,
    };
    let prompt =
        build_system_prompt(&domain, &inputs, settings.chat_prompt_token_budget).await?;

    let history: Vec<PlainMessage> = store
        .list_chat_messages(domain_id, HISTORY_WINDOW)?
        .into_iter()
        .map(|m| PlainMessage {
            role: m.role.to_string(),
            content: m.content,
        })
        .collect();

    let options =
        ToolLoopOptions::from_settings(settings, domain.force_tool_attempt, domain.allow_gmail);
    let outcome = run_chat_turn(
        client,
        router,
        &prompt.text,
        &history,
        user_text,
        tools,
        &options,
        cancel,
        on_chunk,
    )
    .await?;

    // persist the turn's messages (append-idempotent by id)
    store.append_chat_message(&ChatMessage {
        id: new_id(),
        domain_id: domain_id.to_string(),
        role: ChatRole::User,
        content: user_text.to_string(),
        status: None,
        metadata: json!({}),
        created_at: now,
    })?;
    store.append_chat_message(&ChatMessage {
        id: new_id(),
        domain_id: domain_id.to_string(),
        role: ChatRole::Assistant,
        content: outcome.final_text.clone(),
        status: None,
        metadata: json!({
            "rounds": outcome.telemetry.rounds,
            "toolCalls": outcome.telemetry.tool_calls_executed,
            "fallbackUsed": outcome.telemetry.fallback_used,
        }),
        // strictly after the user message so history order is stable
        created_at: now + chrono::Duration::milliseconds(1),
    })?;

    let blocks = outcome.blocks;
    let mut warnings = blocks.decisions.warnings.clone();
    warnings.extend(blocks.advisory.warnings.clone());

    // route parser outputs into the store
    let mut decisions_recorded = Vec::new();
    for parsed in &blocks.decisions.decisions {
        let decision = Decision {
            id: new_id(),
            domain_id: domain_id.to_string(),
            session_id: session_id.map(|s| s.to_string()),
            decision_id: parsed.decision_id.clone(),
            decision: parsed.decision.clone(),
            rationale: parsed.rationale.clone(),
            downside: parsed.downside.clone(),
            revisit_trigger: parsed.revisit_trigger.clone(),
            linked_files: parsed.linked_files.clone(),
            status: DecisionStatus::Active,
            supersedes_decision_id: parsed.supersedes_decision_id.clone(),
            confidence: parsed.confidence.clone(),
            horizon: parsed.horizon.clone(),
            reversibility_class: parsed.reversibility_class.clone(),
            category: parsed.category.clone(),
            authority: parsed.authority.clone(),
            created_at: now,
            updated_at: now,
        };
        match store.insert_decision(&decision) {
            Ok(()) => decisions_recorded.push(parsed.decision_id.clone()),
            Err(e) => warnings.push(format!("decision {} not saved: {e}", parsed.decision_id)),
        }
    }

    let mut gap_flags_raised = Vec::new();
    for parsed in &blocks.gap_flags.accepted {
        let flag = GapFlag {
            id: new_id(),
            domain_id: domain_id.to_string(),
            session_id: session_id.map(|s| s.to_string()),
            category: parsed.category.clone(),
            description: parsed.description.clone(),
            source_message: user_text.to_string(),
            status: GapFlagStatus::Open,
            resolved_at: None,
            created_at: now,
            updated_at: now,
        };
        match store.insert_gap_flag(&flag) {
            Ok(()) => gap_flags_raised.push(flag.id),
            Err(e) => warnings.push(format!("gap flag not saved: {e}")),
        }
    }

    // advisory blocks re-run through the repository-backed pipeline so rate
    // limits and fingerprint dedup apply
    let advisory = parse_advisory_blocks(
        &outcome.final_text,
        domain_id,
        session_id,
        Some(store),
        settings,
        now,
    )?;

    store.write_audit(&AuditEntry {
        id: new_id(),
        domain_id: domain_id.to_string(),
        session_id: session_id.map(|s| s.to_string()),
        agent_name: domain.name.clone(),
        file_path: String::new(),
        change_description: format!(
            "chat turn: {} decisions, {} gap flags, {} advisory artifacts",
            decisions_recorded.len(),
            gap_flags_raised.len(),
            advisory.persisted.len(),
        ),
        content_hash: None,
        event_type: "chat_turn".to_string(),
        source: "chat".to_string(),
        created_at: now,
    })?;

    Ok(ChatTurnResult {
        final_text: outcome.final_text,
        telemetry: outcome.telemetry,
        kb_updates: blocks.kb_updates,
        decisions_recorded,
        gap_flags_raised,
        advisory,
        stops: blocks.stops.accepted,
        warnings,
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::providers::CapabilityCache;
    use crate::providers::ProviderInfo;
    use crate::providers::ToolCapability;
    use crate::providers::WireApi;
    use domainos_protocol::Domain;
    use pretty_assertions::assert_eq;
    use wiremock::Mock;
    use wiremock::MockServer;
    use wiremock::ResponseTemplate;
    use wiremock::matchers::method;
    use wiremock::matchers::path;

    const TURN_RESPONSE: &str = "Noted.\n\n\
```decision\ndecisionId: renew-acme\ndecision: renew the ACME contract\nrationale: best terms available\n```\n\
```gap-flag\ncategory: docs\ndescription: renewal playbook missing\n```\n";

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn chat_turn_persists_messages_records_and_audit() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_raw(
                        format!(
                            "data: {}\n\ndata: [DONE]\n\n",
                            serde_json::json!({
                                "choices": [{"delta": {"content": TURN_RESPONSE}}]
                            })
                        ),
                        "text/event-stream",
                    ),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open_in_memory().unwrap());
        store
            .upsert_domain(&Domain {
                id: "d1".to_string(),
                name: "Vendor Ops".to_string(),
                kb_path: dir.path().to_path_buf(),
                identity: "You steward vendors.".to_string(),
                escalation_triggers: vec![],
                allow_gmail: false,
                model_provider: None,
                model_name: None,
                force_tool_attempt: false,
                sort_order: 0,
            })
            .unwrap();

        let cache = CapabilityCache::new();
        let client = ModelClient::new(
            ProviderInfo {
                name: "openai".to_string(),
                base_url: server.uri(),
                env_key: None,
                wire_api: WireApi::OpenAiChat,
            },
            "test-model",
            cache.clone(),
        );
        // no tools registered for this turn, so the loop streams directly
        cache.set(&client.capability_key(), ToolCapability::NotSupported);

        let result = run_domain_chat_turn(
            &store,
            &client,
            &ToolRouter::new(),
            &Settings::default(),
            "d1",
            Some("s1"),
            "should we renew ACME?",
            &[],
            &CancellationToken::new(),
            Utc::now(),
            |_| {},
        )
        .await
        .unwrap();

        assert_eq!(result.decisions_recorded, vec!["renew-acme"]);
        assert_eq!(result.gap_flags_raised.len(), 1);
        assert!(result.telemetry.bypassed_tool_loop);

        // both turn messages persisted
        let messages = store.list_chat_messages("d1", 10).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, ChatRole::User);
        assert_eq!(messages[1].role, ChatRole::Assistant);
        assert!(messages[1].content.contains("renew-acme"));

        // records landed
        assert_eq!(store.active_decisions("d1", 10).unwrap().len(), 1);
        assert_eq!(store.open_gap_flags("d1", 10).unwrap().len(), 1);

        // audit entry written for the turn
        let audit = store
            .audit_since("d1", Utc::now() - chrono::Duration::minutes(5), 10)
            .unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].event_type, "chat_turn");
    }
}
