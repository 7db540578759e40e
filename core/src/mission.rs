//! Mission runner.
//!
//! A mission is a declarative long-running operation: an inputs schema, a
//! context builder, a prompt builder, a gate predicate and declared
//! side-effect actions. The runner owns the 10-step lifecycle, persists a
//! raw output before any parsed item, and pauses at the gate until the user
//! decides.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use domainos_protocol::AuditEntry;
use serde_json::Value as JsonValue;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::briefing::analyze_briefing_output;
use crate::briefing::build_briefing_prompt;
use crate::canonical::sha256_hex;
use crate::canonical::stable_hash;
use crate::error::DomainOsErr;
use crate::error::Result;
use crate::health::build_portfolio_health;
use crate::store::MissionActionRecord;
use crate::store::MissionActionStatus;
use crate::store::MissionRunRecord;
use crate::store::MissionRunStatus;
use crate::store::Store;
use crate::util::new_id;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissionActionDef {
    pub action_id: String,
    /// `create_deadline`, `draft_email` or `notification`.
    pub action_type: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProposedAction {
    pub action_id: String,
    pub payload: JsonValue,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedMissionOutput {
    /// (kind, content) pairs persisted after the raw output.
    pub items: Vec<(String, String)>,
    pub actions: Vec<ProposedAction>,
}

#[async_trait]
pub trait Mission: Send + Sync {
    fn mission_type(&self) -> &str;
    /// Defaults merged under the caller's inputs.
    fn parameter_defaults(&self) -> JsonValue;
    fn required_params(&self) -> &[&str];
    fn declared_actions(&self) -> Vec<MissionActionDef>;
    fn gate_required(&self) -> bool;
    fn requires_domain(&self) -> bool;
    async fn build_context(&self, store: &Store, inputs: &JsonValue) -> Result<JsonValue>;
    fn build_prompts(&self, inputs: &JsonValue, context: &JsonValue) -> Result<(String, String)>;
    fn parse_outputs(&self, raw: &str, context: &JsonValue) -> Result<ParsedMissionOutput>;
}

/// Streaming LLM seam; implementations must honor the cancellation token
/// between chunks.
#[async_trait]
pub trait MissionLlm: Send + Sync {
    async fn stream(
        &self,
        system_prompt: &str,
        user_message: &str,
        on_chunk: &mut (dyn for<'c> FnMut(&'c str) + Send),
        cancel: &CancellationToken,
    ) -> Result<String>;
}

#[async_trait]
pub trait MissionActionRunner: Send + Sync {
    /// Execute one approved action; returns an external reference string.
    async fn run(&self, action: &MissionActionRecord) -> Result<String>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum MissionRunOutcome {
    Completed { run_id: String },
    Gated {
        run_id: String,
        pending_actions: Vec<MissionActionRecord>,
    },
    Cancelled { run_id: String },
}

pub struct MissionRunner {
    store: Arc<Store>,
    llm: Arc<dyn MissionLlm>,
    actions: Arc<dyn MissionActionRunner>,
}

impl MissionRunner {
    pub fn new(
        store: Arc<Store>,
        llm: Arc<dyn MissionLlm>,
        actions: Arc<dyn MissionActionRunner>,
    ) -> Self {
        Self { store, llm, actions }
    }

    pub async fn run(
        &self,
        mission: &dyn Mission,
        domain_id: Option<&str>,
        inputs: JsonValue,
        cancel: &CancellationToken,
        now: DateTime<Utc>,
        on_chunk: &mut (dyn FnMut(&str) + Send),
    ) -> Result<MissionRunOutcome> {
        // 1. validate inputs and apply defaults
        let inputs = merge_defaults(mission.parameter_defaults(), inputs)?;
        for param in mission.required_params() {
            if inputs.get(param).is_none() {
                return Err(DomainOsErr::Validation(format!(
                    "mission {} requires parameter `{param}`",
                    mission.mission_type()
                )));
            }
        }

        // 2. domain-association permission
        if mission.requires_domain() {
            let Some(domain_id) = domain_id else {
                return Err(DomainOsErr::Validation(format!(
                    "mission {} must be associated with a domain",
                    mission.mission_type()
                )));
            };
            self.store.get_domain(domain_id)?;
        }

        // 3. context + hashes
        let context = mission.build_context(&self.store, &inputs).await?;
        let inputs_hash = stable_hash(&inputs);
        let context_hash = stable_hash(&context);

        // 4. prompts
        let (system_prompt, user_message) = mission.build_prompts(&inputs, &context)?;
        let prompt_hash = sha256_hex(&format!("{system_prompt}\n---\n{user_message}"));

        // 5. run row + start audit
        let run_id = new_id();
        self.store.insert_mission_run(&MissionRunRecord {
            id: run_id.clone(),
            domain_id: domain_id.map(|s| s.to_string()),
            mission_type: mission.mission_type().to_string(),
            inputs: inputs.clone(),
            inputs_hash,
            context_hash,
            prompt_hash,
            status: MissionRunStatus::Pending,
            error: None,
            created_at: now,
            updated_at: now,
        })?;
        self.audit(domain_id, &run_id, "mission_run_started", now)?;

        // 6. stream with cooperative cancellation
        self.store
            .set_mission_run_status(&run_id, MissionRunStatus::Running, None, now)?;
        if cancel.is_cancelled() {
            return self.cancelled(&run_id, now);
        }
        let raw = match self
            .llm
            .stream(&system_prompt, &user_message, on_chunk, cancel)
            .await
        {
            Ok(raw) => raw,
            Err(DomainOsErr::Cancelled) => return self.cancelled(&run_id, now),
            Err(e) => {
                self.store.set_mission_run_status(
                    &run_id,
                    MissionRunStatus::Failed,
                    Some(&e.to_string()),
                    now,
                )?;
                return Err(e);
            }
        };

        // 7. raw output first, parsed items after
        self.store
            .insert_mission_output(&run_id, &new_id(), "raw", &raw, now)?;
        if cancel.is_cancelled() {
            return self.cancelled(&run_id, now);
        }
        let parsed = mission.parse_outputs(&raw, &context)?;
        for (kind, content) in &parsed.items {
            self.store
                .insert_mission_output(&run_id, &new_id(), kind, content, now)?;
        }

        // 8. gate evaluation: every proposed action must map to a declared one
        let declared = mission.declared_actions();
        let mut pending: Vec<MissionActionRecord> = Vec::new();
        for proposal in &parsed.actions {
            let Some(def) = declared.iter().find(|d| d.action_id == proposal.action_id) else {
                let message = format!(
                    "mission {} proposed undeclared action `{}`",
                    mission.mission_type(),
                    proposal.action_id
                );
                self.store.set_mission_run_status(
                    &run_id,
                    MissionRunStatus::Failed,
                    Some(&message),
                    now,
                )?;
                return Err(DomainOsErr::Validation(message));
            };
            let record = MissionActionRecord {
                id: new_id(),
                run_id: run_id.clone(),
                action_id: def.action_id.clone(),
                action_type: def.action_type.clone(),
                payload: proposal.payload.clone(),
                status: MissionActionStatus::Pending,
                result: None,
            };
            self.store.insert_mission_action(&record, now)?;
            pending.push(record);
        }

        if mission.gate_required() && !pending.is_empty() {
            self.store
                .set_mission_run_status(&run_id, MissionRunStatus::Gated, None, now)?;
            self.audit(domain_id, &run_id, "gate_triggered", now)?;
            return Ok(MissionRunOutcome::Gated {
                run_id,
                pending_actions: pending,
            });
        }

        // no gate: execute straight through
        self.execute_actions(&run_id, domain_id, now).await?;
        self.finalize(&run_id, domain_id, now)?;
        Ok(MissionRunOutcome::Completed { run_id })
    }

    /// 9. gate decision. Reject skips every pending action; approve executes
    /// them in order. 10. finalize either way.
    pub async fn resolve_gate(
        &self,
        run_id: &str,
        approve: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let run = self.store.get_mission_run(run_id)?;
        if run.status != MissionRunStatus::Gated {
            return Err(DomainOsErr::Validation(format!(
                "mission run {run_id} is not gated (status {})",
                run.status
            )));
        }
        let domain_id = run.domain_id.as_deref();
        if approve {
            self.execute_actions(run_id, domain_id, now).await?;
        } else {
            for action in self.store.list_mission_actions(run_id)? {
                if action.status == MissionActionStatus::Pending {
                    self.store.set_mission_action_status(
                        &action.id,
                        MissionActionStatus::Skipped,
                        None,
                        now,
                    )?;
                }
            }
        }
        self.finalize(run_id, domain_id, now)
    }

    async fn execute_actions(
        &self,
        run_id: &str,
        domain_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        for action in self.store.list_mission_actions(run_id)? {
            if action.status != MissionActionStatus::Pending {
                continue;
            }
            match self.actions.run(&action).await {
                Ok(external_ref) => {
                    self.store.set_mission_action_status(
                        &action.id,
                        MissionActionStatus::Success,
                        Some(&external_ref),
                        now,
                    )?;
                }
                Err(e) => {
                    self.store.set_mission_action_status(
                        &action.id,
                        MissionActionStatus::Failed,
                        Some(&e.to_string()),
                        now,
                    )?;
                }
            }
            self.audit(domain_id, run_id, "mission_action_executed", now)?;
        }
        Ok(())
    }

    fn finalize(&self, run_id: &str, domain_id: Option<&str>, now: DateTime<Utc>) -> Result<()> {
        self.store
            .set_mission_run_status(run_id, MissionRunStatus::Success, None, now)?;
        self.audit(domain_id, run_id, "run_complete", now)?;
        debug!(run = %run_id, "mission run complete");
        Ok(())
    }

    fn cancelled(&self, run_id: &str, now: DateTime<Utc>) -> Result<MissionRunOutcome> {
        self.store
            .set_mission_run_status(run_id, MissionRunStatus::Cancelled, None, now)?;
        Ok(MissionRunOutcome::Cancelled {
            run_id: run_id.to_string(),
        })
    }

    /// Mission audit events attach to the owning domain; portfolio-wide
    /// missions have no domain and are tracked by the run record alone.
    fn audit(
        &self,
        domain_id: Option<&str>,
        run_id: &str,
        event_type: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let Some(domain_id) = domain_id else {
            return Ok(());
        };
        self.store.write_audit(&AuditEntry {
            id: new_id(),
            domain_id: domain_id.to_string(),
            session_id: None,
            agent_name: "mission-runner".to_string(),
            file_path: String::new(),
            change_description: format!("mission run {run_id}"),
            content_hash: None,
            event_type: event_type.to_string(),
            source: "mission".to_string(),
            created_at: now,
        })?;
        Ok(())
    }
}

fn merge_defaults(defaults: JsonValue, inputs: JsonValue) -> Result<JsonValue> {
    let JsonValue::Object(mut merged) = defaults else {
        return Err(DomainOsErr::Validation(
            "mission defaults must be an object".to_string(),
        ));
    };
    match inputs {
        JsonValue::Null => {}
        JsonValue::Object(overrides) => {
            for (k, v) in overrides {
                merged.insert(k, v);
            }
        }
        _ => {
            return Err(DomainOsErr::Validation(
                "mission inputs must be an object".to_string(),
            ));
        }
    }
    Ok(JsonValue::Object(merged))
}

// ---------------------------------------------------------------------------
// Built-in portfolio briefing mission
// ---------------------------------------------------------------------------

/// The periodic portfolio-wide briefing, gated before it creates deadlines
/// from its own recommendations.
pub struct PortfolioBriefingMission;

pub const CREATE_DEADLINE_ACTION: &str = "create_deadline";

#[async_trait]
impl Mission for PortfolioBriefingMission {
    fn mission_type(&self) -> &str {
        "portfolio_briefing"
    }

    fn parameter_defaults(&self) -> JsonValue {
        json!({"tokenBudget": crate::briefing::BRIEFING_TOKEN_BUDGET})
    }

    fn required_params(&self) -> &[&str] {
        &["tokenBudget"]
    }

    fn declared_actions(&self) -> Vec<MissionActionDef> {
        vec![MissionActionDef {
            action_id: CREATE_DEADLINE_ACTION.to_string(),
            action_type: CREATE_DEADLINE_ACTION.to_string(),
        }]
    }

    fn gate_required(&self) -> bool {
        true
    }

    fn requires_domain(&self) -> bool {
        false
    }

    async fn build_context(&self, store: &Store, inputs: &JsonValue) -> Result<JsonValue> {
        let now = Utc::now();
        let health = build_portfolio_health(store, now)?;
        let relationships = store.list_relationships()?;

        // sibling digests are read-only kb_digest.md files per domain
        let mut digests: BTreeMap<String, Option<String>> = BTreeMap::new();
        for domain in store.list_domains()? {
            let path = domain.kb_path.join("kb_digest.md");
            let digest = tokio::fs::read_to_string(&path).await.ok();
            digests.insert(domain.id.clone(), digest);
        }

        let token_budget = inputs
            .get("tokenBudget")
            .and_then(JsonValue::as_u64)
            .unwrap_or(crate::briefing::BRIEFING_TOKEN_BUDGET as u64) as usize;
        let prompt = build_briefing_prompt(&health, &relationships, &digests, now, token_budget)?;

        Ok(json!({
            "promptText": prompt.text,
            "snapshotHash": prompt.snapshot_hash,
            "contextHash": prompt.context_hash,
            "tokenEstimate": prompt.token_estimate,
        }))
    }

    fn build_prompts(&self, _inputs: &JsonValue, context: &JsonValue) -> Result<(String, String)> {
        let prompt_text = context
            .get("promptText")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| DomainOsErr::Validation("briefing context missing prompt".to_string()))?;
        Ok((
            "You are the portfolio analyst. Ground every claim in the provided data.".to_string(),
            prompt_text.to_string(),
        ))
    }

    fn parse_outputs(&self, raw: &str, context: &JsonValue) -> Result<ParsedMissionOutput> {
        let snapshot_hash = context
            .get("snapshotHash")
            .and_then(JsonValue::as_str)
            .unwrap_or_default();
        let analysis = analyze_briefing_output(raw, snapshot_hash);

        let mut output = ParsedMissionOutput::default();
        for alert in &analysis.alerts {
            output.items.push((
                "alert".to_string(),
                json!({
                    "domain": alert.domain,
                    "severity": alert.severity.as_str(),
                    "text": alert.text,
                    "evidence": alert.evidence,
                })
                .to_string(),
            ));
        }
        for monitor in &analysis.monitors {
            output.items.push((
                "monitor".to_string(),
                json!({"domain": monitor.domain, "text": monitor.text}).to_string(),
            ));
        }
        for action in &analysis.actions {
            output.items.push((
                "action".to_string(),
                json!({
                    "domain": action.domain,
                    "text": action.text,
                    "priority": action.priority,
                    "deadline": action.deadline,
                })
                .to_string(),
            ));
            if action.deadline != "none" {
                output.actions.push(ProposedAction {
                    action_id: CREATE_DEADLINE_ACTION.to_string(),
                    payload: json!({
                        "domainId": action.domain,
                        "text": action.text,
                        "priority": action.priority,
                        "dueDate": action.deadline,
                    }),
                });
            }
        }
        Ok(output)
    }
}
