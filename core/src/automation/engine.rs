//! Tick- and event-driven automation engine.
//!
//! Each trigger computes a dedupe key and attempts an atomic run insert;
//! duplicates are gated by the store's unique index, so a restarted process
//! cannot double-fire a minute. Execution happens outside any transaction;
//! finalization (counters, cooldown) commits atomically.

use std::sync::Arc;
use std::time::Duration as StdDuration;
use std::time::Instant;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Local;
use chrono::Utc;
use domainos_protocol::Automation;
use domainos_protocol::AutomationRun;
use domainos_protocol::DomainEvent;
use domainos_protocol::EventType;
use domainos_protocol::RunStatus;
use domainos_protocol::TriggerType;
use serde_json::Value as JsonValue;
use serde_json::json;
use tokio::time::timeout;
use tracing::debug;
use tracing::warn;

use super::cron::CronExpr;
use crate::canonical::sha256_hex;
use crate::canonical::stable_hash;
use crate::config::Settings;
use crate::error::DomainOsErr;
use crate::error::Result;
use crate::store::FinalizeOutcome;
use crate::store::Store;
use crate::util::new_id;

/// Minute-resolution component of schedule and event dedupe keys, local
/// time, e.g. `2025-06-15T09:00`.
pub fn minute_key(at: DateTime<Local>) -> String {
    at.format("%Y-%m-%dT%H:%M").to_string()
}

pub fn schedule_dedupe_key(automation_id: &str, at: DateTime<Local>) -> String {
    format!("{automation_id}|{}", minute_key(at))
}

/// Event-type-specific whitelist of the payload fields that define
/// uniqueness. Extra fields in `data` never widen the dedupe key.
pub fn materialize_dedupe_payload(event: &DomainEvent) -> JsonValue {
    match event.event_type {
        EventType::IntakeCreated => json!({
            "entityId": event.entity_id,
            "entityType": event.entity_type,
        }),
        EventType::KbChanged => {
            let mut changed: Vec<String> = event
                .data
                .get("changedPaths")
                .and_then(JsonValue::as_array)
                .map(|paths| {
                    paths
                        .iter()
                        .filter_map(JsonValue::as_str)
                        .map(|s| s.to_string())
                        .collect()
                })
                .unwrap_or_default();
            changed.sort();
            json!({
                "entityId": event.entity_id,
                "entityType": event.entity_type,
                "changedPaths": changed,
            })
        }
        EventType::GapFlagRaised => json!({
            "entityId": event.entity_id,
            "entityType": event.entity_type,
            "severity": event.data.get("severity").cloned().unwrap_or(JsonValue::Null),
        }),
        EventType::DeadlineApproaching => json!({
            "entityId": event
                .data
                .get("deadlineId")
                .and_then(JsonValue::as_str)
                .unwrap_or(&event.entity_id),
            "entityType": "deadline",
            "dueDate": event.data.get("dueDate").cloned().unwrap_or(JsonValue::Null),
        }),
    }
}

pub fn event_dedupe_key(automation_id: &str, event: &DomainEvent, at: DateTime<Local>) -> String {
    let payload_hash = stable_hash(&materialize_dedupe_payload(event));
    format!(
        "{automation_id}|{}|{payload_hash}|{}",
        event.event_type,
        minute_key(at)
    )
}

pub fn manual_dedupe_key(automation_id: &str, request_id: Option<&str>) -> String {
    format!("{automation_id}|manual|{}", request_id.unwrap_or("none"))
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AutomationOutcome {
    pub llm_response: Option<String>,
    pub action_result: Option<JsonValue>,
    pub action_external_id: Option<String>,
}

/// Host-provided execution of one run: call the LLM with the rendered
/// prompt, perform the configured action.
#[async_trait]
pub trait AutomationExecutor: Send + Sync {
    async fn execute(
        &self,
        automation: &Automation,
        rendered_prompt: &str,
        run: &AutomationRun,
    ) -> Result<AutomationOutcome>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub triggered: usize,
    pub duplicates: usize,
    pub failures: usize,
}

pub struct AutomationEngine {
    store: Arc<Store>,
    executor: Arc<dyn AutomationExecutor>,
    settings: Settings,
}

impl AutomationEngine {
    pub fn new(store: Arc<Store>, executor: Arc<dyn AutomationExecutor>, settings: Settings) -> Self {
        Self {
            store,
            executor,
            settings,
        }
    }

    /// One scheduler tick (the host calls this once per minute). A single
    /// run's failure never stops the tick.
    pub async fn tick(&self, now_local: DateTime<Local>) -> Result<TickSummary> {
        let mut summary = TickSummary::default();
        let now_utc = now_local.with_timezone(&Utc);

        for automation in self.store.get_scheduled_enabled()? {
            if automation
                .cooldown_until
                .is_some_and(|until| until > now_utc)
            {
                continue;
            }
            let Some(cron_text) = automation.trigger_cron.clone() else {
                continue;
            };
            let cron = match CronExpr::parse(&cron_text) {
                Ok(cron) => cron,
                Err(e) => {
                    warn!(automation = %automation.id, "invalid cron skipped: {e}");
                    continue;
                }
            };

            let mut fire_at: Vec<DateTime<Local>> = Vec::new();
            if cron.matches(now_local) {
                fire_at.push(now_local);
            }
            // catch-up: also attempt the previous matching minute when it
            // postdates the last run; the dedupe key makes a re-attempt of
            // an already-fired slot a no-op
            if automation.catch_up_enabled {
                if let Some(missed) = cron.last_match(now_local) {
                    let covered = automation
                        .last_run_at
                        .is_none_or(|last| missed.with_timezone(&Utc) <= last);
                    if !covered {
                        fire_at.push(missed);
                    }
                }
            }

            for at in fire_at {
                let dedupe_key = schedule_dedupe_key(&automation.id, at);
                match self
                    .trigger(&automation, TriggerType::Schedule, None, None, Some(dedupe_key), now_utc)
                    .await
                {
                    Ok(true) => summary.triggered += 1,
                    Ok(false) => summary.failures += 1,
                    Err(DomainOsErr::Duplicate) => summary.duplicates += 1,
                    Err(e) => {
                        warn!(automation = %automation.id, "trigger failed: {e}");
                        summary.failures += 1;
                    }
                }
            }
        }
        Ok(summary)
    }

    /// Event dispatch from the host (watcher, intake listener, record
    /// transitions).
    pub async fn dispatch_event(
        &self,
        event: &DomainEvent,
        now_local: DateTime<Local>,
    ) -> Result<TickSummary> {
        let mut summary = TickSummary::default();
        let now_utc = now_local.with_timezone(&Utc);

        for automation in self.store.get_enabled_by_event(&event.event_type.to_string())? {
            if automation
                .cooldown_until
                .is_some_and(|until| until > now_utc)
            {
                continue;
            }
            let dedupe_key = event_dedupe_key(&automation.id, event, now_local);
            let trigger_data = automation.store_payloads.then(|| event.data.clone());
            match self
                .trigger(
                    &automation,
                    TriggerType::Event,
                    Some(event.event_type.to_string()),
                    trigger_data,
                    Some(dedupe_key),
                    now_utc,
                )
                .await
            {
                Ok(true) => summary.triggered += 1,
                Ok(false) => summary.failures += 1,
                Err(DomainOsErr::Duplicate) => summary.duplicates += 1,
                Err(e) => {
                    warn!(automation = %automation.id, "event trigger failed: {e}");
                    summary.failures += 1;
                }
            }
        }
        Ok(summary)
    }

    pub async fn run_manual(
        &self,
        automation_id: &str,
        request_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let automation = self.store.get_automation(automation_id)?;
        let dedupe_key = manual_dedupe_key(automation_id, request_id);
        self.trigger(
            &automation,
            TriggerType::Manual,
            None,
            None,
            Some(dedupe_key),
            now,
        )
        .await
    }

    /// Insert (dedupe-gated) and execute one run. Returns Ok(true) on
    /// success, Ok(false) on a finalized failure, Err(Duplicate) when the
    /// dedupe key already fired.
    async fn trigger(
        &self,
        automation: &Automation,
        trigger_type: TriggerType,
        trigger_event: Option<String>,
        trigger_data: Option<JsonValue>,
        dedupe_key: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let run = AutomationRun {
            id: new_id(),
            automation_id: automation.id.clone(),
            domain_id: automation.domain_id.clone(),
            trigger_type,
            trigger_event,
            trigger_data,
            dedupe_key,
            prompt_hash: None,
            prompt_rendered: None,
            response_hash: None,
            llm_response: None,
            action_type: automation.action_type,
            action_result: None,
            action_external_id: None,
            status: RunStatus::Pending,
            error: None,
            error_code: None,
            duration_ms: None,
            created_at: now,
            updated_at: now,
        };
        self.store.try_insert_run(&run)?;
        debug!(automation = %automation.id, run = %run.id, "run inserted");
        self.execute_run(automation, run, now).await
    }

    async fn execute_run(
        &self,
        automation: &Automation,
        run: AutomationRun,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.store.mark_run_running(&run.id, now)?;
        let rendered = render_prompt(&automation.prompt_template, automation, &run);
        let started = Instant::now();

        let budget = StdDuration::from_secs(self.settings.per_round_timeout_secs);
        let outcome = timeout(budget, self.executor.execute(automation, &rendered, &run)).await;
        let duration_ms = started.elapsed().as_millis() as i64;
        let finished_at = now + chrono::Duration::milliseconds(duration_ms);

        let next_run_at = automation
            .trigger_cron
            .as_deref()
            .and_then(|cron| CronExpr::parse(cron).ok())
            .and_then(|cron| cron.next_match(finished_at.with_timezone(&Local)))
            .map(|dt| dt.with_timezone(&Utc));

        match outcome {
            Ok(Ok(result)) => {
                if automation.store_payloads {
                    self.store.record_run_payload(
                        &run.id,
                        Some(&sha256_hex(&rendered)),
                        Some(&rendered),
                        result.llm_response.as_deref().map(sha256_hex).as_deref(),
                        result.llm_response.as_deref(),
                        finished_at,
                    )?;
                }
                self.store.finalize_run(
                    &run.id,
                    &FinalizeOutcome::Success {
                        next_run_at,
                        duration_ms: Some(duration_ms),
                    },
                    finished_at,
                )?;
                Ok(true)
            }
            Ok(Err(e)) => {
                self.store.finalize_run(
                    &run.id,
                    &FinalizeOutcome::Failed {
                        error: e.to_string(),
                        error_code: Some(error_code_of(&e).to_string()),
                        duration_ms: Some(duration_ms),
                    },
                    finished_at,
                )?;
                Ok(false)
            }
            Err(_) => {
                self.store.finalize_run(
                    &run.id,
                    &FinalizeOutcome::Failed {
                        error: format!("execution exceeded {budget:?}"),
                        error_code: Some("timeout".to_string()),
                        duration_ms: Some(duration_ms),
                    },
                    finished_at,
                )?;
                Ok(false)
            }
        }
    }

    /// Housekeeping: crash-recovery sweep plus retention cleanup.
    pub fn housekeeping(&self, now: DateTime<Utc>) -> Result<(usize, usize)> {
        let stale_cutoff = now - chrono::Duration::hours(1);
        let swept = self.store.cleanup_stale_runs(stale_cutoff, now)?;
        let deleted = self.store.retention_cleanup(
            self.settings.automation_retention_days,
            self.settings.automation_retention_keep_latest,
            now,
        )?;
        Ok((swept, deleted))
    }
}

fn error_code_of(e: &DomainOsErr) -> &'static str {
    match e {
        DomainOsErr::Timeout(_) => "timeout",
        DomainOsErr::RetryLimit(_) | DomainOsErr::UnexpectedStatus(..) | DomainOsErr::Stream(_) => {
            "provider"
        }
        DomainOsErr::Validation(_) => "validation",
        DomainOsErr::Db(_) | DomainOsErr::Duplicate => "db",
        _ => "internal",
    }
}

/// Minimal `{{placeholder}}` rendering for prompt templates.
fn render_prompt(template: &str, automation: &Automation, run: &AutomationRun) -> String {
    let event = run.trigger_event.clone().unwrap_or_default();
    let data = run
        .trigger_data
        .as_ref()
        .map(|d| d.to_string())
        .unwrap_or_default();
    template
        .replace("{{automation}}", &automation.name)
        .replace("{{domain_id}}", &automation.domain_id)
        .replace("{{event}}", &event)
        .replace("{{event_data}}", &data)
}
