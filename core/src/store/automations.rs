//! Automation and automation-run repositories.
//!
//! `try_insert_run` is the dedup gate: the partial unique index on
//! `dedupe_key` converts a racing duplicate into `Err(Duplicate)` and bumps
//! the parent's skip counters atomically.

use chrono::DateTime;
use chrono::Duration;
use chrono::Utc;
use domainos_protocol::Automation;
use domainos_protocol::AutomationActionType;
use domainos_protocol::AutomationRun;
use domainos_protocol::RunStatus;
use domainos_protocol::TriggerType;
use rusqlite::Row;
use rusqlite::params;

use super::Store;
use super::parse_ts;
use super::parse_ts_opt;
use super::to_ts;
use crate::error::DomainOsErr;
use crate::error::Result;

const COOLDOWN_BASE_MINUTES: i64 = 5;
const COOLDOWN_MAX_HOURS: i64 = 24;

#[derive(Debug, Clone, PartialEq)]
pub enum FinalizeOutcome {
    Success {
        next_run_at: Option<DateTime<Utc>>,
        duration_ms: Option<i64>,
    },
    Failed {
        error: String,
        error_code: Option<String>,
        duration_ms: Option<i64>,
    },
    Skipped,
}

fn automation_from_row(row: &Row<'_>) -> rusqlite::Result<Automation> {
    let trigger_type: String = row.get("trigger_type")?;
    let action_type: String = row.get("action_type")?;
    let action_config: String = row.get("action_config")?;
    Ok(Automation {
        id: row.get("id")?,
        domain_id: row.get("domain_id")?,
        name: row.get("name")?,
        trigger_type: trigger_type.parse().unwrap_or(TriggerType::Manual),
        trigger_cron: row.get("trigger_cron")?,
        trigger_event: row.get("trigger_event")?,
        prompt_template: row.get("prompt_template")?,
        action_type: action_type.parse().unwrap_or(AutomationActionType::Notification),
        action_config: serde_json::from_str(&action_config).unwrap_or(serde_json::Value::Null),
        enabled: row.get::<_, i64>("enabled")? != 0,
        catch_up_enabled: row.get::<_, i64>("catch_up_enabled")? != 0,
        store_payloads: row.get::<_, i64>("store_payloads")? != 0,
        deadline_window_days: row.get("deadline_window_days")?,
        next_run_at: parse_ts_opt(row.get("next_run_at")?),
        failure_streak: row.get("failure_streak")?,
        cooldown_until: parse_ts_opt(row.get("cooldown_until")?),
        run_count: row.get("run_count")?,
        duplicate_skip_count: row.get("duplicate_skip_count")?,
        last_duplicate_at: parse_ts_opt(row.get("last_duplicate_at")?),
        last_run_at: parse_ts_opt(row.get("last_run_at")?),
        last_error: row.get("last_error")?,
    })
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<AutomationRun> {
    let trigger_type: String = row.get("trigger_type")?;
    let action_type: String = row.get("action_type")?;
    let status: String = row.get("status")?;
    let trigger_data: Option<String> = row.get("trigger_data")?;
    let action_result: Option<String> = row.get("action_result")?;
    Ok(AutomationRun {
        id: row.get("id")?,
        automation_id: row.get("automation_id")?,
        domain_id: row.get("domain_id")?,
        trigger_type: trigger_type.parse().unwrap_or(TriggerType::Manual),
        trigger_event: row.get("trigger_event")?,
        trigger_data: trigger_data.and_then(|s| serde_json::from_str(&s).ok()),
        dedupe_key: row.get("dedupe_key")?,
        prompt_hash: row.get("prompt_hash")?,
        prompt_rendered: row.get("prompt_rendered")?,
        response_hash: row.get("response_hash")?,
        llm_response: row.get("llm_response")?,
        action_type: action_type.parse().unwrap_or(AutomationActionType::Notification),
        action_result: action_result.and_then(|s| serde_json::from_str(&s).ok()),
        action_external_id: row.get("action_external_id")?,
        status: status.parse().unwrap_or(RunStatus::Pending),
        error: row.get("error")?,
        error_code: row.get("error_code")?,
        duration_ms: row.get("duration_ms")?,
        created_at: parse_ts(&row.get::<_, String>("created_at")?),
        updated_at: parse_ts(&row.get::<_, String>("updated_at")?),
    })
}

fn is_dedupe_key_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(failure, message) => {
            failure.code == rusqlite::ErrorCode::ConstraintViolation
                && message
                    .as_deref()
                    .is_some_and(|m| m.contains("dedupe_key"))
        }
        _ => false,
    }
}

impl Store {
    pub fn upsert_automation(&self, automation: &Automation) -> Result<()> {
        match automation.trigger_type {
            TriggerType::Schedule if automation.trigger_cron.is_none() => {
                return Err(DomainOsErr::Validation(
                    "schedule automations require trigger_cron".to_string(),
                ));
            }
            TriggerType::Event if automation.trigger_event.is_none() => {
                return Err(DomainOsErr::Validation(
                    "event automations require trigger_event".to_string(),
                ));
            }
            _ => {}
        }
        if automation.catch_up_enabled && automation.trigger_type != TriggerType::Schedule {
            return Err(DomainOsErr::Validation(
                "catch_up_enabled only applies to schedule automations".to_string(),
            ));
        }
        let conn = self.lock();
        conn.execute(
            "INSERT INTO automations
                 (id, domain_id, name, trigger_type, trigger_cron, trigger_event, prompt_template,
                  action_type, action_config, enabled, catch_up_enabled, store_payloads,
                  deadline_window_days, next_run_at, failure_streak, cooldown_until, run_count,
                  duplicate_skip_count, last_duplicate_at, last_run_at, last_error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
                     ?18, ?19, ?20, ?21)
             ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 trigger_type = excluded.trigger_type,
                 trigger_cron = excluded.trigger_cron,
                 trigger_event = excluded.trigger_event,
                 prompt_template = excluded.prompt_template,
                 action_type = excluded.action_type,
                 action_config = excluded.action_config,
                 enabled = excluded.enabled,
                 catch_up_enabled = excluded.catch_up_enabled,
                 store_payloads = excluded.store_payloads,
                 deadline_window_days = excluded.deadline_window_days",
            params![
                automation.id,
                automation.domain_id,
                automation.name,
                automation.trigger_type.to_string(),
                automation.trigger_cron,
                automation.trigger_event,
                automation.prompt_template,
                automation.action_type.to_string(),
                serde_json::to_string(&automation.action_config)?,
                automation.enabled as i64,
                automation.catch_up_enabled as i64,
                automation.store_payloads as i64,
                automation.deadline_window_days,
                automation.next_run_at.map(to_ts),
                automation.failure_streak,
                automation.cooldown_until.map(to_ts),
                automation.run_count,
                automation.duplicate_skip_count,
                automation.last_duplicate_at.map(to_ts),
                automation.last_run_at.map(to_ts),
                automation.last_error,
            ],
        )?;
        Ok(())
    }

    pub fn get_automation(&self, id: &str) -> Result<Automation> {
        let conn = self.lock();
        conn.query_row(
            "SELECT * FROM automations WHERE id = ?1",
            params![id],
            automation_from_row,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => {
                DomainOsErr::NotFound(format!("automation {id}"))
            }
            other => other.into(),
        })
    }

    pub fn get_scheduled_enabled(&self) -> Result<Vec<Automation>> {
        self.automations_where("enabled = 1 AND trigger_type = 'schedule'", params![])
    }

    pub fn get_enabled_by_event(&self, event: &str) -> Result<Vec<Automation>> {
        self.automations_where(
            "enabled = 1 AND trigger_type = 'event' AND trigger_event = ?1",
            params![event],
        )
    }

    fn automations_where(
        &self,
        predicate: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<Automation>> {
        let conn = self.lock();
        let sql = format!("SELECT * FROM automations WHERE {predicate} ORDER BY id");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params, automation_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Atomically insert a run row. A dedupe-key collision becomes
    /// `Err(Duplicate)` and increments the parent's skip counters.
    pub fn try_insert_run(&self, run: &AutomationRun) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let insert = tx.execute(
            "INSERT INTO automation_runs
                 (id, automation_id, domain_id, trigger_type, trigger_event, trigger_data,
                  dedupe_key, prompt_hash, prompt_rendered, response_hash, llm_response,
                  action_type, action_result, action_external_id, status, error, error_code,
                  duration_ms, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
                     ?18, ?19, ?20)",
            params![
                run.id,
                run.automation_id,
                run.domain_id,
                run.trigger_type.to_string(),
                run.trigger_event,
                run.trigger_data
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                run.dedupe_key,
                run.prompt_hash,
                run.prompt_rendered,
                run.response_hash,
                run.llm_response,
                run.action_type.to_string(),
                run.action_result
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                run.action_external_id,
                run.status.to_string(),
                run.error,
                run.error_code,
                run.duration_ms,
                to_ts(run.created_at),
                to_ts(run.updated_at),
            ],
        );
        match insert {
            Ok(_) => {
                tx.commit()?;
                Ok(())
            }
            Err(e) if is_dedupe_key_violation(&e) => {
                tx.execute(
                    "UPDATE automations
                     SET duplicate_skip_count = duplicate_skip_count + 1, last_duplicate_at = ?1
                     WHERE id = ?2",
                    params![to_ts(run.updated_at), run.automation_id],
                )?;
                tx.commit()?;
                Err(DomainOsErr::Duplicate)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn mark_run_running(&self, run_id: &str, now: DateTime<Utc>) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE automation_runs SET status = 'running', updated_at = ?1 WHERE id = ?2",
            params![to_ts(now), run_id],
        )?;
        Ok(())
    }

    pub fn record_run_payload(
        &self,
        run_id: &str,
        prompt_hash: Option<&str>,
        prompt_rendered: Option<&str>,
        response_hash: Option<&str>,
        llm_response: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE automation_runs
             SET prompt_hash = ?1, prompt_rendered = ?2, response_hash = ?3, llm_response = ?4,
                 updated_at = ?5
             WHERE id = ?6",
            params![prompt_hash, prompt_rendered, response_hash, llm_response, to_ts(now), run_id],
        )?;
        Ok(())
    }

    /// Terminal transition; the run row update and the parent counter
    /// updates commit together.
    pub fn finalize_run(
        &self,
        run_id: &str,
        outcome: &FinalizeOutcome,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let automation_id: String = tx
            .query_row(
                "SELECT automation_id FROM automation_runs WHERE id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    DomainOsErr::NotFound(format!("automation run {run_id}"))
                }
                other => other.into(),
            })?;

        match outcome {
            FinalizeOutcome::Success {
                next_run_at,
                duration_ms,
            } => {
                tx.execute(
                    "UPDATE automation_runs
                     SET status = 'success', error = NULL, error_code = NULL, duration_ms = ?1,
                         updated_at = ?2
                     WHERE id = ?3",
                    params![duration_ms, to_ts(now), run_id],
                )?;
                tx.execute(
                    "UPDATE automations
                     SET run_count = run_count + 1, failure_streak = 0, last_error = NULL,
                         cooldown_until = NULL, last_run_at = ?1, next_run_at = ?2
                     WHERE id = ?3",
                    params![to_ts(now), next_run_at.map(to_ts), automation_id],
                )?;
            }
            FinalizeOutcome::Failed {
                error,
                error_code,
                duration_ms,
            } => {
                tx.execute(
                    "UPDATE automation_runs
                     SET status = 'failed', error = ?1, error_code = ?2, duration_ms = ?3,
                         updated_at = ?4
                     WHERE id = ?5",
                    params![error, error_code, duration_ms, to_ts(now), run_id],
                )?;
                let streak: i64 = tx.query_row(
                    "SELECT failure_streak FROM automations WHERE id = ?1",
                    params![automation_id],
                    |row| row.get(0),
                )?;
                let new_streak = streak + 1;
                let cooldown = cooldown_after_failures(new_streak, now);
                tx.execute(
                    "UPDATE automations
                     SET run_count = run_count + 1, failure_streak = ?1, last_error = ?2,
                         cooldown_until = ?3, last_run_at = ?4
                     WHERE id = ?5",
                    params![new_streak, error, to_ts(cooldown), to_ts(now), automation_id],
                )?;
            }
            FinalizeOutcome::Skipped => {
                tx.execute(
                    "UPDATE automation_runs SET status = 'skipped', updated_at = ?1 WHERE id = ?2",
                    params![to_ts(now), run_id],
                )?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_run(&self, run_id: &str) -> Result<AutomationRun> {
        let conn = self.lock();
        conn.query_row(
            "SELECT * FROM automation_runs WHERE id = ?1",
            params![run_id],
            run_from_row,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => {
                DomainOsErr::NotFound(format!("automation run {run_id}"))
            }
            other => other.into(),
        })
    }

    /// Crash recovery: pending/running rows older than the cutoff are marked
    /// failed with `error_code = 'crash_recovery'`. Returns the number of
    /// rows swept.
    pub fn cleanup_stale_runs(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> Result<usize> {
        let conn = self.lock();
        Ok(conn.execute(
            "UPDATE automation_runs
             SET status = 'failed', error = 'swept by crash recovery',
                 error_code = 'crash_recovery', updated_at = ?1
             WHERE status IN ('pending', 'running') AND created_at < ?2",
            params![to_ts(now), to_ts(cutoff)],
        )?)
    }

    /// Delete runs older than the retention window AND beyond the latest-N
    /// per automation, in one statement.
    pub fn retention_cleanup(
        &self,
        retention_days: i64,
        keep_latest: i64,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let cutoff = now - Duration::days(retention_days);
        let conn = self.lock();
        Ok(conn.execute(
            "DELETE FROM automation_runs WHERE id IN (
                 SELECT id FROM (
                     SELECT id, created_at,
                            ROW_NUMBER() OVER (
                                PARTITION BY automation_id ORDER BY created_at DESC, id DESC
                            ) AS rn
                     FROM automation_runs
                 )
                 WHERE rn > ?1 AND created_at < ?2
             )",
            params![keep_latest, to_ts(cutoff)],
        )?)
    }
}

fn cooldown_after_failures(streak: i64, now: DateTime<Utc>) -> DateTime<Utc> {
    let exponent = (streak - 1).clamp(0, 16) as u32;
    let minutes = COOLDOWN_BASE_MINUTES.saturating_mul(1i64 << exponent);
    let capped = minutes.min(COOLDOWN_MAX_HOURS * 60);
    now + Duration::minutes(capped)
}
