//! Mission run, output and pending-action repositories.

use chrono::DateTime;
use chrono::Utc;
use rusqlite::Row;
use rusqlite::params;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value as JsonValue;
use strum_macros::Display;

use super::Store;
use super::parse_ts;
use super::to_ts;
use crate::error::DomainOsErr;
use crate::error::Result;

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MissionRunStatus {
    Pending,
    Running,
    Gated,
    Success,
    Failed,
    Cancelled,
}

impl std::str::FromStr for MissionRunStatus {
    type Err = DomainOsErr;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "gated" => Ok(Self::Gated),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(DomainOsErr::Validation(format!(
                "unknown mission run status `{other}`"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MissionActionStatus {
    Pending,
    Success,
    Failed,
    Skipped,
}

impl std::str::FromStr for MissionActionStatus {
    type Err = DomainOsErr;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            other => Err(DomainOsErr::Validation(format!(
                "unknown mission action status `{other}`"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MissionRunRecord {
    pub id: String,
    pub domain_id: Option<String>,
    pub mission_type: String,
    pub inputs: JsonValue,
    pub inputs_hash: String,
    pub context_hash: String,
    pub prompt_hash: String,
    pub status: MissionRunStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MissionActionRecord {
    pub id: String,
    pub run_id: String,
    pub action_id: String,
    pub action_type: String,
    pub payload: JsonValue,
    pub status: MissionActionStatus,
    pub result: Option<String>,
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<MissionRunRecord> {
    let status: String = row.get("status")?;
    let inputs: String = row.get("inputs")?;
    Ok(MissionRunRecord {
        id: row.get("id")?,
        domain_id: row.get("domain_id")?,
        mission_type: row.get("mission_type")?,
        inputs: serde_json::from_str(&inputs).unwrap_or(JsonValue::Null),
        inputs_hash: row.get("inputs_hash")?,
        context_hash: row.get("context_hash")?,
        prompt_hash: row.get("prompt_hash")?,
        status: status.parse().unwrap_or(MissionRunStatus::Pending),
        error: row.get("error")?,
        created_at: parse_ts(&row.get::<_, String>("created_at")?),
        updated_at: parse_ts(&row.get::<_, String>("updated_at")?),
    })
}

impl Store {
    pub fn insert_mission_run(&self, run: &MissionRunRecord) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO mission_runs
                 (id, domain_id, mission_type, inputs, inputs_hash, context_hash, prompt_hash,
                  status, error, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                run.id,
                run.domain_id,
                run.mission_type,
                serde_json::to_string(&run.inputs)?,
                run.inputs_hash,
                run.context_hash,
                run.prompt_hash,
                run.status.to_string(),
                run.error,
                to_ts(run.created_at),
                to_ts(run.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_mission_run(&self, run_id: &str) -> Result<MissionRunRecord> {
        let conn = self.lock();
        conn.query_row(
            "SELECT * FROM mission_runs WHERE id = ?1",
            params![run_id],
            run_from_row,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => {
                DomainOsErr::NotFound(format!("mission run {run_id}"))
            }
            other => other.into(),
        })
    }

    pub fn set_mission_run_status(
        &self,
        run_id: &str,
        status: MissionRunStatus,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.lock();
        let updated = conn.execute(
            "UPDATE mission_runs SET status = ?1, error = ?2, updated_at = ?3 WHERE id = ?4",
            params![status.to_string(), error, to_ts(now), run_id],
        )?;
        if updated == 0 {
            return Err(DomainOsErr::NotFound(format!("mission run {run_id}")));
        }
        Ok(())
    }

    pub fn insert_mission_output(
        &self,
        run_id: &str,
        output_id: &str,
        kind: &str,
        content: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO mission_outputs (id, run_id, kind, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![output_id, run_id, kind, content, to_ts(now)],
        )?;
        Ok(())
    }

    pub fn list_mission_outputs(&self, run_id: &str) -> Result<Vec<(String, String)>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT kind, content FROM mission_outputs WHERE run_id = ?1 ORDER BY created_at, id",
        )?;
        let rows = stmt.query_map(params![run_id], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn insert_mission_action(&self, action: &MissionActionRecord, now: DateTime<Utc>) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO mission_actions
                 (id, run_id, action_id, action_type, payload, status, result, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                action.id,
                action.run_id,
                action.action_id,
                action.action_type,
                serde_json::to_string(&action.payload)?,
                action.status.to_string(),
                action.result,
                to_ts(now),
                to_ts(now),
            ],
        )?;
        Ok(())
    }

    pub fn list_mission_actions(&self, run_id: &str) -> Result<Vec<MissionActionRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, run_id, action_id, action_type, payload, status, result
             FROM mission_actions WHERE run_id = ?1 ORDER BY created_at, id",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            let status: String = row.get("status")?;
            let payload: String = row.get("payload")?;
            Ok(MissionActionRecord {
                id: row.get("id")?,
                run_id: row.get("run_id")?,
                action_id: row.get("action_id")?,
                action_type: row.get("action_type")?,
                payload: serde_json::from_str(&payload).unwrap_or(JsonValue::Null),
                status: status.parse().unwrap_or(MissionActionStatus::Pending),
                result: row.get("result")?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn set_mission_action_status(
        &self,
        action_id: &str,
        status: MissionActionStatus,
        result: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.lock();
        let updated = conn.execute(
            "UPDATE mission_actions SET status = ?1, result = ?2, updated_at = ?3 WHERE id = ?4",
            params![status.to_string(), result, to_ts(now), action_id],
        )?;
        if updated == 0 {
            return Err(DomainOsErr::NotFound(format!("mission action {action_id}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn mission_run_lifecycle_round_trips() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        let run = MissionRunRecord {
            id: "mr1".to_string(),
            domain_id: None,
            mission_type: "portfolio_briefing".to_string(),
            inputs: json!({"scope": "all"}),
            inputs_hash: "ih".to_string(),
            context_hash: "ch".to_string(),
            prompt_hash: "ph".to_string(),
            status: MissionRunStatus::Pending,
            error: None,
            created_at: now,
            updated_at: now,
        };
        store.insert_mission_run(&run).unwrap();
        store
            .set_mission_run_status("mr1", MissionRunStatus::Gated, None, now)
            .unwrap();
        assert_eq!(
            store.get_mission_run("mr1").unwrap().status,
            MissionRunStatus::Gated
        );

        store
            .insert_mission_output("mr1", "o1", "raw", "full text", now)
            .unwrap();
        store
            .insert_mission_output("mr1", "o2", "alert", "{\"x\":1}", now)
            .unwrap();
        let outputs = store.list_mission_outputs("mr1").unwrap();
        assert_eq!(outputs[0].0, "raw");
        assert_eq!(outputs.len(), 2);
    }

    #[test]
    fn mission_actions_track_status() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        let run = MissionRunRecord {
            id: "mr1".to_string(),
            domain_id: None,
            mission_type: "portfolio_briefing".to_string(),
            inputs: json!({}),
            inputs_hash: "ih".to_string(),
            context_hash: "ch".to_string(),
            prompt_hash: "ph".to_string(),
            status: MissionRunStatus::Pending,
            error: None,
            created_at: now,
            updated_at: now,
        };
        store.insert_mission_run(&run).unwrap();
        let action = MissionActionRecord {
            id: "ma1".to_string(),
            run_id: "mr1".to_string(),
            action_id: "create_deadline".to_string(),
            action_type: "create_deadline".to_string(),
            payload: json!({"text": "file the report"}),
            status: MissionActionStatus::Pending,
            result: None,
        };
        store.insert_mission_action(&action, now).unwrap();
        store
            .set_mission_action_status("ma1", MissionActionStatus::Success, Some("dl-1"), now)
            .unwrap();
        let actions = store.list_mission_actions("mr1").unwrap();
        assert_eq!(actions[0].status, MissionActionStatus::Success);
        assert_eq!(actions[0].result.as_deref(), Some("dl-1"));
    }
}
