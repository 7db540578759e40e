//! Embedded SQLite store.
//!
//! The process is single-writer: one [`Store`] owns one connection behind a
//! mutex. Every repository call is fast but blocking; callers in async
//! contexts treat them as suspension points and never hold the lock across
//! an await.

mod advisory;
mod audit;
mod automations;
mod chat;
mod domains;
mod kb;
mod missions;
mod records;

use std::path::Path;
use std::sync::Mutex;
use std::sync::MutexGuard;

use chrono::DateTime;
use chrono::SecondsFormat;
use chrono::Utc;
use rusqlite::Connection;

use crate::error::Result;

pub use advisory::AdvisoryCreateOutcome;
pub use automations::FinalizeOutcome;
pub use missions::MissionActionRecord;
pub use missions::MissionActionStatus;
pub use missions::MissionRunRecord;
pub use missions::MissionRunStatus;

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        // A poisoned mutex means another thread panicked mid-statement; the
        // connection itself is still usable.
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// ISO-8601 UTC with millisecond resolution; the canonical timestamp text
/// form in every table.
pub(crate) fn to_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| DateTime::<Utc>::MIN_UTC)
}

pub(crate) fn parse_ts_opt(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.map(|s| parse_ts(&s))
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS domains (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    kb_path TEXT NOT NULL,
    identity TEXT NOT NULL DEFAULT '',
    escalation_triggers TEXT NOT NULL DEFAULT '[]',
    allow_gmail INTEGER NOT NULL DEFAULT 0,
    model_provider TEXT,
    model_name TEXT,
    force_tool_attempt INTEGER NOT NULL DEFAULT 0,
    sort_order INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS kb_files (
    id TEXT PRIMARY KEY,
    domain_id TEXT NOT NULL REFERENCES domains(id) ON DELETE CASCADE,
    relative_path TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    last_synced_at TEXT NOT NULL,
    tier TEXT NOT NULL,
    tier_source TEXT NOT NULL,
    UNIQUE (domain_id, relative_path)
);

CREATE TABLE IF NOT EXISTS protocols (
    id TEXT PRIMARY KEY,
    domain_id TEXT NOT NULL REFERENCES domains(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    content TEXT NOT NULL,
    sort_order INTEGER NOT NULL DEFAULT 0,
    UNIQUE (domain_id, name)
);

CREATE TABLE IF NOT EXISTS shared_protocols (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    content TEXT NOT NULL,
    priority INTEGER NOT NULL DEFAULT 0,
    is_enabled INTEGER NOT NULL DEFAULT 1,
    scope TEXT NOT NULL DEFAULT 'global'
);

CREATE TABLE IF NOT EXISTS chat_messages (
    id TEXT PRIMARY KEY,
    domain_id TEXT NOT NULL REFERENCES domains(id) ON DELETE CASCADE,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    status TEXT,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_chat_messages_domain_created
    ON chat_messages (domain_id, created_at DESC, id DESC);

CREATE TABLE IF NOT EXISTS conversation_summaries (
    domain_id TEXT PRIMARY KEY REFERENCES domains(id) ON DELETE CASCADE,
    summary_text TEXT NOT NULL,
    summary_version INTEGER NOT NULL,
    last_summarized_created_at TEXT NOT NULL,
    summary_hash TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS audit_log (
    id TEXT PRIMARY KEY,
    domain_id TEXT NOT NULL REFERENCES domains(id) ON DELETE CASCADE,
    session_id TEXT,
    agent_name TEXT NOT NULL,
    file_path TEXT NOT NULL,
    change_description TEXT NOT NULL,
    content_hash TEXT,
    event_type TEXT NOT NULL,
    source TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_audit_domain_content_hash
    ON audit_log (domain_id, content_hash) WHERE content_hash IS NOT NULL;

CREATE TABLE IF NOT EXISTS decisions (
    id TEXT PRIMARY KEY,
    domain_id TEXT NOT NULL REFERENCES domains(id) ON DELETE CASCADE,
    session_id TEXT,
    decision_id TEXT NOT NULL,
    decision TEXT NOT NULL,
    rationale TEXT NOT NULL,
    downside TEXT,
    revisit_trigger TEXT,
    linked_files TEXT NOT NULL DEFAULT '[]',
    status TEXT NOT NULL DEFAULT 'active',
    supersedes_decision_id TEXT,
    confidence TEXT,
    horizon TEXT,
    reversibility_class TEXT,
    category TEXT,
    authority TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (domain_id, decision_id)
);

CREATE TABLE IF NOT EXISTS gap_flags (
    id TEXT PRIMARY KEY,
    domain_id TEXT NOT NULL REFERENCES domains(id) ON DELETE CASCADE,
    session_id TEXT,
    category TEXT NOT NULL,
    description TEXT NOT NULL,
    source_message TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL DEFAULT 'open',
    resolved_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS advisory_artifacts (
    id TEXT PRIMARY KEY,
    domain_id TEXT NOT NULL REFERENCES domains(id) ON DELETE CASCADE,
    session_id TEXT,
    type TEXT NOT NULL,
    title TEXT NOT NULL,
    schema_version INTEGER NOT NULL,
    content TEXT NOT NULL,
    fingerprint TEXT NOT NULL,
    source TEXT NOT NULL DEFAULT 'llm',
    status TEXT NOT NULL DEFAULT 'active',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_advisory_domain_fingerprint
    ON advisory_artifacts (domain_id, fingerprint);
CREATE INDEX IF NOT EXISTS idx_advisory_domain_created
    ON advisory_artifacts (domain_id, created_at DESC);

CREATE TABLE IF NOT EXISTS deadlines (
    id TEXT PRIMARY KEY,
    domain_id TEXT NOT NULL REFERENCES domains(id) ON DELETE CASCADE,
    text TEXT NOT NULL,
    due_date TEXT NOT NULL,
    priority INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'active',
    source TEXT NOT NULL DEFAULT 'user',
    source_ref TEXT NOT NULL DEFAULT '',
    snoozed_until TEXT,
    completed_at TEXT,
    cancelled_at TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_deadlines_domain_status_due
    ON deadlines (domain_id, status, due_date);

CREATE TABLE IF NOT EXISTS domain_relationships (
    domain_id TEXT NOT NULL REFERENCES domains(id) ON DELETE CASCADE,
    sibling_domain_id TEXT NOT NULL,
    relationship_type TEXT NOT NULL DEFAULT '',
    dependency_type TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    PRIMARY KEY (domain_id, sibling_domain_id)
);

CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    domain_id TEXT NOT NULL REFERENCES domains(id) ON DELETE CASCADE,
    status TEXT NOT NULL,
    started_at TEXT NOT NULL,
    ended_at TEXT
);

CREATE TABLE IF NOT EXISTS automations (
    id TEXT PRIMARY KEY,
    domain_id TEXT NOT NULL REFERENCES domains(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    trigger_type TEXT NOT NULL,
    trigger_cron TEXT,
    trigger_event TEXT,
    prompt_template TEXT NOT NULL DEFAULT '',
    action_type TEXT NOT NULL,
    action_config TEXT NOT NULL DEFAULT '{}',
    enabled INTEGER NOT NULL DEFAULT 1,
    catch_up_enabled INTEGER NOT NULL DEFAULT 0,
    store_payloads INTEGER NOT NULL DEFAULT 0,
    deadline_window_days INTEGER,
    next_run_at TEXT,
    failure_streak INTEGER NOT NULL DEFAULT 0,
    cooldown_until TEXT,
    run_count INTEGER NOT NULL DEFAULT 0,
    duplicate_skip_count INTEGER NOT NULL DEFAULT 0,
    last_duplicate_at TEXT,
    last_run_at TEXT,
    last_error TEXT
);
CREATE INDEX IF NOT EXISTS idx_automations_enabled_trigger
    ON automations (enabled, trigger_type);

CREATE TABLE IF NOT EXISTS automation_runs (
    id TEXT PRIMARY KEY,
    automation_id TEXT NOT NULL REFERENCES automations(id) ON DELETE CASCADE,
    domain_id TEXT NOT NULL,
    trigger_type TEXT NOT NULL,
    trigger_event TEXT,
    trigger_data TEXT,
    dedupe_key TEXT,
    prompt_hash TEXT,
    prompt_rendered TEXT,
    response_hash TEXT,
    llm_response TEXT,
    action_type TEXT NOT NULL,
    action_result TEXT,
    action_external_id TEXT,
    status TEXT NOT NULL DEFAULT 'pending',
    error TEXT,
    error_code TEXT,
    duration_ms INTEGER,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_automation_runs_dedupe_key
    ON automation_runs (dedupe_key) WHERE dedupe_key IS NOT NULL;

CREATE TABLE IF NOT EXISTS mission_runs (
    id TEXT PRIMARY KEY,
    domain_id TEXT,
    mission_type TEXT NOT NULL,
    inputs TEXT NOT NULL DEFAULT '{}',
    inputs_hash TEXT NOT NULL,
    context_hash TEXT NOT NULL,
    prompt_hash TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    error TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS mission_outputs (
    id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL REFERENCES mission_runs(id) ON DELETE CASCADE,
    kind TEXT NOT NULL,
    content TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS mission_actions (
    id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL REFERENCES mission_runs(id) ON DELETE CASCADE,
    action_id TEXT NOT NULL,
    action_type TEXT NOT NULL,
    payload TEXT NOT NULL DEFAULT '{}',
    status TEXT NOT NULL DEFAULT 'pending',
    result TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn schema_initializes_idempotently() {
        let store = Store::open_in_memory().unwrap();
        // re-running the batch must be a no-op
        init_schema(&store.lock()).unwrap();
    }

    #[test]
    fn timestamps_round_trip_with_millis() {
        let now = Utc::now();
        let text = to_ts(now);
        assert!(text.ends_with('Z'));
        let back = parse_ts(&text);
        assert_eq!(back.timestamp_millis(), now.timestamp_millis());
    }
}
