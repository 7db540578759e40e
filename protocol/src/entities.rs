//! Persistent entities.
//!
//! Timestamps are ISO-8601 UTC with millisecond resolution; the store
//! serializes them via [`chrono::SecondsFormat::Millis`]. Ids are opaque
//! strings unique within their kind.

use std::path::PathBuf;

use chrono::DateTime;
use chrono::NaiveDate;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value as JsonValue;
use strum_macros::Display;
use strum_macros::EnumString;

/// A domain: a folder of markdown files plus the structured records owned by
/// one agent persona.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Domain {
    pub id: String,
    pub name: String,
    /// Absolute path of the knowledge-base root on disk.
    pub kb_path: PathBuf,
    /// Persona text composed into the system prompt.
    pub identity: String,
    pub escalation_triggers: Vec<String>,
    pub allow_gmail: bool,
    /// (provider, model) are either both `None` (use the global default) or
    /// both set.
    pub model_provider: Option<String>,
    pub model_name: Option<String>,
    /// When true, the tool loop is attempted even while the capability cache
    /// says `not_observed` for this (provider, model).
    pub force_tool_attempt: bool,
    pub sort_order: i64,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum KbTier {
    /// Root `claude.md` only; patch-only writes.
    Structural,
    /// `kb_digest.md`; full/append writes only.
    Status,
    /// `kb_intel.md`; any write mode.
    Intelligence,
    General,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TierSource {
    Declared,
    Inferred,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct KbFile {
    pub id: String,
    pub domain_id: String,
    pub relative_path: String,
    /// sha256 over the file content, lowercase hex.
    pub content_hash: String,
    pub size_bytes: u64,
    pub last_synced_at: DateTime<Utc>,
    pub tier: KbTier,
    pub tier_source: TierSource,
}

/// Domain-scoped prompt fragment.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct DomainProtocol {
    pub id: String,
    pub domain_id: String,
    pub name: String,
    pub content: String,
    pub sort_order: i64,
}

/// Globally-scoped prompt fragment shared across domains.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct SharedProtocol {
    pub id: String,
    pub name: String,
    pub content: String,
    pub priority: i64,
    pub is_enabled: bool,
    pub scope: String,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ChatMessage {
    pub id: String,
    pub domain_id: String,
    pub role: ChatRole,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    pub metadata: JsonValue,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ConversationSummary {
    pub domain_id: String,
    pub summary_text: String,
    pub summary_version: i64,
    pub last_summarized_created_at: DateTime<Utc>,
    /// First 16 hex chars of sha256 over `summary_text`.
    pub summary_hash: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct AuditEntry {
    pub id: String,
    pub domain_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub agent_name: String,
    pub file_path: String,
    pub change_description: String,
    /// When present, a second insert with the same (domain_id, content_hash)
    /// is idempotent and returns the prior row.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    pub event_type: String,
    pub source: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DecisionStatus {
    Active,
    Superseded,
    Rejected,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Decision {
    pub id: String,
    pub domain_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Kebab-case identifier chosen by the model, 3-64 chars.
    pub decision_id: String,
    pub decision: String,
    pub rationale: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub downside: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revisit_trigger: Option<String>,
    pub linked_files: Vec<String>,
    pub status: DecisionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supersedes_decision_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub horizon: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reversibility_class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authority: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum GapFlagStatus {
    Open,
    Acknowledged,
    Resolved,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct GapFlag {
    pub id: String,
    pub domain_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub category: String,
    pub description: String,
    pub source_message: String,
    pub status: GapFlagStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AdvisoryType {
    Brainstorm,
    RiskAssessment,
    Scenario,
    StrategicReview,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AdvisorySource {
    Llm,
    User,
    Import,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AdvisoryStatus {
    Active,
    Archived,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct AdvisoryArtifact {
    pub id: String,
    pub domain_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(rename = "type")]
    pub artifact_type: AdvisoryType,
    pub title: String,
    pub schema_version: i64,
    /// Validated JSON payload with the control fields removed.
    pub content: JsonValue,
    /// Lowercase hex sha256; unique per (domain_id, fingerprint) within the
    /// dedup window.
    pub fingerprint: String,
    pub source: AdvisorySource,
    pub status: AdvisoryStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeadlineStatus {
    Active,
    Snoozed,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Deadline {
    pub id: String,
    pub domain_id: String,
    pub text: String,
    pub due_date: NaiveDate,
    /// 1 = most urgent, 7 = least.
    pub priority: u8,
    pub status: DeadlineStatus,
    pub source: String,
    pub source_ref: String,
    /// Non-null iff `status == Snoozed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snoozed_until: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancelled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DependencyType {
    Blocks,
    DependsOn,
    Informs,
    Parallel,
    MonitorOnly,
}

/// Directed relationship; the reciprocal edge is a separate row.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct DomainRelationship {
    pub domain_id: String,
    pub sibling_domain_id: String,
    pub relationship_type: String,
    pub dependency_type: DependencyType,
    pub description: String,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TriggerType {
    Schedule,
    Event,
    Manual,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AutomationActionType {
    Notification,
    CreateGtask,
    DraftGmail,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Automation {
    pub id: String,
    pub domain_id: String,
    pub name: String,
    pub trigger_type: TriggerType,
    /// Set iff `trigger_type == Schedule`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_cron: Option<String>,
    /// Set iff `trigger_type == Event`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_event: Option<String>,
    pub prompt_template: String,
    pub action_type: AutomationActionType,
    pub action_config: JsonValue,
    pub enabled: bool,
    /// Only meaningful for schedule triggers.
    pub catch_up_enabled: bool,
    pub store_payloads: bool,
    /// Only meaningful for `deadline_approaching` event triggers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline_window_days: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_run_at: Option<DateTime<Utc>>,
    pub failure_streak: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown_until: Option<DateTime<Utc>>,
    pub run_count: i64,
    pub duplicate_skip_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_duplicate_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct AutomationRun {
    pub id: String,
    pub automation_id: String,
    pub domain_id: String,
    pub trigger_type: TriggerType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_event: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_data: Option<JsonValue>,
    /// Unique when non-null; the duplicate gate for the engine.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dedupe_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_rendered: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_response: Option<String>,
    pub action_type: AutomationActionType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_result: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_external_id: Option<String>,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SessionStatus {
    Active,
    WrappedUp,
}

/// A work session over a domain; the status snapshot derives its
/// "since" window from the most recent one.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Session {
    pub id: String,
    pub domain_id: String,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn enums_serialize_snake_case() {
        assert_eq!(
            serde_json::to_string(&DependencyType::DependsOn).unwrap(),
            "\"depends_on\""
        );
        assert_eq!(
            serde_json::to_string(&AdvisoryType::RiskAssessment).unwrap(),
            "\"risk_assessment\""
        );
        assert_eq!(
            serde_json::to_string(&SessionStatus::WrappedUp).unwrap(),
            "\"wrapped_up\""
        );
    }

    #[test]
    fn enums_display_snake_case() {
        assert_eq!(DependencyType::MonitorOnly.to_string(), "monitor_only");
        assert_eq!(RunStatus::Pending.to_string(), "pending");
    }

    #[test]
    fn enums_parse_from_str() {
        use std::str::FromStr;
        assert_eq!(
            AdvisoryType::from_str("strategic_review").unwrap(),
            AdvisoryType::StrategicReview
        );
        assert!(AdvisoryType::from_str("strategicreview").is_err());
    }
}
