//! Advisory pipeline: block parsing with repository-backed persistence, and
//! the deterministic task extractor.

use chrono::DateTime;
use chrono::Utc;
use domainos_protocol::AdvisoryArtifact;
use domainos_protocol::AdvisorySource;
use domainos_protocol::AdvisoryType;
use serde_json::Value as JsonValue;

use crate::blocks::advisory::AdvisoryBlockParse;
use crate::blocks::advisory::AdvisoryMode;
use crate::blocks::advisory::AdvisoryReject;
use crate::blocks::advisory::ParsedAdvisoryBlock;
use crate::blocks::advisory::parse_advisory_fences;
use crate::canonical::excerpt;
use crate::config::Settings;
use crate::error::DomainOsErr;
use crate::error::Result;
use crate::store::AdvisoryCreateOutcome;
use crate::store::Store;

pub const REASON_RATE_LIMIT_HOUR: &str = "rate_limit_hour";
pub const REASON_RATE_LIMIT_DAY: &str = "rate_limit_day";
pub const REASON_DUPLICATE_FINGERPRINT: &str = "duplicate_fingerprint_conflict";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdvisoryParseResult {
    /// Artifacts now in the store for this response, including idempotent
    /// hits on a prior run's artifacts.
    pub persisted: Vec<AdvisoryArtifact>,
    /// Ids inside `persisted` that were reused rather than inserted.
    pub idempotent_ids: Vec<String>,
    pub draft_blocks: Vec<ParsedAdvisoryBlock>,
    pub rejects: Vec<AdvisoryReject>,
    pub warnings: Vec<String>,
    /// Human-facing notes, e.g. rate-limit explanations.
    pub system_notes: Vec<String>,
    pub advisory_mode: AdvisoryMode,
}

/// Parse advisory fences and, when a store is supplied, persist the selected
/// persistable blocks under the configured rate limits and dedup window.
pub fn parse_advisory_blocks(
    text: &str,
    domain_id: &str,
    session_id: Option<&str>,
    store: Option<&Store>,
    settings: &Settings,
    now: DateTime<Utc>,
) -> Result<AdvisoryParseResult> {
    let AdvisoryBlockParse {
        selected,
        draft_blocks,
        rejects,
        warnings,
        advisory_mode,
    } = parse_advisory_fences(text);

    let mut result = AdvisoryParseResult {
        draft_blocks,
        rejects,
        warnings,
        advisory_mode,
        ..Default::default()
    };

    let Some(store) = store else {
        return Ok(result);
    };

    for block in selected.iter().filter(|b| b.persist.is_persistable()) {
        match store.create_advisory_artifact(
            domain_id,
            session_id,
            block,
            AdvisorySource::Llm,
            settings,
            now,
        ) {
            Ok(AdvisoryCreateOutcome::Created(artifact)) => result.persisted.push(artifact),
            Ok(AdvisoryCreateOutcome::Duplicate(artifact)) => {
                // idempotent success, still surfaced for telemetry
                result.rejects.push(AdvisoryReject {
                    reason: REASON_DUPLICATE_FINGERPRINT.to_string(),
                    detail: format!("reused artifact {}", artifact.id),
                    raw_excerpt: excerpt(&block.title),
                });
                result.idempotent_ids.push(artifact.id.clone());
                result.persisted.push(artifact);
            }
            Err(e @ DomainOsErr::RateLimitHour { .. }) => {
                result.rejects.push(AdvisoryReject {
                    reason: REASON_RATE_LIMIT_HOUR.to_string(),
                    detail: e.to_string(),
                    raw_excerpt: excerpt(&block.title),
                });
                result.system_notes.push(e.to_string());
            }
            Err(e @ DomainOsErr::RateLimitDay { .. }) => {
                result.rejects.push(AdvisoryReject {
                    reason: REASON_RATE_LIMIT_DAY.to_string(),
                    detail: e.to_string(),
                    raw_excerpt: excerpt(&block.title),
                });
                result.system_notes.push(e.to_string());
            }
            Err(e) => return Err(e),
        }
    }

    Ok(result)
}

// ---------------------------------------------------------------------------
// Task extraction
// ---------------------------------------------------------------------------

const TITLE_MIN: usize = 6;
const TITLE_MAX: usize = 120;
const ACTION_SCAN_TOKENS: usize = 4;

const ACTION_VERBS: &[&str] = &[
    "audit", "call", "cancel", "check", "confirm", "contact", "create", "document", "draft",
    "email", "escalate", "evaluate", "file", "fix", "follow", "monitor", "negotiate", "plan",
    "prepare", "renegotiate", "renew", "research", "review", "run", "schedule", "send", "submit",
    "test", "update", "verify", "write",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPriority {
    High,
    Normal,
    Low,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedTask {
    pub title: String,
    pub priority: TaskPriority,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskCandidateIssue {
    pub title: String,
    /// `too_long`, `too_short` or `no_action_indicator`.
    pub reason: String,
    pub suggested_fix: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskExtraction {
    pub tasks: Vec<ExtractedTask>,
    pub needs_editing: Vec<TaskCandidateIssue>,
    pub artifact_id: String,
    pub artifact_title: String,
}

/// Case-insensitive action-indicator check: an action verb among the first
/// few tokens qualifies, which covers both "Verb object" and "Noun verb"
/// phrasings.
pub fn has_action_indicator(title: &str) -> bool {
    title
        .split_whitespace()
        .take(ACTION_SCAN_TOKENS)
        .map(|token| {
            token
                .trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .any(|token| ACTION_VERBS.contains(&token.as_str()))
}

/// Deterministic per-type extraction of actionable tasks from an artifact
/// payload. Candidates that fail validation land in `needs_editing` with a
/// reason and a suggested fix.
pub fn extract_tasks_from_artifact(artifact: &AdvisoryArtifact) -> TaskExtraction {
    let mut extraction = TaskExtraction {
        artifact_id: artifact.id.clone(),
        artifact_title: artifact.title.clone(),
        ..Default::default()
    };

    let payload = &artifact.content;
    let candidates: Vec<(String, TaskPriority)> = match artifact.artifact_type {
        AdvisoryType::Brainstorm => brainstorm_candidates(payload),
        AdvisoryType::RiskAssessment => str_items(payload, "risks", "mitigation")
            .into_iter()
            .map(|t| (t, TaskPriority::High))
            .collect(),
        AdvisoryType::Scenario => payload
            .get("triggers")
            .and_then(JsonValue::as_array)
            .map(|triggers| {
                triggers
                    .iter()
                    .filter_map(JsonValue::as_str)
                    .map(|t| (format!("Monitor: {t}"), TaskPriority::Low))
                    .collect()
            })
            .unwrap_or_default(),
        AdvisoryType::StrategicReview => {
            let mut out: Vec<(String, TaskPriority)> = Vec::new();
            if let Some(action) = payload
                .get("highest_leverage_action")
                .and_then(JsonValue::as_str)
            {
                out.push((action.to_string(), TaskPriority::High));
            }
            if let Some(assumptions) = payload
                .get("assumptions_to_check")
                .and_then(JsonValue::as_array)
            {
                out.extend(
                    assumptions
                        .iter()
                        .filter_map(JsonValue::as_str)
                        .map(|a| (format!("Verify: {a}"), TaskPriority::Normal)),
                );
            }
            out
        }
    };

    let mut seen: Vec<String> = Vec::new();
    for (title, priority) in candidates {
        let normalized: String = title.trim().to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ");
        if seen.contains(&normalized) {
            continue;
        }
        seen.push(normalized);

        let len = title.chars().count();
        if len > TITLE_MAX {
            extraction.needs_editing.push(TaskCandidateIssue {
                suggested_fix: Some(crate::util::truncate_chars(&title, TITLE_MAX)),
                title,
                reason: "too_long".to_string(),
            });
            continue;
        }
        if len < TITLE_MIN {
            extraction.needs_editing.push(TaskCandidateIssue {
                title,
                reason: "too_short".to_string(),
                suggested_fix: None,
            });
            continue;
        }
        if !has_action_indicator(&title) {
            extraction.needs_editing.push(TaskCandidateIssue {
                suggested_fix: Some(format!("Review: {title}")),
                title,
                reason: "no_action_indicator".to_string(),
            });
            continue;
        }
        extraction.tasks.push(ExtractedTask { title, priority });
    }
    extraction
}

/// brainstorm: `options[].action` preferred, then `recommendation`, then
/// `Evaluate: <option title>` as the last resort.
fn brainstorm_candidates(payload: &JsonValue) -> Vec<(String, TaskPriority)> {
    let actions = str_items(payload, "options", "action");
    if !actions.is_empty() {
        return actions
            .into_iter()
            .map(|a| (a, TaskPriority::Normal))
            .collect();
    }
    if let Some(recommendation) = payload.get("recommendation").and_then(JsonValue::as_str) {
        return vec![(recommendation.to_string(), TaskPriority::Normal)];
    }
    payload
        .get("options")
        .and_then(JsonValue::as_array)
        .map(|options| {
            options
                .iter()
                .filter_map(|o| {
                    o.get("title")
                        .or_else(|| o.get("label"))
                        .and_then(JsonValue::as_str)
                })
                .map(|t| (format!("Evaluate: {t}"), TaskPriority::Normal))
                .collect()
        })
        .unwrap_or_default()
}

fn str_items(payload: &JsonValue, array_key: &str, field: &str) -> Vec<String> {
    payload
        .get(array_key)
        .and_then(JsonValue::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.get(field).and_then(JsonValue::as_str))
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default()
}
