//! Strict-JSON parser for `advisory-<type>` blocks.
//!
//! Unlike the key-value families, advisory bodies are JSON objects validated
//! against a strict per-type schema: unknown keys are rejected at any depth
//! so that a hallucinated field never silently round-trips into a persisted
//! artifact. Control fields (`schemaVersion`, `type`, `title`, `persist`)
//! ride alongside the payload and are stripped before schema validation.

use std::sync::LazyLock;

use domainos_protocol::AdvisoryType;
use regex_lite::Regex;
use serde_json::Map;
use serde_json::Value as JsonValue;

use crate::canonical::canonicalize_text;
use crate::canonical::excerpt;
use crate::canonical::sha256_hex;
use crate::canonical::stable_stringify;
use crate::normalize::EnumCheck;
use crate::normalize::normalize_enum;
use crate::normalize::resolve_alias;
use crate::normalize::validate_enum;

pub const ADVISORY_SCHEMA_VERSION: i64 = 1;
pub const ADVISORY_RAW_MAX_BYTES: usize = 32 * 1024;
pub const ADVISORY_PAYLOAD_MAX_BYTES: usize = 32 * 1024;
/// N: persisted-or-selected blocks per response.
pub const RESPONSE_BLOCK_CAP: usize = 2;
/// M: non-persistable selected blocks captured for 1-click save.
pub const DRAFT_BLOCK_CAP: usize = 2;

const TITLE_MIN_CHARS: usize = 4;
const TITLE_MAX_CHARS: usize = 120;
const FIELD_MAX_CHARS: usize = 2000;

pub const REASON_INVALID_FENCE_TYPE: &str = "invalid_fence_type";
pub const REASON_RAW_SIZE_EXCEEDED: &str = "raw_size_exceeded";
pub const REASON_INVALID_JSON: &str = "invalid_json";
pub const REASON_INVALID_SCHEMA_VERSION: &str = "invalid_schema_version";
pub const REASON_TYPE_MISMATCH: &str = "type_mismatch";
pub const REASON_INVALID_TITLE: &str = "invalid_title";
pub const REASON_INVALID_PERSIST: &str = "invalid_persist";
pub const REASON_PAYLOAD_SIZE_EXCEEDED: &str = "payload_size_exceeded";
pub const REASON_UNKNOWN_KEY_TOP_LEVEL: &str = "unknown_key_top_level";
pub const REASON_UNKNOWN_KEY_NESTED: &str = "unknown_key_nested";
pub const REASON_FIELD_SIZE_EXCEEDED: &str = "field_size_exceeded";
pub const REASON_MISSING_REQUIRED_KEY: &str = "missing_required_key";
pub const REASON_SCHEMA_VALIDATION_FAILED: &str = "schema_validation_failed";
pub const REASON_RESPONSE_BLOCK_CAP_EXCEEDED: &str = "response_block_cap_exceeded";

const CONTROL_FIELDS: &[&str] = &["schemaVersion", "type", "title", "persist"];

#[allow(clippy::unwrap_used)]
static ADVISORY_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^```advisory-(\w+)[^\n]*$").unwrap());

#[allow(clippy::unwrap_used)]
static ADVISORY_MODE_COMMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<!--\s*advisory_mode:\s*(\w+)\s*-->").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persist {
    Yes,
    No,
    Archive,
}

impl Persist {
    pub fn is_persistable(&self) -> bool {
        matches!(self, Persist::Yes | Persist::Archive)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdvisoryMode {
    Brainstorm,
    Challenge,
    Review,
    Scenario,
    #[default]
    General,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedAdvisoryBlock {
    pub artifact_type: AdvisoryType,
    pub schema_version: i64,
    pub title: String,
    pub persist: Persist,
    /// Control fields removed, optional enums soft-normalized.
    pub payload: JsonValue,
    pub fingerprint: String,
    pub size_bytes: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdvisoryReject {
    pub reason: String,
    pub detail: String,
    pub raw_excerpt: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdvisoryBlockParse {
    /// At most [`RESPONSE_BLOCK_CAP`] blocks, persistable first.
    pub selected: Vec<ParsedAdvisoryBlock>,
    /// The first [`DRAFT_BLOCK_CAP`] selected non-persistable blocks.
    pub draft_blocks: Vec<ParsedAdvisoryBlock>,
    pub rejects: Vec<AdvisoryReject>,
    pub warnings: Vec<String>,
    pub advisory_mode: AdvisoryMode,
}

pub fn parse_advisory_fences(text: &str) -> AdvisoryBlockParse {
    let mut result = AdvisoryBlockParse {
        advisory_mode: sniff_advisory_mode(text),
        ..Default::default()
    };

    let mut valid: Vec<ParsedAdvisoryBlock> = Vec::new();
    for (suffix, body) in fenced_bodies_with_suffix(text, &ADVISORY_FENCE) {
        match validate_block(&suffix, &body, &mut result.warnings) {
            Ok(block) => valid.push(block),
            Err(reject) => result.rejects.push(reject),
        }
    }

    // Persistable-first ordering, then the response-level cap.
    let (persistable, non_persistable): (Vec<_>, Vec<_>) =
        valid.into_iter().partition(|b| b.persist.is_persistable());
    let ordered: Vec<ParsedAdvisoryBlock> = persistable
        .into_iter()
        .chain(non_persistable.into_iter())
        .collect();

    for (idx, block) in ordered.into_iter().enumerate() {
        if idx < RESPONSE_BLOCK_CAP {
            if !block.persist.is_persistable() && result.draft_blocks.len() < DRAFT_BLOCK_CAP {
                result.draft_blocks.push(block.clone());
            }
            result.selected.push(block);
        } else {
            result.rejects.push(AdvisoryReject {
                reason: REASON_RESPONSE_BLOCK_CAP_EXCEEDED.to_string(),
                detail: format!(
                    "only {RESPONSE_BLOCK_CAP} advisory blocks are honored per response"
                ),
                raw_excerpt: excerpt(&block.title),
            });
        }
    }

    result
}

fn validate_block(
    suffix: &str,
    body: &str,
    warnings: &mut Vec<String>,
) -> Result<ParsedAdvisoryBlock, AdvisoryReject> {
    let reject = |reason: &str, detail: String| AdvisoryReject {
        reason: reason.to_string(),
        detail,
        raw_excerpt: excerpt(body),
    };

    let size_bytes = body.len();

    let fence_type = normalize_type(suffix);
    let Some(artifact_type) = fence_type else {
        return Err(reject(
            REASON_INVALID_FENCE_TYPE,
            format!("`{suffix}` is not an advisory type"),
        ));
    };

    if size_bytes > ADVISORY_RAW_MAX_BYTES {
        return Err(reject(
            REASON_RAW_SIZE_EXCEEDED,
            format!("{size_bytes} bytes exceeds {ADVISORY_RAW_MAX_BYTES}"),
        ));
    }

    let value: JsonValue = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(e) => return Err(reject(REASON_INVALID_JSON, e.to_string())),
    };
    let JsonValue::Object(mut object) = value else {
        return Err(reject(
            REASON_INVALID_JSON,
            "top level must be a JSON object".to_string(),
        ));
    };

    let schema_version = match object.get("schemaVersion").and_then(JsonValue::as_i64) {
        Some(v) if (1..=ADVISORY_SCHEMA_VERSION).contains(&v) => v,
        other => {
            return Err(reject(
                REASON_INVALID_SCHEMA_VERSION,
                format!("schemaVersion must be an integer in 1..={ADVISORY_SCHEMA_VERSION}, got {other:?}"),
            ));
        }
    };

    match object.get("type").and_then(JsonValue::as_str).and_then(normalize_type) {
        Some(declared) if declared == artifact_type => {}
        other => {
            return Err(reject(
                REASON_TYPE_MISMATCH,
                format!("type field {other:?} does not match fence `{artifact_type}`"),
            ));
        }
    }

    let title = match object.get("title").and_then(JsonValue::as_str) {
        Some(t) if valid_title(t) => t.to_string(),
        other => {
            return Err(reject(
                REASON_INVALID_TITLE,
                format!(
                    "title must be {TITLE_MIN_CHARS}-{TITLE_MAX_CHARS} chars without control chars or <>, got {other:?}"
                ),
            ));
        }
    };

    let persist = match object.get("persist").and_then(JsonValue::as_str).map(parse_persist) {
        Some(Some(p)) => p,
        other => {
            return Err(reject(
                REASON_INVALID_PERSIST,
                format!("persist must normalize to yes|no|archive, got {other:?}"),
            ));
        }
    };

    for field in CONTROL_FIELDS {
        object.remove(*field);
    }

    let payload = JsonValue::Object(object);
    #[allow(clippy::unwrap_used)]
    let payload_len = serde_json::to_string(&payload).unwrap().len();
    if payload_len > ADVISORY_PAYLOAD_MAX_BYTES {
        return Err(reject(
            REASON_PAYLOAD_SIZE_EXCEEDED,
            format!("{payload_len} bytes exceeds {ADVISORY_PAYLOAD_MAX_BYTES}"),
        ));
    }

    if let Err((reason, detail)) = validate_payload(artifact_type, &payload) {
        return Err(reject(reason, detail));
    }

    let mut payload = payload;
    soft_normalize_enums(&mut payload, warnings);

    let fingerprint = advisory_fingerprint(schema_version, artifact_type, &title, &payload);

    Ok(ParsedAdvisoryBlock {
        artifact_type,
        schema_version,
        title,
        persist,
        payload,
        fingerprint,
        size_bytes,
    })
}

fn normalize_type(raw: &str) -> Option<AdvisoryType> {
    match resolve_alias(&normalize_enum(raw)) {
        "brainstorm" => Some(AdvisoryType::Brainstorm),
        "risk_assessment" => Some(AdvisoryType::RiskAssessment),
        "scenario" => Some(AdvisoryType::Scenario),
        "strategic_review" => Some(AdvisoryType::StrategicReview),
        _ => None,
    }
}

fn parse_persist(raw: &str) -> Option<Persist> {
    match resolve_alias(&normalize_enum(raw)) {
        "yes" => Some(Persist::Yes),
        "no" => Some(Persist::No),
        "archive" => Some(Persist::Archive),
        _ => None,
    }
}

fn valid_title(title: &str) -> bool {
    let len = title.chars().count();
    (TITLE_MIN_CHARS..=TITLE_MAX_CHARS).contains(&len)
        && !title.chars().any(|c| c.is_control() || c == '<' || c == '>')
}

// ---------------------------------------------------------------------------
// Strict payload schemas
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum Kind {
    Str,
    StrArr,
    ObjArr(&'static [Field]),
}

#[derive(Debug, Clone, Copy)]
struct Field {
    name: &'static str,
    kind: Kind,
    required: bool,
}

const BRAINSTORM_OPTION: &[Field] = &[
    Field { name: "title", kind: Kind::Str, required: false },
    Field { name: "label", kind: Kind::Str, required: false },
    Field { name: "action", kind: Kind::Str, required: false },
    Field { name: "rationale", kind: Kind::Str, required: false },
    Field { name: "pros", kind: Kind::StrArr, required: false },
    Field { name: "cons", kind: Kind::StrArr, required: false },
];

const BRAINSTORM: &[Field] = &[
    Field { name: "topic", kind: Kind::Str, required: true },
    Field { name: "options", kind: Kind::ObjArr(BRAINSTORM_OPTION), required: true },
    Field { name: "recommendation", kind: Kind::Str, required: false },
    Field { name: "context", kind: Kind::Str, required: false },
    Field { name: "trend", kind: Kind::Str, required: false },
    Field { name: "trendConfidence", kind: Kind::Str, required: false },
];

const RISK: &[Field] = &[
    Field { name: "risk", kind: Kind::Str, required: true },
    Field { name: "likelihood", kind: Kind::Str, required: false },
    Field { name: "impact", kind: Kind::Str, required: false },
    Field { name: "severity", kind: Kind::Str, required: false },
    Field { name: "mitigation", kind: Kind::Str, required: false },
];

const RISK_ASSESSMENT: &[Field] = &[
    Field { name: "summary", kind: Kind::Str, required: false },
    Field { name: "risks", kind: Kind::ObjArr(RISK), required: true },
    Field { name: "trend", kind: Kind::Str, required: false },
    Field { name: "trendConfidence", kind: Kind::Str, required: false },
];

const SCENARIO_OUTCOME: &[Field] = &[
    Field { name: "label", kind: Kind::Str, required: true },
    Field { name: "description", kind: Kind::Str, required: false },
    Field { name: "probability", kind: Kind::Str, required: false },
];

const SCENARIO: &[Field] = &[
    Field { name: "premise", kind: Kind::Str, required: true },
    Field { name: "timeline", kind: Kind::Str, required: false },
    Field { name: "triggers", kind: Kind::StrArr, required: false },
    Field { name: "outcomes", kind: Kind::ObjArr(SCENARIO_OUTCOME), required: false },
    Field { name: "trend", kind: Kind::Str, required: false },
    Field { name: "trendConfidence", kind: Kind::Str, required: false },
];

const STRATEGIC_REVIEW: &[Field] = &[
    Field { name: "position_summary", kind: Kind::Str, required: false },
    Field { name: "strengths", kind: Kind::StrArr, required: false },
    Field { name: "weaknesses", kind: Kind::StrArr, required: false },
    Field { name: "highest_leverage_action", kind: Kind::Str, required: true },
    Field { name: "assumptions_to_check", kind: Kind::StrArr, required: false },
    Field { name: "trend", kind: Kind::Str, required: false },
    Field { name: "trendConfidence", kind: Kind::Str, required: false },
];

fn schema_for(ty: AdvisoryType) -> &'static [Field] {
    match ty {
        AdvisoryType::Brainstorm => BRAINSTORM,
        AdvisoryType::RiskAssessment => RISK_ASSESSMENT,
        AdvisoryType::Scenario => SCENARIO,
        AdvisoryType::StrategicReview => STRATEGIC_REVIEW,
    }
}

type SchemaError = (&'static str, String);

fn validate_payload(ty: AdvisoryType, payload: &JsonValue) -> Result<(), SchemaError> {
    let JsonValue::Object(map) = payload else {
        return Err((REASON_SCHEMA_VALIDATION_FAILED, "payload must be an object".into()));
    };
    validate_object(map, schema_for(ty), true)?;

    // brainstorm options must each carry a title or a label so the task
    // extractor and the fingerprint have something to key on
    if ty == AdvisoryType::Brainstorm {
        if let Some(JsonValue::Array(options)) = map.get("options") {
            for option in options {
                let has_name = option.get("title").and_then(JsonValue::as_str).is_some()
                    || option.get("label").and_then(JsonValue::as_str).is_some();
                if !has_name {
                    return Err((
                        REASON_SCHEMA_VALIDATION_FAILED,
                        "each brainstorm option needs a title or label".into(),
                    ));
                }
            }
        }
    }
    Ok(())
}

fn validate_object(
    map: &Map<String, JsonValue>,
    fields: &'static [Field],
    top_level: bool,
) -> Result<(), SchemaError> {
    for key in map.keys() {
        if !fields.iter().any(|f| f.name == key) {
            let reason = if top_level {
                REASON_UNKNOWN_KEY_TOP_LEVEL
            } else {
                REASON_UNKNOWN_KEY_NESTED
            };
            return Err((reason, format!("unknown key `{key}`")));
        }
    }
    for field in fields {
        let Some(value) = map.get(field.name) else {
            if field.required {
                return Err((
                    REASON_MISSING_REQUIRED_KEY,
                    format!("missing required key `{}`", field.name),
                ));
            }
            continue;
        };
        validate_value(field, value)?;
    }
    Ok(())
}

fn validate_value(field: &Field, value: &JsonValue) -> Result<(), SchemaError> {
    match (&field.kind, value) {
        (Kind::Str, JsonValue::String(s)) => {
            if s.chars().count() > FIELD_MAX_CHARS {
                return Err((
                    REASON_FIELD_SIZE_EXCEEDED,
                    format!("`{}` exceeds {FIELD_MAX_CHARS} chars", field.name),
                ));
            }
            Ok(())
        }
        (Kind::StrArr, JsonValue::Array(items)) => {
            for item in items {
                let JsonValue::String(s) = item else {
                    return Err((
                        REASON_SCHEMA_VALIDATION_FAILED,
                        format!("`{}` must contain strings", field.name),
                    ));
                };
                if s.chars().count() > FIELD_MAX_CHARS {
                    return Err((
                        REASON_FIELD_SIZE_EXCEEDED,
                        format!("`{}` item exceeds {FIELD_MAX_CHARS} chars", field.name),
                    ));
                }
            }
            Ok(())
        }
        (Kind::ObjArr(inner), JsonValue::Array(items)) => {
            for item in items {
                let JsonValue::Object(map) = item else {
                    return Err((
                        REASON_SCHEMA_VALIDATION_FAILED,
                        format!("`{}` must contain objects", field.name),
                    ));
                };
                validate_object(map, inner, false)?;
            }
            Ok(())
        }
        _ => Err((
            REASON_SCHEMA_VALIDATION_FAILED,
            format!("`{}` has the wrong JSON type", field.name),
        )),
    }
}

const TREND: &[&str] = &["improving", "stable", "declining"];
const TREND_CONFIDENCE: &[&str] = &["high", "medium", "low"];

fn soft_normalize_enums(payload: &mut JsonValue, warnings: &mut Vec<String>) {
    let JsonValue::Object(map) = payload else { return };
    for (field, allowed) in [("trend", TREND), ("trendConfidence", TREND_CONFIDENCE)] {
        let Some(JsonValue::String(raw)) = map.get(field) else {
            continue;
        };
        match validate_enum(raw, allowed) {
            EnumCheck::Valid(v) => {
                map.insert(field.to_string(), JsonValue::String(v));
            }
            EnumCheck::Invalid { warning, .. } => {
                map.remove(field);
                warnings.push(format!("{field}: {warning}"));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Fingerprint
// ---------------------------------------------------------------------------

/// Mixes a canonicalized core (trim/lowercase/whitespace-collapse) with the
/// raw core so whitespace-only edits reuse prior artifacts while genuine
/// edits produce new fingerprints.
pub fn advisory_fingerprint(
    schema_version: i64,
    ty: AdvisoryType,
    title: &str,
    payload: &JsonValue,
) -> String {
    let raw_core = core_fields(ty, payload);
    let canonical_core = canonicalize_core(&raw_core);
    let input = format!(
        "{schema_version}|{ty}|{}|{}|{}",
        canonicalize_text(title),
        stable_stringify(&canonical_core),
        stable_stringify(&raw_core),
    );
    sha256_hex(&input)
}

/// Per-type projection of the fields that define artifact identity.
fn core_fields(ty: AdvisoryType, payload: &JsonValue) -> JsonValue {
    let get_str = |v: &JsonValue, key: &str| {
        v.get(key)
            .and_then(JsonValue::as_str)
            .map(|s| JsonValue::String(s.to_string()))
            .unwrap_or(JsonValue::Null)
    };
    let str_arr = |v: Option<&JsonValue>| {
        JsonValue::Array(
            v.and_then(JsonValue::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(JsonValue::as_str)
                        .map(|s| JsonValue::String(s.to_string()))
                        .collect()
                })
                .unwrap_or_default(),
        )
    };

    match ty {
        AdvisoryType::Brainstorm => {
            let options = payload
                .get("options")
                .and_then(JsonValue::as_array)
                .map(|options| {
                    options
                        .iter()
                        .map(|o| {
                            o.get("title")
                                .or_else(|| o.get("label"))
                                .and_then(JsonValue::as_str)
                                .map(|s| JsonValue::String(s.to_string()))
                                .unwrap_or(JsonValue::Null)
                        })
                        .collect()
                })
                .unwrap_or_default();
            serde_json::json!({
                "topic": get_str(payload, "topic"),
                "options": JsonValue::Array(options),
            })
        }
        AdvisoryType::RiskAssessment => {
            let risks = payload
                .get("risks")
                .and_then(JsonValue::as_array)
                .map(|risks| risks.iter().map(|r| get_str(r, "risk")).collect())
                .unwrap_or_default();
            serde_json::json!({
                "summary": get_str(payload, "summary"),
                "risks": JsonValue::Array(risks),
            })
        }
        AdvisoryType::Scenario => serde_json::json!({
            "premise": get_str(payload, "premise"),
            "triggers": str_arr(payload.get("triggers")),
        }),
        AdvisoryType::StrategicReview => serde_json::json!({
            "highest_leverage_action": get_str(payload, "highest_leverage_action"),
            "assumptions_to_check": str_arr(payload.get("assumptions_to_check")),
        }),
    }
}

fn canonicalize_core(core: &JsonValue) -> JsonValue {
    match core {
        JsonValue::String(s) => JsonValue::String(canonicalize_text(s)),
        JsonValue::Array(items) => JsonValue::Array(items.iter().map(canonicalize_core).collect()),
        JsonValue::Object(map) => JsonValue::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), canonicalize_core(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn sniff_advisory_mode(text: &str) -> AdvisoryMode {
    let Some(caps) = ADVISORY_MODE_COMMENT.captures(text) else {
        return AdvisoryMode::General;
    };
    #[allow(clippy::unwrap_used)]
    match normalize_enum(caps.get(1).unwrap().as_str()).as_str() {
        "brainstorm" => AdvisoryMode::Brainstorm,
        "challenge" => AdvisoryMode::Challenge,
        "review" => AdvisoryMode::Review,
        "scenario" => AdvisoryMode::Scenario,
        _ => AdvisoryMode::General,
    }
}

fn fenced_bodies_with_suffix(text: &str, open: &Regex) -> Vec<(String, String)> {
    let mut bodies = Vec::new();
    for caps in open.captures_iter(text) {
        #[allow(clippy::unwrap_used)]
        let m = caps.get(0).unwrap();
        #[allow(clippy::unwrap_used)]
        let suffix = caps.get(1).unwrap().as_str().to_string();
        let after_header = match text[m.end()..].find('\n') {
            Some(nl) => m.end() + nl + 1,
            None => continue,
        };
        let rest = &text[after_header..];
        let mut body_lines: Vec<&str> = Vec::new();
        let mut closed = false;
        for line in rest.lines() {
            if line.trim_end() == "```" {
                closed = true;
                break;
            }
            body_lines.push(line);
        }
        if closed {
            bodies.push((suffix, body_lines.join("\n")));
        }
    }
    bodies
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn brainstorm_json(title: &str, persist: &str) -> String {
        json!({
            "schemaVersion": 1,
            "type": "brainstorm",
            "title": title,
            "persist": persist,
            "topic": "vendor selection",
            "options": [
                {"title": "Stay with ACME", "action": "Renegotiate the ACME contract"},
                {"title": "Switch to Beta", "action": "Run a Beta pilot"}
            ]
        })
        .to_string()
    }

    fn fence(ty: &str, body: &str) -> String {
        format!("```advisory-{ty}\n{body}\n```\n")
    }

    #[test]
    fn accepts_a_valid_brainstorm() {
        let text = fence("brainstorm", &brainstorm_json("Vendor options", "yes"));
        let parsed = parse_advisory_fences(&text);
        assert_eq!(parsed.rejects, vec![]);
        assert_eq!(parsed.selected.len(), 1);
        let block = &parsed.selected[0];
        assert_eq!(block.artifact_type, AdvisoryType::Brainstorm);
        assert_eq!(block.persist, Persist::Yes);
        assert!(block.payload.get("schemaVersion").is_none());
        assert_eq!(block.fingerprint.len(), 64);
    }

    #[test]
    fn rejects_unknown_fence_type() {
        let text = fence("daydream", "{}");
        let parsed = parse_advisory_fences(&text);
        assert_eq!(parsed.rejects[0].reason, REASON_INVALID_FENCE_TYPE);
    }

    #[test]
    fn rejects_oversized_raw_body() {
        let mut body = brainstorm_json("Vendor options", "yes");
        body.push_str(&" ".repeat(ADVISORY_RAW_MAX_BYTES));
        let text = fence("brainstorm", &body);
        let parsed = parse_advisory_fences(&text);
        assert_eq!(parsed.rejects[0].reason, REASON_RAW_SIZE_EXCEEDED);
    }

    #[test]
    fn rejects_non_object_json() {
        let parsed = parse_advisory_fences(&fence("brainstorm", "[1,2]"));
        assert_eq!(parsed.rejects[0].reason, REASON_INVALID_JSON);
        let parsed = parse_advisory_fences(&fence("brainstorm", "{nope"));
        assert_eq!(parsed.rejects[0].reason, REASON_INVALID_JSON);
    }

    #[test]
    fn rejects_control_field_violations() {
        let mut v: JsonValue = serde_json::from_str(&brainstorm_json("Valid title", "yes")).unwrap();
        v["schemaVersion"] = json!(99);
        let parsed = parse_advisory_fences(&fence("brainstorm", &v.to_string()));
        assert_eq!(parsed.rejects[0].reason, REASON_INVALID_SCHEMA_VERSION);

        let mut v: JsonValue = serde_json::from_str(&brainstorm_json("Valid title", "yes")).unwrap();
        v["type"] = json!("scenario");
        let parsed = parse_advisory_fences(&fence("brainstorm", &v.to_string()));
        assert_eq!(parsed.rejects[0].reason, REASON_TYPE_MISMATCH);

        let parsed = parse_advisory_fences(&fence("brainstorm", &brainstorm_json("x", "yes")));
        assert_eq!(parsed.rejects[0].reason, REASON_INVALID_TITLE);

        let parsed =
            parse_advisory_fences(&fence("brainstorm", &brainstorm_json("Valid title", "later")));
        assert_eq!(parsed.rejects[0].reason, REASON_INVALID_PERSIST);
    }

    #[test]
    fn persist_aliases_normalize() {
        let parsed =
            parse_advisory_fences(&fence("brainstorm", &brainstorm_json("Valid title", "Y")));
        assert_eq!(parsed.selected[0].persist, Persist::Yes);
    }

    #[test]
    fn strict_schema_rejects_unknown_keys_at_any_depth() {
        let mut v: JsonValue = serde_json::from_str(&brainstorm_json("Valid title", "yes")).unwrap();
        v["surprise"] = json!("field");
        let parsed = parse_advisory_fences(&fence("brainstorm", &v.to_string()));
        assert_eq!(parsed.rejects[0].reason, REASON_UNKNOWN_KEY_TOP_LEVEL);

        let mut v: JsonValue = serde_json::from_str(&brainstorm_json("Valid title", "yes")).unwrap();
        v["options"][0]["surprise"] = json!("field");
        let parsed = parse_advisory_fences(&fence("brainstorm", &v.to_string()));
        assert_eq!(parsed.rejects[0].reason, REASON_UNKNOWN_KEY_NESTED);
    }

    #[test]
    fn strict_schema_rejects_missing_required_key() {
        let v = json!({
            "schemaVersion": 1,
            "type": "strategic_review",
            "title": "Q3 position",
            "persist": "yes",
            "strengths": ["runway"]
        });
        let parsed = parse_advisory_fences(&fence("strategic_review", &v.to_string()));
        assert_eq!(parsed.rejects[0].reason, REASON_MISSING_REQUIRED_KEY);
    }

    #[test]
    fn strict_schema_rejects_oversized_field() {
        let mut v: JsonValue = serde_json::from_str(&brainstorm_json("Valid title", "yes")).unwrap();
        v["topic"] = json!("t".repeat(FIELD_MAX_CHARS + 1));
        let parsed = parse_advisory_fences(&fence("brainstorm", &v.to_string()));
        assert_eq!(parsed.rejects[0].reason, REASON_FIELD_SIZE_EXCEEDED);
    }

    #[test]
    fn trend_enum_soft_normalizes_or_drops() {
        let v = json!({
            "schemaVersion": 1,
            "type": "scenario",
            "title": "If the vendor folds",
            "persist": "yes",
            "premise": "vendor insolvency",
            "trend": "Improving",
            "trendConfidence": "certain"
        });
        let parsed = parse_advisory_fences(&fence("scenario", &v.to_string()));
        let block = &parsed.selected[0];
        assert_eq!(block.payload["trend"], json!("improving"));
        assert!(block.payload.get("trendConfidence").is_none());
        assert_eq!(parsed.warnings.len(), 1);
    }

    #[test]
    fn cap_selects_persistable_first() {
        let text = format!(
            "{}{}{}",
            fence("brainstorm", &brainstorm_json("Draft one", "no")),
            fence("brainstorm", &brainstorm_json("Keep one", "yes")),
            fence("brainstorm", &brainstorm_json("Keep two", "archive")),
        );
        let parsed = parse_advisory_fences(&text);
        let titles: Vec<&str> = parsed.selected.iter().map(|b| b.title.as_str()).collect();
        assert_eq!(titles, vec!["Keep one", "Keep two"]);
        assert_eq!(parsed.draft_blocks, vec![]);
        assert_eq!(parsed.rejects.len(), 1);
        assert_eq!(parsed.rejects[0].reason, REASON_RESPONSE_BLOCK_CAP_EXCEEDED);
    }

    #[test]
    fn selected_non_persistable_become_drafts() {
        let text = format!(
            "{}{}",
            fence("brainstorm", &brainstorm_json("Draft one", "no")),
            fence("brainstorm", &brainstorm_json("Draft two", "no")),
        );
        let parsed = parse_advisory_fences(&text);
        assert_eq!(parsed.selected.len(), 2);
        assert_eq!(parsed.draft_blocks.len(), 2);
    }

    #[test]
    fn whitespace_only_edits_share_a_fingerprint() {
        let a = parse_advisory_fences(&fence(
            "brainstorm",
            &brainstorm_json("Vendor  options", "yes"),
        ));
        let b = parse_advisory_fences(&fence(
            "brainstorm",
            &brainstorm_json("vendor options", "yes"),
        ));
        // canonical title matches but raw cores match too, so only the title
        // canonicalization differs; fingerprints must still differ or match
        // per the canonical/raw mix: identical cores, identical canonical
        // titles → identical fingerprints.
        assert_eq!(a.selected[0].fingerprint, b.selected[0].fingerprint);

        let c = parse_advisory_fences(&fence(
            "brainstorm",
            &brainstorm_json("Different topic entirely", "yes"),
        ));
        assert_ne!(a.selected[0].fingerprint, c.selected[0].fingerprint);
    }

    #[test]
    fn advisory_mode_sniffed_from_comment() {
        let text = format!(
            "<!-- advisory_mode: challenge -->\n{}",
            fence("brainstorm", &brainstorm_json("Vendor options", "no"))
        );
        let parsed = parse_advisory_fences(&text);
        assert_eq!(parsed.advisory_mode, AdvisoryMode::Challenge);
        assert_eq!(parse_advisory_fences("no comment").advisory_mode, AdvisoryMode::General);
    }

    #[test]
    fn advisory_parser_ignores_other_fences() {
        let text = "```kb-update\nfile: a.md\n```\n";
        let parsed = parse_advisory_fences(text);
        assert_eq!(parsed.selected, vec![]);
        assert_eq!(parsed.rejects, vec![]);
    }
}
