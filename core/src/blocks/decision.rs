//! Parser for `decision` blocks.
//!
//! Key-value grammar. Required: `decisionId` (kebab-case, 3-64 chars),
//! `decision`, `rationale`. Optional enum fields degrade to `None` with a
//! warning when they do not normalize into their allowed set.

use std::sync::LazyLock;

use regex_lite::Regex;

use crate::canonical::excerpt;
use crate::canonical::short_hash;
use crate::normalize::EnumCheck;
use crate::normalize::validate_enum;

#[allow(clippy::unwrap_used)]
static DECISION_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^```decision[^\n]*$").unwrap());

#[allow(clippy::unwrap_used)]
static KEBAB_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]+(?:-[a-z0-9]+)*$").unwrap());

pub const REASON_MISSING_FIELDS: &str = "MISSING_FIELDS";
pub const REASON_INVALID_DECISION_ID: &str = "INVALID_DECISION_ID";

const CONFIDENCE: &[&str] = &["high", "medium", "low"];
const HORIZON: &[&str] = &["immediate", "near_term", "strategic"];
const REVERSIBILITY: &[&str] = &["reversible", "irreversible"];
const CATEGORY: &[&str] = &["strategic", "tactical", "operational"];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedDecision {
    pub decision_id: String,
    pub decision: String,
    pub rationale: String,
    pub downside: Option<String>,
    pub revisit_trigger: Option<String>,
    pub linked_files: Vec<String>,
    pub confidence: Option<String>,
    pub horizon: Option<String>,
    pub reversibility_class: Option<String>,
    pub category: Option<String>,
    pub authority: Option<String>,
    pub supersedes_decision_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RejectedDecision {
    pub id: String,
    pub decision_id: String,
    pub rejection_reason: String,
    pub raw_excerpt: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecisionParse {
    pub decisions: Vec<ParsedDecision>,
    pub rejected: Vec<RejectedDecision>,
    pub warnings: Vec<String>,
}

pub fn parse_decision_blocks(text: &str) -> DecisionParse {
    let mut result = DecisionParse::default();
    for body in fenced_bodies(text, &DECISION_FENCE) {
        let mut parsed = ParsedDecision::default();
        for line in body.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            // camelCase, kebab-case and snake_case keys all normalize to the
            // same lookup token.
            let key: String = key
                .trim()
                .chars()
                .filter(|c| c.is_alphanumeric())
                .collect::<String>()
                .to_lowercase();
            match key.as_str() {
                "decisionid" => parsed.decision_id = value.to_string(),
                "decision" => parsed.decision = value.to_string(),
                "rationale" => parsed.rationale = value.to_string(),
                "downside" => parsed.downside = Some(value.to_string()),
                "revisittrigger" => parsed.revisit_trigger = Some(value.to_string()),
                "linkedfiles" => {
                    parsed.linked_files = value
                        .split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect();
                }
                "confidence" => {
                    parsed.confidence =
                        soft_enum(value, CONFIDENCE, "confidence", &mut result.warnings);
                }
                "horizon" => {
                    parsed.horizon = soft_enum(value, HORIZON, "horizon", &mut result.warnings);
                }
                "reversibilityclass" => {
                    parsed.reversibility_class = soft_enum(
                        value,
                        REVERSIBILITY,
                        "reversibilityClass",
                        &mut result.warnings,
                    );
                }
                "category" => {
                    parsed.category = soft_enum(value, CATEGORY, "category", &mut result.warnings);
                }
                "authority" => parsed.authority = Some(value.to_string()),
                "supersedes" | "supersedesdecisionid" => {
                    parsed.supersedes_decision_id = Some(value.to_string());
                }
                _ => {}
            }
        }

        if parsed.decision_id.is_empty() || parsed.decision.is_empty() || parsed.rationale.is_empty()
        {
            result.rejected.push(RejectedDecision {
                id: short_hash(&body, 8),
                decision_id: parsed.decision_id,
                rejection_reason: REASON_MISSING_FIELDS.to_string(),
                raw_excerpt: excerpt(&body),
            });
            continue;
        }

        let id_len = parsed.decision_id.chars().count();
        if !(3..=64).contains(&id_len) || !KEBAB_ID.is_match(&parsed.decision_id) {
            result.rejected.push(RejectedDecision {
                id: short_hash(&body, 8),
                decision_id: parsed.decision_id,
                rejection_reason: REASON_INVALID_DECISION_ID.to_string(),
                raw_excerpt: excerpt(&body),
            });
            continue;
        }

        result.decisions.push(parsed);
    }
    result
}

fn soft_enum(
    value: &str,
    allowed: &[&str],
    field: &str,
    warnings: &mut Vec<String>,
) -> Option<String> {
    match validate_enum(value, allowed) {
        EnumCheck::Valid(v) => Some(v),
        EnumCheck::Invalid { warning, .. } => {
            warnings.push(format!("{field}: {warning}"));
            None
        }
    }
}

fn fenced_bodies(text: &str, open: &Regex) -> Vec<String> {
    let mut bodies = Vec::new();
    for m in open.find_iter(text) {
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
            bodies.push(body_lines.join("\n"));
        }
    }
    bodies
}
