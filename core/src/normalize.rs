//! Enum canonicalization, keyword extraction, date arithmetic.

use chrono::Days;
use chrono::NaiveDate;

/// `trim → lowercase → [\s-]+ → _`. Every enum-ish field the model emits is
/// pushed through this before validation.
pub fn normalize_enum(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_sep = false;
    for ch in raw.trim().chars() {
        if ch.is_whitespace() || ch == '-' {
            pending_sep = !out.is_empty();
            continue;
        }
        if pending_sep {
            out.push('_');
            pending_sep = false;
        }
        out.extend(ch.to_lowercase());
    }
    out
}

/// Common model-emitted synonyms, applied after [`normalize_enum`].
const ENUM_ALIASES: &[(&str, &str)] = &[
    ("riskassessment", "risk_assessment"),
    ("risk", "risk_assessment"),
    ("strategicreview", "strategic_review"),
    ("review", "strategic_review"),
    ("y", "yes"),
    ("true", "yes"),
    ("n", "no"),
    ("false", "no"),
    ("docs", "documentation"),
    ("doc", "documentation"),
    ("finance", "financial"),
    ("security_incident", "security"),
    ("sec", "security"),
    ("tech", "technical"),
    ("ops", "operational"),
];

pub fn resolve_alias(normalized: &str) -> &str {
    for (alias, target) in ENUM_ALIASES {
        if *alias == normalized {
            return target;
        }
    }
    normalized
}

/// Outcome of validating a raw enum-ish value against an allowed set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnumCheck {
    Valid(String),
    /// The value did not normalize into the allowed set. Parsers emit this
    /// as a soft warning and degrade the field rather than rejecting the
    /// whole block.
    Invalid { raw: String, warning: String },
}

pub fn validate_enum(raw: &str, allowed: &[&str]) -> EnumCheck {
    let normalized = resolve_alias(&normalize_enum(raw)).to_string();
    if allowed.contains(&normalized.as_str()) {
        EnumCheck::Valid(normalized)
    } else {
        EnumCheck::Invalid {
            raw: raw.to_string(),
            warning: format!(
                "value `{raw}` is not one of [{}]; field dropped",
                allowed.join(", ")
            ),
        }
    }
}

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "with", "that", "this", "from", "have", "has", "was", "are", "were",
    "will", "would", "should", "could", "been", "being", "about", "after", "before", "into",
    "over", "under", "between", "during", "their", "there", "these", "those", "them", "then",
    "than", "when", "where", "which", "while", "what", "who", "whom", "whose", "why", "how",
    "all", "any", "each", "few", "more", "most", "other", "some", "such", "not", "only", "own",
    "same", "too", "very", "can", "just", "now", "also", "its", "per", "due", "via", "you",
    "your", "our", "out", "off", "on", "in", "of", "to", "is", "it", "as", "at", "by", "an",
    "be", "or", "if", "do", "up", "so", "no", "nor", "but", "new",
];

const MIN_KEYWORD_LEN: usize = 3;

/// Extract up to `max` keywords from free text: lowercased alphanumeric
/// tokens, stopwords and numeric-only tokens removed, 3-char minimum,
/// first-seen order, deduped.
pub fn extract_keywords_from_text(text: &str, max: usize) -> Vec<String> {
    let mut seen: Vec<String> = Vec::new();
    for token in text.split(|c: char| !c.is_alphanumeric()) {
        if seen.len() >= max {
            break;
        }
        let token = token.to_lowercase();
        if token.len() < MIN_KEYWORD_LEN {
            continue;
        }
        if token.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        if STOPWORDS.contains(&token.as_str()) {
            continue;
        }
        if seen.iter().any(|s| s == &token) {
            continue;
        }
        seen.push(token);
    }
    seen
}

pub fn parse_iso_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok()
}

/// Whole days from `from` to `to`; negative when `to` is earlier.
pub fn days_between(from: NaiveDate, to: NaiveDate) -> i64 {
    (to - from).num_days()
}

pub fn add_days(date: NaiveDate, days: u64) -> NaiveDate {
    date.checked_add_days(Days::new(days)).unwrap_or(date)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn normalize_collapses_separators() {
        assert_eq!(normalize_enum("  Risk Assessment "), "risk_assessment");
        assert_eq!(normalize_enum("stale-risk"), "stale_risk");
        assert_eq!(normalize_enum("A  - b"), "a_b");
    }

    #[test]
    fn aliases_map_synonyms() {
        assert_eq!(resolve_alias(&normalize_enum("RiskAssessment")), "risk_assessment");
        assert_eq!(resolve_alias(&normalize_enum("Y")), "yes");
        assert_eq!(resolve_alias(&normalize_enum("docs")), "documentation");
        assert_eq!(resolve_alias(&normalize_enum("finance")), "financial");
        assert_eq!(resolve_alias(&normalize_enum("Security Incident")), "security");
    }

    #[test]
    fn validate_enum_soft_fails() {
        assert_eq!(
            validate_enum("High", &["high", "medium", "low"]),
            EnumCheck::Valid("high".to_string())
        );
        match validate_enum("extreme", &["high", "medium", "low"]) {
            EnumCheck::Invalid { raw, .. } => assert_eq!(raw, "extreme"),
            other => panic!("expected Invalid, got {other:?}"),
        }
    }

    #[test]
    fn keywords_skip_stopwords_numbers_and_short_tokens() {
        let kws = extract_keywords_from_text(
            "Renew the contract before 2025 with ACME for q2 budget review",
            5,
        );
        assert_eq!(kws, vec!["renew", "contract", "acme", "budget", "review"]);
    }

    #[test]
    fn keywords_dedupe_case_insensitively() {
        let kws = extract_keywords_from_text("Budget budget BUDGET planning", 5);
        assert_eq!(kws, vec!["budget", "planning"]);
    }

    #[test]
    fn date_arithmetic() {
        let a = parse_iso_date("2025-06-15").unwrap();
        let b = parse_iso_date("2025-06-29").unwrap();
        assert_eq!(days_between(a, b), 14);
        assert_eq!(days_between(b, a), -14);
        assert_eq!(add_days(a, 14), b);
    }
}
