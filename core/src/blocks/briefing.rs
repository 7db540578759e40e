//! Tolerant parser for `briefing-alert`, `briefing-action` and
//! `briefing-monitor` blocks.
//!
//! Briefing output comes from a long generation over many domains, so this
//! parser forgives what the strict parsers would not: underscore or
//! capitalized fence spellings, continuation lines, and key lines missing
//! their colon. Everything it forgives is recorded as a diagnostic.

use std::sync::LazyLock;

use regex_lite::Regex;

use crate::normalize::normalize_enum;
use crate::normalize::parse_iso_date;

#[allow(clippy::unwrap_used)]
static BRIEFING_FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?mi)^```[ \t]*briefing[-_](alert|action|monitor)[ \t]*$").unwrap()
});

const MAX_DIAGNOSTICS: usize = 5;

const KNOWN_FIELDS: &[&str] = &["domain", "severity", "text", "evidence", "priority", "deadline"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BriefingSeverity {
    Critical,
    Warning,
    Monitor,
}

impl BriefingSeverity {
    fn parse(raw: &str) -> Option<Self> {
        match normalize_enum(raw).as_str() {
            "critical" => Some(Self::Critical),
            "warning" => Some(Self::Warning),
            "monitor" => Some(Self::Monitor),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::Warning => "warning",
            Self::Monitor => "monitor",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BriefingAlert {
    pub domain: String,
    pub severity: BriefingSeverity,
    pub text: String,
    pub evidence: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BriefingAction {
    pub domain: String,
    pub text: String,
    /// 1 = most urgent, 7 = least.
    pub priority: u8,
    /// `YYYY-MM-DD`, or `"none"` when the model gave no deadline.
    pub deadline: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BriefingMonitor {
    pub domain: String,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BriefingBlockParse {
    pub alerts: Vec<BriefingAlert>,
    pub actions: Vec<BriefingAction>,
    pub monitors: Vec<BriefingMonitor>,
    /// Capped at [`MAX_DIAGNOSTICS`] entries.
    pub diagnostics: Vec<String>,
    pub skipped_blocks: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BriefingKind {
    Alert,
    Action,
    Monitor,
}

pub fn parse_briefing_blocks(text: &str) -> BriefingBlockParse {
    let mut result = BriefingBlockParse::default();

    for (kind, body) in fenced_bodies_with_kind(text, &BRIEFING_FENCE) {
        let fields = parse_fields(&body, &mut result);
        let get = |name: &str| fields.iter().find(|(k, _)| k == name).map(|(_, v)| v.clone());

        match kind {
            BriefingKind::Alert => {
                let domain = get("domain");
                let severity = get("severity").and_then(|s| BriefingSeverity::parse(&s));
                let text = get("text");
                let evidence = get("evidence");
                match (domain, severity, text, evidence) {
                    (Some(domain), Some(severity), Some(text), Some(evidence)) => {
                        result.alerts.push(BriefingAlert {
                            domain,
                            severity,
                            text,
                            evidence,
                        });
                    }
                    _ => skip(&mut result, "briefing-alert missing domain/severity/text/evidence"),
                }
            }
            BriefingKind::Action => {
                let domain = get("domain");
                let text = get("text");
                let priority = get("priority").and_then(|p| p.trim().parse::<u8>().ok());
                let deadline_raw = get("deadline");
                let deadline = match &deadline_raw {
                    None => Some("none".to_string()),
                    Some(d) if parse_iso_date(d).is_some() => Some(d.trim().to_string()),
                    Some(_) => None,
                };
                match (domain, text, priority, deadline) {
                    (Some(domain), Some(text), Some(priority), Some(deadline))
                        if (1..=7).contains(&priority) =>
                    {
                        result.actions.push(BriefingAction {
                            domain,
                            text,
                            priority,
                            deadline,
                        });
                    }
                    _ => skip(
                        &mut result,
                        "briefing-action missing domain/text or invalid priority/deadline",
                    ),
                }
            }
            BriefingKind::Monitor => match (get("domain"), get("text")) {
                (Some(domain), Some(text)) => {
                    result.monitors.push(BriefingMonitor { domain, text });
                }
                _ => skip(&mut result, "briefing-monitor missing domain/text"),
            },
        }
    }
    result
}

fn skip(result: &mut BriefingBlockParse, message: &str) {
    result.skipped_blocks += 1;
    push_diagnostic(&mut result.diagnostics, message);
}

fn push_diagnostic(diagnostics: &mut Vec<String>, message: &str) {
    if diagnostics.len() < MAX_DIAGNOSTICS {
        diagnostics.push(message.to_string());
    }
}

/// Field accumulation: a `key: value` line starts a field, indented or blank
/// lines continue it, a colon-less line starting with a known field name is
/// accepted with a diagnostic, anything else appends to the current field
/// with a diagnostic.
fn parse_fields(body: &str, result: &mut BriefingBlockParse) -> Vec<(String, String)> {
    let mut fields: Vec<(String, String)> = Vec::new();
    let mut current: Option<usize> = None;

    for line in body.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let indented = line.starts_with("  ");

        if !indented {
            if let Some((key, value)) = line.split_once(':') {
                let key = key.trim().to_lowercase();
                if KNOWN_FIELDS.contains(&key.as_str()) {
                    fields.push((key, value.trim().to_string()));
                    current = Some(fields.len() - 1);
                    continue;
                }
            } else {
                let first = line.split_whitespace().next().unwrap_or("").to_lowercase();
                if KNOWN_FIELDS.contains(&first.as_str()) {
                    let rest = line.trim_start()[first.len()..].trim().to_string();
                    fields.push((first.clone(), rest));
                    current = Some(fields.len() - 1);
                    push_diagnostic(
                        &mut result.diagnostics,
                        &format!("field line missing colon: `{first}`"),
                    );
                    continue;
                }
            }
        }

        match current {
            Some(idx) => {
                let (_, value) = &mut fields[idx];
                if !value.is_empty() {
                    value.push(' ');
                }
                value.push_str(line.trim());
                if !indented {
                    push_diagnostic(
                        &mut result.diagnostics,
                        "unrecognized line appended to previous field",
                    );
                }
            }
            None => push_diagnostic(&mut result.diagnostics, "line outside any field ignored"),
        }
    }

    for (_, value) in &mut fields {
        *value = value.trim().to_string();
    }
    fields
}

fn fenced_bodies_with_kind(text: &str, open: &Regex) -> Vec<(BriefingKind, String)> {
    let mut bodies = Vec::new();
    for caps in open.captures_iter(text) {
        #[allow(clippy::unwrap_used)]
        let m = caps.get(0).unwrap();
        #[allow(clippy::unwrap_used)]
        let kind = match caps.get(1).unwrap().as_str().to_lowercase().as_str() {
            "alert" => BriefingKind::Alert,
            "action" => BriefingKind::Action,
            _ => BriefingKind::Monitor,
        };
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
            bodies.push((kind, body_lines.join("\n")));
        }
    }
    bodies
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_all_three_kinds_with_fence_variants() {
        let text = "\
```briefing-alert
domain: ops
severity: critical
text: digest stale for 40 days
evidence: kb_digest.md last synced 2025-05-01
```
```briefing_action
domain: ops
text: refresh the digest
priority: 2
deadline: 2025-07-01
```
```Briefing-Monitor
domain: legal
text: watch the contract renewal window
```
";
        let parsed = parse_briefing_blocks(text);
        assert_eq!(parsed.alerts.len(), 1);
        assert_eq!(parsed.alerts[0].severity, BriefingSeverity::Critical);
        assert_eq!(parsed.actions.len(), 1);
        assert_eq!(parsed.actions[0].priority, 2);
        assert_eq!(parsed.monitors.len(), 1);
        assert_eq!(parsed.skipped_blocks, 0);
    }

    #[test]
    fn continuation_lines_join_with_spaces() {
        let text = "\
```briefing-alert
domain: ops
severity: warning
text: first part
  continues here
  and here
evidence: e
```
";
        let parsed = parse_briefing_blocks(text);
        assert_eq!(parsed.alerts[0].text, "first part continues here and here");
    }

    #[test]
    fn missing_deadline_becomes_none() {
        let text = "```briefing-action\ndomain: d\ntext: t\npriority: 4\n```\n";
        let parsed = parse_briefing_blocks(text);
        assert_eq!(parsed.actions[0].deadline, "none");
    }

    #[test]
    fn colonless_known_field_line_is_accepted_with_diagnostic() {
        let text = "```briefing-monitor\ndomain acme\ntext: watch it\n```\n";
        let parsed = parse_briefing_blocks(text);
        assert_eq!(parsed.monitors.len(), 1);
        assert_eq!(parsed.monitors[0].domain, "acme");
        assert!(parsed.diagnostics[0].contains("missing colon"));
    }

    #[test]
    fn out_of_range_priority_skips_block() {
        let text = "```briefing-action\ndomain: d\ntext: t\npriority: 9\n```\n";
        let parsed = parse_briefing_blocks(text);
        assert_eq!(parsed.actions, vec![]);
        assert_eq!(parsed.skipped_blocks, 1);
    }

    #[test]
    fn diagnostics_cap_at_five() {
        let mut text = String::new();
        for _ in 0..8 {
            text.push_str("```briefing-monitor\ntext only no domain\n```\n");
        }
        let parsed = parse_briefing_blocks(&text);
        assert_eq!(parsed.skipped_blocks, 8);
        assert_eq!(parsed.diagnostics.len(), 5);
    }
}
