//! Parsers for the two minimal key-value blocks: `gap-flag` and `stop`.

use std::sync::LazyLock;

use regex_lite::Regex;

use crate::canonical::excerpt;
use crate::normalize::normalize_enum;
use crate::normalize::resolve_alias;

#[allow(clippy::unwrap_used)]
static GAP_FLAG_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^```gap-flag[^\n]*$").unwrap());

#[allow(clippy::unwrap_used)]
static STOP_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^```stop[^\n]*$").unwrap());

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedGapFlag {
    /// Normalized per the shared enum rules (aliases applied).
    pub category: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedStop {
    pub reason: String,
    pub action_needed: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MinimalBlockParse<T> {
    pub accepted: Vec<T>,
    /// Excerpts of blocks that were missing a required field.
    pub rejected: Vec<String>,
}

// hand-written so `T: Default` is not required
impl<T> Default for MinimalBlockParse<T> {
    fn default() -> Self {
        Self {
            accepted: Vec::new(),
            rejected: Vec::new(),
        }
    }
}

pub fn parse_gap_flag_blocks(text: &str) -> MinimalBlockParse<ParsedGapFlag> {
    let mut result = MinimalBlockParse::default();
    for body in fenced_bodies(text, &GAP_FLAG_FENCE) {
        let mut category = None;
        let mut description = None;
        for line in body.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            match key.trim().to_lowercase().as_str() {
                "category" => {
                    category = Some(resolve_alias(&normalize_enum(value)).to_string());
                }
                "description" => description = Some(value.to_string()),
                _ => {}
            }
        }
        match (category, description) {
            (Some(category), Some(description)) => {
                result.accepted.push(ParsedGapFlag {
                    category,
                    description,
                });
            }
            _ => result.rejected.push(excerpt(&body)),
        }
    }
    result
}

pub fn parse_stop_blocks(text: &str) -> MinimalBlockParse<ParsedStop> {
    let mut result = MinimalBlockParse::default();
    for body in fenced_bodies(text, &STOP_FENCE) {
        let mut reason = None;
        let mut action_needed = None;
        for line in body.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            let key: String = key
                .trim()
                .chars()
                .filter(|c| c.is_alphanumeric())
                .collect::<String>()
                .to_lowercase();
            match key.as_str() {
                "reason" => reason = Some(value.to_string()),
                "actionneeded" => action_needed = Some(value.to_string()),
                _ => {}
            }
        }
        match (reason, action_needed) {
            (Some(reason), Some(action_needed)) => {
                result.accepted.push(ParsedStop {
                    reason,
                    action_needed,
                });
            }
            _ => result.rejected.push(excerpt(&body)),
        }
    }
    result
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
