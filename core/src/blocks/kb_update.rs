//! Parser for `kb-update` blocks.
//!
//! ````text
//! ```kb-update
//! file: notes/q3.md
//! action: update
//! tier: general
//! mode: append
//! reasoning: capture the new vendor quote
//! ---
//! <new content>
//! ```
//! ````
//!
//! Validation runs as an ordered ladder; the first failing rule names the
//! rejection. Rejected entries preserve source order and carry a
//! deterministic id so the UI can key annotations across re-parses.

use std::sync::LazyLock;

use domainos_protocol::KbTier;
use domainos_protocol::TierSource;
use regex_lite::Regex;

use crate::canonical::excerpt;
use crate::canonical::short_hash;

#[allow(clippy::unwrap_used)]
static KB_UPDATE_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^```kb-update[^\n]*$").unwrap());

pub const REASON_MISSING_FIELDS: &str = "MISSING_FIELDS";
pub const REASON_INVALID_ACTION: &str = "INVALID_ACTION";
pub const REASON_PATH_TRAVERSAL: &str = "PATH_TRAVERSAL";
pub const REASON_STRUCTURAL_REQUIRES_PATCH: &str = "STRUCTURAL_REQUIRES_PATCH";
pub const REASON_STATUS_NO_PATCH: &str = "STATUS_NO_PATCH";
pub const REASON_DELETE_NEEDS_CONFIRM: &str = "DELETE_NEEDS_CONFIRM";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KbAction {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Full,
    Append,
    Patch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Basis {
    Primary,
    Sibling,
    External,
    User,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KbUpdateProposal {
    pub file: String,
    pub action: KbAction,
    pub tier: KbTier,
    pub tier_source: TierSource,
    pub mode: Option<WriteMode>,
    pub basis: Option<Basis>,
    pub reasoning: String,
    pub confirm: Option<String>,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RejectedProposal {
    /// First 8 hex chars of sha256 over the raw block content.
    pub id: String,
    pub file: String,
    pub action: String,
    pub reasoning: String,
    pub rejection_reason: String,
    pub suggested_fix: Option<String>,
    pub raw_excerpt: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct KbUpdateParse {
    pub proposals: Vec<KbUpdateProposal>,
    pub rejected_proposals: Vec<RejectedProposal>,
}

struct RawFields {
    file: Option<String>,
    action: Option<String>,
    tier: Option<String>,
    mode: Option<String>,
    basis: Option<String>,
    reasoning: Option<String>,
    confirm: Option<String>,
    has_separator: bool,
    content: String,
}

pub fn parse_kb_update_blocks(text: &str) -> KbUpdateParse {
    let mut result = KbUpdateParse::default();
    for body in fenced_bodies(text, &KB_UPDATE_FENCE) {
        let fields = split_fields(&body);

        // A block without `file:` is not a kb-update attempt at all.
        let Some(file) = fields.file.clone().filter(|f| !f.is_empty()) else {
            continue;
        };

        let reasoning = fields.reasoning.clone().unwrap_or_default();
        let action_raw = fields.action.clone().unwrap_or_default();

        let reject = |reason: &str, fix: Option<&str>| RejectedProposal {
            id: short_hash(&body, 8),
            file: file.clone(),
            action: action_raw.clone(),
            reasoning: reasoning.clone(),
            rejection_reason: reason.to_string(),
            suggested_fix: fix.map(|s| s.to_string()),
            raw_excerpt: excerpt(&body),
        };

        if action_raw.is_empty() || reasoning.is_empty() || !fields.has_separator {
            result.rejected_proposals.push(reject(
                REASON_MISSING_FIELDS,
                Some("include file:, action:, reasoning: and a --- separator"),
            ));
            continue;
        }

        let action = match action_raw.trim().to_lowercase().as_str() {
            "create" => KbAction::Create,
            "update" => KbAction::Update,
            "delete" => KbAction::Delete,
            _ => {
                result.rejected_proposals.push(reject(
                    REASON_INVALID_ACTION,
                    Some("use one of create, update or delete"),
                ));
                continue;
            }
        };

        if escapes_kb_root(&file) {
            result.rejected_proposals.push(reject(
                REASON_PATH_TRAVERSAL,
                Some("use a path relative to the domain KB root"),
            ));
            continue;
        }

        let (tier, tier_source) = resolve_tier(&file, fields.tier.as_deref());

        let mode = fields.mode.as_deref().and_then(parse_mode);
        if tier == KbTier::Structural && mode != Some(WriteMode::Patch) {
            result.rejected_proposals.push(reject(
                REASON_STRUCTURAL_REQUIRES_PATCH,
                Some("structural files accept mode: patch only"),
            ));
            continue;
        }
        if tier == KbTier::Status && mode == Some(WriteMode::Patch) {
            result.rejected_proposals.push(reject(
                REASON_STATUS_NO_PATCH,
                Some("status files accept mode: full or append"),
            ));
            continue;
        }

        if action == KbAction::Delete {
            let expected = format!("DELETE {file}");
            if fields.confirm.as_deref() != Some(expected.as_str()) {
                result.rejected_proposals.push(reject(
                    REASON_DELETE_NEEDS_CONFIRM,
                    Some("add a confirm: DELETE <file> line matching the file exactly"),
                ));
                continue;
            }
        }

        result.proposals.push(KbUpdateProposal {
            file,
            action,
            tier,
            tier_source,
            mode,
            basis: fields.basis.as_deref().and_then(parse_basis),
            reasoning,
            confirm: fields.confirm.clone(),
            content: fields.content,
        });
    }
    result
}

/// Tier is taken from the declaration when valid, except that the root
/// `claude.md` is always structural and a nested `claude.md` is always
/// downgraded to general.
fn resolve_tier(file: &str, declared: Option<&str>) -> (KbTier, TierSource) {
    let is_root = !file.contains('/');
    let file_name = file.rsplit('/').next().unwrap_or(file).to_lowercase();

    if file_name == "claude.md" {
        return if is_root {
            (KbTier::Structural, TierSource::Inferred)
        } else {
            (KbTier::General, TierSource::Inferred)
        };
    }

    if let Some(declared) = declared {
        match declared.trim().to_lowercase().as_str() {
            // `structural` may only be declared for the root claude.md,
            // which was handled above.
            "structural" => return (KbTier::General, TierSource::Inferred),
            "status" => return (KbTier::Status, TierSource::Declared),
            "intelligence" => return (KbTier::Intelligence, TierSource::Declared),
            "general" => return (KbTier::General, TierSource::Declared),
            _ => {}
        }
    }

    let inferred = match file_name.as_str() {
        "kb_digest.md" => KbTier::Status,
        "kb_intel.md" => KbTier::Intelligence,
        _ => KbTier::General,
    };
    (inferred, TierSource::Inferred)
}

fn escapes_kb_root(file: &str) -> bool {
    let normalized = file.replace('\\', "/");
    if normalized.starts_with('/') {
        return true;
    }
    // windows drive letter or UNC
    if normalized.len() >= 2 && normalized.as_bytes()[1] == b':' {
        return true;
    }
    normalized.split('/').any(|component| component == "..")
}

fn parse_mode(raw: &str) -> Option<WriteMode> {
    match raw.trim().to_lowercase().as_str() {
        "full" => Some(WriteMode::Full),
        "append" => Some(WriteMode::Append),
        "patch" => Some(WriteMode::Patch),
        _ => None,
    }
}

fn parse_basis(raw: &str) -> Option<Basis> {
    match raw.trim().to_lowercase().as_str() {
        "primary" => Some(Basis::Primary),
        "sibling" => Some(Basis::Sibling),
        "external" => Some(Basis::External),
        "user" => Some(Basis::User),
        _ => None,
    }
}

fn split_fields(body: &str) -> RawFields {
    let mut fields = RawFields {
        file: None,
        action: None,
        tier: None,
        mode: None,
        basis: None,
        reasoning: None,
        confirm: None,
        has_separator: false,
        content: String::new(),
    };

    let mut content_lines: Vec<&str> = Vec::new();
    for line in body.lines() {
        if fields.has_separator {
            content_lines.push(line);
            continue;
        }
        if line.trim_end() == "---" {
            fields.has_separator = true;
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim().to_string();
        match key.trim().to_lowercase().as_str() {
            "file" => fields.file = Some(value),
            "action" => fields.action = Some(value),
            "tier" => fields.tier = Some(value),
            "mode" => fields.mode = Some(value),
            "basis" => fields.basis = Some(value),
            "reasoning" => fields.reasoning = Some(value),
            "confirm" => fields.confirm = Some(value),
            _ => {}
        }
    }
    fields.content = content_lines.join("\n");
    fields
}

/// Collect the body of each fence opened by `open` and closed by a line that
/// is exactly three backticks. An unterminated fence is ignored.
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
