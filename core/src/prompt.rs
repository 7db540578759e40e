//! Per-turn system prompt assembly.
//!
//! The prompt is built from the domain identity, protocols, tiered KB
//! excerpts, the status briefing, sibling digests and the advisory protocol,
//! under a token budget. A manifest records what went in, which files were
//! included and the per-section token estimates, so the UI can show exactly
//! what the agent saw.

use domainos_protocol::Domain;
use domainos_protocol::DomainProtocol;
use domainos_protocol::KbFile;
use domainos_protocol::KbTier;
use domainos_protocol::SharedProtocol;
use tracing::warn;

use crate::briefing::estimate_tokens;
use crate::error::Result;
use crate::util::truncate_bytes;

/// Per-file byte cap; larger KB files are truncated, not skipped.
pub const KB_FILE_MAX_BYTES: usize = 32 * 1024;

pub const DEFAULT_ADVISORY_PROTOCOL: &str = "\
## Advisory output\n\
For strategic analysis, emit an `advisory-<type>` fenced JSON block where\n\
<type> is one of brainstorm, risk_assessment, scenario, strategic_review.\n\
Include schemaVersion, type, title and persist (yes|no|archive) alongside\n\
the typed payload. At most two advisory blocks are honored per response.\n";

#[derive(Debug, Clone, PartialEq)]
pub struct PromptSection {
    pub name: String,
    pub chars: usize,
    pub token_estimate: usize,
    /// KB files included in this section, in inclusion order.
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PromptManifest {
    pub sections: Vec<PromptSection>,
    pub total_token_estimate: usize,
    /// Files dropped because the budget ran out before their tier.
    pub skipped_files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SystemPrompt {
    pub text: String,
    pub manifest: PromptManifest,
}

#[derive(Debug, Clone, Default)]
pub struct PromptInputs {
    pub kb_files: Vec<KbFile>,
    pub protocols: Vec<DomainProtocol>,
    pub shared_protocols: Vec<SharedProtocol>,
    /// (sibling domain name, digest content) pairs.
    pub sibling_digests: Vec<(String, String)>,
    pub status_briefing: Option<String>,
    pub conversation_summary: Option<String>,
    pub advisory_protocol: Option<String>,
}

fn tier_rank(tier: KbTier) -> u8 {
    match tier {
        KbTier::Structural => 0,
        KbTier::Status => 1,
        KbTier::Intelligence => 2,
        KbTier::General => 3,
    }
}

fn push_section(
    text: &mut String,
    manifest: &mut PromptManifest,
    name: &str,
    body: String,
    files: Vec<String>,
) {
    if body.is_empty() {
        return;
    }
    let chars = body.chars().count();
    manifest.sections.push(PromptSection {
        name: name.to_string(),
        chars,
        token_estimate: estimate_tokens(chars),
        files,
    });
    text.push_str(&body);
    if !body.ends_with('\n') {
        text.push('\n');
    }
    text.push('\n');
}

pub async fn build_system_prompt(
    domain: &Domain,
    inputs: &PromptInputs,
    token_budget: usize,
) -> Result<SystemPrompt> {
    let mut text = String::new();
    let mut manifest = PromptManifest::default();

    // identity first: who the agent is for this domain
    let mut identity = format!("# {}\n", domain.name);
    if !domain.identity.is_empty() {
        identity.push_str(&domain.identity);
        identity.push('\n');
    }
    if !domain.escalation_triggers.is_empty() {
        identity.push_str("\nEscalate immediately when any of these apply:\n");
        for trigger in &domain.escalation_triggers {
            identity.push_str(&format!("- {trigger}\n"));
        }
    }
    push_section(&mut text, &mut manifest, "identity", identity, vec![]);

    let mut protocols = String::new();
    for p in &inputs.shared_protocols {
        protocols.push_str(&format!("## {}\n{}\n", p.name, p.content));
    }
    for p in &inputs.protocols {
        protocols.push_str(&format!("## {}\n{}\n", p.name, p.content));
    }
    push_section(&mut text, &mut manifest, "protocols", protocols, vec![]);

    // tiered KB excerpts, most load-bearing tiers first, until the budget is
    // spent
    let mut ordered: Vec<&KbFile> = inputs.kb_files.iter().collect();
    ordered.sort_by(|a, b| {
        tier_rank(a.tier)
            .cmp(&tier_rank(b.tier))
            .then(a.relative_path.cmp(&b.relative_path))
    });

    let mut kb_body = String::new();
    let mut included: Vec<String> = Vec::new();
    for file in ordered {
        let spent = estimate_tokens(text.chars().count() + kb_body.chars().count());
        if spent >= token_budget {
            manifest.skipped_files.push(file.relative_path.clone());
            continue;
        }
        let path = domain.kb_path.join(&file.relative_path);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) => {
                warn!(file = %file.relative_path, error = %e, "kb file unreadable; skipping");
                manifest.skipped_files.push(file.relative_path.clone());
                continue;
            }
        };
        let capped = truncate_bytes(&content, KB_FILE_MAX_BYTES);
        kb_body.push_str(&format!(
            "### {} [{}]\n{}\n",
            file.relative_path, file.tier, capped
        ));
        included.push(file.relative_path.clone());
    }
    push_section(&mut text, &mut manifest, "knowledge_base", kb_body, included);

    if let Some(summary) = &inputs.conversation_summary {
        push_section(
            &mut text,
            &mut manifest,
            "conversation_summary",
            format!("## Earlier conversation\n{summary}\n"),
            vec![],
        );
    }

    if let Some(briefing) = &inputs.status_briefing {
        push_section(&mut text, &mut manifest, "status_briefing", briefing.clone(), vec![]);
    }

    if !inputs.sibling_digests.is_empty() {
        let mut digests = String::from("## Sibling domains\n");
        for (name, digest) in &inputs.sibling_digests {
            digests.push_str(&format!("### {name}\n{digest}\n"));
        }
        push_section(&mut text, &mut manifest, "sibling_digests", digests, vec![]);
    }

    let advisory = inputs
        .advisory_protocol
        .clone()
        .unwrap_or_else(|| DEFAULT_ADVISORY_PROTOCOL.to_string());
    push_section(&mut text, &mut manifest, "advisory_protocol", advisory, vec![]);

    manifest.total_token_estimate = estimate_tokens(text.chars().count());
    Ok(SystemPrompt { text, manifest })
}

/// Pluggable classifier for "is the user asking for a status rundown".
pub trait StatusIntentClassifier: Send + Sync {
    fn is_status_query(&self, text: &str) -> bool;
}

/// Conservative keyword default.
#[derive(Debug, Clone, Default)]
pub struct KeywordStatusIntent;

const STATUS_PHRASES: &[&str] = &[
    "status",
    "overdue",
    "what's pending",
    "whats pending",
    "catch me up",
    "where do we stand",
    "deadlines",
    "open items",
];

impl StatusIntentClassifier for KeywordStatusIntent {
    fn is_status_query(&self, text: &str) -> bool {
        let lowered = text.to_lowercase();
        STATUS_PHRASES.iter().any(|p| lowered.contains(p))
    }
}

pub fn detect_status_intent(classifier: &dyn StatusIntentClassifier, text: &str) -> bool {
    classifier.is_status_query(text)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use chrono::Utc;
    use domainos_protocol::TierSource;
    use pretty_assertions::assert_eq;

    fn domain(kb_path: &std::path::Path) -> Domain {
        Domain {
            id: "d1".to_string(),
            name: "Vendor Ops".to_string(),
            kb_path: kb_path.to_path_buf(),
            identity: "You steward vendor relationships.".to_string(),
            escalation_triggers: vec!["legal exposure".to_string()],
            allow_gmail: false,
            model_provider: None,
            model_name: None,
            force_tool_attempt: false,
            sort_order: 0,
        }
    }

    fn kb_file(path: &str, tier: KbTier) -> KbFile {
        KbFile {
            id: path.to_string(),
            domain_id: "d1".to_string(),
            relative_path: path.to_string(),
            content_hash: "h".to_string(),
            size_bytes: 0,
            last_synced_at: Utc::now(),
            tier,
            tier_source: TierSource::Inferred,
        }
    }

    #[tokio::test]
    async fn sections_assemble_in_order_with_manifest() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("claude.md"), "structure doc").unwrap();
        std::fs::write(dir.path().join("notes.md"), "general notes").unwrap();

        let inputs = PromptInputs {
            kb_files: vec![
                kb_file("notes.md", KbTier::General),
                kb_file("claude.md", KbTier::Structural),
            ],
            status_briefing: Some("## Status: Vendor Ops\n(nothing urgent)".to_string()),
            sibling_digests: vec![("Legal".to_string(), "contract review ongoing".to_string())],
            ..Default::default()
        };
        let prompt = build_system_prompt(&domain(dir.path()), &inputs, 10_000)
            .await
            .unwrap();

        assert!(prompt.text.starts_with("# Vendor Ops"));
        // structural tier is included before general
        let claude_pos = prompt.text.find("claude.md").unwrap();
        let notes_pos = prompt.text.find("notes.md").unwrap();
        assert!(claude_pos < notes_pos);

        let names: Vec<&str> = prompt
            .manifest
            .sections
            .iter()
            .map(|s| s.name.as_str())
            .collect();
        assert_eq!(
            names,
            vec![
                "identity",
                "knowledge_base",
                "status_briefing",
                "sibling_digests",
                "advisory_protocol"
            ]
        );
        let kb = &prompt.manifest.sections[1];
        assert_eq!(kb.files, vec!["claude.md", "notes.md"]);
        assert!(prompt.manifest.total_token_estimate > 0);
    }

    #[tokio::test]
    async fn budget_exhaustion_skips_later_tiers() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("claude.md"), "x".repeat(4_000)).unwrap();
        std::fs::write(dir.path().join("notes.md"), "general notes").unwrap();

        let inputs = PromptInputs {
            kb_files: vec![
                kb_file("claude.md", KbTier::Structural),
                kb_file("notes.md", KbTier::General),
            ],
            ..Default::default()
        };
        // enough for the structural file only
        let prompt = build_system_prompt(&domain(dir.path()), &inputs, 1_000)
            .await
            .unwrap();
        assert_eq!(prompt.manifest.skipped_files, vec!["notes.md"]);
    }

    #[tokio::test]
    async fn missing_kb_file_is_skipped_with_manifest_note() {
        let dir = tempfile::tempdir().unwrap();
        let inputs = PromptInputs {
            kb_files: vec![kb_file("ghost.md", KbTier::General)],
            ..Default::default()
        };
        let prompt = build_system_prompt(&domain(dir.path()), &inputs, 10_000)
            .await
            .unwrap();
        assert_eq!(prompt.manifest.skipped_files, vec!["ghost.md"]);
    }

    #[test]
    fn keyword_intent_classifier_matches_conservatively() {
        let classifier = KeywordStatusIntent;
        assert!(detect_status_intent(&classifier, "Catch me up on this domain"));
        assert!(detect_status_intent(&classifier, "anything overdue?"));
        assert!(!detect_status_intent(&classifier, "draft an email to ACME"));
    }
}
