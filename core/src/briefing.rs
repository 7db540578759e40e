//! Portfolio briefing: health projection, prompt assembly with deterministic
//! compression, and output analysis.

use std::collections::BTreeMap;

use chrono::DateTime;
use chrono::Utc;
use domainos_protocol::DomainRelationship;
use serde::Serialize;

use crate::blocks::briefing::BriefingAction;
use crate::blocks::briefing::BriefingAlert;
use crate::blocks::briefing::BriefingMonitor;
use crate::blocks::briefing::parse_briefing_blocks;
use crate::canonical::stable_hash;
use crate::error::Result;
use crate::health::PortfolioHealth;
use crate::util::truncate_chars;

pub const BRIEFING_TOKEN_BUDGET: usize = 48_000;
pub const DIGEST_INITIAL_CAP_CHARS: usize = 6_000;
pub const DIGEST_FLOOR_CHARS: usize = 500;
pub const DIGEST_HARD_FLOOR_CHARS: usize = 2_000;
pub const QUIET_PLACEHOLDER: &str = "(quiet domain — digest omitted for token budget)";
pub const MISSING_PLACEHOLDER: &str = "(kb_digest.md missing)";

const PROJECTION_DESCRIPTION_CAP: usize = 80;

/// chars / 4, the estimator used for every briefing budget decision.
pub fn estimate_tokens(chars: usize) -> usize {
    chars / 4
}

/// Whitelisted projection of [`PortfolioHealth`] embedded as ground truth.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectedHealthV1 {
    pub schema_version: u32,
    pub snapshot_hash: String,
    pub domains: Vec<ProjectedDomainV1>,
    pub alerts: Vec<ProjectedAlertV1>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectedDomainV1 {
    pub domain_id: String,
    pub domain_name: String,
    pub status: String,
    pub severity_score: i64,
    pub open_gap_flags: u32,
    pub overdue_deadlines: u32,
    pub critical_files: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worst_file: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectedAlertV1 {
    pub source_domain_id: String,
    pub target_domain_id: String,
    pub severity: String,
    pub message: String,
}

pub fn project_health_v1(health: &PortfolioHealth) -> ProjectedHealthV1 {
    let mut domains: Vec<ProjectedDomainV1> = health
        .domains
        .iter()
        .map(|d| ProjectedDomainV1 {
            domain_id: d.domain_id.clone(),
            domain_name: d.domain_name.clone(),
            status: match serde_json::to_value(d.status) {
                Ok(serde_json::Value::String(s)) => s,
                _ => "active".to_string(),
            },
            severity_score: d.severity_score,
            open_gap_flags: d.open_gap_flags,
            overdue_deadlines: d.overdue_deadlines,
            critical_files: d.stale_summary.critical,
            worst_file: d.stale_summary.worst_file.as_ref().map(|w| w.path.clone()),
        })
        .collect();
    domains.sort_by(|a, b| a.domain_id.cmp(&b.domain_id));

    let alerts = health
        .alerts
        .iter()
        .map(|a| ProjectedAlertV1 {
            source_domain_id: a.source_domain_id.clone(),
            target_domain_id: a.target_domain_id.clone(),
            severity: a.severity.clone(),
            message: truncate_chars(&a.message, PROJECTION_DESCRIPTION_CAP),
        })
        .collect();

    ProjectedHealthV1 {
        schema_version: 1,
        snapshot_hash: health.snapshot_hash.clone(),
        domains,
        alerts,
    }
}

/// Which compression step finally fit the budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionStep {
    None,
    InitialCap,
    Proportional,
    QuietPlaceholder,
    HardFloor,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompressedDigest {
    pub domain_id: String,
    pub content: String,
    pub placeholder: bool,
}

/// Deterministic digest compression. Digests arrive keyed by domain id with
/// `None` for a missing `kb_digest.md`; `quiet` lists the domains whose
/// health status is quiet. Runs the pipeline in order, stopping at the first
/// step that fits `char_budget`.
pub fn compress_digests(
    digests: &BTreeMap<String, Option<String>>,
    quiet: &[String],
    char_budget: usize,
) -> (Vec<CompressedDigest>, CompressionStep) {
    let mut out: Vec<CompressedDigest> = digests
        .iter()
        .map(|(id, digest)| match digest {
            Some(content) => CompressedDigest {
                domain_id: id.clone(),
                content: content.clone(),
                placeholder: false,
            },
            None => CompressedDigest {
                domain_id: id.clone(),
                content: MISSING_PLACEHOLDER.to_string(),
                placeholder: true,
            },
        })
        .collect();

    let fits = |digests: &[CompressedDigest]| {
        digests.iter().map(|d| d.content.chars().count()).sum::<usize>() <= char_budget
    };
    if fits(&out) {
        return (out, CompressionStep::None);
    }

    // 1. per-domain initial cap
    for d in out.iter_mut().filter(|d| !d.placeholder) {
        d.content = truncate_chars(&d.content, DIGEST_INITIAL_CAP_CHARS);
    }
    if fits(&out) {
        return (out, CompressionStep::InitialCap);
    }

    // 2. proportional truncation with a per-domain floor; remainder handed
    //    out in domain-id order so the result is deterministic
    let placeholder_chars: usize = out
        .iter()
        .filter(|d| d.placeholder)
        .map(|d| d.content.chars().count())
        .sum();
    let available = char_budget.saturating_sub(placeholder_chars);
    let sizes: Vec<usize> = out
        .iter()
        .filter(|d| !d.placeholder)
        .map(|d| d.content.chars().count())
        .collect();
    let total: usize = sizes.iter().sum();
    if total > 0 {
        // every domain keeps at least the floor (or its full digest when
        // shorter); the budget left over is split proportionally to what
        // each digest has beyond its floor
        let base: Vec<usize> = sizes.iter().map(|s| (*s).min(DIGEST_FLOOR_CHARS)).collect();
        let base_sum: usize = base.iter().sum();
        let remaining = available.saturating_sub(base_sum);
        let excess: Vec<usize> = sizes.iter().zip(&base).map(|(s, b)| s - b).collect();
        let excess_sum: usize = excess.iter().sum();

        let mut targets: Vec<usize> = base.clone();
        if excess_sum > 0 {
            for (target, exc) in targets.iter_mut().zip(&excess) {
                *target += remaining * exc / excess_sum;
            }
        }
        // integer division leaves a remainder; hand it out in id order
        let mut used: usize = targets.iter().sum();
        for (idx, target) in targets.iter_mut().enumerate() {
            if used >= available {
                break;
            }
            let extra = (sizes[idx] - *target).min(available - used);
            *target += extra;
            used += extra;
        }

        let mut t = targets.into_iter();
        for d in out.iter_mut().filter(|d| !d.placeholder) {
            if let Some(target) = t.next() {
                d.content = truncate_chars(&d.content, target);
            }
        }
    }
    if fits(&out) {
        return (out, CompressionStep::Proportional);
    }

    // 3. quiet domains collapse to a placeholder
    for d in out.iter_mut() {
        if !d.placeholder && quiet.contains(&d.domain_id) {
            d.content = QUIET_PLACEHOLDER.to_string();
            d.placeholder = true;
        }
    }
    if fits(&out) {
        return (out, CompressionStep::QuietPlaceholder);
    }

    // 4. last resort: hard per-domain floor
    for d in out.iter_mut().filter(|d| !d.placeholder) {
        d.content = truncate_chars(&d.content, DIGEST_HARD_FLOOR_CHARS);
    }
    (out, CompressionStep::HardFloor)
}

#[derive(Debug, Clone, PartialEq)]
pub struct BriefingPrompt {
    pub text: String,
    pub token_estimate: usize,
    pub context_hash: String,
    pub snapshot_hash: String,
    pub compression: CompressionStep,
}

/// Assemble the full briefing prompt: static ground truth plus compressed
/// digests, deterministic for a given (health, digests, now) input.
pub fn build_briefing_prompt(
    health: &PortfolioHealth,
    relationships: &[DomainRelationship],
    digests: &BTreeMap<String, Option<String>>,
    now: DateTime<Utc>,
    token_budget: usize,
) -> Result<BriefingPrompt> {
    let projected = project_health_v1(health);
    let ground_truth = serde_json::to_string_pretty(&projected)?;

    let mut static_text = String::new();
    static_text.push_str(&format!(
        "# Portfolio briefing\nCurrent date: {}\n\n",
        now.format("%Y-%m-%d")
    ));
    static_text.push_str("## Ground truth\n```json\n");
    static_text.push_str(&ground_truth);
    static_text.push_str("\n```\n\n");

    static_text.push_str("## Computed alerts (do not dismiss or downgrade)\n");
    if health.alerts.is_empty() {
        static_text.push_str("(none)\n");
    }
    for alert in &health.alerts {
        static_text.push_str(&format!(
            "- [{}] {} -> {}: {}\n",
            alert.severity, alert.source_domain_id, alert.target_domain_id, alert.message
        ));
    }
    static_text.push('\n');

    static_text.push_str("## Domain relationships (authoritative)\n");
    static_text.push_str("| source | target | dependency | description |\n");
    static_text.push_str("|---|---|---|---|\n");
    for rel in relationships {
        static_text.push_str(&format!(
            "| {} | {} | {} | {} |\n",
            rel.domain_id, rel.sibling_domain_id, rel.dependency_type, rel.description
        ));
    }
    static_text.push('\n');

    static_text.push_str(OUTPUT_FORMAT_SECTION);
    static_text.push_str(CONSTRAINTS_SECTION);

    let char_budget = token_budget
        .saturating_mul(4)
        .saturating_sub(static_text.chars().count());
    let quiet: Vec<String> = health
        .domains
        .iter()
        .filter(|d| {
            matches!(
                d.status,
                crate::health::DomainHealthStatus::Quiet
            )
        })
        .map(|d| d.domain_id.clone())
        .collect();
    let (compressed, compression) = compress_digests(digests, &quiet, char_budget);

    let mut text = static_text;
    text.push_str("## Domain digests\n");
    for digest in &compressed {
        text.push_str(&format!("### {}\n{}\n\n", digest.domain_id, digest.content));
    }

    let token_estimate = estimate_tokens(text.chars().count());
    let context_hash = stable_hash(&serde_json::json!({
        "snapshotHash": health.snapshot_hash,
        "digests": compressed
            .iter()
            .map(|d| serde_json::json!({"id": d.domain_id, "content": d.content}))
            .collect::<Vec<_>>(),
    }));

    Ok(BriefingPrompt {
        text,
        token_estimate,
        context_hash,
        snapshot_hash: health.snapshot_hash.clone(),
        compression,
    })
}

const OUTPUT_FORMAT_SECTION: &str = "## Output format\n\
Emit findings as fenced blocks, one block per finding:\n\n\
```briefing-alert\ndomain: <domain id>\nseverity: critical|warning|monitor\ntext: <what is wrong>\nevidence: <the ground-truth fields that support it>\n```\n\n\
```briefing-action\ndomain: <domain id>\ntext: <what to do>\npriority: <1-7>\ndeadline: <YYYY-MM-DD or omit>\n```\n\n\
```briefing-monitor\ndomain: <domain id>\ntext: <what to watch>\n```\n\n";

const CONSTRAINTS_SECTION: &str = "## Constraints\n\
- Never dismiss or downgrade a computed alert.\n\
- Reference domains by id, not by name.\n\
- Evidence must quote ground-truth fields, not digest prose.\n\
- At most one alert per (domain, cause).\n\n";

#[derive(Debug, Clone, PartialEq)]
pub struct BriefingAnalysis {
    pub alerts: Vec<BriefingAlert>,
    pub actions: Vec<BriefingAction>,
    pub monitors: Vec<BriefingMonitor>,
    pub diagnostics: Vec<String>,
    pub skipped_blocks: usize,
    pub raw_text: String,
    /// Hash of the portfolio snapshot the analysis was generated against;
    /// a cached analysis is invalid once this stops matching.
    pub snapshot_hash: String,
}

pub fn analyze_briefing_output(raw_text: &str, snapshot_hash: &str) -> BriefingAnalysis {
    let parsed = parse_briefing_blocks(raw_text);
    BriefingAnalysis {
        alerts: parsed.alerts,
        actions: parsed.actions,
        monitors: parsed.monitors,
        diagnostics: parsed.diagnostics,
        skipped_blocks: parsed.skipped_blocks,
        raw_text: raw_text.to_string(),
        snapshot_hash: snapshot_hash.to_string(),
    }
}
