//! Portfolio health engine.
//!
//! Scores every domain from its KB staleness, open gap flags and overdue
//! deadlines, classifies it into a status, derives cross-domain alerts along
//! the dependency graph, and hashes the whole structure. The snapshot hash
//! is the sole staleness signal for the briefing analysis layer.

use std::collections::BTreeMap;

use chrono::DateTime;
use chrono::Utc;
use domainos_protocol::Deadline;
use domainos_protocol::DeadlineStatus;
use domainos_protocol::DependencyType;
use domainos_protocol::KbTier;
use serde::Deserialize;
use serde::Serialize;

use crate::canonical::stable_hash;
use crate::error::Result;
use crate::store::Store;

const FRESH_MAX_DAYS: i64 = 7;
const STALE_MAX_DAYS: i64 = 30;
const QUIET_AFTER_DAYS: i64 = 14;
const DEADLINE_SEVERITY_CAP: i64 = 12;

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub enum DomainHealthStatus {
    #[serde(rename = "active")]
    Active,
    #[serde(rename = "quiet")]
    Quiet,
    #[serde(rename = "stale-risk")]
    StaleRisk,
    #[serde(rename = "blocked")]
    Blocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Staleness {
    Fresh,
    Stale,
    Critical,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorstFile {
    pub path: String,
    pub tier: String,
    pub days_stale: i64,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StaleSummary {
    pub fresh: u32,
    pub stale: u32,
    pub critical: u32,
    pub fresh_by_tier: BTreeMap<String, u32>,
    pub stale_by_tier: BTreeMap<String, u32>,
    pub critical_by_tier: BTreeMap<String, u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worst_file: Option<WorstFile>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DependencyEdge {
    pub domain_id: String,
    pub dependency_type: DependencyType,
    pub description: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DomainHealth {
    pub domain_id: String,
    pub domain_name: String,
    pub status: DomainHealthStatus,
    pub file_count_total: u32,
    pub file_count_stat_checked: u32,
    pub stale_summary: StaleSummary,
    pub open_gap_flags: u32,
    pub overdue_deadlines: u32,
    pub severity_score: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_touched_at: Option<DateTime<Utc>>,
    pub outgoing_deps: Vec<DependencyEdge>,
    pub incoming_deps: Vec<DependencyEdge>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AlertTrace {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_tier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_staleness: Option<i64>,
    pub dependency_type: DependencyType,
    pub base_severity: i64,
    pub escalated: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CrossDomainAlert {
    pub source_domain_id: String,
    pub target_domain_id: String,
    /// `critical`, `warning` or `monitor`.
    pub severity: String,
    pub message: String,
    pub trace: AlertTrace,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioHealth {
    pub domains: Vec<DomainHealth>,
    pub alerts: Vec<CrossDomainAlert>,
    pub snapshot_hash: String,
}

/// Tier weight for staleness scoring: losing currency on structural or
/// status files hurts more than on general notes.
fn tier_weight(tier: KbTier) -> i64 {
    match tier {
        KbTier::Structural | KbTier::Status => 3,
        KbTier::Intelligence => 2,
        KbTier::General => 1,
    }
}

fn staleness_of(days: i64) -> Staleness {
    if days <= FRESH_MAX_DAYS {
        Staleness::Fresh
    } else if days <= STALE_MAX_DAYS {
        Staleness::Stale
    } else {
        Staleness::Critical
    }
}

fn staleness_factor(staleness: Staleness) -> i64 {
    match staleness {
        Staleness::Fresh => 0,
        Staleness::Stale => 1,
        Staleness::Critical => 3,
    }
}

/// Overdue deadline contribution: P1/P2 -> 4, P3/P4 -> 2, P5+ -> 1.
/// Zero for anything not active or not overdue at `today`.
pub fn deadline_severity_weight(deadline: &Deadline, today: chrono::NaiveDate) -> i64 {
    if deadline.status != DeadlineStatus::Active || deadline.due_date >= today {
        return 0;
    }
    match deadline.priority {
        1 | 2 => 4,
        3 | 4 => 2,
        _ => 1,
    }
}

pub fn build_portfolio_health(store: &Store, now: DateTime<Utc>) -> Result<PortfolioHealth> {
    let today = now.date_naive();
    let relationships = store.list_relationships()?;

    let mut domains = store.list_domains()?;
    domains.sort_by(|a, b| a.id.cmp(&b.id));

    let mut healths: Vec<DomainHealth> = Vec::with_capacity(domains.len());
    for domain in &domains {
        let files = store.list_kb_files(&domain.id)?;
        let mut summary = StaleSummary::default();
        let mut staleness_score = 0i64;
        let mut last_touched: Option<DateTime<Utc>> = None;
        let mut worst: Option<WorstFile> = None;

        for file in &files {
            let days = (now - file.last_synced_at).num_days();
            let staleness = staleness_of(days);
            let tier_key = file.tier.to_string();
            match staleness {
                Staleness::Fresh => {
                    summary.fresh += 1;
                    *summary.fresh_by_tier.entry(tier_key).or_default() += 1;
                }
                Staleness::Stale => {
                    summary.stale += 1;
                    *summary.stale_by_tier.entry(tier_key).or_default() += 1;
                }
                Staleness::Critical => {
                    summary.critical += 1;
                    *summary.critical_by_tier.entry(tier_key).or_default() += 1;
                }
            }
            staleness_score += tier_weight(file.tier) * staleness_factor(staleness);
            if last_touched.is_none_or(|t| file.last_synced_at > t) {
                last_touched = Some(file.last_synced_at);
            }
            let weighted_days = days * tier_weight(file.tier);
            let current_worst = worst
                .as_ref()
                .map(|w| w.days_stale * tier_weight_by_name(&w.tier))
                .unwrap_or(-1);
            if staleness != Staleness::Fresh && weighted_days > current_worst {
                worst = Some(WorstFile {
                    path: file.relative_path.clone(),
                    tier: file.tier.to_string(),
                    days_stale: days,
                });
            }
        }
        summary.worst_file = worst;

        let open_gaps = store.open_gap_flags(&domain.id, usize::MAX / 2)?.len() as u32;
        let active_deadlines = store.deadlines_by_status(&domain.id, DeadlineStatus::Active)?;
        let overdue: Vec<&Deadline> = active_deadlines
            .iter()
            .filter(|d| d.due_date < today)
            .collect();
        let deadline_component: i64 = overdue
            .iter()
            .map(|d| deadline_severity_weight(d, today))
            .sum::<i64>()
            .min(DEADLINE_SEVERITY_CAP);

        let days_since_touch = last_touched.map(|t| (now - t).num_days());
        let status = classify(
            summary.critical,
            open_gaps,
            days_since_touch,
            files.is_empty(),
        );

        let outgoing: Vec<DependencyEdge> = relationships
            .iter()
            .filter(|r| r.domain_id == domain.id)
            .map(|r| DependencyEdge {
                domain_id: r.sibling_domain_id.clone(),
                dependency_type: r.dependency_type,
                description: r.description.clone(),
            })
            .collect();
        let incoming: Vec<DependencyEdge> = relationships
            .iter()
            .filter(|r| r.sibling_domain_id == domain.id)
            .map(|r| DependencyEdge {
                domain_id: r.domain_id.clone(),
                dependency_type: r.dependency_type,
                description: r.description.clone(),
            })
            .collect();

        healths.push(DomainHealth {
            domain_id: domain.id.clone(),
            domain_name: domain.name.clone(),
            status,
            file_count_total: files.len() as u32,
            file_count_stat_checked: files.len() as u32,
            stale_summary: summary,
            open_gap_flags: open_gaps,
            overdue_deadlines: overdue.len() as u32,
            severity_score: staleness_score + deadline_component,
            last_touched_at: last_touched,
            outgoing_deps: outgoing,
            incoming_deps: incoming,
        });
    }

    let alerts = derive_alerts(&healths);
    let snapshot_hash = snapshot_hash(&healths, &alerts)?;

    Ok(PortfolioHealth {
        domains: healths,
        alerts,
        snapshot_hash,
    })
}

fn tier_weight_by_name(name: &str) -> i64 {
    match name {
        "structural" | "status" => 3,
        "intelligence" => 2,
        _ => 1,
    }
}

/// Deterministic classification from criticals, open gaps and idle time.
fn classify(
    criticals: u32,
    open_gaps: u32,
    days_since_touch: Option<i64>,
    no_files: bool,
) -> DomainHealthStatus {
    if criticals >= 3 || (criticals >= 1 && open_gaps >= 2) {
        return DomainHealthStatus::Blocked;
    }
    if criticals >= 1 || days_since_touch.is_some_and(|d| d > STALE_MAX_DAYS) {
        return DomainHealthStatus::StaleRisk;
    }
    if no_files || days_since_touch.is_some_and(|d| d > QUIET_AFTER_DAYS) {
        return DomainHealthStatus::Quiet;
    }
    DomainHealthStatus::Active
}

fn derive_alerts(healths: &[DomainHealth]) -> Vec<CrossDomainAlert> {
    let mut alerts = Vec::new();
    for source in healths {
        if !matches!(
            source.status,
            DomainHealthStatus::StaleRisk | DomainHealthStatus::Blocked
        ) {
            continue;
        }
        for dep in &source.outgoing_deps {
            let severity = match dep.dependency_type {
                DependencyType::Blocks | DependencyType::DependsOn => "critical",
                DependencyType::Informs => "warning",
                DependencyType::MonitorOnly => "monitor",
                DependencyType::Parallel => continue,
            };
            let worst = source.stale_summary.worst_file.as_ref();
            alerts.push(CrossDomainAlert {
                source_domain_id: source.domain_id.clone(),
                target_domain_id: dep.domain_id.clone(),
                severity: severity.to_string(),
                message: format!(
                    "{} is {} and {} depends on it ({})",
                    source.domain_name,
                    match source.status {
                        DomainHealthStatus::Blocked => "blocked",
                        _ => "at stale-risk",
                    },
                    dep.domain_id,
                    dep.dependency_type,
                ),
                trace: AlertTrace {
                    trigger_file: worst.map(|w| w.path.clone()),
                    trigger_tier: worst.map(|w| w.tier.clone()),
                    trigger_staleness: worst.map(|w| w.days_stale),
                    dependency_type: dep.dependency_type,
                    base_severity: source.severity_score,
                    escalated: source.status == DomainHealthStatus::Blocked,
                },
            });
        }
    }
    alerts
}

fn snapshot_hash(domains: &[DomainHealth], alerts: &[CrossDomainAlert]) -> Result<String> {
    let value = serde_json::json!({
        "domains": serde_json::to_value(domains)?,
        "alerts": serde_json::to_value(alerts)?,
    });
    Ok(stable_hash(&value))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use chrono::Duration;
    use chrono::NaiveDate;
    use domainos_protocol::Domain;
    use domainos_protocol::DomainRelationship;
    use domainos_protocol::GapFlag;
    use domainos_protocol::GapFlagStatus;
    use domainos_protocol::KbFile;
    use domainos_protocol::TierSource;
    use pretty_assertions::assert_eq;

    fn insert_domain(store: &Store, id: &str) {
        store
            .upsert_domain(&Domain {
                id: id.to_string(),
                name: id.to_uppercase(),
                kb_path: format!("/kb/{id}").into(),
                identity: String::new(),
                escalation_triggers: vec![],
                allow_gmail: false,
                model_provider: None,
                model_name: None,
                force_tool_attempt: false,
                sort_order: 0,
            })
            .unwrap();
    }

    fn insert_file(store: &Store, domain: &str, path: &str, tier: KbTier, synced: DateTime<Utc>) {
        store
            .upsert_kb_file(&KbFile {
                id: format!("{domain}-{path}"),
                domain_id: domain.to_string(),
                relative_path: path.to_string(),
                content_hash: "h".to_string(),
                size_bytes: 1,
                last_synced_at: synced,
                tier,
                tier_source: TierSource::Inferred,
            })
            .unwrap();
    }

    fn now() -> DateTime<Utc> {
        NaiveDate::from_ymd_opt(2025, 6, 15)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
            .and_utc()
    }

    #[test]
    fn deadline_weight_zero_unless_active_and_overdue() {
        let today = now().date_naive();
        let mut d = Deadline {
            id: "d".to_string(),
            domain_id: "x".to_string(),
            text: String::new(),
            due_date: today - Duration::days(1),
            priority: 1,
            status: DeadlineStatus::Active,
            source: String::new(),
            source_ref: String::new(),
            snoozed_until: None,
            completed_at: None,
            cancelled_at: None,
            created_at: now(),
        };
        assert_eq!(deadline_severity_weight(&d, today), 4);
        d.priority = 4;
        assert_eq!(deadline_severity_weight(&d, today), 2);
        d.priority = 6;
        assert_eq!(deadline_severity_weight(&d, today), 1);
        d.due_date = today;
        assert_eq!(deadline_severity_weight(&d, today), 0);
        d.due_date = today - Duration::days(1);
        d.status = DeadlineStatus::Snoozed;
        assert_eq!(deadline_severity_weight(&d, today), 0);
    }

    #[test]
    fn fresh_domain_is_active_and_scores_zero() {
        let store = Store::open_in_memory().unwrap();
        insert_domain(&store, "a");
        insert_file(&store, "a", "claude.md", KbTier::Structural, now() - Duration::days(1));
        let health = build_portfolio_health(&store, now()).unwrap();
        assert_eq!(health.domains[0].status, DomainHealthStatus::Active);
        assert_eq!(health.domains[0].severity_score, 0);
        assert_eq!(health.alerts, vec![]);
    }

    #[test]
    fn critical_files_push_stale_risk_then_blocked() {
        let store = Store::open_in_memory().unwrap();
        insert_domain(&store, "a");
        insert_file(&store, "a", "kb_digest.md", KbTier::Status, now() - Duration::days(45));
        let health = build_portfolio_health(&store, now()).unwrap();
        assert_eq!(health.domains[0].status, DomainHealthStatus::StaleRisk);
        // structural weight 3 * critical factor 3
        assert_eq!(health.domains[0].severity_score, 9);

        for (i, flag) in ["g1", "g2"].iter().enumerate() {
            store
                .insert_gap_flag(&GapFlag {
                    id: flag.to_string(),
                    domain_id: "a".to_string(),
                    session_id: None,
                    category: "technical".to_string(),
                    description: format!("gap {i}"),
                    source_message: String::new(),
                    status: GapFlagStatus::Open,
                    resolved_at: None,
                    created_at: now(),
                    updated_at: now(),
                })
                .unwrap();
        }
        let health = build_portfolio_health(&store, now()).unwrap();
        assert_eq!(health.domains[0].status, DomainHealthStatus::Blocked);
    }

    #[test]
    fn alerts_follow_dependency_type() {
        let store = Store::open_in_memory().unwrap();
        insert_domain(&store, "a");
        insert_domain(&store, "b");
        insert_domain(&store, "c");
        insert_file(&store, "a", "kb_digest.md", KbTier::Status, now() - Duration::days(45));
        for (target, dep) in [("b", DependencyType::Blocks), ("c", DependencyType::Informs)] {
            store
                .upsert_relationship(&DomainRelationship {
                    domain_id: "a".to_string(),
                    sibling_domain_id: target.to_string(),
                    relationship_type: "upstream".to_string(),
                    dependency_type: dep,
                    description: String::new(),
                })
                .unwrap();
        }

        let health = build_portfolio_health(&store, now()).unwrap();
        assert_eq!(health.alerts.len(), 2);
        let severities: Vec<(&str, &str)> = health
            .alerts
            .iter()
            .map(|a| (a.target_domain_id.as_str(), a.severity.as_str()))
            .collect();
        assert_eq!(severities, vec![("b", "critical"), ("c", "warning")]);
        let trace = &health.alerts[0].trace;
        assert_eq!(trace.trigger_file.as_deref(), Some("kb_digest.md"));
        assert!(!trace.escalated);
    }

    #[test]
    fn snapshot_hash_changes_with_state() {
        let store = Store::open_in_memory().unwrap();
        insert_domain(&store, "a");
        insert_file(&store, "a", "notes.md", KbTier::General, now() - Duration::days(1));
        let h1 = build_portfolio_health(&store, now()).unwrap().snapshot_hash;
        let h1_again = build_portfolio_health(&store, now()).unwrap().snapshot_hash;
        assert_eq!(h1, h1_again);

        insert_file(&store, "a", "more.md", KbTier::General, now() - Duration::days(2));
        let h2 = build_portfolio_health(&store, now()).unwrap().snapshot_hash;
        assert_ne!(h1, h2);
    }
}
