//! Per-domain status snapshot.
//!
//! Collects the operational picture for one domain at a point in time:
//! overdue and upcoming deadlines, open gap flags, recent decisions and
//! artifacts, audit events since the last session window, a ranked
//! top-action list, and search hints for the mail tools.

use chrono::DateTime;
use chrono::Duration;
use chrono::Utc;
use domainos_protocol::Deadline;
use domainos_protocol::DeadlineStatus;
use domainos_protocol::Decision;
use domainos_protocol::GapFlag;

use crate::error::Result;
use crate::normalize::extract_keywords_from_text;
use crate::store::Store;
use crate::util::truncate_chars;

pub const STATUS_CAP_TOP_ACTIONS: usize = 8;
pub const STATUS_CAP_DEADLINES: usize = 6;
pub const STATUS_CAP_GAP_FLAGS: usize = 6;
pub const STATUS_CAP_AUDIT_EVENTS: usize = 10;
pub const STATUS_CAP_DECISIONS: usize = 5;
pub const STATUS_CAP_ARTIFACTS: usize = 4;
pub const STATUS_SOFT_CAP_CHARS: usize = 3_100;
pub const STATUS_HARD_CAP_CHARS: usize = 3_400;
const KEYWORD_MAX_CHARS: usize = 30;

const UPCOMING_WINDOW_DAYS: i64 = 14;

const DEADLINE_BASE: i64 = 50;
const DEADLINE_PER_DAY: i64 = 3;
const DEADLINE_PER_PRIORITY: i64 = 5;
const PRIORITY_MAX: i64 = 7;
const GAP_BASE: i64 = 30;
const GAP_AGE_BONUS: i64 = 10;
const GAP_AGE_BONUS_DAYS: i64 = 14;

/// Category weights for gap-flag ranking, keyed by the normalized category.
fn gap_category_weight(category: &str) -> i64 {
    match category {
        "security" => 15,
        "financial" | "legal" => 12,
        "compliance" => 10,
        "technical" => 8,
        "process" | "documentation" => 5,
        _ => 0,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinceWindowKind {
    WrappedSession,
    RecentSession,
    None,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SinceWindow {
    pub kind: SinceWindowKind,
    pub since: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OverdueDeadline {
    pub deadline: Deadline,
    pub days_overdue: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopActionSource {
    Deadline,
    GapFlag,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TopAction {
    pub source: TopActionSource,
    pub ref_id: String,
    pub text: String,
    pub score: i64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchHints {
    pub keywords: Vec<String>,
    pub gmail_queries: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DomainStatus {
    pub domain_id: String,
    pub domain_name: String,
    pub generated_at: DateTime<Utc>,
    pub since_window: SinceWindow,
    pub overdue_deadlines: Vec<OverdueDeadline>,
    pub upcoming_deadlines: Vec<Deadline>,
    pub open_gap_flags: Vec<GapFlag>,
    pub recently_resolved: Vec<GapFlag>,
    pub active_decisions: Vec<Decision>,
    /// (title, type) pairs, newest first.
    pub recent_artifacts: Vec<(String, String)>,
    /// (event_type, change_description) pairs since the window.
    pub audit_events: Vec<(String, String)>,
    pub top_actions: Vec<TopAction>,
    pub search_hints: SearchHints,
}

pub fn build_domain_status(
    store: &Store,
    domain_id: &str,
    now: DateTime<Utc>,
) -> Result<DomainStatus> {
    let domain = store.get_domain(domain_id)?;
    let today = now.date_naive();

    let since_window = resolve_since_window(store, domain_id)?;

    let active = store.deadlines_by_status(domain_id, DeadlineStatus::Active)?;
    let mut overdue: Vec<OverdueDeadline> = active
        .iter()
        .filter(|d| d.due_date < today)
        .map(|d| OverdueDeadline {
            deadline: d.clone(),
            days_overdue: (today - d.due_date).num_days(),
        })
        .collect();
    overdue.sort_by(|a, b| {
        b.days_overdue
            .cmp(&a.days_overdue)
            .then(a.deadline.priority.cmp(&b.deadline.priority))
    });
    overdue.truncate(STATUS_CAP_DEADLINES);

    let horizon = today + Duration::days(UPCOMING_WINDOW_DAYS);
    let mut upcoming: Vec<Deadline> = active
        .into_iter()
        .filter(|d| d.due_date >= today && d.due_date <= horizon)
        .collect();
    upcoming.sort_by(|a, b| a.due_date.cmp(&b.due_date).then(a.priority.cmp(&b.priority)));
    upcoming.truncate(STATUS_CAP_DEADLINES);

    let open_gap_flags = store.open_gap_flags(domain_id, STATUS_CAP_GAP_FLAGS)?;
    let recently_resolved = match since_window.since {
        Some(since) => store.recently_resolved_gap_flags(domain_id, since, STATUS_CAP_GAP_FLAGS)?,
        None => Vec::new(),
    };
    let active_decisions = store.active_decisions(domain_id, STATUS_CAP_DECISIONS)?;
    let recent_artifacts = store
        .recent_advisories(domain_id, STATUS_CAP_ARTIFACTS)?
        .into_iter()
        .map(|a| (a.title, a.artifact_type.to_string()))
        .collect();

    // No window means no audit reporting at all.
    let audit_events = match since_window.since {
        Some(since) => store
            .audit_since(domain_id, since, STATUS_CAP_AUDIT_EVENTS)?
            .into_iter()
            .map(|e| (e.event_type, e.change_description))
            .collect(),
        None => Vec::new(),
    };

    let top_actions = rank_top_actions(&overdue, &upcoming, &open_gap_flags, now);
    let search_hints = build_search_hints(&domain.name, &top_actions);

    Ok(DomainStatus {
        domain_id: domain.id,
        domain_name: domain.name,
        generated_at: now,
        since_window,
        overdue_deadlines: overdue,
        upcoming_deadlines: upcoming,
        open_gap_flags,
        recently_resolved,
        active_decisions,
        recent_artifacts,
        audit_events,
        top_actions,
        search_hints,
    })
}

fn resolve_since_window(store: &Store, domain_id: &str) -> Result<SinceWindow> {
    if let Some(session) = store.latest_wrapped_session(domain_id)? {
        return Ok(SinceWindow {
            kind: SinceWindowKind::WrappedSession,
            since: session.ended_at,
        });
    }
    if let Some(session) = store.latest_active_session(domain_id)? {
        return Ok(SinceWindow {
            kind: SinceWindowKind::RecentSession,
            since: Some(session.started_at),
        });
    }
    Ok(SinceWindow {
        kind: SinceWindowKind::None,
        since: None,
    })
}

pub(crate) fn deadline_score(days_overdue: i64, priority: u8) -> i64 {
    DEADLINE_BASE + days_overdue * DEADLINE_PER_DAY + (PRIORITY_MAX - priority as i64) * DEADLINE_PER_PRIORITY
}

pub(crate) fn gap_score(category: &str, age_days: i64) -> i64 {
    let age_bonus = if age_days >= GAP_AGE_BONUS_DAYS {
        GAP_AGE_BONUS
    } else {
        0
    };
    GAP_BASE + gap_category_weight(category) + age_bonus
}

/// Merge deadlines and gap flags into one ranked list. Diversification rule:
/// when any gap flags exist, at least one gap appears in the result even if
/// every deadline outscores it.
fn rank_top_actions(
    overdue: &[OverdueDeadline],
    upcoming: &[Deadline],
    gap_flags: &[GapFlag],
    now: DateTime<Utc>,
) -> Vec<TopAction> {
    let mut actions: Vec<TopAction> = Vec::new();

    for od in overdue {
        actions.push(TopAction {
            source: TopActionSource::Deadline,
            ref_id: od.deadline.id.clone(),
            text: od.deadline.text.clone(),
            score: deadline_score(od.days_overdue, od.deadline.priority),
        });
    }
    for d in upcoming {
        actions.push(TopAction {
            source: TopActionSource::Deadline,
            ref_id: d.id.clone(),
            text: d.text.clone(),
            score: deadline_score(0, d.priority),
        });
    }
    for g in gap_flags {
        let age_days = (now - g.created_at).num_days();
        actions.push(TopAction {
            source: TopActionSource::GapFlag,
            ref_id: g.id.clone(),
            text: g.description.clone(),
            score: gap_score(&g.category, age_days),
        });
    }

    actions.sort_by(|a, b| b.score.cmp(&a.score).then(a.ref_id.cmp(&b.ref_id)));

    let mut top: Vec<TopAction> = actions
        .iter()
        .take(STATUS_CAP_TOP_ACTIONS)
        .cloned()
        .collect();

    let has_gap = !gap_flags.is_empty();
    let gap_included = top.iter().any(|a| a.source == TopActionSource::GapFlag);
    if has_gap && !gap_included {
        if let Some(best_gap) = actions
            .iter()
            .find(|a| a.source == TopActionSource::GapFlag)
            .cloned()
        {
            if top.len() == STATUS_CAP_TOP_ACTIONS {
                top.pop();
            }
            top.push(best_gap);
        }
    }
    top
}

fn build_search_hints(domain_name: &str, top_actions: &[TopAction]) -> SearchHints {
    let combined: String = top_actions
        .iter()
        .map(|a| a.text.as_str())
        .collect::<Vec<_>>()
        .join(" ");

    let mut keywords: Vec<String> = vec![truncate_chars(domain_name, KEYWORD_MAX_CHARS)];
    for kw in extract_keywords_from_text(&combined, 5) {
        let kw = truncate_chars(&kw, KEYWORD_MAX_CHARS);
        if !keywords.iter().any(|k| k.eq_ignore_ascii_case(&kw)) {
            keywords.push(kw);
        }
    }

    let quoted_domain = if domain_name.contains(char::is_whitespace) {
        format!("\"{domain_name}\"")
    } else {
        domain_name.to_string()
    };

    let non_domain = keywords.len().saturating_sub(1);
    let gmail_queries = if non_domain < 2 {
        // too little signal: only the fallback set
        vec![
            quoted_domain.clone(),
            format!("{quoted_domain} newer_than:30d"),
        ]
    } else {
        let mut queries = vec![quoted_domain.clone()];
        for kw in keywords.iter().skip(1).take(3) {
            queries.push(format!("{quoted_domain} {kw}"));
        }
        queries
    };

    SearchHints {
        keywords,
        gmail_queries,
    }
}

/// Render the snapshot as the briefing text that rides in the system prompt.
/// Sections stop being added once the soft cap is passed; the hard cap is a
/// final truncation.
pub fn render_status_briefing(status: &DomainStatus) -> String {
    let mut sections: Vec<String> = Vec::new();

    let mut header = format!("## Status: {}\n", status.domain_name);
    header.push_str(&format!(
        "Generated: {}\n",
        status.generated_at.format("%Y-%m-%d %H:%M UTC")
    ));
    sections.push(header);

    if !status.overdue_deadlines.is_empty() {
        let mut s = String::from("### Overdue\n");
        for od in &status.overdue_deadlines {
            s.push_str(&format!(
                "- [P{}] {} ({} days overdue)\n",
                od.deadline.priority, od.deadline.text, od.days_overdue
            ));
        }
        sections.push(s);
    }
    if !status.upcoming_deadlines.is_empty() {
        let mut s = String::from("### Upcoming (14 days)\n");
        for d in &status.upcoming_deadlines {
            s.push_str(&format!("- [P{}] {} (due {})\n", d.priority, d.text, d.due_date));
        }
        sections.push(s);
    }
    if !status.top_actions.is_empty() {
        let mut s = String::from("### Top actions\n");
        for a in &status.top_actions {
            s.push_str(&format!("- {}\n", a.text));
        }
        sections.push(s);
    }
    if !status.open_gap_flags.is_empty() {
        let mut s = String::from("### Open gaps\n");
        for g in &status.open_gap_flags {
            s.push_str(&format!("- [{}] {}\n", g.category, g.description));
        }
        sections.push(s);
    }
    if !status.recently_resolved.is_empty() {
        let mut s = String::from("### Recently resolved\n");
        for g in &status.recently_resolved {
            s.push_str(&format!("- {}\n", g.description));
        }
        sections.push(s);
    }
    if !status.active_decisions.is_empty() {
        let mut s = String::from("### Active decisions\n");
        for d in &status.active_decisions {
            s.push_str(&format!("- {}: {}\n", d.decision_id, d.decision));
        }
        sections.push(s);
    }
    if !status.recent_artifacts.is_empty() {
        let mut s = String::from("### Recent advisory artifacts\n");
        for (title, ty) in &status.recent_artifacts {
            s.push_str(&format!("- {title} ({ty})\n"));
        }
        sections.push(s);
    }
    if !status.audit_events.is_empty() {
        let mut s = String::from("### Activity since last session\n");
        for (event_type, description) in &status.audit_events {
            s.push_str(&format!("- {event_type}: {description}\n"));
        }
        sections.push(s);
    }

    let mut out = String::new();
    for section in sections {
        if out.chars().count() > STATUS_SOFT_CAP_CHARS {
            break;
        }
        out.push_str(&section);
        out.push('\n');
    }
    truncate_chars(out.trim_end(), STATUS_HARD_CAP_CHARS)
}
