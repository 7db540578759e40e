//! Decision, gap-flag and deadline repositories.

use chrono::DateTime;
use chrono::NaiveDate;
use chrono::Utc;
use domainos_protocol::Deadline;
use domainos_protocol::DeadlineStatus;
use domainos_protocol::Decision;
use domainos_protocol::DecisionStatus;
use domainos_protocol::GapFlag;
use domainos_protocol::GapFlagStatus;
use rusqlite::Row;
use rusqlite::params;

use super::Store;
use super::parse_ts;
use super::parse_ts_opt;
use super::to_ts;
use crate::error::DomainOsErr;
use crate::error::Result;

fn decision_from_row(row: &Row<'_>) -> rusqlite::Result<Decision> {
    let linked: String = row.get("linked_files")?;
    let status: String = row.get("status")?;
    Ok(Decision {
        id: row.get("id")?,
        domain_id: row.get("domain_id")?,
        session_id: row.get("session_id")?,
        decision_id: row.get("decision_id")?,
        decision: row.get("decision")?,
        rationale: row.get("rationale")?,
        downside: row.get("downside")?,
        revisit_trigger: row.get("revisit_trigger")?,
        linked_files: serde_json::from_str(&linked).unwrap_or_default(),
        status: status.parse().unwrap_or(DecisionStatus::Active),
        supersedes_decision_id: row.get("supersedes_decision_id")?,
        confidence: row.get("confidence")?,
        horizon: row.get("horizon")?,
        reversibility_class: row.get("reversibility_class")?,
        category: row.get("category")?,
        authority: row.get("authority")?,
        created_at: parse_ts(&row.get::<_, String>("created_at")?),
        updated_at: parse_ts(&row.get::<_, String>("updated_at")?),
    })
}

fn gap_flag_from_row(row: &Row<'_>) -> rusqlite::Result<GapFlag> {
    let status: String = row.get("status")?;
    Ok(GapFlag {
        id: row.get("id")?,
        domain_id: row.get("domain_id")?,
        session_id: row.get("session_id")?,
        category: row.get("category")?,
        description: row.get("description")?,
        source_message: row.get("source_message")?,
        status: status.parse().unwrap_or(GapFlagStatus::Open),
        resolved_at: parse_ts_opt(row.get("resolved_at")?),
        created_at: parse_ts(&row.get::<_, String>("created_at")?),
        updated_at: parse_ts(&row.get::<_, String>("updated_at")?),
    })
}

fn deadline_from_row(row: &Row<'_>) -> rusqlite::Result<Deadline> {
    let status: String = row.get("status")?;
    let due: String = row.get("due_date")?;
    Ok(Deadline {
        id: row.get("id")?,
        domain_id: row.get("domain_id")?,
        text: row.get("text")?,
        due_date: NaiveDate::parse_from_str(&due, "%Y-%m-%d").unwrap_or(NaiveDate::MIN),
        priority: row.get::<_, i64>("priority")? as u8,
        status: status.parse().unwrap_or(DeadlineStatus::Active),
        source: row.get("source")?,
        source_ref: row.get("source_ref")?,
        snoozed_until: parse_ts_opt(row.get("snoozed_until")?),
        completed_at: parse_ts_opt(row.get("completed_at")?),
        cancelled_at: parse_ts_opt(row.get("cancelled_at")?),
        created_at: parse_ts(&row.get::<_, String>("created_at")?),
    })
}

impl Store {
    /// Insert a decision. When it supersedes a predecessor, the predecessor
    /// flips to `superseded` in the same transaction.
    pub fn insert_decision(&self, decision: &Decision) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO decisions
                 (id, domain_id, session_id, decision_id, decision, rationale, downside,
                  revisit_trigger, linked_files, status, supersedes_decision_id, confidence,
                  horizon, reversibility_class, category, authority, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            params![
                decision.id,
                decision.domain_id,
                decision.session_id,
                decision.decision_id,
                decision.decision,
                decision.rationale,
                decision.downside,
                decision.revisit_trigger,
                serde_json::to_string(&decision.linked_files)?,
                decision.status.to_string(),
                decision.supersedes_decision_id,
                decision.confidence,
                decision.horizon,
                decision.reversibility_class,
                decision.category,
                decision.authority,
                to_ts(decision.created_at),
                to_ts(decision.updated_at),
            ],
        )?;
        if let Some(predecessor) = &decision.supersedes_decision_id {
            tx.execute(
                "UPDATE decisions SET status = ?1, updated_at = ?2
                 WHERE domain_id = ?3 AND decision_id = ?4",
                params![
                    DecisionStatus::Superseded.to_string(),
                    to_ts(decision.updated_at),
                    decision.domain_id,
                    predecessor,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn set_decision_status(
        &self,
        domain_id: &str,
        decision_id: &str,
        status: DecisionStatus,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.lock();
        let updated = conn.execute(
            "UPDATE decisions SET status = ?1, updated_at = ?2
             WHERE domain_id = ?3 AND decision_id = ?4",
            params![status.to_string(), to_ts(now), domain_id, decision_id],
        )?;
        if updated == 0 {
            return Err(DomainOsErr::NotFound(format!("decision {decision_id}")));
        }
        Ok(())
    }

    pub fn active_decisions(&self, domain_id: &str, limit: usize) -> Result<Vec<Decision>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM decisions WHERE domain_id = ?1 AND status = 'active'
             ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![domain_id, limit as i64], decision_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn get_decision(&self, domain_id: &str, decision_id: &str) -> Result<Decision> {
        let conn = self.lock();
        conn.query_row(
            "SELECT * FROM decisions WHERE domain_id = ?1 AND decision_id = ?2",
            params![domain_id, decision_id],
            decision_from_row,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => {
                DomainOsErr::NotFound(format!("decision {decision_id}"))
            }
            other => other.into(),
        })
    }

    pub fn insert_gap_flag(&self, flag: &GapFlag) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO gap_flags
                 (id, domain_id, session_id, category, description, source_message, status,
                  resolved_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                flag.id,
                flag.domain_id,
                flag.session_id,
                flag.category,
                flag.description,
                flag.source_message,
                flag.status.to_string(),
                flag.resolved_at.map(to_ts),
                to_ts(flag.created_at),
                to_ts(flag.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn set_gap_flag_status(
        &self,
        flag_id: &str,
        status: GapFlagStatus,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let resolved_at = (status == GapFlagStatus::Resolved).then_some(to_ts(now));
        let conn = self.lock();
        let updated = conn.execute(
            "UPDATE gap_flags SET status = ?1, resolved_at = ?2, updated_at = ?3 WHERE id = ?4",
            params![status.to_string(), resolved_at, to_ts(now), flag_id],
        )?;
        if updated == 0 {
            return Err(DomainOsErr::NotFound(format!("gap flag {flag_id}")));
        }
        Ok(())
    }

    pub fn open_gap_flags(&self, domain_id: &str, limit: usize) -> Result<Vec<GapFlag>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM gap_flags WHERE domain_id = ?1 AND status IN ('open', 'acknowledged')
             ORDER BY created_at ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![domain_id, limit as i64], gap_flag_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn recently_resolved_gap_flags(
        &self,
        domain_id: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<GapFlag>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM gap_flags
             WHERE domain_id = ?1 AND status = 'resolved' AND resolved_at >= ?2
             ORDER BY resolved_at DESC LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![domain_id, to_ts(since), limit as i64], gap_flag_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn insert_deadline(&self, deadline: &Deadline) -> Result<()> {
        if !(1..=7).contains(&deadline.priority) {
            return Err(DomainOsErr::Validation(format!(
                "deadline priority must be 1..=7, got {}",
                deadline.priority
            )));
        }
        if (deadline.status == DeadlineStatus::Snoozed) != deadline.snoozed_until.is_some() {
            return Err(DomainOsErr::Validation(
                "snoozed_until must be set iff status is snoozed".to_string(),
            ));
        }
        let conn = self.lock();
        conn.execute(
            "INSERT INTO deadlines
                 (id, domain_id, text, due_date, priority, status, source, source_ref,
                  snoozed_until, completed_at, cancelled_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                deadline.id,
                deadline.domain_id,
                deadline.text,
                deadline.due_date.format("%Y-%m-%d").to_string(),
                deadline.priority as i64,
                deadline.status.to_string(),
                deadline.source,
                deadline.source_ref,
                deadline.snoozed_until.map(to_ts),
                deadline.completed_at.map(to_ts),
                deadline.cancelled_at.map(to_ts),
                to_ts(deadline.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn snooze_deadline(
        &self,
        deadline_id: &str,
        until: DateTime<Utc>,
    ) -> Result<()> {
        self.transition_deadline(
            deadline_id,
            DeadlineStatus::Snoozed,
            "snoozed_until",
            Some(until),
        )
    }

    pub fn complete_deadline(&self, deadline_id: &str, now: DateTime<Utc>) -> Result<()> {
        self.transition_deadline(
            deadline_id,
            DeadlineStatus::Completed,
            "completed_at",
            Some(now),
        )
    }

    pub fn cancel_deadline(&self, deadline_id: &str, now: DateTime<Utc>) -> Result<()> {
        self.transition_deadline(
            deadline_id,
            DeadlineStatus::Cancelled,
            "cancelled_at",
            Some(now),
        )
    }

    fn transition_deadline(
        &self,
        deadline_id: &str,
        status: DeadlineStatus,
        ts_column: &str,
        ts: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let conn = self.lock();
        // snoozed_until is cleared on any transition out of snoozed
        let sql = format!(
            "UPDATE deadlines SET status = ?1, snoozed_until = NULL, {ts_column} = ?2 WHERE id = ?3"
        );
        let updated = conn.execute(&sql, params![status.to_string(), ts.map(to_ts), deadline_id])?;
        if updated == 0 {
            return Err(DomainOsErr::NotFound(format!("deadline {deadline_id}")));
        }
        Ok(())
    }

    pub fn deadlines_by_status(
        &self,
        domain_id: &str,
        status: DeadlineStatus,
    ) -> Result<Vec<Deadline>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM deadlines WHERE domain_id = ?1 AND status = ?2 ORDER BY due_date, priority",
        )?;
        let rows = stmt.query_map(params![domain_id, status.to_string()], deadline_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::super::domains::test_support::insert_test_domain;
    use super::*;
    use pretty_assertions::assert_eq;

    fn decision(decision_id: &str, supersedes: Option<&str>) -> Decision {
        let now = Utc::now();
        Decision {
            id: format!("row-{decision_id}"),
            domain_id: "d1".to_string(),
            session_id: None,
            decision_id: decision_id.to_string(),
            decision: "do the thing".to_string(),
            rationale: "because".to_string(),
            downside: None,
            revisit_trigger: None,
            linked_files: vec![],
            status: DecisionStatus::Active,
            supersedes_decision_id: supersedes.map(|s| s.to_string()),
            confidence: None,
            horizon: None,
            reversibility_class: None,
            category: None,
            authority: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn superseding_flips_predecessor_atomically() {
        let store = Store::open_in_memory().unwrap();
        insert_test_domain(&store, "d1", "Ops");
        store.insert_decision(&decision("old-way", None)).unwrap();
        store
            .insert_decision(&decision("new-way", Some("old-way")))
            .unwrap();

        let old = store.get_decision("d1", "old-way").unwrap();
        assert_eq!(old.status, DecisionStatus::Superseded);
        let active = store.active_decisions("d1", 10).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].decision_id, "new-way");
    }

    #[test]
    fn gap_flag_resolution_sets_resolved_at() {
        let store = Store::open_in_memory().unwrap();
        insert_test_domain(&store, "d1", "Ops");
        let now = Utc::now();
        let flag = GapFlag {
            id: "g1".to_string(),
            domain_id: "d1".to_string(),
            session_id: None,
            category: "documentation".to_string(),
            description: "missing runbook".to_string(),
            source_message: "".to_string(),
            status: GapFlagStatus::Open,
            resolved_at: None,
            created_at: now,
            updated_at: now,
        };
        store.insert_gap_flag(&flag).unwrap();
        assert_eq!(store.open_gap_flags("d1", 10).unwrap().len(), 1);

        store
            .set_gap_flag_status("g1", GapFlagStatus::Resolved, now)
            .unwrap();
        assert_eq!(store.open_gap_flags("d1", 10).unwrap().len(), 0);
        let resolved = store
            .recently_resolved_gap_flags("d1", now - chrono::Duration::minutes(1), 10)
            .unwrap();
        assert_eq!(resolved.len(), 1);
        assert!(resolved[0].resolved_at.is_some());
    }

    #[test]
    fn deadline_invariants_enforced_on_insert() {
        let store = Store::open_in_memory().unwrap();
        insert_test_domain(&store, "d1", "Ops");
        let now = Utc::now();
        let mut deadline = Deadline {
            id: "dl1".to_string(),
            domain_id: "d1".to_string(),
            text: "file the report".to_string(),
            due_date: now.date_naive(),
            priority: 9,
            status: DeadlineStatus::Active,
            source: "user".to_string(),
            source_ref: "".to_string(),
            snoozed_until: None,
            completed_at: None,
            cancelled_at: None,
            created_at: now,
        };
        assert!(store.insert_deadline(&deadline).is_err());
        deadline.priority = 2;
        store.insert_deadline(&deadline).unwrap();

        store.snooze_deadline("dl1", now).unwrap();
        let snoozed = store
            .deadlines_by_status("d1", DeadlineStatus::Snoozed)
            .unwrap();
        assert!(snoozed[0].snoozed_until.is_some());

        store.complete_deadline("dl1", now).unwrap();
        let completed = store
            .deadlines_by_status("d1", DeadlineStatus::Completed)
            .unwrap();
        assert_eq!(completed[0].snoozed_until, None);
        assert!(completed[0].completed_at.is_some());
    }
}
