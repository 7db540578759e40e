//! Domain, relationship and session repositories.

use chrono::DateTime;
use chrono::Utc;
use domainos_protocol::DependencyType;
use domainos_protocol::Domain;
use domainos_protocol::DomainRelationship;
use domainos_protocol::Session;
use domainos_protocol::SessionStatus;
use rusqlite::Row;
use rusqlite::params;

use super::Store;
use super::parse_ts;
use super::parse_ts_opt;
use super::to_ts;
use crate::error::DomainOsErr;
use crate::error::Result;

fn domain_from_row(row: &Row<'_>) -> rusqlite::Result<Domain> {
    let triggers: String = row.get("escalation_triggers")?;
    Ok(Domain {
        id: row.get("id")?,
        name: row.get("name")?,
        kb_path: std::path::PathBuf::from(row.get::<_, String>("kb_path")?),
        identity: row.get("identity")?,
        escalation_triggers: serde_json::from_str(&triggers).unwrap_or_default(),
        allow_gmail: row.get::<_, i64>("allow_gmail")? != 0,
        model_provider: row.get("model_provider")?,
        model_name: row.get("model_name")?,
        force_tool_attempt: row.get::<_, i64>("force_tool_attempt")? != 0,
        sort_order: row.get("sort_order")?,
    })
}

impl Store {
    pub fn upsert_domain(&self, domain: &Domain) -> Result<()> {
        // (provider, model) must be both set or both absent
        if domain.model_provider.is_some() != domain.model_name.is_some() {
            return Err(DomainOsErr::Validation(
                "model_provider and model_name must be set together".to_string(),
            ));
        }
        let conn = self.lock();
        conn.execute(
            "INSERT INTO domains (id, name, kb_path, identity, escalation_triggers, allow_gmail,
                                  model_provider, model_name, force_tool_attempt, sort_order)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 kb_path = excluded.kb_path,
                 identity = excluded.identity,
                 escalation_triggers = excluded.escalation_triggers,
                 allow_gmail = excluded.allow_gmail,
                 model_provider = excluded.model_provider,
                 model_name = excluded.model_name,
                 force_tool_attempt = excluded.force_tool_attempt,
                 sort_order = excluded.sort_order",
            params![
                domain.id,
                domain.name,
                domain.kb_path.to_string_lossy(),
                domain.identity,
                serde_json::to_string(&domain.escalation_triggers)?,
                domain.allow_gmail as i64,
                domain.model_provider,
                domain.model_name,
                domain.force_tool_attempt as i64,
                domain.sort_order,
            ],
        )?;
        Ok(())
    }

    pub fn get_domain(&self, domain_id: &str) -> Result<Domain> {
        let conn = self.lock();
        conn.query_row(
            "SELECT * FROM domains WHERE id = ?1",
            params![domain_id],
            domain_from_row,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => {
                DomainOsErr::NotFound(format!("domain {domain_id}"))
            }
            other => other.into(),
        })
    }

    pub fn list_domains(&self) -> Result<Vec<Domain>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT * FROM domains ORDER BY sort_order, id")?;
        let rows = stmt.query_map([], domain_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Cascade delete: every owned row goes with the domain.
    pub fn delete_domain(&self, domain_id: &str) -> Result<()> {
        let conn = self.lock();
        let deleted = conn.execute("DELETE FROM domains WHERE id = ?1", params![domain_id])?;
        if deleted == 0 {
            return Err(DomainOsErr::NotFound(format!("domain {domain_id}")));
        }
        Ok(())
    }

    pub fn upsert_relationship(&self, rel: &DomainRelationship) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO domain_relationships
                 (domain_id, sibling_domain_id, relationship_type, dependency_type, description)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(domain_id, sibling_domain_id) DO UPDATE SET
                 relationship_type = excluded.relationship_type,
                 dependency_type = excluded.dependency_type,
                 description = excluded.description",
            params![
                rel.domain_id,
                rel.sibling_domain_id,
                rel.relationship_type,
                rel.dependency_type.to_string(),
                rel.description,
            ],
        )?;
        Ok(())
    }

    pub fn list_relationships(&self) -> Result<Vec<DomainRelationship>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT domain_id, sibling_domain_id, relationship_type, dependency_type, description
             FROM domain_relationships ORDER BY domain_id, sibling_domain_id",
        )?;
        let rows = stmt.query_map([], |row| {
            let dep: String = row.get("dependency_type")?;
            Ok(DomainRelationship {
                domain_id: row.get("domain_id")?,
                sibling_domain_id: row.get("sibling_domain_id")?,
                relationship_type: row.get("relationship_type")?,
                dependency_type: dep.parse().unwrap_or(DependencyType::MonitorOnly),
                description: row.get("description")?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn outgoing_relationships(&self, domain_id: &str) -> Result<Vec<DomainRelationship>> {
        Ok(self
            .list_relationships()?
            .into_iter()
            .filter(|r| r.domain_id == domain_id)
            .collect())
    }

    pub fn start_session(&self, domain_id: &str, id: &str, now: DateTime<Utc>) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO sessions (id, domain_id, status, started_at) VALUES (?1, ?2, ?3, ?4)",
            params![id, domain_id, SessionStatus::Active.to_string(), to_ts(now)],
        )?;
        Ok(())
    }

    pub fn wrap_up_session(&self, session_id: &str, now: DateTime<Utc>) -> Result<()> {
        let conn = self.lock();
        let updated = conn.execute(
            "UPDATE sessions SET status = ?1, ended_at = ?2 WHERE id = ?3",
            params![SessionStatus::WrappedUp.to_string(), to_ts(now), session_id],
        )?;
        if updated == 0 {
            return Err(DomainOsErr::NotFound(format!("session {session_id}")));
        }
        Ok(())
    }

    /// Most recent wrapped-up session for a domain, by ended_at.
    pub fn latest_wrapped_session(&self, domain_id: &str) -> Result<Option<Session>> {
        self.latest_session_with_status(domain_id, SessionStatus::WrappedUp)
    }

    /// Most recent still-active session for a domain, by started_at.
    pub fn latest_active_session(&self, domain_id: &str) -> Result<Option<Session>> {
        self.latest_session_with_status(domain_id, SessionStatus::Active)
    }

    fn latest_session_with_status(
        &self,
        domain_id: &str,
        status: SessionStatus,
    ) -> Result<Option<Session>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, domain_id, status, started_at, ended_at FROM sessions
             WHERE domain_id = ?1 AND status = ?2
             ORDER BY COALESCE(ended_at, started_at) DESC LIMIT 1",
        )?;
        let mut rows = stmt.query_map(params![domain_id, status.to_string()], |row| {
            let status_raw: String = row.get("status")?;
            Ok(Session {
                id: row.get("id")?,
                domain_id: row.get("domain_id")?,
                status: status_raw.parse().unwrap_or(SessionStatus::Active),
                started_at: parse_ts(&row.get::<_, String>("started_at")?),
                ended_at: parse_ts_opt(row.get("ended_at")?),
            })
        })?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    #![allow(clippy::unwrap_used)]
    use super::*;

    pub fn insert_test_domain(store: &Store, id: &str, name: &str) -> Domain {
        let domain = Domain {
            id: id.to_string(),
            name: name.to_string(),
            kb_path: std::path::PathBuf::from(format!("/kb/{id}")),
            identity: format!("You are the {name} steward."),
            escalation_triggers: vec![],
            allow_gmail: true,
            model_provider: None,
            model_name: None,
            force_tool_attempt: false,
            sort_order: 0,
        };
        store.upsert_domain(&domain).unwrap();
        domain
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::test_support::insert_test_domain;
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn domain_round_trips() {
        let store = Store::open_in_memory().unwrap();
        let domain = insert_test_domain(&store, "d1", "Ops");
        assert_eq!(store.get_domain("d1").unwrap(), domain);
        assert!(matches!(
            store.get_domain("missing"),
            Err(DomainOsErr::NotFound(_))
        ));
    }

    #[test]
    fn provider_and_model_must_travel_together() {
        let store = Store::open_in_memory().unwrap();
        let mut domain = insert_test_domain(&store, "d1", "Ops");
        domain.model_provider = Some("ollama".to_string());
        assert!(matches!(
            store.upsert_domain(&domain),
            Err(DomainOsErr::Validation(_))
        ));
    }

    #[test]
    fn cascade_delete_removes_owned_rows() {
        let store = Store::open_in_memory().unwrap();
        insert_test_domain(&store, "d1", "Ops");
        store.start_session("d1", "s1", Utc::now()).unwrap();
        store.delete_domain("d1").unwrap();
        assert_eq!(store.latest_active_session("d1").unwrap(), None);
    }

    #[test]
    fn session_window_prefers_wrapped() {
        let store = Store::open_in_memory().unwrap();
        insert_test_domain(&store, "d1", "Ops");
        let t0 = Utc::now();
        store.start_session("d1", "s1", t0).unwrap();
        assert!(store.latest_wrapped_session("d1").unwrap().is_none());
        store.wrap_up_session("s1", t0).unwrap();
        let wrapped = store.latest_wrapped_session("d1").unwrap().unwrap();
        assert_eq!(wrapped.status, SessionStatus::WrappedUp);
        assert!(wrapped.ended_at.is_some());
    }
}
