//! Audit log with content-hash dedup.

use domainos_protocol::AuditEntry;
use rusqlite::params;

use super::Store;
use super::parse_ts;
use super::to_ts;
use crate::error::Result;

impl Store {
    /// Insert an audit entry. When `content_hash` is present and a prior row
    /// exists with the same (domain_id, content_hash), the insert is
    /// idempotent and the prior row's id is returned.
    pub fn write_audit(&self, entry: &AuditEntry) -> Result<String> {
        let conn = self.lock();

        if let Some(hash) = &entry.content_hash {
            let existing: Option<String> = conn
                .query_row(
                    "SELECT id FROM audit_log WHERE domain_id = ?1 AND content_hash = ?2",
                    params![entry.domain_id, hash],
                    |row| row.get(0),
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })?;
            if let Some(id) = existing {
                return Ok(id);
            }
        }

        conn.execute(
            "INSERT INTO audit_log
                 (id, domain_id, session_id, agent_name, file_path, change_description,
                  content_hash, event_type, source, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                entry.id,
                entry.domain_id,
                entry.session_id,
                entry.agent_name,
                entry.file_path,
                entry.change_description,
                entry.content_hash,
                entry.event_type,
                entry.source,
                to_ts(entry.created_at),
            ],
        )?;
        Ok(entry.id.clone())
    }

    /// Audit events for a domain since `since`, newest first, capped.
    pub fn audit_since(
        &self,
        domain_id: &str,
        since: chrono::DateTime<chrono::Utc>,
        limit: usize,
    ) -> Result<Vec<AuditEntry>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, domain_id, session_id, agent_name, file_path, change_description,
                    content_hash, event_type, source, created_at
             FROM audit_log
             WHERE domain_id = ?1 AND created_at >= ?2
             ORDER BY created_at DESC LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![domain_id, to_ts(since), limit as i64], |row| {
            Ok(AuditEntry {
                id: row.get("id")?,
                domain_id: row.get("domain_id")?,
                session_id: row.get("session_id")?,
                agent_name: row.get("agent_name")?,
                file_path: row.get("file_path")?,
                change_description: row.get("change_description")?,
                content_hash: row.get("content_hash")?,
                event_type: row.get("event_type")?,
                source: row.get("source")?,
                created_at: parse_ts(&row.get::<_, String>("created_at")?),
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::super::domains::test_support::insert_test_domain;
    use super::*;
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    fn entry(id: &str, content_hash: Option<&str>) -> AuditEntry {
        AuditEntry {
            id: id.to_string(),
            domain_id: "d1".to_string(),
            session_id: None,
            agent_name: "ops-agent".to_string(),
            file_path: "notes.md".to_string(),
            change_description: "updated notes".to_string(),
            content_hash: content_hash.map(|s| s.to_string()),
            event_type: "kb_write".to_string(),
            source: "chat".to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn same_content_hash_returns_prior_row_id() {
        let store = Store::open_in_memory().unwrap();
        insert_test_domain(&store, "d1", "Ops");
        let first = store.write_audit(&entry("a1", Some("abc123"))).unwrap();
        assert_eq!(first, "a1");
        let second = store.write_audit(&entry("a2", Some("abc123"))).unwrap();
        assert_eq!(second, "a1");
    }

    #[test]
    fn entries_without_hash_always_insert() {
        let store = Store::open_in_memory().unwrap();
        insert_test_domain(&store, "d1", "Ops");
        store.write_audit(&entry("a1", None)).unwrap();
        store.write_audit(&entry("a2", None)).unwrap();
        let since = Utc::now() - chrono::Duration::minutes(1);
        assert_eq!(store.audit_since("d1", since, 10).unwrap().len(), 2);
    }
}
