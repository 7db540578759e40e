//! KB file index and protocol repositories.

use domainos_protocol::DomainProtocol;
use domainos_protocol::KbFile;
use domainos_protocol::KbTier;
use domainos_protocol::SharedProtocol;
use domainos_protocol::TierSource;
use rusqlite::Row;
use rusqlite::params;

use super::Store;
use super::parse_ts;
use super::to_ts;
use crate::error::Result;

fn kb_file_from_row(row: &Row<'_>) -> rusqlite::Result<KbFile> {
    let tier: String = row.get("tier")?;
    let tier_source: String = row.get("tier_source")?;
    Ok(KbFile {
        id: row.get("id")?,
        domain_id: row.get("domain_id")?,
        relative_path: row.get("relative_path")?,
        content_hash: row.get("content_hash")?,
        size_bytes: row.get::<_, i64>("size_bytes")? as u64,
        last_synced_at: parse_ts(&row.get::<_, String>("last_synced_at")?),
        tier: tier.parse().unwrap_or(KbTier::General),
        tier_source: tier_source.parse().unwrap_or(TierSource::Inferred),
    })
}

impl Store {
    /// Upsert from a filesystem scan, keyed by (domain_id, relative_path).
    pub fn upsert_kb_file(&self, file: &KbFile) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO kb_files
                 (id, domain_id, relative_path, content_hash, size_bytes, last_synced_at, tier, tier_source)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(domain_id, relative_path) DO UPDATE SET
                 content_hash = excluded.content_hash,
                 size_bytes = excluded.size_bytes,
                 last_synced_at = excluded.last_synced_at,
                 tier = excluded.tier,
                 tier_source = excluded.tier_source",
            params![
                file.id,
                file.domain_id,
                file.relative_path,
                file.content_hash,
                file.size_bytes as i64,
                to_ts(file.last_synced_at),
                file.tier.to_string(),
                file.tier_source.to_string(),
            ],
        )?;
        Ok(())
    }

    pub fn remove_kb_file(&self, domain_id: &str, relative_path: &str) -> Result<bool> {
        let conn = self.lock();
        let deleted = conn.execute(
            "DELETE FROM kb_files WHERE domain_id = ?1 AND relative_path = ?2",
            params![domain_id, relative_path],
        )?;
        Ok(deleted > 0)
    }

    pub fn list_kb_files(&self, domain_id: &str) -> Result<Vec<KbFile>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM kb_files WHERE domain_id = ?1 ORDER BY relative_path",
        )?;
        let rows = stmt.query_map(params![domain_id], kb_file_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn list_protocols(&self, domain_id: &str) -> Result<Vec<DomainProtocol>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, domain_id, name, content, sort_order FROM protocols
             WHERE domain_id = ?1 ORDER BY sort_order, name",
        )?;
        let rows = stmt.query_map(params![domain_id], |row| {
            Ok(DomainProtocol {
                id: row.get("id")?,
                domain_id: row.get("domain_id")?,
                name: row.get("name")?,
                content: row.get("content")?,
                sort_order: row.get("sort_order")?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn upsert_protocol(&self, protocol: &DomainProtocol) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO protocols (id, domain_id, name, content, sort_order)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(domain_id, name) DO UPDATE SET
                 content = excluded.content,
                 sort_order = excluded.sort_order",
            params![
                protocol.id,
                protocol.domain_id,
                protocol.name,
                protocol.content,
                protocol.sort_order,
            ],
        )?;
        Ok(())
    }

    pub fn enabled_shared_protocols(&self) -> Result<Vec<SharedProtocol>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, name, content, priority, is_enabled, scope FROM shared_protocols
             WHERE is_enabled = 1 ORDER BY priority DESC, name",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(SharedProtocol {
                id: row.get("id")?,
                name: row.get("name")?,
                content: row.get("content")?,
                priority: row.get("priority")?,
                is_enabled: row.get::<_, i64>("is_enabled")? != 0,
                scope: row.get("scope")?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn upsert_shared_protocol(&self, protocol: &SharedProtocol) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO shared_protocols (id, name, content, priority, is_enabled, scope)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(name) DO UPDATE SET
                 content = excluded.content,
                 priority = excluded.priority,
                 is_enabled = excluded.is_enabled,
                 scope = excluded.scope",
            params![
                protocol.id,
                protocol.name,
                protocol.content,
                protocol.priority,
                protocol.is_enabled as i64,
                protocol.scope,
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::super::domains::test_support::insert_test_domain;
    use super::*;
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    #[test]
    fn scan_upsert_updates_in_place() {
        let store = Store::open_in_memory().unwrap();
        insert_test_domain(&store, "d1", "Ops");
        let mut file = KbFile {
            id: "f1".to_string(),
            domain_id: "d1".to_string(),
            relative_path: "claude.md".to_string(),
            content_hash: "hash-a".to_string(),
            size_bytes: 10,
            last_synced_at: Utc::now(),
            tier: KbTier::Structural,
            tier_source: TierSource::Inferred,
        };
        store.upsert_kb_file(&file).unwrap();
        file.content_hash = "hash-b".to_string();
        store.upsert_kb_file(&file).unwrap();

        let files = store.list_kb_files("d1").unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].content_hash, "hash-b");
        assert_eq!(files[0].tier, KbTier::Structural);

        assert!(store.remove_kb_file("d1", "claude.md").unwrap());
        assert!(!store.remove_kb_file("d1", "claude.md").unwrap());
    }

    #[test]
    fn shared_protocols_filter_disabled() {
        let store = Store::open_in_memory().unwrap();
        let mut p = SharedProtocol {
            id: "p1".to_string(),
            name: "escalation".to_string(),
            content: "escalate on conflict".to_string(),
            priority: 5,
            is_enabled: true,
            scope: "global".to_string(),
        };
        store.upsert_shared_protocol(&p).unwrap();
        assert_eq!(store.enabled_shared_protocols().unwrap().len(), 1);
        p.is_enabled = false;
        store.upsert_shared_protocol(&p).unwrap();
        assert_eq!(store.enabled_shared_protocols().unwrap().len(), 0);
    }
}
