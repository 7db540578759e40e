//! Advisory artifact repository: rate limits, fingerprint dedup, persistence.

use chrono::DateTime;
use chrono::Duration;
use chrono::Utc;
use domainos_protocol::AdvisoryArtifact;
use domainos_protocol::AdvisorySource;
use domainos_protocol::AdvisoryStatus;
use domainos_protocol::AdvisoryType;
use rusqlite::Connection;
use rusqlite::Row;
use rusqlite::params;

use super::Store;
use super::parse_ts;
use super::to_ts;
use crate::blocks::advisory::ParsedAdvisoryBlock;
use crate::blocks::advisory::Persist;
use crate::config::Settings;
use crate::error::DomainOsErr;
use crate::error::Result;
use crate::util::new_id;

#[derive(Debug, Clone, PartialEq)]
pub enum AdvisoryCreateOutcome {
    Created(AdvisoryArtifact),
    /// An identical fingerprint existed within the dedup window; the prior
    /// artifact is returned and no row is written.
    Duplicate(AdvisoryArtifact),
}

fn artifact_from_row(row: &Row<'_>) -> rusqlite::Result<AdvisoryArtifact> {
    let ty: String = row.get("type")?;
    let source: String = row.get("source")?;
    let status: String = row.get("status")?;
    let content: String = row.get("content")?;
    Ok(AdvisoryArtifact {
        id: row.get("id")?,
        domain_id: row.get("domain_id")?,
        session_id: row.get("session_id")?,
        artifact_type: ty.parse().unwrap_or(AdvisoryType::Brainstorm),
        title: row.get("title")?,
        schema_version: row.get("schema_version")?,
        content: serde_json::from_str(&content).unwrap_or(serde_json::Value::Null),
        fingerprint: row.get("fingerprint")?,
        source: source.parse().unwrap_or(AdvisorySource::Llm),
        status: status.parse().unwrap_or(AdvisoryStatus::Active),
        created_at: parse_ts(&row.get::<_, String>("created_at")?),
        updated_at: parse_ts(&row.get::<_, String>("updated_at")?),
    })
}

impl Store {
    /// Persist one parsed advisory block, enforcing the per-domain hourly and
    /// daily limits and the fingerprint dedup window. The counts run inside
    /// the same transaction as the insert so concurrent callers cannot slip
    /// past the limit between check and write.
    pub fn create_advisory_artifact(
        &self,
        domain_id: &str,
        session_id: Option<&str>,
        block: &ParsedAdvisoryBlock,
        source: AdvisorySource,
        settings: &Settings,
        now: DateTime<Utc>,
    ) -> Result<AdvisoryCreateOutcome> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let window_start = now - Duration::hours(settings.advisory_dedupe_window_hours);
        if let Some(existing) =
            find_by_fingerprint(&tx, domain_id, &block.fingerprint, window_start)?
        {
            tx.commit()?;
            return Ok(AdvisoryCreateOutcome::Duplicate(existing));
        }

        let hour_count = count_since(&tx, domain_id, now - Duration::hours(1))?;
        if hour_count >= settings.advisory_hourly_limit {
            return Err(DomainOsErr::RateLimitHour {
                limit: settings.advisory_hourly_limit,
            });
        }
        let midnight = now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc())
            .unwrap_or(now);
        let day_count = count_since(&tx, domain_id, midnight)?;
        if day_count >= settings.advisory_daily_limit {
            return Err(DomainOsErr::RateLimitDay {
                limit: settings.advisory_daily_limit,
            });
        }

        let status = if block.persist == Persist::Archive {
            AdvisoryStatus::Archived
        } else {
            AdvisoryStatus::Active
        };
        let artifact = AdvisoryArtifact {
            id: new_id(),
            domain_id: domain_id.to_string(),
            session_id: session_id.map(|s| s.to_string()),
            artifact_type: block.artifact_type,
            title: block.title.clone(),
            schema_version: block.schema_version,
            content: block.payload.clone(),
            fingerprint: block.fingerprint.clone(),
            source,
            status,
            created_at: now,
            updated_at: now,
        };
        tx.execute(
            "INSERT INTO advisory_artifacts
                 (id, domain_id, session_id, type, title, schema_version, content, fingerprint,
                  source, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                artifact.id,
                artifact.domain_id,
                artifact.session_id,
                artifact.artifact_type.to_string(),
                artifact.title,
                artifact.schema_version,
                serde_json::to_string(&artifact.content)?,
                artifact.fingerprint,
                artifact.source.to_string(),
                artifact.status.to_string(),
                to_ts(artifact.created_at),
                to_ts(artifact.updated_at),
            ],
        )?;
        tx.commit()?;
        Ok(AdvisoryCreateOutcome::Created(artifact))
    }

    pub fn count_advisories_last_hour(&self, domain_id: &str, now: DateTime<Utc>) -> Result<u32> {
        let conn = self.lock();
        count_since(&conn, domain_id, now - Duration::hours(1))
    }

    pub fn recent_advisories(&self, domain_id: &str, limit: usize) -> Result<Vec<AdvisoryArtifact>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM advisory_artifacts WHERE domain_id = ?1
             ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![domain_id, limit as i64], artifact_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn get_advisory(&self, id: &str) -> Result<AdvisoryArtifact> {
        let conn = self.lock();
        conn.query_row(
            "SELECT * FROM advisory_artifacts WHERE id = ?1",
            params![id],
            artifact_from_row,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => {
                DomainOsErr::NotFound(format!("advisory artifact {id}"))
            }
            other => other.into(),
        })
    }

    pub fn archive_advisory(&self, id: &str, now: DateTime<Utc>) -> Result<()> {
        let conn = self.lock();
        let updated = conn.execute(
            "UPDATE advisory_artifacts SET status = 'archived', updated_at = ?1 WHERE id = ?2",
            params![to_ts(now), id],
        )?;
        if updated == 0 {
            return Err(DomainOsErr::NotFound(format!("advisory artifact {id}")));
        }
        Ok(())
    }

    pub fn rename_advisory(&self, id: &str, title: &str, now: DateTime<Utc>) -> Result<()> {
        let conn = self.lock();
        let updated = conn.execute(
            "UPDATE advisory_artifacts SET title = ?1, updated_at = ?2 WHERE id = ?3",
            params![title, to_ts(now), id],
        )?;
        if updated == 0 {
            return Err(DomainOsErr::NotFound(format!("advisory artifact {id}")));
        }
        Ok(())
    }
}

fn count_since(conn: &Connection, domain_id: &str, since: DateTime<Utc>) -> Result<u32> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM advisory_artifacts WHERE domain_id = ?1 AND created_at >= ?2",
        params![domain_id, to_ts(since)],
        |row| row.get(0),
    )?;
    Ok(count as u32)
}

fn find_by_fingerprint(
    conn: &Connection,
    domain_id: &str,
    fingerprint: &str,
    window_start: DateTime<Utc>,
) -> Result<Option<AdvisoryArtifact>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM advisory_artifacts
         WHERE domain_id = ?1 AND fingerprint = ?2 AND created_at >= ?3
         ORDER BY created_at DESC LIMIT 1",
    )?;
    let mut rows = stmt.query_map(params![domain_id, fingerprint, to_ts(window_start)], artifact_from_row)?;
    match rows.next() {
        Some(row) => Ok(Some(row?)),
        None => Ok(None),
    }
}
