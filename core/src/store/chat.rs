//! Chat message log and conversation summary.
//!
//! The message log is append-idempotent: inserts use `INSERT OR IGNORE` so a
//! retried turn never duplicates a row. The summary row is skipped entirely
//! when its content hash is unchanged.

use chrono::DateTime;
use chrono::Utc;
use domainos_protocol::ChatMessage;
use domainos_protocol::ChatRole;
use domainos_protocol::ConversationSummary;
use rusqlite::params;

use super::Store;
use super::parse_ts;
use super::to_ts;
use crate::canonical::short_hash;
use crate::error::Result;

impl Store {
    /// Returns `true` when the row was actually inserted.
    pub fn append_chat_message(&self, message: &ChatMessage) -> Result<bool> {
        let conn = self.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO chat_messages (id, domain_id, role, content, status, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                message.id,
                message.domain_id,
                message.role.to_string(),
                message.content,
                message.status,
                serde_json::to_string(&message.metadata)?,
                to_ts(message.created_at),
            ],
        )?;
        Ok(inserted > 0)
    }

    pub fn list_chat_messages(&self, domain_id: &str, limit: usize) -> Result<Vec<ChatMessage>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, domain_id, role, content, status, metadata, created_at
             FROM chat_messages WHERE domain_id = ?1
             ORDER BY created_at DESC, id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![domain_id, limit as i64], |row| {
            let role: String = row.get("role")?;
            let metadata: String = row.get("metadata")?;
            Ok(ChatMessage {
                id: row.get("id")?,
                domain_id: row.get("domain_id")?,
                role: role.parse().unwrap_or(ChatRole::User),
                content: row.get("content")?,
                status: row.get("status")?,
                metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
                created_at: parse_ts(&row.get::<_, String>("created_at")?),
            })
        })?;
        let mut messages = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        messages.reverse();
        Ok(messages)
    }

    pub fn clear_chat_messages(&self, domain_id: &str) -> Result<usize> {
        let conn = self.lock();
        Ok(conn.execute(
            "DELETE FROM chat_messages WHERE domain_id = ?1",
            params![domain_id],
        )?)
    }

    /// Write the conversation summary unless the text is unchanged. The
    /// version increments monotonically on every real write.
    pub fn upsert_conversation_summary(
        &self,
        domain_id: &str,
        summary_text: &str,
        last_summarized_created_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<ConversationSummary>> {
        let summary_hash = short_hash(summary_text, 16);
        let conn = self.lock();

        let existing: Option<(String, i64)> = conn
            .query_row(
                "SELECT summary_hash, summary_version FROM conversation_summaries WHERE domain_id = ?1",
                params![domain_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        let next_version = match &existing {
            Some((hash, _)) if hash == &summary_hash => return Ok(None),
            Some((_, version)) => version + 1,
            None => 1,
        };

        conn.execute(
            "INSERT INTO conversation_summaries
                 (domain_id, summary_text, summary_version, last_summarized_created_at, summary_hash, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(domain_id) DO UPDATE SET
                 summary_text = excluded.summary_text,
                 summary_version = excluded.summary_version,
                 last_summarized_created_at = excluded.last_summarized_created_at,
                 summary_hash = excluded.summary_hash,
                 updated_at = excluded.updated_at",
            params![
                domain_id,
                summary_text,
                next_version,
                to_ts(last_summarized_created_at),
                summary_hash,
                to_ts(now),
            ],
        )?;

        Ok(Some(ConversationSummary {
            domain_id: domain_id.to_string(),
            summary_text: summary_text.to_string(),
            summary_version: next_version,
            last_summarized_created_at,
            summary_hash,
            updated_at: now,
        }))
    }

    pub fn get_conversation_summary(&self, domain_id: &str) -> Result<Option<ConversationSummary>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT domain_id, summary_text, summary_version, last_summarized_created_at,
                    summary_hash, updated_at
             FROM conversation_summaries WHERE domain_id = ?1",
        )?;
        let mut rows = stmt.query_map(params![domain_id], |row| {
            Ok(ConversationSummary {
                domain_id: row.get("domain_id")?,
                summary_text: row.get("summary_text")?,
                summary_version: row.get("summary_version")?,
                last_summarized_created_at: parse_ts(
                    &row.get::<_, String>("last_summarized_created_at")?,
                ),
                summary_hash: row.get("summary_hash")?,
                updated_at: parse_ts(&row.get::<_, String>("updated_at")?),
            })
        })?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::super::domains::test_support::insert_test_domain;
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn message(id: &str, content: &str) -> ChatMessage {
        ChatMessage {
            id: id.to_string(),
            domain_id: "d1".to_string(),
            role: ChatRole::User,
            content: content.to_string(),
            status: None,
            metadata: json!({"turn": 1}),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn append_is_idempotent_by_id() {
        let store = Store::open_in_memory().unwrap();
        insert_test_domain(&store, "d1", "Ops");
        assert!(store.append_chat_message(&message("m1", "hello")).unwrap());
        assert!(!store.append_chat_message(&message("m1", "hello")).unwrap());
        let messages = store.list_chat_messages("d1", 10).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "hello");
        assert_eq!(messages[0].metadata, json!({"turn": 1}));
    }

    #[test]
    fn summary_write_skipped_when_hash_unchanged() {
        let store = Store::open_in_memory().unwrap();
        insert_test_domain(&store, "d1", "Ops");
        let now = Utc::now();

        let first = store
            .upsert_conversation_summary("d1", "summary v1", now, now)
            .unwrap()
            .unwrap();
        assert_eq!(first.summary_version, 1);
        assert_eq!(first.summary_hash.len(), 16);

        // identical text: skipped
        assert!(
            store
                .upsert_conversation_summary("d1", "summary v1", now, now)
                .unwrap()
                .is_none()
        );

        // changed text: version increments
        let second = store
            .upsert_conversation_summary("d1", "summary v2", now, now)
            .unwrap()
            .unwrap();
        assert_eq!(second.summary_version, 2);
    }

    #[test]
    fn clear_removes_only_that_domain() {
        let store = Store::open_in_memory().unwrap();
        insert_test_domain(&store, "d1", "Ops");
        insert_test_domain(&store, "d2", "Legal");
        store.append_chat_message(&message("m1", "one")).unwrap();
        let mut other = message("m2", "two");
        other.domain_id = "d2".to_string();
        store.append_chat_message(&other).unwrap();

        assert_eq!(store.clear_chat_messages("d1").unwrap(), 1);
        assert_eq!(store.list_chat_messages("d2", 10).unwrap().len(), 1);
    }
}
