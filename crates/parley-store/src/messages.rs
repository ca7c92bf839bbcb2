//! Persistence for chat messages. History replay is independent of live
//! delivery; the router saves before it fans out.

use chrono::{DateTime, Utc};
use rusqlite::params;

use parley_shared::types::{GroupId, MessageId, UserId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::StoredMessage;

impl Database {
    /// Insert a message and return its assigned sequence number.
    pub fn insert_message(
        &self,
        id: MessageId,
        group_id: GroupId,
        sender_id: UserId,
        content: &str,
        sent_at: DateTime<Utc>,
    ) -> Result<i64> {
        self.conn().execute(
            "INSERT INTO messages (id, group_id, sender_id, content, sent_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                id.to_string(),
                group_id.0,
                sender_id.0,
                content,
                sent_at.to_rfc3339(),
            ],
        )?;
        Ok(self.conn().last_insert_rowid())
    }

    /// The most recent `limit` messages of a group, oldest first.
    pub fn get_history(&self, group_id: GroupId, limit: u32) -> Result<Vec<StoredMessage>> {
        let mut stmt = self.conn().prepare(
            "SELECT seq, id, group_id, sender_id, username, content, sent_at
             FROM (
                 SELECT m.seq, m.id, m.group_id, m.sender_id, u.username, m.content, m.sent_at
                 FROM messages m
                 JOIN users u ON u.id = m.sender_id
                 WHERE m.group_id = ?1
                 ORDER BY m.seq DESC
                 LIMIT ?2
             )
             ORDER BY seq ASC",
        )?;

        let rows = stmt.query_map(params![group_id.0, limit], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// Fetch one message by id.
    pub fn get_message(&self, id: MessageId) -> Result<StoredMessage> {
        self.conn()
            .query_row(
                "SELECT m.seq, m.id, m.group_id, m.sender_id, u.username, m.content, m.sent_at
                 FROM messages m
                 JOIN users u ON u.id = m.sender_id
                 WHERE m.id = ?1",
                params![id.to_string()],
                row_to_message,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }
}

/// Map a `rusqlite::Row` to a [`StoredMessage`].
fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
    let seq: i64 = row.get(0)?;
    let id_str: String = row.get(1)?;
    let group_id: i64 = row.get(2)?;
    let sender_id: i64 = row.get(3)?;
    let sender_name: String = row.get(4)?;
    let content: String = row.get(5)?;
    let sent_str: String = row.get(6)?;

    let id = uuid::Uuid::parse_str(&id_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;

    let sent_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&sent_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(StoredMessage {
        seq,
        id: MessageId(id),
        group_id: GroupId(group_id),
        sender_id: UserId(sender_id),
        sender_name,
        content,
        sent_at,
    })
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use parley_shared::types::MessageId;

    use crate::database::Database;

    #[test]
    fn insert_assigns_monotonic_seq() {
        let db = Database::open_in_memory().unwrap();
        let alice = db.create_user("alice", "h", false).unwrap();
        let group = db.create_group("lobby").unwrap();

        let s1 = db
            .insert_message(MessageId::new(), group.id, alice.id, "one", Utc::now())
            .unwrap();
        let s2 = db
            .insert_message(MessageId::new(), group.id, alice.id, "two", Utc::now())
            .unwrap();
        assert!(s2 > s1);
    }

    #[test]
    fn history_is_oldest_first_and_limited() {
        let db = Database::open_in_memory().unwrap();
        let alice = db.create_user("alice", "h", false).unwrap();
        let group = db.create_group("lobby").unwrap();

        for i in 0..5 {
            db.insert_message(
                MessageId::new(),
                group.id,
                alice.id,
                &format!("msg-{i}"),
                Utc::now(),
            )
            .unwrap();
        }

        let history = db.get_history(group.id, 3).unwrap();
        let contents: Vec<_> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["msg-2", "msg-3", "msg-4"]);
        assert_eq!(history[0].sender_name, "alice");
    }
}
