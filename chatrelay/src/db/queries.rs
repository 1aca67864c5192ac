//! Database query implementations.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};

use super::error::{DbError, DbResult};
use crate::models::{Conversation, Message, MessageSender};

/// Parse a timestamp string flexibly from various formats.
fn parse_timestamp(s: &str) -> DbResult<DateTime<Utc>> {
    // Try RFC3339 first
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }

    // Try common SQLite datetime format: "YYYY-MM-DD HH:MM:SS"
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Ok(naive.and_utc());
    }

    // Try with fractional seconds: "YYYY-MM-DD HH:MM:SS.SSS"
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(naive.and_utc());
    }

    Err(DbError::InvalidRow(format!("invalid timestamp format: {s}")))
}

/// Map a unique-constraint violation on insert to [`DbError::SeqConflict`].
fn map_insert_error(err: rusqlite::Error, conversation_id: &str, seq: i64) -> DbError {
    let is_unique_violation = matches!(
        &err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    );
    if is_unique_violation {
        DbError::SeqConflict {
            conversation_id: conversation_id.to_string(),
            seq,
        }
    } else {
        err.into()
    }
}

/// Start a write transaction that takes the write lock up front, so the
/// insert and the conversation update commit or roll back together.
fn write_transaction(conn: &Connection) -> DbResult<Transaction<'_>> {
    Ok(Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?)
}

/// Queries for conversations table.
pub struct ConversationQueries;

impl ConversationQueries {
    /// Insert a conversation unless one with the same id exists, then return
    /// the stored row. Safe to call repeatedly with the same id.
    pub fn upsert(conn: &Connection, conversation: &Conversation) -> DbResult<Conversation> {
        conn.execute(
            r"INSERT INTO conversations (id, title, created_at, updated_at)
              VALUES (?1, ?2, ?3, ?4)
              ON CONFLICT(id) DO NOTHING",
            params![
                conversation.id,
                conversation.title,
                conversation.created_at.to_rfc3339(),
                conversation.updated_at.to_rfc3339(),
            ],
        )?;

        Self::get_by_id(conn, &conversation.id)?.ok_or_else(|| {
            DbError::InvalidRow(format!("conversation {} vanished after upsert", conversation.id))
        })
    }

    /// Get a conversation by ID.
    pub fn get_by_id(conn: &Connection, id: &str) -> DbResult<Option<Conversation>> {
        let mut stmt = conn.prepare(
            "SELECT id, title, created_at, updated_at FROM conversations WHERE id = ?1",
        )?;

        let result = stmt.query_row(params![id], |row| Ok(Self::row_to_conversation(row)));

        match result {
            Ok(conversation) => Ok(Some(conversation?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Check whether a conversation exists.
    pub fn exists(conn: &Connection, id: &str) -> DbResult<bool> {
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM conversations WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Set the title, but only if the conversation has none yet.
    pub fn set_title_if_empty(conn: &Connection, id: &str, title: &str) -> DbResult<bool> {
        let count = conn.execute(
            "UPDATE conversations SET title = ?1 WHERE id = ?2 AND title = ''",
            params![title, id],
        )?;
        Ok(count > 0)
    }

    /// Bump `updated_at`.
    pub fn touch(conn: &Connection, id: &str, at: DateTime<Utc>) -> DbResult<()> {
        conn.execute(
            "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
            params![at.to_rfc3339(), id],
        )?;
        Ok(())
    }

    /// Convert a row to a Conversation.
    fn row_to_conversation(row: &rusqlite::Row<'_>) -> DbResult<Conversation> {
        let created_at_str: String = row.get(2)?;
        let updated_at_str: String = row.get(3)?;

        Ok(Conversation {
            id: row.get(0)?,
            title: row.get(1)?,
            created_at: parse_timestamp(&created_at_str)?,
            updated_at: parse_timestamp(&updated_at_str)?,
        })
    }
}

/// Queries for messages table.
pub struct MessageQueries;

impl MessageQueries {
    /// Insert a message at its explicit `seq`. The insert and the
    /// conversation's `updated_at` bump commit together.
    ///
    /// Returns the row id. Fails with [`DbError::SeqConflict`] when the seq is
    /// already taken in that conversation.
    pub fn insert_at(conn: &Connection, message: &Message) -> DbResult<i64> {
        let tx = write_transaction(conn)?;
        tx.execute(
            r"INSERT INTO messages (conversation_id, sender, text, seq, created_at)
              VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                message.conversation_id,
                message.sender.as_str(),
                message.text,
                message.seq,
                message.created_at.to_rfc3339(),
            ],
        )
        .map_err(|e| map_insert_error(e, &message.conversation_id, message.seq))?;
        let id = tx.last_insert_rowid();

        ConversationQueries::touch(&tx, &message.conversation_id, message.created_at)?;
        tx.commit()?;
        Ok(id)
    }

    /// Insert a message unless its seq is already taken. Returns whether a
    /// row was written.
    pub fn insert_if_absent(conn: &Connection, message: &Message) -> DbResult<bool> {
        let tx = write_transaction(conn)?;
        let count = tx.execute(
            r"INSERT INTO messages (conversation_id, sender, text, seq, created_at)
              VALUES (?1, ?2, ?3, ?4, ?5)
              ON CONFLICT(conversation_id, seq) DO NOTHING",
            params![
                message.conversation_id,
                message.sender.as_str(),
                message.text,
                message.seq,
                message.created_at.to_rfc3339(),
            ],
        )?;
        if count > 0 {
            ConversationQueries::touch(&tx, &message.conversation_id, message.created_at)?;
        }
        tx.commit()?;
        Ok(count > 0)
    }

    /// Append a message at `max(seq) + 1` (or 0). The seq is allocated and
    /// claimed by a single statement.
    pub fn append_next(
        conn: &Connection,
        conversation_id: &str,
        sender: MessageSender,
        text: &str,
    ) -> DbResult<Message> {
        let created_at = Utc::now();
        let tx = write_transaction(conn)?;
        let (id, seq): (i64, i64) = tx
            .query_row(
                r"INSERT INTO messages (conversation_id, sender, text, seq, created_at)
                  SELECT ?1, ?2, ?3, COALESCE(MAX(seq), -1) + 1, ?4
                  FROM messages WHERE conversation_id = ?1
                  RETURNING id, seq",
                params![conversation_id, sender.as_str(), text, created_at.to_rfc3339()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(|e| map_insert_error(e, conversation_id, -1))?;

        ConversationQueries::touch(&tx, conversation_id, created_at)?;
        tx.commit()?;

        Ok(Message {
            id,
            conversation_id: conversation_id.to_string(),
            sender,
            text: text.to_string(),
            seq,
            created_at,
        })
    }

    /// List messages for a conversation ordered by seq, then creation time.
    pub fn list_ordered(conn: &Connection, conversation_id: &str) -> DbResult<Vec<Message>> {
        let mut stmt = conn.prepare(
            r"SELECT id, conversation_id, sender, text, seq, created_at
              FROM messages WHERE conversation_id = ?1 ORDER BY seq ASC, created_at ASC",
        )?;
        let rows =
            stmt.query_map(params![conversation_id], |row| Ok(Self::row_to_message(row)))?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row??);
        }
        Ok(messages)
    }

    /// Highest seq in a conversation, if it has any messages.
    pub fn last_seq(conn: &Connection, conversation_id: &str) -> DbResult<Option<i64>> {
        let seq: Option<i64> = conn.query_row(
            "SELECT MAX(seq) FROM messages WHERE conversation_id = ?1",
            params![conversation_id],
            |row| row.get(0),
        )?;
        Ok(seq)
    }

    /// Convert a row to a Message.
    fn row_to_message(row: &rusqlite::Row<'_>) -> DbResult<Message> {
        let sender_str: String = row.get(2)?;
        let sender = MessageSender::from_str(&sender_str)
            .ok_or_else(|| DbError::InvalidRow(format!("invalid message sender: {sender_str}")))?;

        let created_at_str: String = row.get(5)?;
        let created_at = parse_timestamp(&created_at_str)?;

        Ok(Message {
            id: row.get(0)?,
            conversation_id: row.get(1)?,
            sender,
            text: row.get(3)?,
            seq: row.get(4)?,
            created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn db_with_conversation(id: &str) -> Database {
        let db = Database::open_in_memory().unwrap();
        ConversationQueries::upsert(db.conn(), &Conversation::new(id.to_string())).unwrap();
        db
    }

    #[test]
    fn upsert_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let first = ConversationQueries::upsert(db.conn(), &Conversation::new("c1".into())).unwrap();
        let mut again = Conversation::new("c1".into());
        again.title = "ignored".into();
        let second = ConversationQueries::upsert(db.conn(), &again).unwrap();
        assert_eq!(first, second);
        assert!(second.title.is_empty());
    }

    #[test]
    fn exists_reports_unknown_ids() {
        let db = db_with_conversation("c1");
        assert!(ConversationQueries::exists(db.conn(), "c1").unwrap());
        assert!(!ConversationQueries::exists(db.conn(), "nope").unwrap());
        assert!(ConversationQueries::get_by_id(db.conn(), "nope").unwrap().is_none());
    }

    #[test]
    fn title_is_only_set_once() {
        let db = db_with_conversation("c1");
        assert!(ConversationQueries::set_title_if_empty(db.conn(), "c1", "First").unwrap());
        assert!(!ConversationQueries::set_title_if_empty(db.conn(), "c1", "Second").unwrap());
        let conv = ConversationQueries::get_by_id(db.conn(), "c1").unwrap().unwrap();
        assert_eq!(conv.title, "First");
    }

    #[test]
    fn last_seq_is_none_for_empty_conversation() {
        let db = db_with_conversation("c1");
        assert_eq!(MessageQueries::last_seq(db.conn(), "c1").unwrap(), None);
    }

    #[test]
    fn append_next_starts_at_zero_and_increments() {
        let db = db_with_conversation("c1");
        let a = MessageQueries::append_next(db.conn(), "c1", MessageSender::User, "a").unwrap();
        let b = MessageQueries::append_next(db.conn(), "c1", MessageSender::Assistant, "b").unwrap();
        assert_eq!(a.seq, 0);
        assert_eq!(b.seq, 1);
        assert_eq!(MessageQueries::last_seq(db.conn(), "c1").unwrap(), Some(1));
    }

    #[test]
    fn append_next_continues_after_gaps() {
        let db = db_with_conversation("c1");
        let msg = Message::new("c1".into(), MessageSender::User, "x".into(), 7);
        MessageQueries::insert_at(db.conn(), &msg).unwrap();
        let next = MessageQueries::append_next(db.conn(), "c1", MessageSender::User, "y").unwrap();
        assert_eq!(next.seq, 8);
    }

    #[test]
    fn duplicate_seq_is_a_conflict() {
        let db = db_with_conversation("c1");
        let first = Message::new("c1".into(), MessageSender::User, "one".into(), 0);
        let second = Message::new("c1".into(), MessageSender::User, "two".into(), 0);
        MessageQueries::insert_at(db.conn(), &first).unwrap();

        let err = MessageQueries::insert_at(db.conn(), &second).unwrap_err();
        assert!(err.is_seq_conflict(), "unexpected error: {err}");

        let messages = MessageQueries::list_ordered(db.conn(), "c1").unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text, "one");
    }

    #[test]
    fn same_seq_in_other_conversation_is_fine() {
        let db = db_with_conversation("c1");
        ConversationQueries::upsert(db.conn(), &Conversation::new("c2".into())).unwrap();
        for id in ["c1", "c2"] {
            let msg = Message::new(id.into(), MessageSender::User, "hi".into(), 0);
            MessageQueries::insert_at(db.conn(), &msg).unwrap();
        }
    }

    #[test]
    fn insert_if_absent_keeps_existing_row() {
        let db = db_with_conversation("c1");
        let first = Message::new("c1".into(), MessageSender::User, "original".into(), 0);
        let retry = Message::new("c1".into(), MessageSender::User, "retry".into(), 0);
        assert!(MessageQueries::insert_if_absent(db.conn(), &first).unwrap());
        assert!(!MessageQueries::insert_if_absent(db.conn(), &retry).unwrap());
        let messages = MessageQueries::list_ordered(db.conn(), "c1").unwrap();
        assert_eq!(messages[0].text, "original");
    }

    #[test]
    fn list_orders_by_seq() {
        let db = db_with_conversation("c1");
        for (seq, text) in [(2, "c"), (0, "a"), (1, "b")] {
            let msg = Message::new("c1".into(), MessageSender::User, text.into(), seq);
            MessageQueries::insert_at(db.conn(), &msg).unwrap();
        }
        let texts: Vec<_> = MessageQueries::list_ordered(db.conn(), "c1")
            .unwrap()
            .into_iter()
            .map(|m| m.text)
            .collect();
        assert_eq!(texts, ["a", "b", "c"]);
    }

    #[test]
    fn append_touches_conversation() {
        let db = db_with_conversation("c1");
        let before = ConversationQueries::get_by_id(db.conn(), "c1").unwrap().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        MessageQueries::append_next(db.conn(), "c1", MessageSender::User, "hi").unwrap();
        let after = ConversationQueries::get_by_id(db.conn(), "c1").unwrap().unwrap();
        assert!(after.updated_at > before.updated_at);
    }

    #[test]
    fn failed_touch_rolls_back_the_insert() {
        let db = db_with_conversation("c1");
        db.conn()
            .execute_batch(
                "CREATE TRIGGER freeze BEFORE UPDATE ON conversations
                 BEGIN SELECT RAISE(ABORT, 'frozen'); END;",
            )
            .unwrap();

        let msg = Message::new("c1".into(), MessageSender::User, "hi".into(), 0);
        let err = MessageQueries::insert_at(db.conn(), &msg).unwrap_err();
        assert!(!err.is_seq_conflict());
        assert!(MessageQueries::append_next(db.conn(), "c1", MessageSender::User, "hi").is_err());
        assert!(MessageQueries::insert_if_absent(db.conn(), &msg).is_err());

        assert!(MessageQueries::list_ordered(db.conn(), "c1").unwrap().is_empty());
    }

    #[test]
    fn concurrent_appends_never_share_a_seq() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("race.db");
        {
            let db = Database::open_at(&path).unwrap();
            ConversationQueries::upsert(db.conn(), &Conversation::new("c1".into())).unwrap();
        }

        let handles: Vec<_> = (0..2)
            .map(|writer| {
                let path = path.clone();
                std::thread::spawn(move || {
                    let db = Database::open_at(&path).unwrap();
                    for i in 0..20 {
                        MessageQueries::append_next(
                            db.conn(),
                            "c1",
                            MessageSender::User,
                            &format!("w{writer}-{i}"),
                        )
                        .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let db = Database::open_at(&path).unwrap();
        let seqs: Vec<i64> = MessageQueries::list_ordered(db.conn(), "c1")
            .unwrap()
            .iter()
            .map(|m| m.seq)
            .collect();
        assert_eq!(seqs, (0..40).collect::<Vec<_>>());
    }
}
