//! Database connection management.

use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;

use super::error::DbResult;

/// Database wrapper for chatrelay.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open or create the database at a specific path.
    pub fn open_at(path: &Path) -> DbResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        // Other processes may hold the write lock briefly.
        conn.busy_timeout(Duration::from_secs(5))?;
        tracing::debug!(path = %path.display(), "opened database");

        let db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> DbResult<Self> {
        let db = Self {
            conn: Connection::open_in_memory()?,
        };
        db.initialize()?;
        Ok(db)
    }

    /// Initialize the database schema.
    ///
    /// `UNIQUE (conversation_id, seq)` is the ordering backstop: concurrent
    /// writers that pick the same seq lose at insert time.
    fn initialize(&self) -> DbResult<()> {
        self.conn.execute_batch(
            r"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id TEXT NOT NULL,
                sender TEXT NOT NULL,
                text TEXT NOT NULL,
                seq INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (conversation_id, seq),
                FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id, seq);
            CREATE INDEX IF NOT EXISTS idx_conversations_updated ON conversations(updated_at);
            ",
        )?;
        Ok(())
    }

    /// Get a reference to the connection.
    pub const fn conn(&self) -> &Connection {
        &self.conn
    }
}
