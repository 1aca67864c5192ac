//! Storage errors.

use thiserror::Error;

/// Result alias for storage operations.
pub type DbResult<T> = std::result::Result<T, DbError>;

/// Errors raised by the message and conversation stores.
#[derive(Debug, Error)]
pub enum DbError {
    /// Another writer already holds this sequence number.
    #[error("sequence {seq} already taken in conversation {conversation_id}")]
    SeqConflict { conversation_id: String, seq: i64 },

    /// A stored row could not be mapped back into a model.
    #[error("invalid row: {0}")]
    InvalidRow(String),

    /// Underlying `SQLite` failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Failed to prepare the database directory.
    #[error("database directory error: {0}")]
    Io(#[from] std::io::Error),
}

impl DbError {
    /// Whether the error is a (conversation, seq) uniqueness violation.
    pub const fn is_seq_conflict(&self) -> bool {
        matches!(self, Self::SeqConflict { .. })
    }
}
