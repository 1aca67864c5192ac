//! Database module for `SQLite` operations.

mod connection;
mod error;
mod queries;

pub use connection::Database;
pub use error::{DbError, DbResult};
pub use queries::{ConversationQueries, MessageQueries};
