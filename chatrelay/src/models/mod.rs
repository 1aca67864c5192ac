//! Data models for chatrelay entities.

mod conversation;
mod message;

pub use conversation::{derive_title, Conversation};
pub use message::{Message, MessageSender};
