//! Message model representing one persisted turn of a conversation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who sent a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageSender {
    /// Message typed by the user.
    User,
    /// Message generated by the completion provider.
    #[serde(alias = "ai")]
    Assistant,
}

impl MessageSender {
    /// Convert sender to string for database storage.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    /// Parse sender from a database or wire string.
    ///
    /// `"ai"` is accepted as a legacy spelling of the assistant sender.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "assistant" | "ai" => Some(Self::Assistant),
            _ => None,
        }
    }

    /// Whether a message from this sender should trigger reply generation.
    pub const fn triggers_reply(self) -> bool {
        matches!(self, Self::User)
    }
}

impl std::fmt::Display for MessageSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A persisted message.
///
/// Messages are immutable once stored. Ordering within a conversation is
/// given by `seq`, which is unique per conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Row identifier (auto-incremented by DB).
    pub id: i64,
    /// Conversation this message belongs to.
    pub conversation_id: String,
    /// Who sent the message.
    pub sender: MessageSender,
    /// Message body.
    pub text: String,
    /// Position within the conversation.
    pub seq: i64,
    /// When the message was stored.
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Create a new message (id will be set by database).
    pub fn new(conversation_id: String, sender: MessageSender, text: String, seq: i64) -> Self {
        Self {
            id: 0, // Will be set by database on insert
            conversation_id,
            sender,
            text,
            seq,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sender_accepts_legacy_ai_alias() {
        assert_eq!(MessageSender::from_str("ai"), Some(MessageSender::Assistant));
        let parsed: MessageSender = serde_json::from_str("\"ai\"").unwrap();
        assert_eq!(parsed, MessageSender::Assistant);
        assert_eq!(serde_json::to_string(&parsed).unwrap(), "\"assistant\"");
    }

    #[test]
    fn sender_rejects_unknown_role() {
        assert_eq!(MessageSender::from_str("system"), None);
        assert!(serde_json::from_str::<MessageSender>("\"robot\"").is_err());
    }

    #[test]
    fn only_user_triggers_reply() {
        assert!(MessageSender::User.triggers_reply());
        assert!(!MessageSender::Assistant.triggers_reply());
    }

    #[test]
    fn message_serializes_camel_case() {
        let msg = Message::new("c1".into(), MessageSender::User, "hi".into(), 0);
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["conversationId"], "c1");
        assert_eq!(value["sender"], "user");
        assert!(value.get("createdAt").is_some());
    }
}
