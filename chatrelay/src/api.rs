//! JSON bodies of the HTTP API, shared by the server and the client.

use serde::{Deserialize, Serialize};

use crate::models::{Conversation, Message, MessageSender};

const fn default_true() -> bool {
    true
}

/// Body of `POST /conversations/{id}/messages`.
///
/// Fields are optional so that missing values are reported as an invalid
/// payload rather than a deserialization failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub sender: Option<String>,
    pub text: Option<String>,
    /// When false the text is not stored; a reply is generated over the
    /// history already persisted.
    #[serde(default = "default_true")]
    pub save_user_message: bool,
}

impl SendMessageRequest {
    pub fn new(sender: MessageSender, text: impl Into<String>) -> Self {
        Self {
            sender: Some(sender.as_str().to_string()),
            text: Some(text.into()),
            save_user_message: true,
        }
    }
}

/// Body of `POST /conversations`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateConversationRequest {
    pub conversation_id: Option<String>,
    pub first_message: Option<String>,
    pub sender: Option<String>,
}

/// A conversation together with its ordered messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationView {
    pub chat: Conversation,
    pub messages: Vec<Message>,
}

/// Acknowledgment for messages that do not trigger a reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesResponse {
    pub messages: Vec<Message>,
}

/// Error body returned before any streaming starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}
