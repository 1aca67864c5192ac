//! Local conversation state kept by the client.
//!
//! State is keyed by conversation id so several conversations can stream at
//! once without one reply leaking into another's scratch buffer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use uuid::Uuid;

use super::error::{ClientError, ClientResult};
use crate::models::{Message, MessageSender};
use crate::protocol::WireEvent;

/// Role of a message as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiRole {
    User,
    Assistant,
}

impl From<MessageSender> for UiRole {
    fn from(sender: MessageSender) -> Self {
        match sender {
            MessageSender::User => Self::User,
            MessageSender::Assistant => Self::Assistant,
        }
    }
}

/// A message in the local list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UiMessage {
    /// Locally minted id; unrelated to the server row id.
    pub id: String,
    pub role: UiRole,
    pub content: String,
}

impl UiMessage {
    pub fn new(role: UiRole, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(UiRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(UiRole::Assistant, content)
    }
}

impl From<&Message> for UiMessage {
    fn from(message: &Message) -> Self {
        Self::new(message.sender.into(), message.text.clone())
    }
}

/// How a reply stream ended, from the client's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    /// A `complete` event arrived; the finalized message was appended.
    Completed(UiMessage),
    /// An `error` event arrived; nothing was appended.
    Failed(String),
    /// The body ended without a terminal event.
    Ended,
}

#[derive(Debug, Default)]
struct ConversationEntry {
    messages: Vec<UiMessage>,
    streaming_text: String,
    is_streaming: bool,
}

/// Shared, per-conversation client state.
///
/// Cloning is cheap; clones share the same underlying map.
#[derive(Debug, Clone, Default)]
pub struct ConversationState {
    inner: Arc<Mutex<HashMap<String, ConversationEntry>>>,
}

impl ConversationState {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ConversationEntry>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_entry<T>(&self, conversation_id: &str, f: impl FnOnce(&mut ConversationEntry) -> T) -> T {
        let mut map = self.lock();
        let entry = map.entry(conversation_id.to_string()).or_default();
        f(entry)
    }

    /// Replace the message list of a conversation.
    pub fn set_messages(&self, conversation_id: &str, messages: Vec<UiMessage>) {
        self.with_entry(conversation_id, |entry| entry.messages = messages);
    }

    pub fn add_message(&self, conversation_id: &str, message: UiMessage) {
        self.with_entry(conversation_id, |entry| entry.messages.push(message));
    }

    pub fn messages(&self, conversation_id: &str) -> Vec<UiMessage> {
        self.lock()
            .get(conversation_id)
            .map(|entry| entry.messages.clone())
            .unwrap_or_default()
    }

    /// Text of the reply currently streaming (or of the last one that failed).
    pub fn streaming_text(&self, conversation_id: &str) -> String {
        self.lock()
            .get(conversation_id)
            .map(|entry| entry.streaming_text.clone())
            .unwrap_or_default()
    }

    pub fn is_streaming(&self, conversation_id: &str) -> bool {
        self.lock()
            .get(conversation_id)
            .is_some_and(|entry| entry.is_streaming)
    }

    /// Mark a conversation as streaming and reset its scratch buffer.
    ///
    /// The returned guard puts the conversation back to idle when dropped,
    /// whichever way the stream ends.
    pub fn begin_stream(&self, conversation_id: &str) -> ClientResult<StreamingGuard> {
        self.with_entry(conversation_id, |entry| {
            if entry.is_streaming {
                return Err(ClientError::AlreadyStreaming(conversation_id.to_string()));
            }
            entry.is_streaming = true;
            entry.streaming_text.clear();
            Ok(())
        })?;
        Ok(StreamingGuard {
            state: self.clone(),
            conversation_id: conversation_id.to_string(),
        })
    }

    fn end_stream(&self, conversation_id: &str) {
        if let Some(entry) = self.lock().get_mut(conversation_id) {
            entry.is_streaming = false;
        }
    }

    /// Apply one wire event to a conversation.
    ///
    /// Returns `Some` once the event ends the stream. A `complete` event is
    /// finalized from its own content, not from the scratch buffer; an
    /// `error` leaves the scratch buffer untouched.
    pub fn apply(&self, conversation_id: &str, event: &WireEvent) -> Option<StreamOutcome> {
        self.with_entry(conversation_id, |entry| match event {
            WireEvent::Chunk { content, .. } => {
                entry.streaming_text.push_str(content);
                None
            }
            WireEvent::Complete { content } => {
                let message = UiMessage::assistant(content.as_str());
                entry.messages.push(message.clone());
                entry.streaming_text.clear();
                entry.is_streaming = false;
                Some(StreamOutcome::Completed(message))
            }
            WireEvent::Error { error } => {
                entry.is_streaming = false;
                Some(StreamOutcome::Failed(error.clone()))
            }
        })
    }
}

/// Resets a conversation's streaming flag when dropped.
#[derive(Debug)]
pub struct StreamingGuard {
    state: ConversationState,
    conversation_id: String,
}

impl Drop for StreamingGuard {
    fn drop(&mut self) {
        self.state.end_stream(&self.conversation_id);
    }
}
