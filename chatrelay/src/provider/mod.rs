//! Completion providers.
//!
//! A provider turns an ordered, role-tagged history into a lazy stream of
//! text fragments. Dropping the stream is the cancellation signal: providers
//! stop producing (and abort any upstream request) once it is dropped.

mod openai;
mod scripted;

use std::sync::Arc;

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{ProviderKind, ServerConfig};
use crate::models::{Message, MessageSender};

pub use openai::{OpenAiOptions, OpenAiProvider};
pub use scripted::{Script, ScriptedProvider};

/// Stream of reply fragments; ends when the reply is complete.
pub type FragmentStream = BoxStream<'static, Result<String, ProviderError>>;

/// Role of a message in provider context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// A role-tagged message handed to the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

impl From<&Message> for ChatMessage {
    fn from(message: &Message) -> Self {
        match message.sender {
            MessageSender::User => Self::user(message.text.clone()),
            MessageSender::Assistant => Self::assistant(message.text.clone()),
        }
    }
}

/// Errors raised while generating a completion.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("provider returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("could not decode provider stream: {0}")]
    Decode(String),

    #[error("{0}")]
    Scripted(String),
}

/// Something that can stream a completion for a conversation.
pub trait CompletionProvider: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Start generating a reply for `messages`, oldest first.
    fn stream_completion(&self, messages: Vec<ChatMessage>) -> FragmentStream;
}

/// Build the provider selected in the server configuration.
pub fn build(config: &ServerConfig) -> anyhow::Result<Arc<dyn CompletionProvider>> {
    match config.provider {
        ProviderKind::Openai => {
            let Some(api_key) = config.openai_api_key.clone() else {
                anyhow::bail!("OPENAI_API_KEY is required for the openai provider");
            };
            let options = OpenAiOptions {
                api_key,
                base_url: config.openai_base_url.clone(),
                model: config.model.clone(),
                temperature: config.temperature,
                max_tokens: config.max_tokens,
            };
            Ok(Arc::new(OpenAiProvider::new(options)))
        }
        ProviderKind::Scripted => Ok(Arc::new(ScriptedProvider::new(Script::Echo))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_maps_senders_to_roles() {
        let user = Message::new("c".into(), MessageSender::User, "q".into(), 0);
        let reply = Message::new("c".into(), MessageSender::Assistant, "a".into(), 1);
        assert_eq!(ChatMessage::from(&user), ChatMessage::user("q"));
        assert_eq!(ChatMessage::from(&reply), ChatMessage::assistant("a"));
    }

    #[test]
    fn openai_provider_needs_a_key() {
        let mut config = ServerConfig::for_tests();
        config.provider = ProviderKind::Openai;
        config.openai_api_key = None;
        assert!(build(&config).is_err());

        config.openai_api_key = Some("sk-test".into());
        assert_eq!(build(&config).unwrap().name(), "openai");
    }
}
