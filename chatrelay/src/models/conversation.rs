//! Conversation model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Longest title stored for a conversation, in characters.
const MAX_TITLE_CHARS: usize = 60;

/// A conversation. The id is minted by the client before the first write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    /// Client-generated identifier.
    pub id: String,
    /// Sidebar title (empty until set).
    pub title: String,
    /// When the conversation was created.
    pub created_at: DateTime<Utc>,
    /// When a message was last appended.
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// Create a new, untitled conversation.
    pub fn new(id: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            title: String::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Build a sidebar title from the first message of a conversation.
///
/// Quotes are stripped, line breaks collapse to single spaces and the result
/// is cut to [`MAX_TITLE_CHARS`] characters.
pub fn derive_title(first_message: &str) -> String {
    let mut title = String::with_capacity(first_message.len());
    let mut in_break = false;
    for ch in first_message.chars() {
        match ch {
            '"' | '\'' | '`' => {}
            '\n' | '\r' => {
                if !in_break {
                    title.push(' ');
                }
                in_break = true;
                continue;
            }
            _ => title.push(ch),
        }
        in_break = false;
    }
    title.trim().chars().take(MAX_TITLE_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_strips_quotes_and_newlines() {
        assert_eq!(derive_title("\"What's\"\r\n\nup?"), "Whats up?");
    }

    #[test]
    fn title_is_truncated_on_char_boundary() {
        let long = "é".repeat(100);
        let title = derive_title(&long);
        assert_eq!(title.chars().count(), 60);
    }

    #[test]
    fn new_conversation_is_untitled() {
        let conv = Conversation::new("abc".into());
        assert!(conv.title.is_empty());
        assert_eq!(conv.created_at, conv.updated_at);
    }
}
