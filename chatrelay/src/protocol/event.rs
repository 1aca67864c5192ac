//! Wire event vocabulary and line-level encoding.

use rand::distr::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Prefix that marks a line as carrying an event payload.
pub const DATA_PREFIX: &str = "data:";

/// Length of the random id attached to each chunk.
const CHUNK_ID_LEN: usize = 16;

/// One event of the streaming protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WireEvent {
    /// An incremental fragment of the reply.
    Chunk {
        content: String,
        #[serde(rename = "messageId")]
        message_id: String,
    },
    /// The reply finished; `content` is the full text as assembled by the relay.
    Complete { content: String },
    /// Generation failed after the stream started.
    Error { error: String },
}

impl WireEvent {
    /// Wrap a fragment in a chunk event with a fresh random id.
    pub fn chunk(content: impl Into<String>) -> Self {
        let message_id = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(CHUNK_ID_LEN)
            .map(char::from)
            .collect();
        Self::Chunk {
            content: content.into(),
            message_id,
        }
    }

    /// Build a completion event.
    pub fn complete(content: impl Into<String>) -> Self {
        Self::Complete {
            content: content.into(),
        }
    }

    /// Build an error event.
    pub fn error(error: impl Into<String>) -> Self {
        Self::Error {
            error: error.into(),
        }
    }

    /// Short label for logging.
    pub const fn type_label(&self) -> &'static str {
        match self {
            Self::Chunk { .. } => "chunk",
            Self::Complete { .. } => "complete",
            Self::Error { .. } => "error",
        }
    }

    /// Encode as a complete frame: `data: <JSON>\n\n`.
    pub fn encode(&self) -> serde_json::Result<String> {
        let json = serde_json::to_string(self)?;
        Ok(format!("{DATA_PREFIX} {json}\n\n"))
    }
}

/// Result of inspecting one line of the stream.
#[derive(Debug)]
pub enum LineOutcome {
    /// Blank line, comment or unknown framing.
    Ignored,
    /// A well-formed event.
    Event(WireEvent),
    /// A `data:` line whose payload is not a valid event.
    Malformed(serde_json::Error),
}

/// Inspect one line (without its terminating newline).
///
/// Lines that do not start with `data:` are ignored so unknown framing can be
/// added later without breaking older clients.
pub fn parse_line(line: &str) -> LineOutcome {
    let line = line.strip_suffix('\r').unwrap_or(line);
    let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
        return LineOutcome::Ignored;
    };
    let payload = payload.strip_prefix(' ').unwrap_or(payload);

    match serde_json::from_str::<WireEvent>(payload) {
        Ok(event) => LineOutcome::Event(event),
        Err(e) => LineOutcome::Malformed(e),
    }
}
