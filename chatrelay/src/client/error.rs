//! Client error types.

use thiserror::Error;

/// Errors raised while talking to a chatrelay server.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("stream read failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("conversation {0} is already streaming a reply")]
    AlreadyStreaming(String),
}

pub type ClientResult<T> = Result<T, ClientError>;
