//! Wire protocol shared by the relay and the client.
//!
//! Every event travels as one `data: <JSON>\n\n` frame over a chunked
//! `text/event-stream` response. The JSON carries a `type` discriminator:
//!
//! - `{"type":"chunk","content":"...","messageId":"..."}`
//! - `{"type":"complete","content":"..."}`
//! - `{"type":"error","error":"..."}`

mod decoder;
mod event;

pub use decoder::LineDecoder;
pub use event::{parse_line, LineOutcome, WireEvent, DATA_PREFIX};

/// Content type of the streaming response.
pub const EVENT_STREAM_CONTENT_TYPE: &str = "text/event-stream";
