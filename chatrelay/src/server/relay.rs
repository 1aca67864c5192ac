//! The stream relay: turns one user message into a persisted exchange while
//! forwarding the reply to the caller fragment by fragment.
//!
//! The relay task writes encoded frames into a bounded channel that backs the
//! response body. A closed channel means the client went away; the relay
//! then stops pulling from the provider and drops its stream, which cancels
//! the upstream request. Nothing is persisted for an abandoned or failed
//! reply.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::http::header::{CACHE_CONTROL, CONNECTION, CONTENT_TYPE};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;

use super::ServerState;
use crate::db::{DbError, MessageQueries};
use crate::models::{Message, MessageSender};
use crate::protocol::{WireEvent, EVENT_STREAM_CONTENT_TYPE};
use crate::provider::ChatMessage;

/// Frames buffered between the relay task and the response body.
const FRAME_BUFFER: usize = 16;

/// Message sent to the client when generation fails.
const GENERATION_FAILED: &str = "Failed to generate response";
/// Message sent to the client when the reply runs past the time limit.
const GENERATION_TIMED_OUT: &str = "Response took too long and was stopped";

/// Ephemeral state of one streamed reply.
#[derive(Debug)]
pub struct StreamSession {
    pub conversation_id: String,
    /// Seq the finished reply will be stored at.
    pub reply_seq: i64,
    accumulated: String,
    fragments: usize,
}

impl StreamSession {
    pub const fn new(conversation_id: String, reply_seq: i64) -> Self {
        Self {
            conversation_id,
            reply_seq,
            accumulated: String::new(),
            fragments: 0,
        }
    }

    fn push(&mut self, fragment: &str) {
        self.accumulated.push_str(fragment);
        self.fragments += 1;
    }
}

/// How a relay ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    /// Provider finished; `persisted` is false for an empty reply or a
    /// failed write.
    Completed { persisted: bool },
    /// Provider raised an error mid-stream.
    ProviderFailed,
    /// The reply ran past the configured time limit.
    TimedOut,
    /// The client closed the connection.
    Disconnected,
}

/// Store the incoming message and decide where the reply will go.
///
/// The seq is read, then claimed with an insert; if another writer took it
/// first the message is re-appended at a freshly allocated seq. Any other
/// write failure is logged and swallowed so the exchange can still proceed.
/// Returns the seq reserved for the reply.
pub async fn record_incoming(
    state: &ServerState,
    conversation_id: &str,
    sender: MessageSender,
    text: &str,
    save: bool,
) -> Result<i64, DbError> {
    let db = state.db().await;
    let conn = db.conn();

    let next_seq = MessageQueries::last_seq(conn, conversation_id)?.map_or(0, |seq| seq + 1);
    if !save {
        return Ok(next_seq);
    }

    let message = Message::new(conversation_id.to_string(), sender, text.to_string(), next_seq);
    let stored_seq = match MessageQueries::insert_at(conn, &message) {
        Ok(_) => next_seq,
        Err(e) if e.is_seq_conflict() => {
            tracing::warn!(conversation_id, seq = next_seq, "seq taken by a concurrent writer, re-appending");
            match MessageQueries::append_next(conn, conversation_id, sender, text) {
                Ok(stored) => stored.seq,
                Err(e) => {
                    tracing::error!(conversation_id, error = %e, "failed to persist incoming message");
                    next_seq
                }
            }
        }
        Err(e) => {
            tracing::error!(conversation_id, error = %e, "failed to persist incoming message");
            next_seq
        }
    };

    tracing::debug!(conversation_id, seq = stored_seq, %sender, "stored incoming message");
    Ok(stored_seq + 1)
}

/// Spawn the relay task and return the streaming response that carries its
/// frames.
pub fn start(state: Arc<ServerState>, session: StreamSession, context: Vec<ChatMessage>) -> Response {
    let (tx, rx) = mpsc::channel::<String>(FRAME_BUFFER);

    tokio::spawn(async move {
        run_relay(&state, session, context, tx).await;
    });

    let body = Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, Infallible>));
    (
        [
            (CONTENT_TYPE, EVENT_STREAM_CONTENT_TYPE),
            (CACHE_CONTROL, "no-cache"),
            (CONNECTION, "keep-alive"),
        ],
        body,
    )
        .into_response()
}

/// Drive the provider and forward every fragment as a `chunk` frame.
///
/// Frames are sent one at a time in provider order; the bounded channel
/// means a slow reader slows the relay down rather than piling up frames.
/// The time limit covers those sends too, so a client that stays connected
/// but stops reading is cut off like a slow provider.
#[tracing::instrument(
    name = "relay",
    skip_all,
    fields(conversation_id = %session.conversation_id, reply_seq = session.reply_seq)
)]
pub async fn run_relay(
    state: &ServerState,
    mut session: StreamSession,
    context: Vec<ChatMessage>,
    tx: mpsc::Sender<String>,
) -> RelayEnd {
    let provider = state.provider();
    tracing::info!(provider = provider.name(), context = context.len(), "starting reply");

    let mut fragments = provider.stream_completion(context);
    let deadline = Instant::now() + state.max_stream_duration();

    loop {
        let next = tokio::select! {
            biased;
            () = tx.closed() => {
                tracing::info!(fragments = session.fragments, "client disconnected, abandoning reply");
                return RelayEnd::Disconnected;
            }
            () = tokio::time::sleep_until(deadline) => {
                tracing::warn!(fragments = session.fragments, "reply exceeded time limit");
                emit_now(&tx, &WireEvent::error(GENERATION_TIMED_OUT));
                return RelayEnd::TimedOut;
            }
            next = fragments.next() => next,
        };

        match next {
            Some(Ok(fragment)) => {
                if fragment.is_empty() {
                    continue;
                }
                session.push(&fragment);
                match emit(&tx, &WireEvent::chunk(fragment), deadline).await {
                    Delivery::Sent => {}
                    Delivery::Closed => {
                        tracing::info!(fragments = session.fragments, "client disconnected, abandoning reply");
                        return RelayEnd::Disconnected;
                    }
                    Delivery::Expired => {
                        tracing::warn!(fragments = session.fragments, "client stopped reading before the time limit");
                        emit_now(&tx, &WireEvent::error(GENERATION_TIMED_OUT));
                        return RelayEnd::TimedOut;
                    }
                }
            }
            Some(Err(e)) => {
                tracing::error!(error = %e, fragments = session.fragments, "provider failed mid-stream");
                emit(&tx, &WireEvent::error(GENERATION_FAILED), deadline).await;
                return RelayEnd::ProviderFailed;
            }
            None => break,
        }
    }
    drop(fragments);

    let persisted = if session.accumulated.is_empty() {
        false
    } else {
        persist_reply(state, &session).await
    };

    let complete = WireEvent::complete(session.accumulated.as_str());
    if emit(&tx, &complete, deadline).await == Delivery::Expired {
        tracing::warn!("client stopped reading before the final frame");
    }
    tracing::info!(fragments = session.fragments, persisted, "reply complete");
    RelayEnd::Completed { persisted }
}

/// Store the assembled reply at its reserved seq. If that seq was taken in
/// the meantime, the reply is appended at the next free one instead.
async fn persist_reply(state: &ServerState, session: &StreamSession) -> bool {
    let db = state.db().await;
    let conn = db.conn();
    let reply = Message::new(
        session.conversation_id.clone(),
        MessageSender::Assistant,
        session.accumulated.clone(),
        session.reply_seq,
    );

    let result = match MessageQueries::insert_at(conn, &reply) {
        Err(e) if e.is_seq_conflict() => {
            tracing::warn!(seq = session.reply_seq, "reply seq taken by a concurrent writer, re-appending");
            MessageQueries::append_next(
                conn,
                &session.conversation_id,
                MessageSender::Assistant,
                &session.accumulated,
            )
            .map(|stored| stored.id)
        }
        other => other,
    };

    match result {
        Ok(_) => true,
        Err(e) => {
            tracing::error!(error = %e, "failed to persist reply");
            false
        }
    }
}

/// What happened to a frame handed to [`emit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Sent,
    /// The client is gone (or the frame could not be encoded).
    Closed,
    /// The channel stayed full until the deadline.
    Expired,
}

fn encode(event: &WireEvent) -> Option<String> {
    match event.encode() {
        Ok(frame) => Some(frame),
        Err(e) => {
            tracing::error!(error = %e, event = event.type_label(), "failed to encode wire event");
            None
        }
    }
}

/// Encode and send one frame, waiting for channel space no later than
/// `deadline`.
async fn emit(tx: &mpsc::Sender<String>, event: &WireEvent, deadline: Instant) -> Delivery {
    let Some(frame) = encode(event) else {
        return Delivery::Closed;
    };
    match tokio::time::timeout_at(deadline, tx.send(frame)).await {
        Ok(Ok(())) => Delivery::Sent,
        Ok(Err(_)) => Delivery::Closed,
        Err(_) => Delivery::Expired,
    }
}

/// Send a last frame only if there is room for it right now.
fn emit_now(tx: &mpsc::Sender<String>, event: &WireEvent) {
    if let Some(frame) = encode(event) {
        if tx.try_send(frame).is_err() {
            tracing::debug!(event = event.type_label(), "no room for final frame, dropping it");
        }
    }
}
