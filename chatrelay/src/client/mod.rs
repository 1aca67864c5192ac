//! HTTP client for a chatrelay server.
//!
//! `ChatClient` sends messages, reads the streamed reply and keeps the local
//! [`ConversationState`] in step with it.

mod error;
mod state;

use futures::{Stream, StreamExt};
use reqwest::StatusCode;

use crate::api::{ConversationView, CreateConversationRequest, ErrorBody, SendMessageRequest};
use crate::models::MessageSender;
use crate::protocol::{parse_line, LineDecoder, LineOutcome, WireEvent};

pub use error::{ClientError, ClientResult};
pub use state::{ConversationState, StreamOutcome, StreamingGuard, UiMessage, UiRole};

/// Options for a single send.
#[derive(Debug, Clone, Copy)]
pub struct SendOptions {
    /// Ask the server to store the text before replying.
    pub save_user_message: bool,
    /// Append the text to the local list before the request goes out.
    pub append_to_store: bool,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            save_user_message: true,
            append_to_store: true,
        }
    }
}

/// What a consumed stream looked like.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSummary {
    pub outcome: StreamOutcome,
    /// `chunk` events applied.
    pub chunks: usize,
    /// `data:` lines that could not be parsed.
    pub malformed: usize,
}

/// Client for one chatrelay server.
#[derive(Debug, Clone)]
pub struct ChatClient {
    http: reqwest::Client,
    base_url: String,
    state: ConversationState,
}

impl ChatClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            state: ConversationState::new(),
        }
    }

    /// Local state shared by every clone of this client.
    pub const fn state(&self) -> &ConversationState {
        &self.state
    }

    fn messages_url(&self, conversation_id: &str) -> String {
        format!(
            "{}/conversations/{}/messages",
            self.base_url,
            urlencoding::encode(conversation_id)
        )
    }

    /// Create a conversation with its first user message.
    ///
    /// Safe to retry: the server treats a repeated id as the same
    /// conversation.
    pub async fn create_conversation(
        &self,
        conversation_id: &str,
        first_message: &str,
    ) -> ClientResult<ConversationView> {
        let req = CreateConversationRequest {
            conversation_id: Some(conversation_id.to_string()),
            first_message: Some(first_message.to_string()),
            sender: Some(MessageSender::User.as_str().to_string()),
        };
        let resp = self
            .http
            .post(format!("{}/conversations", self.base_url))
            .json(&req)
            .send()
            .await?;
        let view: ConversationView = check_status(resp).await?.json().await?;

        self.state.set_messages(
            conversation_id,
            view.messages.iter().map(UiMessage::from).collect(),
        );
        tracing::debug!(conversation_id, "conversation created");
        Ok(view)
    }

    /// Fetch a conversation and rebuild its local message list.
    ///
    /// Returns `None` if the server does not know the conversation.
    pub async fn load_conversation(
        &self,
        conversation_id: &str,
    ) -> ClientResult<Option<ConversationView>> {
        let resp = self.http.get(self.messages_url(conversation_id)).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let view: ConversationView = check_status(resp).await?.json().await?;

        self.state.set_messages(
            conversation_id,
            view.messages.iter().map(UiMessage::from).collect(),
        );
        Ok(Some(view))
    }

    /// Send a user message and stream the reply into local state.
    pub async fn send_message(
        &self,
        conversation_id: &str,
        text: &str,
    ) -> ClientResult<StreamSummary> {
        self.send_message_with(conversation_id, text, SendOptions::default(), |_| {})
            .await
    }

    /// Like [`send_message`](Self::send_message), calling `on_event` for
    /// every event as it is applied.
    pub async fn send_message_with(
        &self,
        conversation_id: &str,
        text: &str,
        options: SendOptions,
        on_event: impl FnMut(&WireEvent),
    ) -> ClientResult<StreamSummary> {
        let _guard = self.state.begin_stream(conversation_id)?;

        if options.append_to_store {
            self.state.add_message(conversation_id, UiMessage::user(text));
        }

        let mut req = SendMessageRequest::new(MessageSender::User, text);
        req.save_user_message = options.save_user_message;

        let resp = self
            .http
            .post(self.messages_url(conversation_id))
            .json(&req)
            .send()
            .await?;
        let resp = check_status(resp).await?;

        let summary = consume_stream(&self.state, conversation_id, resp.bytes_stream(), on_event).await?;
        tracing::debug!(
            conversation_id,
            chunks = summary.chunks,
            malformed = summary.malformed,
            outcome = ?summary.outcome,
            "reply stream finished"
        );
        Ok(summary)
    }
}

/// Turn a non-success response into [`ClientError::Status`], preferring the
/// server's `{"error": ...}` message over the raw body.
async fn check_status(resp: reqwest::Response) -> ClientResult<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let body = serde_json::from_str::<ErrorBody>(&body).map_or(body, |e| e.error);
    Err(ClientError::Status {
        status: status.as_u16(),
        body,
    })
}

/// Read a reply body to its end, applying each event to `state`.
///
/// Stops at the first terminal event. Malformed lines are logged and
/// skipped. A body that ends without a terminal event yields
/// [`StreamOutcome::Ended`]; a transport error is returned as is and leaves
/// no assistant message behind.
pub async fn consume_stream<S, B, E>(
    state: &ConversationState,
    conversation_id: &str,
    body: S,
    mut on_event: impl FnMut(&WireEvent),
) -> ClientResult<StreamSummary>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: Into<ClientError>,
{
    let mut body = std::pin::pin!(body);
    let mut decoder = LineDecoder::new();
    let mut reader = LineReader {
        state,
        conversation_id,
        chunks: 0,
        malformed: 0,
    };

    while let Some(bytes) = body.next().await {
        let bytes = bytes.map_err(Into::into)?;
        for line in decoder.push(bytes.as_ref()) {
            if let Some(outcome) = reader.handle_line(&line, &mut on_event) {
                return Ok(reader.finish(outcome));
            }
        }
    }

    // A final line without a trailing newline.
    if let Some(line) = decoder.finish() {
        if let Some(outcome) = reader.handle_line(&line, &mut on_event) {
            return Ok(reader.finish(outcome));
        }
    }

    tracing::debug!(conversation_id, "stream ended without a terminal event");
    Ok(reader.finish(StreamOutcome::Ended))
}

struct LineReader<'a> {
    state: &'a ConversationState,
    conversation_id: &'a str,
    chunks: usize,
    malformed: usize,
}

impl LineReader<'_> {
    fn handle_line<F>(&mut self, line: &str, on_event: &mut F) -> Option<StreamOutcome>
    where
        F: FnMut(&WireEvent),
    {
        let event = match parse_line(line) {
            LineOutcome::Ignored => return None,
            LineOutcome::Malformed(e) => {
                self.malformed += 1;
                tracing::warn!(conversation_id = self.conversation_id, error = %e, "skipping malformed event");
                return None;
            }
            LineOutcome::Event(event) => event,
        };

        if matches!(event, WireEvent::Chunk { .. }) {
            self.chunks += 1;
        }
        if let WireEvent::Error { error } = &event {
            tracing::warn!(conversation_id = self.conversation_id, error = %error, "server reported a failed reply");
        }

        let outcome = self.state.apply(self.conversation_id, &event);
        on_event(&event);
        outcome
    }

    fn finish(self, outcome: StreamOutcome) -> StreamSummary {
        StreamSummary {
            outcome,
            chunks: self.chunks,
            malformed: self.malformed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(events: &[WireEvent]) -> String {
        events.iter().map(|e| e.encode().unwrap()).collect()
    }

    fn body_of(parts: Vec<Vec<u8>>) -> impl Stream<Item = Result<Vec<u8>, ClientError>> {
        futures::stream::iter(parts.into_iter().map(Ok))
    }

    #[tokio::test]
    async fn consumes_chunks_then_complete() {
        let state = ConversationState::new();
        let _guard = state.begin_stream("c1").unwrap();
        let wire = frames(&[
            WireEvent::chunk("Hi"),
            WireEvent::chunk(" there"),
            WireEvent::chunk("!"),
            WireEvent::complete("Hi there!"),
        ]);

        let mut progression = Vec::new();
        let summary = consume_stream(&state, "c1", body_of(vec![wire.into_bytes()]), |event| {
            if matches!(event, WireEvent::Chunk { .. }) {
                progression.push(state.streaming_text("c1"));
            }
        })
        .await
        .unwrap();

        assert_eq!(progression, ["Hi", "Hi there", "Hi there!"]);
        assert_eq!(summary.chunks, 3);
        assert!(matches!(
            summary.outcome,
            StreamOutcome::Completed(ref m) if m.content == "Hi there!"
        ));
        assert_eq!(state.messages("c1").len(), 1);
    }

    #[tokio::test]
    async fn frames_split_anywhere_decode_the_same() {
        let state = ConversationState::new();
        let _guard = state.begin_stream("c1").unwrap();
        let wire = frames(&[
            WireEvent::chunk("héllo "),
            WireEvent::chunk("wörld 👋"),
            WireEvent::complete("héllo wörld 👋"),
        ])
        .into_bytes();

        // Three-byte pieces cut through both the frames and the multibyte chars.
        let parts: Vec<Vec<u8>> = wire.chunks(3).map(<[u8]>::to_vec).collect();
        let summary = consume_stream(&state, "c1", body_of(parts), |_| {})
            .await
            .unwrap();

        assert_eq!(summary.chunks, 2);
        assert_eq!(summary.malformed, 0);
        assert_eq!(state.messages("c1")[0].content, "héllo wörld 👋");
    }

    #[tokio::test]
    async fn malformed_line_is_skipped() {
        let state = ConversationState::new();
        let _guard = state.begin_stream("c1").unwrap();
        let mut wire = String::from("data: {not json\n\n");
        wire.push_str(&frames(&[WireEvent::complete("ok")]));

        let summary = consume_stream(&state, "c1", body_of(vec![wire.into_bytes()]), |_| {})
            .await
            .unwrap();

        assert_eq!(summary.malformed, 1);
        assert_eq!(summary.outcome, StreamOutcome::Completed(state.messages("c1")[0].clone()));
    }

    #[tokio::test]
    async fn complete_content_wins_over_accumulated_text() {
        let state = ConversationState::new();
        let _guard = state.begin_stream("c1").unwrap();
        let wire = frames(&[WireEvent::chunk("draft"), WireEvent::complete("final")]);

        consume_stream(&state, "c1", body_of(vec![wire.into_bytes()]), |_| {})
            .await
            .unwrap();

        assert_eq!(state.messages("c1")[0].content, "final");
    }

    #[tokio::test]
    async fn processing_stops_at_terminal_event() {
        let state = ConversationState::new();
        let _guard = state.begin_stream("c1").unwrap();
        let wire = frames(&[
            WireEvent::error("Failed to generate response"),
            WireEvent::complete("late"),
        ]);

        let summary = consume_stream(&state, "c1", body_of(vec![wire.into_bytes()]), |_| {})
            .await
            .unwrap();

        assert_eq!(
            summary.outcome,
            StreamOutcome::Failed("Failed to generate response".into())
        );
        assert!(state.messages("c1").is_empty());
    }

    #[tokio::test]
    async fn unterminated_last_line_is_processed() {
        let state = ConversationState::new();
        let _guard = state.begin_stream("c1").unwrap();
        let wire = frames(&[WireEvent::complete("tail")]);
        let wire = wire.trim_end().to_string();

        let summary = consume_stream(&state, "c1", body_of(vec![wire.into_bytes()]), |_| {})
            .await
            .unwrap();

        assert!(matches!(summary.outcome, StreamOutcome::Completed(_)));
    }

    #[tokio::test]
    async fn body_ending_early_commits_nothing() {
        let state = ConversationState::new();
        let _guard = state.begin_stream("c1").unwrap();
        let wire = frames(&[WireEvent::chunk("Hi")]);

        let summary = consume_stream(&state, "c1", body_of(vec![wire.into_bytes()]), |_| {})
            .await
            .unwrap();

        assert_eq!(summary.outcome, StreamOutcome::Ended);
        assert!(state.messages("c1").is_empty());
    }

    #[tokio::test]
    async fn transport_error_leaves_state_idle() {
        let state = ConversationState::new();
        let wire = frames(&[WireEvent::chunk("Hi")]).into_bytes();
        let body = futures::stream::iter(vec![
            Ok(wire),
            Err(std::io::Error::other("connection reset")),
        ]);

        let result = {
            let _guard = state.begin_stream("c1").unwrap();
            consume_stream(&state, "c1", body, |_| {}).await
        };

        assert!(matches!(result, Err(ClientError::Io(_))));
        assert!(!state.is_streaming("c1"));
        assert!(state.messages("c1").is_empty());
    }

    #[test]
    fn send_options_default_to_saving_and_appending() {
        let options = SendOptions::default();
        assert!(options.save_user_message);
        assert!(options.append_to_store);
    }
}
