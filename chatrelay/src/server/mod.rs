//! chatrelay HTTP server.
//!
//! Endpoints:
//! - POST /conversations - Create a conversation with its first message
//! - GET /conversations/{id}/messages - Conversation and ordered messages
//! - POST /conversations/{id}/messages - Send a message; user messages get a
//!   streamed reply (`text/event-stream`), others a 201 with the message list

mod error;
pub mod relay;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, MutexGuard};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api::{
    ConversationView, CreateConversationRequest, MessagesResponse, SendMessageRequest,
};
use crate::config::ServerConfig;
use crate::db::{ConversationQueries, Database, MessageQueries};
use crate::models::{derive_title, Conversation, Message, MessageSender};
use crate::provider::{self, ChatMessage, CompletionProvider};

pub use error::ApiError;
pub use relay::{RelayEnd, StreamSession};

/// Shared server state.
pub struct ServerState {
    /// The message store; the only state shared between requests.
    db: Mutex<Database>,
    /// Where replies come from.
    provider: Arc<dyn CompletionProvider>,
    /// Longest a single reply may stream.
    max_stream_duration: Duration,
}

impl ServerState {
    pub fn new(
        db: Database,
        provider: Arc<dyn CompletionProvider>,
        max_stream_duration: Duration,
    ) -> Self {
        Self {
            db: Mutex::new(db),
            provider,
            max_stream_duration,
        }
    }

    /// Lock the database.
    pub async fn db(&self) -> MutexGuard<'_, Database> {
        self.db.lock().await
    }

    pub fn provider(&self) -> Arc<dyn CompletionProvider> {
        Arc::clone(&self.provider)
    }

    pub const fn max_stream_duration(&self) -> Duration {
        self.max_stream_duration
    }
}

// === Server Lifecycle ===

/// Build the router.
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/conversations", post(create_conversation))
        .route(
            "/conversations/{id}/messages",
            get(get_messages).post(post_message),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Open the database, build the provider and serve until Ctrl-C.
pub async fn start_server(config: &ServerConfig) -> Result<()> {
    let db = Database::open_at(&config.db_path)
        .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?;
    let provider = provider::build(config)?;
    let provider_name = provider.name();
    let state = Arc::new(ServerState::new(db, provider, config.max_stream_duration));

    let addr = SocketAddr::from(([127, 0, 0, 1], config.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    println!("chatrelay server starting on http://{addr}");
    tracing::info!(
        %addr,
        provider = provider_name,
        db = %config.db_path.display(),
        "server started"
    );

    serve(listener, state).await
}

/// Serve on an already-bound listener.
pub async fn serve(listener: TcpListener, state: Arc<ServerState>) -> Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

// === Handlers ===

fn invalid_json(rejection: &JsonRejection) -> ApiError {
    ApiError::InvalidPayload(rejection.body_text())
}

/// Check sender and text of an incoming message.
fn validate_send(req: &SendMessageRequest) -> Result<(MessageSender, String), ApiError> {
    let sender = req
        .sender
        .as_deref()
        .and_then(MessageSender::from_str)
        .ok_or_else(|| ApiError::InvalidPayload("sender must be \"user\" or \"assistant\"".into()))?;

    let text = req
        .text
        .as_deref()
        .filter(|text| !text.trim().is_empty())
        .ok_or_else(|| ApiError::InvalidPayload("text must not be empty".into()))?;

    Ok((sender, text.to_string()))
}

async fn create_conversation(
    State(state): State<Arc<ServerState>>,
    payload: Result<Json<CreateConversationRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ConversationView>), ApiError> {
    let Json(req) = payload.map_err(|e| invalid_json(&e))?;

    let conversation_id = req
        .conversation_id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| ApiError::InvalidPayload("conversationId is required".into()))?;
    let first_message = req
        .first_message
        .filter(|text| !text.trim().is_empty())
        .ok_or_else(|| ApiError::InvalidPayload("firstMessage must not be empty".into()))?;
    if req.sender.as_deref() != Some(MessageSender::User.as_str()) {
        return Err(ApiError::InvalidPayload("sender must be \"user\"".into()));
    }

    let db = state.db().await;
    let conn = db.conn();

    // Both writes are no-ops when the conversation already exists, so a
    // client retrying after a dropped response gets the same result.
    ConversationQueries::upsert(conn, &Conversation::new(conversation_id.clone()))?;
    let first = Message::new(
        conversation_id.clone(),
        MessageSender::User,
        first_message.clone(),
        0,
    );
    MessageQueries::insert_if_absent(conn, &first)?;

    let title = derive_title(&first_message);
    if !title.is_empty() {
        if let Err(e) = ConversationQueries::set_title_if_empty(conn, &conversation_id, &title) {
            tracing::warn!(conversation_id, error = %e, "failed to set conversation title");
        }
    }

    let chat = ConversationQueries::get_by_id(conn, &conversation_id)?.ok_or(ApiError::NotFound)?;
    let messages = MessageQueries::list_ordered(conn, &conversation_id)?;
    tracing::info!(conversation_id, messages = messages.len(), "conversation created");

    Ok((StatusCode::CREATED, Json(ConversationView { chat, messages })))
}

async fn get_messages(
    State(state): State<Arc<ServerState>>,
    Path(conversation_id): Path<String>,
) -> Result<Json<ConversationView>, ApiError> {
    let db = state.db().await;
    let chat = ConversationQueries::get_by_id(db.conn(), &conversation_id)?
        .ok_or(ApiError::NotFound)?;
    let messages = MessageQueries::list_ordered(db.conn(), &conversation_id)?;
    Ok(Json(ConversationView { chat, messages }))
}

/// Accept one message. User messages are answered with a streamed reply;
/// anything else is stored and acknowledged with the full message list.
async fn post_message(
    State(state): State<Arc<ServerState>>,
    Path(conversation_id): Path<String>,
    payload: Result<Json<SendMessageRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(req) = payload.map_err(|e| invalid_json(&e))?;
    let (sender, text) = validate_send(&req)?;

    if !ConversationQueries::exists(state.db().await.conn(), &conversation_id)? {
        return Err(ApiError::NotFound);
    }

    let reply_seq = relay::record_incoming(
        &state,
        &conversation_id,
        sender,
        &text,
        req.save_user_message,
    )
    .await?;

    let history = MessageQueries::list_ordered(state.db().await.conn(), &conversation_id)?;

    if !sender.triggers_reply() {
        return Ok((StatusCode::CREATED, Json(MessagesResponse { messages: history })).into_response());
    }

    let context: Vec<ChatMessage> = history.iter().map(ChatMessage::from).collect();
    let session = StreamSession::new(conversation_id, reply_seq);
    Ok(relay::start(state, session, context))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(sender: Option<&str>, text: Option<&str>) -> SendMessageRequest {
        SendMessageRequest {
            sender: sender.map(String::from),
            text: text.map(String::from),
            save_user_message: true,
        }
    }

    #[test]
    fn validate_accepts_known_senders() {
        let (sender, text) = validate_send(&request(Some("user"), Some(" hi "))).unwrap();
        assert_eq!(sender, MessageSender::User);
        assert_eq!(text, " hi ");

        let (sender, _) = validate_send(&request(Some("ai"), Some("x"))).unwrap();
        assert_eq!(sender, MessageSender::Assistant);
    }

    #[test]
    fn validate_rejects_bad_payloads() {
        for req in [
            request(None, Some("hi")),
            request(Some("robot"), Some("hi")),
            request(Some("user"), None),
            request(Some("user"), Some("   \n")),
        ] {
            assert!(matches!(
                validate_send(&req),
                Err(ApiError::InvalidPayload(_))
            ));
        }
    }
}
