//! CLI command execution.
//!
//! `serve` runs the server in-process; every other command is a thin client
//! that talks to a running server over HTTP.

use std::io::Write;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use uuid::Uuid;

use crate::client::{ChatClient, SendOptions, StreamOutcome, StreamSummary};
use crate::config::{default_db_path, ServerConfig};
use crate::logging;
use crate::models::MessageSender;
use crate::protocol::WireEvent;
use crate::server;

use super::args::{Cli, Commands, ServeArgs};

/// Default log filter for the server.
const SERVER_LOG_FILTER: &str = "info,hyper=warn,reqwest=warn";
/// Default log filter for client commands; their output is the reply itself.
const CLIENT_LOG_FILTER: &str = "warn";

/// Generate a UUIDv7 (time-ordered, globally unique).
fn generate_uuid() -> String {
    Uuid::now_v7().to_string()
}

impl From<ServeArgs> for ServerConfig {
    fn from(args: ServeArgs) -> Self {
        Self {
            port: args.port,
            db_path: args.db.unwrap_or_else(default_db_path),
            provider: args.provider,
            model: args.model,
            openai_base_url: args.openai_base_url,
            openai_api_key: args.openai_api_key,
            temperature: args.temperature,
            max_tokens: args.max_tokens,
            max_stream_duration: Duration::from_secs(args.max_stream_secs),
        }
    }
}

/// Execute the CLI command.
pub async fn execute(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Serve(args) => {
            logging::init(SERVER_LOG_FILTER);
            server::start_server(&ServerConfig::from(args)).await
        }
        Commands::New { message } => {
            logging::init(CLIENT_LOG_FILTER);
            let message = join_message(&message)?;
            start_conversation(&cli.server, &message).await
        }
        Commands::Send { id, message } => {
            logging::init(CLIENT_LOG_FILTER);
            let message = join_message(&message)?;
            send_message(&cli.server, &id, &message).await
        }
        Commands::History { id } => {
            logging::init(CLIENT_LOG_FILTER);
            show_history(&cli.server, &id).await
        }
    }
}

fn join_message(words: &[String]) -> Result<String> {
    let message = words.join(" ");
    if message.trim().is_empty() {
        bail!("Message must not be empty");
    }
    Ok(message)
}

async fn start_conversation(server_url: &str, message: &str) -> Result<()> {
    let client = ChatClient::new(server_url);
    let id = generate_uuid();

    client
        .create_conversation(&id, message)
        .await
        .with_context(|| format!("Failed to create conversation on {server_url}"))?;
    println!("Conversation: {id}");
    println!();

    // The first message is already stored by the create call.
    let options = SendOptions {
        save_user_message: false,
        append_to_store: false,
    };
    let summary = client
        .send_message_with(&id, message, options, print_event)
        .await
        .context("Failed to stream reply")?;
    report(&summary)
}

async fn send_message(server_url: &str, id: &str, message: &str) -> Result<()> {
    let client = ChatClient::new(server_url);
    let summary = client
        .send_message_with(id, message, SendOptions::default(), print_event)
        .await
        .with_context(|| format!("Failed to send message to {id}"))?;
    report(&summary)
}

/// Print reply fragments as they arrive.
fn print_event(event: &WireEvent) {
    if let WireEvent::Chunk { content, .. } = event {
        print!("{content}");
        let _ = std::io::stdout().flush();
    }
}

fn report(summary: &StreamSummary) -> Result<()> {
    match &summary.outcome {
        StreamOutcome::Completed(_) => {
            println!();
            Ok(())
        }
        StreamOutcome::Failed(error) => {
            println!();
            bail!("Reply failed: {error}")
        }
        StreamOutcome::Ended => {
            println!();
            bail!("Connection closed before the reply finished")
        }
    }
}

async fn show_history(server_url: &str, id: &str) -> Result<()> {
    let client = ChatClient::new(server_url);
    let Some(view) = client
        .load_conversation(id)
        .await
        .with_context(|| format!("Failed to load conversation {id}"))?
    else {
        bail!("Conversation {id} not found");
    };

    if !view.chat.title.is_empty() {
        println!("{}", view.chat.title);
        println!("{}", "-".repeat(60));
    }

    if view.messages.is_empty() {
        println!("No messages in conversation {id}.");
        return Ok(());
    }

    for message in &view.messages {
        let role_display = match message.sender {
            MessageSender::User => "USER",
            MessageSender::Assistant => "ASSISTANT",
        };
        println!("[{role_display} #{}]:", message.seq);
        println!("{}", message.text);
        println!();
    }

    Ok(())
}
