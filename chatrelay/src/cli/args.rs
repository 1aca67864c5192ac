//! CLI argument definitions.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::{
    default_server_url, ProviderKind, DEFAULT_MAX_STREAM_SECS, DEFAULT_MAX_TOKENS, DEFAULT_MODEL,
    DEFAULT_OPENAI_BASE_URL, DEFAULT_PORT, DEFAULT_TEMPERATURE,
};

/// chatrelay - Stream chat replies from a completion provider
#[derive(Parser, Debug)]
#[command(name = "chatrelay")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Server to talk to (client commands only)
    #[arg(long, global = true, env = "CHATRELAY_SERVER", default_value_t = default_server_url())]
    pub server: String,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the relay server
    Serve(ServeArgs),

    /// Start a new conversation and stream the first reply
    New {
        /// First message of the conversation
        #[arg(trailing_var_arg = true, required = true)]
        message: Vec<String>,
    },

    /// Send a message to an existing conversation
    Send {
        /// Conversation ID
        id: String,

        /// Message to send
        #[arg(trailing_var_arg = true, required = true)]
        message: Vec<String>,
    },

    /// Print the messages of a conversation
    History {
        /// Conversation ID
        id: String,
    },
}

/// Options for `serve`.
#[derive(clap::Args, Debug)]
pub struct ServeArgs {
    /// Port to listen on
    #[arg(short, long, env = "CHATRELAY_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Path to the SQLite database (default: ~/.chatrelay/chatrelay.db)
    #[arg(long, env = "CHATRELAY_DB")]
    pub db: Option<PathBuf>,

    /// Completion provider
    #[arg(long, value_enum, env = "CHATRELAY_PROVIDER", default_value = "openai")]
    pub provider: ProviderKind,

    /// Model name passed to the provider
    #[arg(short, long, env = "CHATRELAY_MODEL", default_value = DEFAULT_MODEL)]
    pub model: String,

    /// Root of the OpenAI-compatible API
    #[arg(long, env = "OPENAI_BASE_URL", default_value = DEFAULT_OPENAI_BASE_URL)]
    pub openai_base_url: String,

    /// API key for the OpenAI provider
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub openai_api_key: Option<String>,

    /// Sampling temperature
    #[arg(long, default_value_t = DEFAULT_TEMPERATURE)]
    pub temperature: f32,

    /// Maximum tokens per reply
    #[arg(long, default_value_t = DEFAULT_MAX_TOKENS)]
    pub max_tokens: u32,

    /// Stop a reply that streams for longer than this many seconds
    #[arg(long, env = "CHATRELAY_MAX_STREAM_SECS", default_value_t = DEFAULT_MAX_STREAM_SECS)]
    pub max_stream_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_serve_with_defaults() {
        let cli = Cli::try_parse_from(["chatrelay", "serve", "--provider", "scripted"]).unwrap();
        let Commands::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(args.provider, ProviderKind::Scripted);
        assert_eq!(args.max_stream_secs, DEFAULT_MAX_STREAM_SECS);
    }

    #[test]
    fn joins_trailing_message_words() {
        let cli = Cli::try_parse_from(["chatrelay", "send", "abc", "hello", "there"]).unwrap();
        let Commands::Send { id, message } = cli.command else {
            panic!("expected send");
        };
        assert_eq!(id, "abc");
        assert_eq!(message.join(" "), "hello there");
    }

    #[test]
    fn new_requires_a_message() {
        assert!(Cli::try_parse_from(["chatrelay", "new"]).is_err());
    }
}
