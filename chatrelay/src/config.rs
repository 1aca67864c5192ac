//! Server configuration.
//!
//! Values come from command-line flags, each with an environment fallback
//! (see `cli::args`). Defaults live here so the server and tests agree.

use std::path::PathBuf;
use std::time::Duration;

use clap::ValueEnum;

/// Directory under the home directory holding chatrelay state.
const DATA_DIR: &str = ".chatrelay";
/// Database file name inside [`DATA_DIR`].
const DB_FILE: &str = "chatrelay.db";

/// Default port for `serve` and for clients.
pub const DEFAULT_PORT: u16 = 58232;
/// Default upstream model.
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
/// Default OpenAI-compatible API root.
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
/// Default sampling temperature.
pub const DEFAULT_TEMPERATURE: f32 = 0.7;
/// Default cap on generated tokens.
pub const DEFAULT_MAX_TOKENS: u32 = 1024;
/// Default limit on the length of one streamed reply, in seconds.
pub const DEFAULT_MAX_STREAM_SECS: u64 = 120;

/// Which completion provider the server talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ProviderKind {
    /// OpenAI-compatible streaming chat completions.
    Openai,
    /// Built-in offline provider that echoes the last user message.
    Scripted,
}

/// Everything the server needs to start.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub db_path: PathBuf,
    pub provider: ProviderKind,
    pub model: String,
    pub openai_base_url: String,
    pub openai_api_key: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Longest a single reply may stream before it is cut off.
    pub max_stream_duration: Duration,
}

impl ServerConfig {
    /// Configuration for an in-process server with the scripted provider.
    pub fn for_tests() -> Self {
        Self {
            port: 0,
            db_path: PathBuf::from(":memory:"),
            provider: ProviderKind::Scripted,
            model: DEFAULT_MODEL.to_string(),
            openai_base_url: DEFAULT_OPENAI_BASE_URL.to_string(),
            openai_api_key: None,
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            max_stream_duration: Duration::from_secs(DEFAULT_MAX_STREAM_SECS),
        }
    }
}

/// Default database location: `~/.chatrelay/chatrelay.db`.
pub fn default_db_path() -> PathBuf {
    dirs::home_dir()
        .map_or_else(|| std::env::temp_dir().join(DATA_DIR), |home| home.join(DATA_DIR))
        .join(DB_FILE)
}

/// Default server URL for client commands.
pub fn default_server_url() -> String {
    format!("http://127.0.0.1:{DEFAULT_PORT}")
}
