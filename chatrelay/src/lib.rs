//! chatrelay - relay streamed chat replies from a completion provider.
//!
//! Architecture:
//! - The server persists each user message, streams the provider's reply to
//!   the caller as `data: <JSON>` events and persists the finished reply
//! - The client consumes that stream and keeps per-conversation local state
//! - All storage goes through the server's SQLite database

pub mod api;
pub mod cli;
pub mod client;
pub mod config;
pub mod db;
pub mod logging;
pub mod models;
pub mod protocol;
pub mod provider;
pub mod server;
