//! Command-line interface.

mod args;
mod commands;

pub use args::{Cli, Commands, ServeArgs};
pub use commands::execute;
