use anyhow::Result;
use clap::Parser;

use chatrelay::cli::{execute, Cli};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    execute(cli).await
}
