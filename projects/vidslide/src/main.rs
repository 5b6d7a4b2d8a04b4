mod batch;
mod cli;
mod commands;
mod config;
mod console;
mod error;
mod extract;
mod naming;
mod package;
mod run_context;
mod video;

use anyhow::Result;
use cli::{Args, Command};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt::init();

    let args = Args::parse_args();

    match args.command {
        Command::Extract(extract) => commands::run_extract(extract).await?,
        Command::Batch(command) => commands::run_batch(command).await?,
    }

    Ok(())
}
