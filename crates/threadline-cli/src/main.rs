//! Threadline CLI
//!
//! Ask natural-language questions over archived discussion threads.

use anyhow::Result;
use clap::Parser;
use threadline_core::Config;

mod app;
mod commands;
mod output;
mod progress;

use app::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let cli = Cli::parse();

    // Load config (use THREADLINE_CONFIG env var if set, otherwise use default)
    let config = match std::env::var("THREADLINE_CONFIG") {
        Ok(path) => Config::load_from(std::path::Path::new(&path))?,
        Err(_) => Config::load()?,
    };

    match cli.command {
        Commands::Ask(args) => commands::ask::run(args, config, cli.format).await,
        Commands::Sources(args) => commands::sources::run(args, cli.format).await,
        Commands::Config => commands::config::run(&config, cli.format),
    }
}
