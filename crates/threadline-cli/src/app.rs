//! CLI argument definitions

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "threadline")]
#[command(
    author,
    version,
    about = "Ask questions over archived discussion threads"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Output format
    #[arg(long, global = true, value_enum, default_value = "cli")]
    pub format: OutputFormat,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Ask a question over an archive
    Ask(AskArgs),

    /// List sources present in an archive
    Sources(SourcesArgs),

    /// Show the active configuration
    Config,
}

#[derive(Args)]
pub struct AskArgs {
    /// Question to ask
    pub query: Vec<String>,

    /// Path to the JSON archive file
    #[arg(long, env = "THREADLINE_ARCHIVE")]
    pub archive: PathBuf,

    /// Restrict the run to a source (repeatable)
    #[arg(long = "source")]
    pub sources: Vec<String>,

    /// Suppress live progress output
    #[arg(long)]
    pub no_progress: bool,
}

#[derive(Args)]
pub struct SourcesArgs {
    /// Path to the JSON archive file
    #[arg(long, env = "THREADLINE_ARCHIVE")]
    pub archive: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable terminal output
    Cli,
    /// JSON output
    Json,
}
