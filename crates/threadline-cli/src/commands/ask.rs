//! Ask command - submit a query and stream progress

use crate::app::{AskArgs, OutputFormat};
use crate::output;
use crate::progress::ProgressRenderer;
use anyhow::Result;
use std::sync::Arc;
use threadline_core::{Config, MemoryStore, QueryEngine, QueryOptions};

pub async fn run(args: AskArgs, config: Config, format: OutputFormat) -> Result<()> {
    let query = args.query.join(" ");
    if query.trim().is_empty() {
        anyhow::bail!("query must not be empty");
    }

    let store = Arc::new(MemoryStore::load(&args.archive)?);
    let engine = QueryEngine::from_config(config, store)?;

    let options = QueryOptions {
        source_filter: if args.sources.is_empty() {
            None
        } else {
            Some(args.sources.clone())
        },
    };

    let mut handle = engine.submit_query(&query, options);

    // Single consumer of the run's progress queue
    let renderer = ProgressRenderer::new(!args.no_progress && format == OutputFormat::Cli);
    while let Some(event) = handle.events.recv().await {
        renderer.render(&event);
    }

    let results = handle.results.await??;

    match format {
        OutputFormat::Json => println!("{}", output::json::format_results(&results)?),
        OutputFormat::Cli => print!("{}", output::terminal::format_results(&results)),
    }

    Ok(())
}
