//! Sources command - list sources present in an archive

use crate::app::{OutputFormat, SourcesArgs};
use anyhow::Result;
use threadline_core::{CorpusStore, MemoryStore};

pub async fn run(args: SourcesArgs, format: OutputFormat) -> Result<()> {
    let store = MemoryStore::load(&args.archive)?;
    let sources = store.list_sources().await?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&sources)?);
        }
        _ => {
            for source in &sources {
                println!("{}", source);
            }
            eprintln!("{} sources, {} records", sources.len(), store.len());
        }
    }
    Ok(())
}
