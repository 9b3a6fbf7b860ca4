//! Pipeline fan-out orchestration
//!
//! Runs one stage pipeline per source concurrently and multiplexes all
//! progress callbacks into one bounded queue whose single consumer side
//! is handed to the transport layer. The whole run carries a wall-clock
//! budget: on timeout, outstanding pipelines are cancelled and the
//! results gathered so far are still returned.

use super::events::{EventSink, ProgressEvent};
use super::stages::StagePipeline;
use super::FinalResult;
use crate::config::{Config, PipelineConfig};
use crate::corpus::CorpusStore;
use crate::error::{Result, ThreadlineError};
use crate::llm::{HybridClient, ProviderClient, RateWindow};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};

/// Options for one submitted query
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Restrict the run to these sources; defaults to every source in
    /// the corpus
    pub source_filter: Option<Vec<String>>,
}

/// Live handle to one submitted query: the event stream plus the
/// join handle resolving to the per-source final results
pub struct QueryHandle {
    pub events: mpsc::Receiver<ProgressEvent>,
    pub results: JoinHandle<Result<Vec<FinalResult>>>,
}

/// Entry point for submitting queries over a corpus
#[derive(Clone)]
pub struct QueryEngine {
    client: Arc<dyn ProviderClient>,
    store: Arc<dyn CorpusStore>,
    config: Config,
}

impl QueryEngine {
    /// Create from an existing client (tests inject stubs here)
    pub fn new(client: Arc<dyn ProviderClient>, store: Arc<dyn CorpusStore>, config: Config) -> Self {
        Self {
            client,
            store,
            config,
        }
    }

    /// Create from configuration, wiring the primary/fallback hybrid
    pub fn from_config(config: Config, store: Arc<dyn CorpusStore>) -> Result<Self> {
        let client = HybridClient::from_config(&config.providers)?;
        Ok(Self::new(Arc::new(client), store, config))
    }

    /// Submit a query and return a live handle. The events receiver is
    /// the single consumer of the run's bounded progress queue; it ends
    /// once every pipeline has reported its terminal event.
    pub fn submit_query(&self, query: &str, options: QueryOptions) -> QueryHandle {
        let (events, rx) = EventSink::new(self.config.pipeline.event_queue_capacity);
        let engine = self.clone();
        let query = query.to_string();
        let results =
            tokio::spawn(async move { engine.run_query(&query, options, events).await });
        QueryHandle {
            events: rx,
            results,
        }
    }

    /// Run a query to completion, reporting progress through `events`
    pub async fn run_query(
        &self,
        query: &str,
        options: QueryOptions,
        events: EventSink,
    ) -> Result<Vec<FinalResult>> {
        let query = query.trim();
        if query.is_empty() {
            return Err(ThreadlineError::InvalidInput(
                "query must not be empty".to_string(),
            ));
        }

        let available = self.store.list_sources().await?;
        if available.is_empty() {
            return Err(ThreadlineError::EmptyCorpus(
                "corpus has no records".to_string(),
            ));
        }

        let sources = match options.source_filter {
            Some(filter) if !filter.is_empty() => {
                for source in &filter {
                    if !available.contains(source) {
                        return Err(ThreadlineError::SourceNotFound(source.clone()));
                    }
                }
                filter
            }
            _ => available,
        };

        tracing::info!(sources = sources.len(), "starting pipeline run");

        let run = PipelineRun::new(
            query.to_string(),
            sources,
            self.client.clone(),
            self.store.clone(),
            self.config.pipeline.clone(),
        );
        run.execute(events).await
    }
}

/// One top-level run: owns the per-run rate window and the fan-out over
/// sources. Created per query, dropped when the run completes.
pub struct PipelineRun {
    query: String,
    sources: Vec<String>,
    client: Arc<dyn ProviderClient>,
    store: Arc<dyn CorpusStore>,
    rate_window: Arc<RateWindow>,
    config: PipelineConfig,
}

impl PipelineRun {
    pub fn new(
        query: String,
        sources: Vec<String>,
        client: Arc<dyn ProviderClient>,
        store: Arc<dyn CorpusStore>,
        config: PipelineConfig,
    ) -> Self {
        // A fresh window per run: unrelated queries never inherit
        // stale counters
        let rate_window = Arc::new(RateWindow::from_config(&config));
        Self {
            query,
            sources,
            client,
            store,
            rate_window,
            config,
        }
    }

    /// Run every source's pipeline to completion or cancellation.
    /// Returns one FinalResult per source, ordered by source id.
    pub async fn execute(self, events: EventSink) -> Result<Vec<FinalResult>> {
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(self.config.run_timeout_secs);
        let model = self.client.default_model().to_string();

        let mut set = JoinSet::new();
        for source in &self.sources {
            let pipeline = StagePipeline::new(
                source.clone(),
                self.client.clone(),
                self.store.clone(),
                self.rate_window.clone(),
                self.config.clone(),
                model.clone(),
                events.clone(),
            );
            let query = self.query.clone();
            set.spawn(async move { pipeline.run(&query).await });
        }

        let mut results: Vec<FinalResult> = Vec::new();
        loop {
            if set.is_empty() {
                break;
            }
            match tokio::time::timeout_at(deadline, set.join_next()).await {
                Ok(Some(Ok(result))) => results.push(result),
                Ok(Some(Err(join_err))) => {
                    tracing::warn!("pipeline task did not complete: {}", join_err);
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(
                        completed = results.len(),
                        outstanding = set.len(),
                        timeout_secs = self.config.run_timeout_secs,
                        "run timed out, cancelling outstanding pipelines"
                    );
                    set.abort_all();
                    while set.join_next().await.is_some() {}
                    break;
                }
            }
        }

        // Sources whose pipeline was cancelled still get a terminal
        // event and a low-confidence result
        for source in &self.sources {
            if !results.iter().any(|r| &r.source_id == source) {
                let degraded = FinalResult::degraded(
                    source.clone(),
                    "pipeline cancelled before completion",
                );
                events.emit(
                    ProgressEvent::new(
                        source,
                        super::events::Phase::Pipeline,
                        super::events::EventStatus::Failed,
                        "pipeline cancelled before completion",
                    )
                    .with_data(serde_json::json!(degraded)),
                );
                results.push(degraded);
            }
        }

        results.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        Ok(results)
    }
}
