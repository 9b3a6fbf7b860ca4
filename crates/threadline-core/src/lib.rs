//! Threadline Core Library
//!
//! Query orchestration over archived discussion threads.
//!
//! # Features
//! - Chunked scatter-gather classification under a shared rate window
//! - Primary/fallback inference with one bounded retry per rate limit
//! - Circuit-broken link-graph context expansion
//! - Per-source stage pipelines fanned out concurrently
//! - Live progress events multiplexed into one bounded stream

pub mod config;
pub mod corpus;
pub mod error;
pub mod llm;
pub mod pipeline;

pub use config::{Config, EndpointConfig, PipelineConfig, ProviderStackConfig};
pub use corpus::{CorpusStore, MemoryStore, Record, RecordFilter};
pub use error::{Error, ProviderError, Result, ThreadlineError};
pub use llm::{
    extract_json, invoke_with_rate_retry, ApiMetrics, BreakerState, ChatMessage, ChatRequest,
    ChatResponse, CircuitBreaker, HttpProviderClient, HybridClient, MetricsSnapshot,
    ProviderClient, ProviderResult, RateWindow, TokenUsage,
};
pub use pipeline::{
    AggregateResult, ChunkResult, ChunkedProcessor, Confidence, ContextExpander, EnrichedRecord,
    EventSink, EventStatus, FinalResult, Phase, PipelineRun, ProgressEvent, QueryEngine,
    QueryHandle, QueryOptions, ScoredRecord, StagePipeline, Tier, WorkItem,
};

/// Default config directory name
pub const CONFIG_DIR_NAME: &str = "threadline";
