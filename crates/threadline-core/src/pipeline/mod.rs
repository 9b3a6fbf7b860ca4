//! Query pipeline
//!
//! One pipeline run per query: chunked scatter-gather classification,
//! selective rescoring and graph context expansion, synthesis, and
//! validation, fanned out per source with live progress events.

pub mod chunked;
pub mod events;
pub mod expand;
pub mod fanout;
pub mod stages;

pub use chunked::{AggregateResult, ChunkResult, ChunkedProcessor, WorkItem};
pub use events::{EventSink, EventStatus, Phase, ProgressEvent};
pub use expand::ContextExpander;
pub use fanout::{PipelineRun, QueryEngine, QueryHandle, QueryOptions};
pub use stages::StagePipeline;

use crate::corpus::Record;
use serde::{Deserialize, Serialize};

/// Relevance classification of a record relative to a query.
/// The derived order (High before Medium before Low before Context)
/// is the output sort order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Tier {
    High,
    Medium,
    Low,
    Context,
}

impl Tier {
    /// Parse a tier name case-insensitively
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "HIGH" => Some(Self::High),
            "MEDIUM" => Some(Self::Medium),
            "LOW" => Some(Self::Low),
            "CONTEXT" => Some(Self::Context),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "HIGH",
            Self::Medium => "MEDIUM",
            Self::Low => "LOW",
            Self::Context => "CONTEXT",
        }
    }
}

/// One record scored against the query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredRecord {
    pub record_id: String,
    pub tier: Tier,
    pub justification: String,
}

/// A scored record joined with its full content and provenance
#[derive(Debug, Clone)]
pub struct EnrichedRecord {
    pub record: Record,
    pub tier: Tier,
    pub justification: String,
    /// True for records the classifier scored, false for records pulled
    /// in by context expansion
    pub is_original: bool,
}

impl EnrichedRecord {
    /// Wrap a graph-expansion record. Context records carry the CONTEXT
    /// tier regardless of any prior score.
    pub fn context(record: Record) -> Self {
        Self {
            record,
            tier: Tier::Context,
            justification: "linked context".to_string(),
            is_original: false,
        }
    }
}

/// Confidence of a final per-source answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

/// Final answer for one source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalResult {
    pub source_id: String,
    pub answer: String,
    pub citations: Vec<String>,
    pub confidence: Confidence,
    pub records_analyzed: usize,
}

impl FinalResult {
    /// Empty low-confidence result for a source whose pipeline failed.
    /// Sibling pipelines are unaffected; this is the only caller-visible
    /// shape of a per-source failure.
    pub fn degraded(source_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            answer: message.into(),
            citations: Vec::new(),
            confidence: Confidence::Low,
            records_analyzed: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_ordering() {
        assert!(Tier::High < Tier::Medium);
        assert!(Tier::Medium < Tier::Low);
        assert!(Tier::Low < Tier::Context);

        let mut tiers = vec![Tier::Low, Tier::Context, Tier::High, Tier::Medium];
        tiers.sort();
        assert_eq!(
            tiers,
            vec![Tier::High, Tier::Medium, Tier::Low, Tier::Context]
        );
    }

    #[test]
    fn test_tier_parse() {
        assert_eq!(Tier::parse("HIGH"), Some(Tier::High));
        assert_eq!(Tier::parse("medium"), Some(Tier::Medium));
        assert_eq!(Tier::parse(" Low "), Some(Tier::Low));
        assert_eq!(Tier::parse("irrelevant"), None);
    }

    #[test]
    fn test_tier_serde_uppercase() {
        let json = serde_json::to_string(&Tier::High).unwrap();
        assert_eq!(json, "\"HIGH\"");
        let tier: Tier = serde_json::from_str("\"MEDIUM\"").unwrap();
        assert_eq!(tier, Tier::Medium);
    }

    #[test]
    fn test_degraded_result_shape() {
        let result = FinalResult::degraded("rust", "no answer could be produced");
        assert_eq!(result.confidence, Confidence::Low);
        assert!(result.citations.is_empty());
        assert_eq!(result.records_analyzed, 0);
    }
}
