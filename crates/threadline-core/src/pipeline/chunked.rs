//! Chunked scatter-gather classification
//!
//! Splits a corpus slice into fixed-size chunks, dispatches each chunk
//! as one provider call under a bounded concurrency limit, and merges
//! the scored results. Individual chunk failures never abort the whole
//! run: after the first pass, exactly one global retry round re-runs
//! the failed chunks; chunks that fail again are dropped and reported
//! as partial failure in the aggregate metadata.

use super::{ScoredRecord, Tier};
use crate::corpus::Record;
use crate::error::{ProviderError, Result, ThreadlineError};
use crate::llm::{
    invoke_with_rate_retry, ChatMessage, ChatRequest, ProviderClient, ProviderResult, RateWindow,
};
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Fallback when the caller does not bound concurrency. Chunk tasks
/// share one per-minute quota, so unbounded parallelism is never safe.
const DEFAULT_CONCURRENCY: usize = 4;

/// One unit of work submitted to a provider call. Immutable once built.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub chunk_index: usize,
    pub query: String,
    pub records: Vec<Record>,
}

/// Scored output of one successfully processed WorkItem
#[derive(Debug, Clone)]
pub struct ChunkResult {
    pub chunk_index: usize,
    pub item_count: usize,
    pub records: Vec<ScoredRecord>,
}

/// Union of all chunk results for one stage
#[derive(Debug, Clone)]
pub struct AggregateResult {
    /// Deduplicated by record id, ordered by tier then record id
    pub records: Vec<ScoredRecord>,
    pub chunk_count: usize,
    /// Chunks dropped after the global retry round
    pub failed_chunks: Vec<usize>,
    /// Records in chunks that completed
    pub records_analyzed: usize,
}

impl AggregateResult {
    /// True when at least one chunk was permanently dropped
    pub fn is_partial(&self) -> bool {
        !self.failed_chunks.is_empty()
    }
}

/// Scatter-gather processor for one pipeline stage
pub struct ChunkedProcessor {
    client: Arc<dyn ProviderClient>,
    rate_window: Arc<RateWindow>,
    model: String,
    chunk_size: usize,
    concurrency: usize,
}

impl ChunkedProcessor {
    pub fn new(
        client: Arc<dyn ProviderClient>,
        rate_window: Arc<RateWindow>,
        model: impl Into<String>,
        chunk_size: usize,
        concurrency: usize,
    ) -> Self {
        Self {
            client,
            rate_window,
            model: model.into(),
            chunk_size: chunk_size.max(1),
            concurrency: if concurrency > 0 {
                concurrency
            } else {
                DEFAULT_CONCURRENCY
            },
        }
    }

    /// Classify a corpus slice against a query.
    ///
    /// Never fails on individual chunk errors; the only hard error is an
    /// empty input. Partial success is a valid, reportable outcome.
    pub async fn process(&self, query: &str, records: &[Record]) -> Result<AggregateResult> {
        if records.is_empty() {
            return Err(ThreadlineError::EmptyCorpus(
                "no records to classify".to_string(),
            ));
        }

        let items: Vec<WorkItem> = records
            .chunks(self.chunk_size)
            .enumerate()
            .map(|(chunk_index, chunk)| WorkItem {
                chunk_index,
                query: query.to_string(),
                records: chunk.to_vec(),
            })
            .collect();
        let chunk_count = items.len();

        tracing::debug!(
            records = records.len(),
            chunks = chunk_count,
            concurrency = self.concurrency,
            "dispatching classification chunks"
        );

        let (mut completed, failed) = self.dispatch_round(&items).await;

        // Exactly one global retry round over the failed chunks
        let failed_chunks = if failed.is_empty() {
            Vec::new()
        } else {
            tracing::info!(
                failed = failed.len(),
                "retrying failed chunks in global retry round"
            );
            let retry_items: Vec<WorkItem> = failed
                .iter()
                .map(|&idx| items[idx].clone())
                .collect();
            let (recovered, still_failed) = self.dispatch_round(&retry_items).await;
            completed.extend(recovered);
            if !still_failed.is_empty() {
                tracing::warn!(
                    chunks = ?still_failed,
                    "chunks permanently dropped after retry round"
                );
            }
            still_failed
        };

        let records_analyzed = completed.iter().map(|r| r.item_count).sum();
        let merged = merge_chunk_results(completed);

        Ok(AggregateResult {
            records: merged,
            chunk_count,
            failed_chunks,
            records_analyzed,
        })
    }

    /// Run one bounded-concurrency pass over a set of chunks, returning
    /// the completed results and the indices of chunks that failed
    async fn dispatch_round(&self, items: &[WorkItem]) -> (Vec<ChunkResult>, Vec<usize>) {
        let mut futs = Vec::with_capacity(items.len());
        for item in items {
            futs.push(self.process_chunk_indexed(item));
        }
        let outcomes: Vec<(usize, Option<ChunkResult>)> = stream::iter(futs)
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut completed = Vec::new();
        let mut failed = Vec::new();
        for (chunk_index, outcome) in outcomes {
            match outcome {
                Some(result) => completed.push(result),
                None => failed.push(chunk_index),
            }
        }
        failed.sort_unstable();
        (completed, failed)
    }

    async fn process_chunk_indexed(&self, item: &WorkItem) -> (usize, Option<ChunkResult>) {
        (item.chunk_index, self.process_chunk(item).await)
    }

    async fn process_chunk(&self, item: &WorkItem) -> Option<ChunkResult> {
        match self.classify_chunk(item).await {
            Ok(result) => Some(result),
            Err(err) => {
                tracing::warn!(chunk = item.chunk_index, "chunk failed: {}", err);
                None
            }
        }
    }

    async fn classify_chunk(&self, item: &WorkItem) -> ProviderResult<ChunkResult> {
        let request = ChatRequest::new(
            self.model.clone(),
            vec![
                ChatMessage::system(
                    "You rate archived discussion posts for relevance to a question. \
                     Respond ONLY with valid JSON matching the requested schema.",
                ),
                ChatMessage::user(build_classify_prompt(&item.query, &item.records)),
            ],
        )
        .with_json()
        .with_max_tokens(2048);

        let response =
            invoke_with_rate_retry(self.client.as_ref(), &self.rate_window, &request).await?;
        parse_chunk_response(&response.content, item)
    }
}

fn build_classify_prompt(query: &str, records: &[Record]) -> String {
    let mut prompt = format!(
        r#"Rate how relevant each archived post is to this question:

Question: "{}"

Posts:
"#,
        query
    );

    for record in records {
        let content = if record.content.len() > 1500 {
            &record.content[..1500]
        } else {
            &record.content
        };
        prompt.push_str(&format!(
            "[{}] {} @ {}:\n{}\n\n",
            record.id, record.author, record.timestamp, content
        ));
    }

    prompt.push_str(
        r#"Rate every post exactly once. HIGH = directly answers or discusses the question.
MEDIUM = related background or partial information. LOW = unrelated.

Output JSON only:
{"records": [{"id": "...", "tier": "HIGH", "reason": "..."}]}"#,
    );

    prompt
}

/// Parse a classification response into a ChunkResult.
///
/// Ids the provider invented are dropped: the aggregate must only ever
/// contain ids present in the input. An unparseable body is reported as
/// MalformedResponse so the chunk is retried like a transport failure.
fn parse_chunk_response(response: &str, item: &WorkItem) -> ProviderResult<ChunkResult> {
    #[derive(serde::Deserialize)]
    struct Wire {
        records: Vec<WireRecord>,
    }

    #[derive(serde::Deserialize)]
    struct WireRecord {
        id: String,
        tier: String,
        #[serde(default)]
        reason: String,
    }

    let json = crate::llm::extract_json(response);
    let wire: Wire = serde_json::from_str(json)
        .map_err(|e| ProviderError::MalformedResponse(format!("classification JSON: {}", e)))?;

    let known_ids: HashSet<&str> = item.records.iter().map(|r| r.id.as_str()).collect();
    let mut scored = Vec::with_capacity(wire.records.len());

    for record in wire.records {
        if !known_ids.contains(record.id.as_str()) {
            tracing::warn!(
                chunk = item.chunk_index,
                id = %record.id,
                "dropping fabricated record id from classification"
            );
            continue;
        }
        let Some(tier) = Tier::parse(&record.tier) else {
            tracing::warn!(
                chunk = item.chunk_index,
                id = %record.id,
                tier = %record.tier,
                "dropping record with unrecognized tier"
            );
            continue;
        };
        scored.push(ScoredRecord {
            record_id: record.id,
            tier,
            justification: record.reason,
        });
    }

    Ok(ChunkResult {
        chunk_index: item.chunk_index,
        item_count: item.records.len(),
        records: scored,
    })
}

/// Merge chunk results: deduplicate by record id keeping the best tier,
/// then order by tier (HIGH first) with ties broken by ascending id
fn merge_chunk_results(results: Vec<ChunkResult>) -> Vec<ScoredRecord> {
    let mut best: HashMap<String, ScoredRecord> = HashMap::new();
    for result in results {
        for scored in result.records {
            match best.get(&scored.record_id) {
                Some(existing) if existing.tier <= scored.tier => {}
                _ => {
                    best.insert(scored.record_id.clone(), scored);
                }
            }
        }
    }

    let mut merged: Vec<ScoredRecord> = best.into_values().collect();
    merged.sort_by(|a, b| {
        a.tier
            .cmp(&b.tier)
            .then_with(|| a.record_id.cmp(&b.record_id))
    });
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(id: &str) -> Record {
        Record {
            id: id.to_string(),
            content: format!("content {}", id),
            author: "alice".to_string(),
            timestamp: chrono::Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            source: "rust".to_string(),
            parent_id: None,
        }
    }

    fn work_item(ids: &[&str]) -> WorkItem {
        WorkItem {
            chunk_index: 0,
            query: "q".to_string(),
            records: ids.iter().map(|id| record(id)).collect(),
        }
    }

    fn scored(id: &str, tier: Tier) -> ScoredRecord {
        ScoredRecord {
            record_id: id.to_string(),
            tier,
            justification: String::new(),
        }
    }

    #[test]
    fn test_parse_valid_response() {
        let item = work_item(&["p01", "p02"]);
        let response = r#"{"records": [
            {"id": "p01", "tier": "HIGH", "reason": "on topic"},
            {"id": "p02", "tier": "low"}
        ]}"#;

        let result = parse_chunk_response(response, &item).unwrap();
        assert_eq!(result.item_count, 2);
        assert_eq!(result.records.len(), 2);
        assert_eq!(result.records[0].tier, Tier::High);
        assert_eq!(result.records[1].tier, Tier::Low);
    }

    #[test]
    fn test_parse_fenced_response() {
        let item = work_item(&["p01"]);
        let response =
            "```json\n{\"records\": [{\"id\": \"p01\", \"tier\": \"MEDIUM\", \"reason\": \"r\"}]}\n```";
        let result = parse_chunk_response(response, &item).unwrap();
        assert_eq!(result.records[0].tier, Tier::Medium);
    }

    #[test]
    fn test_parse_drops_fabricated_ids() {
        let item = work_item(&["p01"]);
        let response = r#"{"records": [
            {"id": "p01", "tier": "HIGH", "reason": "real"},
            {"id": "ghost", "tier": "HIGH", "reason": "invented"}
        ]}"#;

        let result = parse_chunk_response(response, &item).unwrap();
        assert_eq!(result.records.len(), 1);
        assert_eq!(result.records[0].record_id, "p01");
    }

    #[test]
    fn test_parse_drops_unknown_tiers() {
        let item = work_item(&["p01", "p02"]);
        let response = r#"{"records": [
            {"id": "p01", "tier": "CRITICAL", "reason": "?"},
            {"id": "p02", "tier": "LOW", "reason": "ok"}
        ]}"#;

        let result = parse_chunk_response(response, &item).unwrap();
        assert_eq!(result.records.len(), 1);
        assert_eq!(result.records[0].record_id, "p02");
    }

    #[test]
    fn test_parse_malformed_is_retryable() {
        let item = work_item(&["p01"]);
        let err = parse_chunk_response("not json at all", &item).unwrap_err();
        assert!(matches!(err, ProviderError::MalformedResponse(_)));
        assert!(!err.is_rate_limit());
    }

    #[test]
    fn test_merge_dedup_keeps_best_tier() {
        let results = vec![
            ChunkResult {
                chunk_index: 0,
                item_count: 2,
                records: vec![scored("p01", Tier::Low), scored("p02", Tier::Medium)],
            },
            ChunkResult {
                chunk_index: 1,
                item_count: 2,
                records: vec![scored("p01", Tier::High), scored("p02", Tier::Low)],
            },
        ];

        let merged = merge_chunk_results(results);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].record_id, "p01");
        assert_eq!(merged[0].tier, Tier::High);
        assert_eq!(merged[1].record_id, "p02");
        assert_eq!(merged[1].tier, Tier::Medium);
    }

    #[test]
    fn test_merge_orders_tier_then_id() {
        let results = vec![ChunkResult {
            chunk_index: 0,
            item_count: 4,
            records: vec![
                scored("p04", Tier::Low),
                scored("p03", Tier::High),
                scored("p02", Tier::Medium),
                scored("p01", Tier::High),
            ],
        }];

        let merged = merge_chunk_results(results);
        let ids: Vec<&str> = merged.iter().map(|r| r.record_id.as_str()).collect();
        assert_eq!(ids, vec!["p01", "p03", "p02", "p04"]);
    }
}
