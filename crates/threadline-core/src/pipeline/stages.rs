//! Per-source stage pipeline
//!
//! Classify, expand-and-score, synthesize, validate. One pipeline
//! instance never runs two stages concurrently; different instances run
//! fully in parallel under the fan-out orchestrator. Failures resolve
//! as locally as possible (chunk retry, fallback provider, stage
//! degradation); when a stage is beyond recovery, the pipeline returns
//! an empty low-confidence result and leaves its siblings alone.

use super::chunked::{AggregateResult, ChunkedProcessor};
use super::events::{EventSink, EventStatus, Phase, ProgressEvent};
use super::expand::ContextExpander;
use super::{Confidence, EnrichedRecord, FinalResult, ScoredRecord, Tier};
use crate::config::PipelineConfig;
use crate::corpus::{CorpusStore, Record, RecordFilter};
use crate::error::{ProviderError, Result, ThreadlineError};
use crate::llm::{
    invoke_with_rate_retry, ChatMessage, ChatRequest, CircuitBreaker, ProviderClient,
    ProviderResult, RateWindow,
};
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Answer plus citation list produced by the synthesis stage
#[derive(Debug, Clone)]
struct SynthesisDraft {
    answer: String,
    citations: Vec<String>,
}

/// The four-stage pipeline for one source
pub struct StagePipeline {
    source_id: String,
    client: Arc<dyn ProviderClient>,
    store: Arc<dyn CorpusStore>,
    rate_window: Arc<RateWindow>,
    breaker: Arc<CircuitBreaker>,
    config: PipelineConfig,
    model: String,
    events: EventSink,
}

impl StagePipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source_id: impl Into<String>,
        client: Arc<dyn ProviderClient>,
        store: Arc<dyn CorpusStore>,
        rate_window: Arc<RateWindow>,
        config: PipelineConfig,
        model: impl Into<String>,
        events: EventSink,
    ) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(
            "corpus-graph",
            config.breaker_failure_threshold,
            std::time::Duration::from_secs(config.breaker_recovery_secs),
        ));
        Self {
            source_id: source_id.into(),
            client,
            store,
            rate_window,
            breaker,
            config,
            model: model.into(),
            events,
        }
    }

    /// Run all stages for this source. Never panics the run: any
    /// unrecoverable stage failure degrades to an empty low-confidence
    /// result. The terminal event carries the FinalResult.
    pub async fn run(&self, query: &str) -> FinalResult {
        self.emit(Phase::Pipeline, EventStatus::Started, "pipeline started");

        match self.run_stages(query).await {
            Ok(result) => {
                self.events.emit(
                    ProgressEvent::new(
                        &self.source_id,
                        Phase::Pipeline,
                        EventStatus::Completed,
                        "pipeline finished",
                    )
                    .with_data(serde_json::json!(result)),
                );
                result
            }
            Err(err) => {
                tracing::warn!(
                    source = %self.source_id,
                    "pipeline degraded to empty result: {}",
                    err
                );
                let result = FinalResult::degraded(
                    &self.source_id,
                    format!("no answer could be produced: {}", err),
                );
                self.events.emit(
                    ProgressEvent::new(
                        &self.source_id,
                        Phase::Pipeline,
                        EventStatus::Failed,
                        err.to_string(),
                    )
                    .with_data(serde_json::json!(result)),
                );
                result
            }
        }
    }

    async fn run_stages(&self, query: &str) -> Result<FinalResult> {
        // CLASSIFY
        self.emit(
            Phase::Classify,
            EventStatus::Started,
            "classifying corpus slice",
        );
        let records = self
            .store
            .fetch_records(&RecordFilter::for_source(&self.source_id))
            .await?;
        if records.is_empty() {
            return Err(self.stage_error("classify", "source has no records"));
        }
        let by_id: HashMap<String, Record> =
            records.iter().map(|r| (r.id.clone(), r.clone())).collect();

        let processor = ChunkedProcessor::new(
            self.client.clone(),
            self.rate_window.clone(),
            self.model.clone(),
            self.config.chunk_size,
            self.config.classify_concurrency,
        );
        let aggregate = processor.process(query, &records).await?;
        self.events.emit(
            ProgressEvent::new(
                &self.source_id,
                Phase::Classify,
                EventStatus::Completed,
                format!("classified {} records", aggregate.records_analyzed),
            )
            .with_data(serde_json::json!({
                "scored": aggregate.records.len(),
                "chunks": aggregate.chunk_count,
                "failed_chunks": aggregate.failed_chunks,
            })),
        );

        // EXPAND_AND_SCORE
        self.emit(
            Phase::ExpandAndScore,
            EventStatus::Started,
            "rescoring medium results and expanding context",
        );
        let enriched = self.expand_and_score(query, &aggregate, &by_id).await;
        self.events.emit(
            ProgressEvent::new(
                &self.source_id,
                Phase::ExpandAndScore,
                EventStatus::Completed,
                format!("selected {} records for synthesis", enriched.len()),
            )
            .with_data(serde_json::json!({
                "originals": enriched.iter().filter(|e| e.is_original).count(),
                "context": enriched.iter().filter(|e| !e.is_original).count(),
            })),
        );

        // SYNTHESIZE
        self.emit(Phase::Synthesize, EventStatus::Started, "synthesizing answer");
        let draft = self.synthesize(query, &enriched).await?;
        self.emit(
            Phase::Synthesize,
            EventStatus::Completed,
            format!("answer drafted with {} citations", draft.citations.len()),
        );

        // VALIDATE
        self.emit(Phase::Validate, EventStatus::Started, "validating answer");
        let (answer, validated) = self.validate(query, draft.answer).await;
        self.emit(
            Phase::Validate,
            EventStatus::Completed,
            if validated {
                "answer validated"
            } else {
                "validation skipped, returning unvalidated answer"
            },
        );

        let confidence = if answer.trim().is_empty() {
            Confidence::Low
        } else if aggregate.is_partial() || !validated {
            Confidence::Medium
        } else {
            Confidence::High
        };

        Ok(FinalResult {
            source_id: self.source_id.clone(),
            answer,
            citations: draft.citations,
            confidence,
            records_analyzed: aggregate.records_analyzed,
        })
    }

    /// Rescore medium-tier records, expand high-tier records with graph
    /// context, and select the capped synthesis input set
    async fn expand_and_score(
        &self,
        query: &str,
        aggregate: &AggregateResult,
        by_id: &HashMap<String, Record>,
    ) -> Vec<EnrichedRecord> {
        let mut high = Vec::new();
        let mut medium = Vec::new();
        for scored in &aggregate.records {
            match scored.tier {
                Tier::High => high.push(scored.clone()),
                Tier::Medium => medium.push(scored.clone()),
                _ => {}
            }
        }

        // Medium survivors bypass expansion and merge in directly
        let survivors = self.rescore_medium(query, medium, by_id).await;

        let seed_ids: HashSet<String> = high.iter().map(|s| s.record_id.clone()).collect();
        let expander = ContextExpander::new(
            self.store.clone(),
            self.breaker.clone(),
            self.config.max_context_depth,
            self.config.max_context_nodes,
        );
        let context = match expander.expand(&seed_ids).await {
            Ok(context) => context,
            Err(err) => {
                tracing::warn!(source = %self.source_id, "context expansion failed: {}", err);
                Vec::new()
            }
        };

        let mut enriched = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        for scored in high {
            if let Some(record) = by_id.get(&scored.record_id) {
                seen.insert(scored.record_id.clone());
                enriched.push(EnrichedRecord {
                    record: record.clone(),
                    tier: Tier::High,
                    justification: scored.justification,
                    is_original: true,
                });
            }
        }
        for (scored, score) in survivors {
            if let Some(record) = by_id.get(&scored.record_id) {
                if seen.insert(scored.record_id.clone()) {
                    enriched.push(EnrichedRecord {
                        record: record.clone(),
                        tier: Tier::Medium,
                        justification: format!("rescored {:.2}: {}", score, scored.justification),
                        is_original: true,
                    });
                }
            }
        }
        for record in context {
            if seen.insert(record.id.clone()) {
                enriched.push(EnrichedRecord::context(record));
            }
        }

        select_for_synthesis(enriched, self.config.max_synthesis_records)
    }

    /// Numerically rescore medium-tier records under a bounded call
    /// batch, keep those at or above the threshold, cap the count.
    /// A record whose rescore call fails is dropped, not retried.
    async fn rescore_medium(
        &self,
        query: &str,
        medium: Vec<ScoredRecord>,
        by_id: &HashMap<String, Record>,
    ) -> Vec<(ScoredRecord, f64)> {
        if medium.is_empty() {
            return Vec::new();
        }

        let outcomes: Vec<Option<(ScoredRecord, f64)>> = stream::iter(medium)
            .map(|scored| async move {
                let record = by_id.get(&scored.record_id)?;
                match self.score_record(query, record).await {
                    Ok(score) => Some((scored, score)),
                    Err(err) => {
                        tracing::warn!(
                            source = %self.source_id,
                            id = %record.id,
                            "rescore failed, dropping record: {}",
                            err
                        );
                        None
                    }
                }
            })
            .buffer_unordered(self.config.rescore_concurrency.max(1))
            .collect()
            .await;

        let mut survivors: Vec<(ScoredRecord, f64)> = outcomes
            .into_iter()
            .flatten()
            .filter(|(_, score)| *score >= self.config.medium_score_threshold)
            .collect();
        survivors.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.record_id.cmp(&b.0.record_id))
        });
        survivors.truncate(self.config.medium_selection_cap);
        survivors
    }

    async fn score_record(&self, query: &str, record: &Record) -> ProviderResult<f64> {
        let request = ChatRequest::new(
            self.model.clone(),
            vec![
                ChatMessage::system(
                    "Score how useful one archived post is for answering a question. \
                     Output ONLY JSON: {\"score\": 0.0-1.0}",
                ),
                ChatMessage::user(build_score_prompt(query, record)),
            ],
        )
        .with_json()
        .with_max_tokens(128);

        let response =
            invoke_with_rate_retry(self.client.as_ref(), &self.rate_window, &request).await?;
        parse_score_response(&response.content)
    }

    /// Single synthesis call over the capped record set
    async fn synthesize(
        &self,
        query: &str,
        enriched: &[EnrichedRecord],
    ) -> Result<SynthesisDraft> {
        if enriched.is_empty() {
            return Err(self.stage_error("synthesize", "no relevant records survived selection"));
        }

        let request = ChatRequest::new(
            self.model.clone(),
            vec![
                ChatMessage::system(
                    "You answer questions from archived discussion posts. Cite post ids for \
                     every claim. Output ONLY JSON: \
                     {\"answer\": \"...\", \"citations\": [\"id\", ...]}",
                ),
                ChatMessage::user(build_synthesis_prompt(query, enriched)),
            ],
        )
        .with_json()
        .with_max_tokens(2048);

        let response =
            invoke_with_rate_retry(self.client.as_ref(), &self.rate_window, &request)
                .await
                .map_err(ThreadlineError::from)?;
        let draft = parse_synthesis_response(&response.content)?;

        let known_ids: Vec<String> = enriched.iter().map(|e| e.record.id.clone()).collect();
        let citations = reconcile_citations(&draft.answer, draft.citations, &known_ids);

        Ok(SynthesisDraft {
            answer: draft.answer,
            citations,
        })
    }

    /// Check the answer against the query's language and format; on
    /// mismatch issue one corrective pass. Any failure here degrades to
    /// the unvalidated answer instead of failing the pipeline.
    async fn validate(&self, query: &str, answer: String) -> (String, bool) {
        match self.check_answer(query, &answer).await {
            Ok(true) => (answer, true),
            Ok(false) => match self.correct_answer(query, &answer).await {
                Ok(corrected) => {
                    tracing::debug!(source = %self.source_id, "answer corrected in one pass");
                    (corrected, true)
                }
                Err(err) => {
                    tracing::warn!(
                        source = %self.source_id,
                        "corrective pass failed, keeping original answer: {}",
                        err
                    );
                    (answer, false)
                }
            },
            Err(err) => {
                tracing::warn!(source = %self.source_id, "validation skipped: {}", err);
                (answer, false)
            }
        }
    }

    async fn check_answer(&self, query: &str, answer: &str) -> ProviderResult<bool> {
        let request = ChatRequest::new(
            self.model.clone(),
            vec![
                ChatMessage::system(
                    "Check whether an answer matches the language and format of the question \
                     it responds to. Output ONLY JSON: {\"matches\": true}",
                ),
                ChatMessage::user(format!(
                    "Question:\n{}\n\nAnswer:\n{}\n\nDoes the answer match the question's \
                     language and expected format?",
                    query, answer
                )),
            ],
        )
        .with_json()
        .with_max_tokens(128);

        let response =
            invoke_with_rate_retry(self.client.as_ref(), &self.rate_window, &request).await?;

        #[derive(serde::Deserialize)]
        struct Wire {
            matches: bool,
        }
        let wire: Wire = serde_json::from_str(crate::llm::extract_json(&response.content))
            .map_err(|e| ProviderError::MalformedResponse(format!("validation JSON: {}", e)))?;
        Ok(wire.matches)
    }

    async fn correct_answer(&self, query: &str, answer: &str) -> ProviderResult<String> {
        let request = ChatRequest::new(
            self.model.clone(),
            vec![
                ChatMessage::system(
                    "Rewrite an answer so it matches the language and format of the question. \
                     Keep every post id citation unchanged. Output only the rewritten answer.",
                ),
                ChatMessage::user(format!("Question:\n{}\n\nAnswer:\n{}", query, answer)),
            ],
        )
        .with_max_tokens(2048);

        let response =
            invoke_with_rate_retry(self.client.as_ref(), &self.rate_window, &request).await?;
        Ok(response.content.trim().to_string())
    }

    fn stage_error(&self, stage: &str, reason: &str) -> ThreadlineError {
        ThreadlineError::Stage {
            stage: stage.to_string(),
            source_id: self.source_id.clone(),
            reason: reason.to_string(),
        }
    }

    fn emit(&self, phase: Phase, status: EventStatus, message: impl Into<String>) {
        self.events
            .emit(ProgressEvent::new(&self.source_id, phase, status, message));
    }
}

/// Keep the best records under the synthesis cap: order by tier (HIGH
/// first, CONTEXT last) with ties broken by ascending id, then truncate
fn select_for_synthesis(mut enriched: Vec<EnrichedRecord>, cap: usize) -> Vec<EnrichedRecord> {
    enriched.sort_by(|a, b| {
        a.tier
            .cmp(&b.tier)
            .then_with(|| a.record.id.cmp(&b.record.id))
    });
    enriched.truncate(cap.max(1));
    enriched
}

fn build_score_prompt(query: &str, record: &Record) -> String {
    let content = if record.content.len() > 2000 {
        &record.content[..2000]
    } else {
        &record.content
    };
    format!(
        "Question: \"{}\"\n\nPost [{}] by {}:\n{}\n\nScore 0.0-1.0 JSON:",
        query, record.id, record.author, content
    )
}

fn build_synthesis_prompt(query: &str, enriched: &[EnrichedRecord]) -> String {
    let mut prompt = format!(
        r#"Answer this question using only the posts below. Cite post ids.

Question: "{}"

Posts:
"#,
        query
    );

    for item in enriched {
        let content = if item.record.content.len() > 1500 {
            &item.record.content[..1500]
        } else {
            &item.record.content
        };
        let provenance = if item.is_original { item.tier.as_str() } else { "CONTEXT" };
        prompt.push_str(&format!(
            "[{}] ({}) {} @ {}:\n{}\n\n",
            item.record.id, provenance, item.record.author, item.record.timestamp, content
        ));
    }

    prompt.push_str(
        r#"Output JSON only:
{"answer": "...", "citations": ["id", ...]}"#,
    );
    prompt
}

fn parse_score_response(response: &str) -> ProviderResult<f64> {
    #[derive(serde::Deserialize)]
    struct Wire {
        score: f64,
    }
    let wire: Wire = serde_json::from_str(crate::llm::extract_json(response))
        .map_err(|e| ProviderError::MalformedResponse(format!("score JSON: {}", e)))?;
    Ok(wire.score.clamp(0.0, 1.0))
}

fn parse_synthesis_response(response: &str) -> Result<SynthesisDraft> {
    #[derive(serde::Deserialize)]
    struct Wire {
        answer: String,
        #[serde(default)]
        citations: Vec<String>,
    }
    let wire: Wire = serde_json::from_str(crate::llm::extract_json(response)).map_err(|e| {
        ThreadlineError::Provider(ProviderError::MalformedResponse(format!(
            "synthesis JSON: {}",
            e
        )))
    })?;
    Ok(SynthesisDraft {
        answer: wire.answer,
        citations: wire.citations,
    })
}

/// Validate the citation list against the record set and add any id the
/// answer mentions but the list misses. Ids are only ever added, never
/// removed, except for ids that do not exist in the record set at all.
fn reconcile_citations(
    answer: &str,
    citations: Vec<String>,
    known_ids: &[String],
) -> Vec<String> {
    let known: HashSet<&str> = known_ids.iter().map(|s| s.as_str()).collect();
    let mut seen: HashSet<String> = HashSet::new();
    let mut reconciled = Vec::new();

    for id in citations {
        if known.contains(id.as_str()) && seen.insert(id.clone()) {
            reconciled.push(id);
        }
    }
    for id in known_ids {
        if !seen.contains(id) && answer.contains(id.as_str()) {
            seen.insert(id.clone());
            reconciled.push(id.clone());
        }
    }
    reconciled
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

    fn enriched(id: &str, tier: Tier) -> EnrichedRecord {
        EnrichedRecord {
            record: record(id),
            tier,
            justification: String::new(),
            is_original: tier != Tier::Context,
        }
    }

    #[test]
    fn test_reconcile_keeps_known_citations() {
        let known = vec!["p01".to_string(), "p02".to_string()];
        let result = reconcile_citations(
            "see p01",
            vec!["p01".to_string(), "p02".to_string()],
            &known,
        );
        assert_eq!(result, vec!["p01".to_string(), "p02".to_string()]);
    }

    #[test]
    fn test_reconcile_drops_unknown_ids() {
        let known = vec!["p01".to_string()];
        let result = reconcile_citations("answer", vec!["ghost".to_string()], &known);
        assert!(result.is_empty());
    }

    #[test]
    fn test_reconcile_adds_mentioned_ids() {
        let known = vec!["p01".to_string(), "p02".to_string(), "p03".to_string()];
        // Answer cites p02 inline but the model forgot to list it
        let result = reconcile_citations(
            "According to p02, the answer is yes.",
            vec!["p01".to_string()],
            &known,
        );
        assert_eq!(result, vec!["p01".to_string(), "p02".to_string()]);
    }

    #[test]
    fn test_reconcile_never_duplicates() {
        let known = vec!["p01".to_string()];
        let result = reconcile_citations(
            "p01 and p01 again",
            vec!["p01".to_string(), "p01".to_string()],
            &known,
        );
        assert_eq!(result, vec!["p01".to_string()]);
    }

    #[test]
    fn test_parse_score_clamps_range() {
        assert_eq!(parse_score_response(r#"{"score": 0.7}"#).unwrap(), 0.7);
        assert_eq!(parse_score_response(r#"{"score": 1.8}"#).unwrap(), 1.0);
        assert_eq!(parse_score_response(r#"{"score": -0.2}"#).unwrap(), 0.0);
        assert!(parse_score_response("nope").is_err());
    }

    #[test]
    fn test_parse_synthesis_defaults_citations() {
        let draft = parse_synthesis_response(r#"{"answer": "yes"}"#).unwrap();
        assert_eq!(draft.answer, "yes");
        assert!(draft.citations.is_empty());
    }

    #[test]
    fn test_select_for_synthesis_caps_lowest_tier_first() {
        let input = vec![
            enriched("p05", Tier::Context),
            enriched("p01", Tier::High),
            enriched("p04", Tier::Low),
            enriched("p02", Tier::High),
            enriched("p03", Tier::Medium),
        ];

        let selected = select_for_synthesis(input, 3);
        let ids: Vec<&str> = selected.iter().map(|e| e.record.id.as_str()).collect();
        assert_eq!(ids, vec!["p01", "p02", "p03"]);
    }

    #[test]
    fn test_select_for_synthesis_unique_ids() {
        let input = vec![
            enriched("p01", Tier::High),
            enriched("p02", Tier::Medium),
        ];
        let selected = select_for_synthesis(input, 10);
        let mut ids: Vec<&str> = selected.iter().map(|e| e.record.id.as_str()).collect();
        let before = ids.len();
        ids.dedup();
        assert_eq!(before, ids.len());
    }

    #[test]
    fn test_synthesis_prompt_marks_context_records() {
        let prompt = build_synthesis_prompt(
            "what changed?",
            &[enriched("p01", Tier::High), enriched("c01", Tier::Context)],
        );
        assert!(prompt.contains("[p01] (HIGH)"));
        assert!(prompt.contains("[c01] (CONTEXT)"));
    }
}
