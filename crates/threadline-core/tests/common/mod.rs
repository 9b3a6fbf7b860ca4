//! Shared stubs for integration tests: a scripted provider client and
//! record constructors for in-memory corpora.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::TimeZone;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use threadline_core::{
    ChatRequest, ChatResponse, ProviderClient, ProviderError, ProviderResult, Record, Tier,
    TokenUsage,
};

/// Deterministic scripted provider.
///
/// Recognizes the engine's prompt families by their system messages and
/// answers from configured tier/score tables. Failures are injected by
/// matching substrings of the user prompt: `fail_once_when` entries are
/// consumed on first match, `fail_always_when` entries persist, and
/// `hang_when` entries never resolve.
pub struct StubProvider {
    tiers: HashMap<String, Tier>,
    scores: HashMap<String, f64>,
    answer: String,
    citations: Vec<String>,
    validation_matches: bool,
    corrected_answer: String,
    fail_once: Mutex<Vec<(String, ProviderError)>>,
    fail_always: Vec<(String, ProviderError)>,
    hang_when: Vec<String>,
    pub total_calls: AtomicU64,
    pub classify_calls: AtomicU64,
    pub requests: Mutex<Vec<(String, String)>>,
}

impl StubProvider {
    pub fn new() -> Self {
        Self {
            tiers: HashMap::new(),
            scores: HashMap::new(),
            answer: "stub answer".to_string(),
            citations: Vec::new(),
            validation_matches: true,
            corrected_answer: "corrected answer".to_string(),
            fail_once: Mutex::new(Vec::new()),
            fail_always: Vec::new(),
            hang_when: Vec::new(),
            total_calls: AtomicU64::new(0),
            classify_calls: AtomicU64::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_tier(mut self, id: &str, tier: Tier) -> Self {
        self.tiers.insert(id.to_string(), tier);
        self
    }

    pub fn with_score(mut self, id: &str, score: f64) -> Self {
        self.scores.insert(id.to_string(), score);
        self
    }

    pub fn with_answer(mut self, answer: &str, citations: &[&str]) -> Self {
        self.answer = answer.to_string();
        self.citations = citations.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_validation(mut self, matches: bool) -> Self {
        self.validation_matches = matches;
        self
    }

    pub fn with_correction(mut self, corrected: &str) -> Self {
        self.corrected_answer = corrected.to_string();
        self
    }

    pub fn fail_once_when(self, marker: &str, err: ProviderError) -> Self {
        self.fail_once
            .lock()
            .unwrap()
            .push((marker.to_string(), err));
        self
    }

    pub fn fail_always_when(mut self, marker: &str, err: ProviderError) -> Self {
        self.fail_always.push((marker.to_string(), err));
        self
    }

    pub fn hang_when(mut self, marker: &str) -> Self {
        self.hang_when.push(marker.to_string());
        self
    }

    /// User prompts of every synthesis call seen so far
    pub fn synthesis_prompts(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(system, _)| system.contains("You answer questions"))
            .map(|(_, user)| user.clone())
            .collect()
    }

    fn ok(content: String) -> ProviderResult<ChatResponse> {
        Ok(ChatResponse {
            content,
            usage: TokenUsage::default(),
        })
    }
}

/// Extract `[id]` markers at the start of prompt lines
fn extract_bracket_ids(prompt: &str) -> Vec<String> {
    prompt
        .lines()
        .filter_map(|line| {
            let rest = line.strip_prefix('[')?;
            let (id, _) = rest.split_once(']')?;
            Some(id.to_string())
        })
        .collect()
}

#[async_trait]
impl ProviderClient for StubProvider {
    async fn invoke(&self, request: &ChatRequest) -> ProviderResult<ChatResponse> {
        self.total_calls.fetch_add(1, Ordering::SeqCst);

        let system = request
            .messages
            .iter()
            .find(|m| m.role == "system")
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let user = request
            .messages
            .iter()
            .find(|m| m.role == "user")
            .map(|m| m.content.clone())
            .unwrap_or_default();
        self.requests
            .lock()
            .unwrap()
            .push((system.clone(), user.clone()));

        if self.hang_when.iter().any(|m| user.contains(m.as_str())) {
            futures::future::pending::<()>().await;
            unreachable!();
        }

        {
            let mut fail_once = self.fail_once.lock().unwrap();
            if let Some(pos) = fail_once
                .iter()
                .position(|(marker, _)| user.contains(marker.as_str()))
            {
                let (_, err) = fail_once.remove(pos);
                return Err(err);
            }
        }
        for (marker, err) in &self.fail_always {
            if user.contains(marker.as_str()) {
                return Err(err.clone());
            }
        }

        if system.contains("rate archived discussion posts") {
            self.classify_calls.fetch_add(1, Ordering::SeqCst);
            let records: Vec<serde_json::Value> = extract_bracket_ids(&user)
                .into_iter()
                .map(|id| {
                    let tier = self.tiers.get(&id).copied().unwrap_or(Tier::Low);
                    serde_json::json!({"id": id, "tier": tier.as_str(), "reason": "stub"})
                })
                .collect();
            return Self::ok(serde_json::json!({ "records": records }).to_string());
        }

        if system.contains("Score how useful") {
            let id = user
                .split("Post [")
                .nth(1)
                .and_then(|s| s.split(']').next())
                .unwrap_or("");
            let score = self.scores.get(id).copied().unwrap_or(0.0);
            return Self::ok(serde_json::json!({ "score": score }).to_string());
        }

        if system.contains("You answer questions") {
            return Self::ok(
                serde_json::json!({
                    "answer": self.answer,
                    "citations": self.citations,
                })
                .to_string(),
            );
        }

        if system.contains("Check whether an answer matches") {
            return Self::ok(
                serde_json::json!({ "matches": self.validation_matches }).to_string(),
            );
        }

        if system.contains("Rewrite an answer") {
            return Self::ok(self.corrected_answer.clone());
        }

        Err(ProviderError::MalformedResponse(format!(
            "stub does not recognize prompt: {}",
            system
        )))
    }

    fn provider_name(&self) -> &str {
        "stub"
    }

    fn default_model(&self) -> &str {
        "stub-model"
    }
}

/// Record constructor for in-memory corpora
pub fn record(id: &str, source: &str, parent: Option<&str>) -> Record {
    Record {
        id: id.to_string(),
        content: format!("post body {}", id),
        author: "alice".to_string(),
        timestamp: chrono::Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
        source: source.to_string(),
        parent_id: parent.map(String::from),
    }
}

/// Build `count` top-level records with zero-padded ids like `a000`
pub fn records_with_prefix(prefix: &str, source: &str, count: usize) -> Vec<Record> {
    (0..count)
        .map(|i| record(&format!("{}{:03}", prefix, i), source, None))
        .collect()
}
