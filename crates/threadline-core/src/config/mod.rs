//! Configuration management

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Primary/fallback inference endpoints
    #[serde(default)]
    pub providers: ProviderStackConfig,

    /// Pipeline tuning knobs
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// One external inference endpoint (vLLM, OpenAI-compatible)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Provider name used in logs and metrics
    pub name: String,

    /// Base URL of the inference service
    pub url: String,

    /// Model name for chat completions
    #[serde(default = "default_model")]
    pub model: String,

    /// API key (optional, for authenticated services)
    #[serde(default)]
    pub api_key: Option<String>,

    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

/// Primary and fallback endpoints plus model id translation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderStackConfig {
    pub primary: EndpointConfig,

    pub fallback: EndpointConfig,

    /// Maps primary model ids to the fallback provider's naming scheme.
    /// Unmapped models fall back to the fallback endpoint's own default.
    #[serde(default)]
    pub model_aliases: HashMap<String, String>,
}

impl Default for ProviderStackConfig {
    fn default() -> Self {
        Self {
            primary: EndpointConfig {
                name: "primary".to_string(),
                url: std::env::var("THREADLINE_LLM_URL")
                    .unwrap_or_else(|_| "http://localhost:8000".to_string()),
                model: default_model(),
                api_key: std::env::var("THREADLINE_LLM_API_KEY").ok(),
                timeout_secs: default_timeout(),
            },
            fallback: EndpointConfig {
                name: "fallback".to_string(),
                url: std::env::var("THREADLINE_FALLBACK_URL")
                    .unwrap_or_else(|_| "http://localhost:8001".to_string()),
                model: std::env::var("THREADLINE_FALLBACK_MODEL")
                    .unwrap_or_else(|_| "mistralai/Mistral-7B-Instruct-v0.3".to_string()),
                api_key: std::env::var("THREADLINE_FALLBACK_API_KEY").ok(),
                timeout_secs: default_timeout(),
            },
            model_aliases: HashMap::new(),
        }
    }
}

fn default_model() -> String {
    std::env::var("THREADLINE_LLM_MODEL")
        .unwrap_or_else(|_| "meta-llama/Llama-3.1-8B-Instruct".to_string())
}

fn default_timeout() -> u64 {
    30
}

/// Scheduling, retry, and capacity knobs for one query run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Records per classification chunk
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Concurrent classification chunks in flight
    #[serde(default = "default_classify_concurrency")]
    pub classify_concurrency: usize,

    /// Concurrent medium-tier rescoring calls in flight
    #[serde(default = "default_rescore_concurrency")]
    pub rescore_concurrency: usize,

    /// Length of the shared per-run request window in seconds
    #[serde(default = "default_rate_window_secs")]
    pub rate_window_secs: u64,

    /// Cooldown after a rate-limit error. Slightly longer than the
    /// window so the next provider-side window has started.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,

    /// Consecutive failures before the circuit breaker opens
    #[serde(default = "default_breaker_failure_threshold")]
    pub breaker_failure_threshold: u32,

    /// Seconds an open breaker waits before allowing a probe call
    #[serde(default = "default_breaker_recovery_secs")]
    pub breaker_recovery_secs: u64,

    /// Maximum link-graph traversal depth during context expansion
    #[serde(default = "default_max_context_depth")]
    pub max_context_depth: usize,

    /// Maximum nodes added on top of the seed set during expansion
    #[serde(default = "default_max_context_nodes")]
    pub max_context_nodes: usize,

    /// Hard cap on records handed to the synthesis call
    #[serde(default = "default_max_synthesis_records")]
    pub max_synthesis_records: usize,

    /// Minimum rescore value a medium-tier record needs to survive
    #[serde(default = "default_medium_score_threshold")]
    pub medium_score_threshold: f64,

    /// Hard cap on surviving medium-tier records
    #[serde(default = "default_medium_selection_cap")]
    pub medium_selection_cap: usize,

    /// Capacity of the bounded progress event queue
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,

    /// Wall-clock budget for one whole query run in seconds
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            classify_concurrency: default_classify_concurrency(),
            rescore_concurrency: default_rescore_concurrency(),
            rate_window_secs: default_rate_window_secs(),
            cooldown_secs: default_cooldown_secs(),
            breaker_failure_threshold: default_breaker_failure_threshold(),
            breaker_recovery_secs: default_breaker_recovery_secs(),
            max_context_depth: default_max_context_depth(),
            max_context_nodes: default_max_context_nodes(),
            max_synthesis_records: default_max_synthesis_records(),
            medium_score_threshold: default_medium_score_threshold(),
            medium_selection_cap: default_medium_selection_cap(),
            event_queue_capacity: default_event_queue_capacity(),
            run_timeout_secs: default_run_timeout_secs(),
        }
    }
}

fn default_chunk_size() -> usize {
    100
}

fn default_classify_concurrency() -> usize {
    4
}

fn default_rescore_concurrency() -> usize {
    4
}

fn default_rate_window_secs() -> u64 {
    60
}

fn default_cooldown_secs() -> u64 {
    65
}

fn default_breaker_failure_threshold() -> u32 {
    5
}

fn default_breaker_recovery_secs() -> u64 {
    30
}

fn default_max_context_depth() -> usize {
    2
}

fn default_max_context_nodes() -> usize {
    30
}

fn default_max_synthesis_records() -> usize {
    40
}

fn default_medium_score_threshold() -> f64 {
    0.6
}

fn default_medium_selection_cap() -> usize {
    10
}

fn default_event_queue_capacity() -> usize {
    256
}

fn default_run_timeout_secs() -> u64 {
    600
}

impl Config {
    /// Load config from default path
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        Self::load_from(&path)
    }

    /// Load config from an explicit path, falling back to defaults when
    /// the file does not exist
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = serde_yaml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    /// Save config to default path
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get default config path
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(crate::CONFIG_DIR_NAME)
            .join("config.yml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_defaults() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.chunk_size, 100);
        assert_eq!(cfg.rate_window_secs, 60);
        assert!(cfg.cooldown_secs > cfg.rate_window_secs);
        assert!(cfg.classify_concurrency > 0);
        assert!(cfg.event_queue_capacity > 0);
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let yaml = r#"
pipeline:
  chunk_size: 25
  medium_score_threshold: 0.8
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.pipeline.chunk_size, 25);
        assert_eq!(cfg.pipeline.medium_score_threshold, 0.8);
        // Untouched fields keep their defaults
        assert_eq!(cfg.pipeline.rate_window_secs, 60);
        assert_eq!(cfg.pipeline.max_synthesis_records, 40);
    }

    #[test]
    fn test_load_missing_file_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::load_from(&dir.path().join("missing.yml")).unwrap();
        assert_eq!(cfg.pipeline.chunk_size, 100);
    }

    #[test]
    fn test_roundtrip_yaml() {
        let mut cfg = Config::default();
        cfg.pipeline.chunk_size = 50;
        cfg.providers
            .model_aliases
            .insert("llama-large".to_string(), "mistral-large".to_string());

        let yaml = serde_yaml::to_string(&cfg).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.pipeline.chunk_size, 50);
        assert_eq!(
            parsed.providers.model_aliases.get("llama-large").unwrap(),
            "mistral-large"
        );
    }
}
