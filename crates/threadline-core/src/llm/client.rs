//! HTTP client for external LLM inference services (vLLM, OpenAI, etc.)

use crate::config::EndpointConfig;
use crate::error::ProviderError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{atomic::AtomicU64, Arc};
use std::time::{Duration, Instant};

/// Result of a single provider call
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Chat message for completion requests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Token usage reported by the provider
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
}

/// One completion request
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Ask the provider for a structured JSON body
    pub json_response: bool,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: 0.2,
            max_tokens: 1024,
            json_response: false,
        }
    }

    pub fn with_json(mut self) -> Self {
        self.json_response = true;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// Response from one completion request
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub usage: TokenUsage,
}

/// Trait for inference provider clients
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Issue one completion request
    async fn invoke(&self, request: &ChatRequest) -> ProviderResult<ChatResponse>;

    /// Provider name for logs and metrics
    fn provider_name(&self) -> &str;

    /// Model used when the caller does not name one
    fn default_model(&self) -> &str;
}

/// API metrics for monitoring
#[derive(Debug, Default)]
pub struct ApiMetrics {
    pub total_requests: AtomicU64,
    pub total_errors: AtomicU64,
    pub rate_limited: AtomicU64,
    pub total_latency_ms: AtomicU64,
}

/// Snapshot of API metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub total_errors: u64,
    pub rate_limited: u64,
    pub avg_latency_ms: f64,
}

/// vLLM/OpenAI-compatible HTTP client
pub struct HttpProviderClient {
    http_client: reqwest::Client,
    config: EndpointConfig,
    metrics: Arc<ApiMetrics>,
}

impl HttpProviderClient {
    /// Create new client from endpoint configuration
    pub fn new(config: EndpointConfig) -> crate::error::Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            http_client,
            config,
            metrics: Arc::new(ApiMetrics::default()),
        })
    }

    /// Get current API metrics
    pub fn metrics(&self) -> MetricsSnapshot {
        use std::sync::atomic::Ordering;

        let total = self.metrics.total_requests.load(Ordering::Relaxed);
        MetricsSnapshot {
            total_requests: total,
            total_errors: self.metrics.total_errors.load(Ordering::Relaxed),
            rate_limited: self.metrics.rate_limited.load(Ordering::Relaxed),
            avg_latency_ms: if total > 0 {
                self.metrics.total_latency_ms.load(Ordering::Relaxed) as f64 / total as f64
            } else {
                0.0
            },
        }
    }

    fn record_error(&self, err: ProviderError) -> ProviderError {
        use std::sync::atomic::Ordering;

        self.metrics.total_errors.fetch_add(1, Ordering::Relaxed);
        if err.is_rate_limit() {
            self.metrics.rate_limited.fetch_add(1, Ordering::Relaxed);
        }
        err
    }
}

#[async_trait]
impl ProviderClient for HttpProviderClient {
    async fn invoke(&self, request: &ChatRequest) -> ProviderResult<ChatResponse> {
        use std::sync::atomic::Ordering;

        let start = Instant::now();
        self.metrics.total_requests.fetch_add(1, Ordering::Relaxed);

        #[derive(Serialize)]
        struct WireRequest<'a> {
            model: &'a str,
            messages: &'a [ChatMessage],
            temperature: f32,
            max_tokens: u32,
            #[serde(skip_serializing_if = "Option::is_none")]
            response_format: Option<ResponseFormat>,
        }

        #[derive(Serialize)]
        struct ResponseFormat {
            #[serde(rename = "type")]
            kind: &'static str,
        }

        #[derive(Deserialize)]
        struct WireResponse {
            choices: Vec<WireChoice>,
            #[serde(default)]
            usage: Option<TokenUsage>,
        }

        #[derive(Deserialize)]
        struct WireChoice {
            message: ChatMessage,
        }

        let wire = WireRequest {
            model: &request.model,
            messages: &request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            response_format: request
                .json_response
                .then_some(ResponseFormat { kind: "json_object" }),
        };

        let url = format!("{}/v1/chat/completions", self.config.url);

        let mut req = self.http_client.post(&url).json(&wire);
        if let Some(ref api_key) = self.config.api_key {
            req = req.header("Authorization", format!("Bearer {}", api_key));
        }

        let response = req
            .send()
            .await
            .map_err(|e| self.record_error(ProviderError::Unavailable(e.to_string())))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let err = if status.as_u16() == 429 {
                ProviderError::RateLimited(format!("HTTP 429: {}", body))
            } else if status.is_client_error() {
                ProviderError::ClientInput(format!("HTTP {}: {}", status, body))
            } else {
                ProviderError::Unavailable(format!("HTTP {}: {}", status, body))
            };
            return Err(self.record_error(err));
        }

        let wire_response: WireResponse = response.json().await.map_err(|e| {
            self.record_error(ProviderError::MalformedResponse(e.to_string()))
        })?;

        let content = wire_response
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .unwrap_or_default();

        // An empty body is retried like a transport failure
        if content.trim().is_empty() {
            return Err(self.record_error(ProviderError::MalformedResponse(
                "empty completion".to_string(),
            )));
        }

        let elapsed = start.elapsed().as_millis() as u64;
        self.metrics
            .total_latency_ms
            .fetch_add(elapsed, Ordering::Relaxed);

        tracing::debug!(
            provider = %self.config.name,
            model = %request.model,
            latency_ms = elapsed,
            "completion ok"
        );

        Ok(ChatResponse {
            content,
            usage: wire_response.usage.unwrap_or_default(),
        })
    }

    fn provider_name(&self) -> &str {
        &self.config.name
    }

    fn default_model(&self) -> &str {
        &self.config.model
    }
}

/// Extract a JSON object from an LLM response that may wrap it in
/// markdown code fences or surrounding prose
pub fn extract_json(response: &str) -> &str {
    let body = if response.contains("```json") {
        response
            .split("```json")
            .nth(1)
            .and_then(|s| s.split("```").next())
            .unwrap_or(response)
    } else if response.contains("```") {
        response
            .split("```")
            .nth(1)
            .and_then(|s| s.split("```").next())
            .unwrap_or(response)
    } else {
        response
    };

    match (body.find('{'), body.rfind('}')) {
        (Some(start), Some(end)) if start < end => &body[start..=end],
        _ => body.trim(),
    }
}
