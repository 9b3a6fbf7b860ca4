//! Hybrid provider client with primary/fallback failover
//!
//! Wraps two provider clients. A failed primary call is retried once on
//! the fallback with the model id translated to the fallback's naming
//! scheme. Client-input rejections are not retried: the fallback would
//! refuse the same request.

use super::client::{ChatRequest, ChatResponse, ProviderClient, ProviderResult};
use crate::config::ProviderStackConfig;
use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Primary + fallback client pair
pub struct HybridClient {
    primary: Arc<dyn ProviderClient>,
    fallback: Arc<dyn ProviderClient>,
    model_aliases: HashMap<String, String>,
}

impl HybridClient {
    /// Create from two existing clients
    pub fn new(
        primary: Arc<dyn ProviderClient>,
        fallback: Arc<dyn ProviderClient>,
        model_aliases: HashMap<String, String>,
    ) -> Self {
        Self {
            primary,
            fallback,
            model_aliases,
        }
    }

    /// Create from configuration, building HTTP clients for both legs
    pub fn from_config(config: &ProviderStackConfig) -> Result<Self> {
        let primary = super::client::HttpProviderClient::new(config.primary.clone())?;
        let fallback = super::client::HttpProviderClient::new(config.fallback.clone())?;
        Ok(Self::new(
            Arc::new(primary),
            Arc::new(fallback),
            config.model_aliases.clone(),
        ))
    }

    /// Translate a primary model id into the fallback's naming scheme
    fn translate_model(&self, model: &str) -> String {
        self.model_aliases
            .get(model)
            .cloned()
            .unwrap_or_else(|| self.fallback.default_model().to_string())
    }
}

#[async_trait]
impl ProviderClient for HybridClient {
    async fn invoke(&self, request: &ChatRequest) -> ProviderResult<ChatResponse> {
        let start = Instant::now();
        let primary_err = match self.primary.invoke(request).await {
            Ok(response) => {
                tracing::debug!(
                    provider = %self.primary.provider_name(),
                    model = %request.model,
                    latency_ms = start.elapsed().as_millis() as u64,
                    prompt_tokens = response.usage.prompt_tokens,
                    completion_tokens = response.usage.completion_tokens,
                    "primary leg ok"
                );
                return Ok(response);
            }
            Err(err) if err.is_client_error() => return Err(err),
            Err(err) => err,
        };

        tracing::warn!(
            provider = %self.primary.provider_name(),
            model = %request.model,
            latency_ms = start.elapsed().as_millis() as u64,
            rate_limit = primary_err.is_rate_limit(),
            "primary leg failed, trying fallback: {}",
            primary_err
        );

        let mut fallback_request = request.clone();
        fallback_request.model = self.translate_model(&request.model);

        let fallback_start = Instant::now();
        match self.fallback.invoke(&fallback_request).await {
            Ok(response) => {
                tracing::info!(
                    provider = %self.fallback.provider_name(),
                    model = %fallback_request.model,
                    latency_ms = fallback_start.elapsed().as_millis() as u64,
                    prompt_tokens = response.usage.prompt_tokens,
                    completion_tokens = response.usage.completion_tokens,
                    "fallback leg recovered"
                );
                Ok(response)
            }
            Err(err) => {
                tracing::warn!(
                    provider = %self.fallback.provider_name(),
                    model = %fallback_request.model,
                    latency_ms = fallback_start.elapsed().as_millis() as u64,
                    "fallback leg failed: {}",
                    err
                );
                Err(err)
            }
        }
    }

    fn provider_name(&self) -> &str {
        "hybrid"
    }

    fn default_model(&self) -> &str {
        self.primary.default_model()
    }
}
