//! LLM integration
//!
//! Provides the provider client trait, the OpenAI-compatible HTTP
//! implementation, the primary/fallback hybrid client, and the shared
//! rate-limit and circuit-breaker guards used around external calls.

mod breaker;
mod client;
mod hybrid;
mod rate_window;

pub use breaker::{BreakerState, CircuitBreaker};
pub use client::{
    extract_json, ApiMetrics, ChatMessage, ChatRequest, ChatResponse, HttpProviderClient,
    MetricsSnapshot, ProviderClient, ProviderResult, TokenUsage,
};
pub use hybrid::HybridClient;
pub use rate_window::RateWindow;

/// Issue one request through the shared rate window, retrying exactly
/// once after a cooldown when the provider reports a rate limit. A
/// second failure is returned to the caller; pipeline-level retry
/// rounds decide what happens next.
pub async fn invoke_with_rate_retry(
    client: &dyn ProviderClient,
    window: &RateWindow,
    request: &ChatRequest,
) -> ProviderResult<ChatResponse> {
    window.record_request().await;
    match client.invoke(request).await {
        Err(err) if err.is_rate_limit() => {
            window.cooldown_and_reset().await;
            window.record_request().await;
            client.invoke(request).await
        }
        other => other,
    }
}
