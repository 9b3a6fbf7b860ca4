//! Error types for threadline

use thiserror::Error;

/// Result type alias using ThreadlineError
pub type Result<T> = std::result::Result<T, ThreadlineError>;

/// Error type alias for convenience
pub type Error = ThreadlineError;

/// Exit codes for CLI
pub mod exit_codes {
    pub const SUCCESS: i32 = 0;
    pub const GENERAL_ERROR: i32 = 1;
    pub const NOT_FOUND: i32 = 2;
    pub const INVALID_INPUT: i32 = 3;
}

/// Failure classification for a single inference provider call.
///
/// The rate-limit and client-error distinctions are carried as variants
/// rather than matched out of error text: the retry policy, the rate
/// window cooldown, and the circuit breaker all branch on them.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("rate limited by provider: {0}")]
    RateLimited(String),

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("malformed provider response: {0}")]
    MalformedResponse(String),

    #[error("request rejected by provider: {0}")]
    ClientInput(String),
}

impl ProviderError {
    /// True when the provider signalled a rate-limit condition
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Self::RateLimited(_))
    }

    /// True for 4xx-equivalent rejections. These are never retried and
    /// never counted toward circuit breaker failures.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::ClientInput(_))
    }
}

/// Main error type for threadline
#[derive(Debug, Error)]
pub enum ThreadlineError {
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Corpus error: {0}")]
    Corpus(String),

    #[error("Source not found: {0}")]
    SourceNotFound(String),

    #[error("Empty corpus: {0}")]
    EmptyCorpus(String),

    #[error("Circuit breaker open for {0}")]
    CircuitOpen(String),

    #[error("Stage {stage} failed for source {source_id}: {reason}")]
    Stage {
        stage: String,
        source_id: String,
        reason: String,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Query run timed out after {0}s")]
    Timeout(u64),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl ThreadlineError {
    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::SourceNotFound(_) => exit_codes::NOT_FOUND,
            Self::Config(_) | Self::InvalidInput(_) | Self::EmptyCorpus(_) => {
                exit_codes::INVALID_INPUT
            }
            _ => exit_codes::GENERAL_ERROR,
        }
    }

    /// True for failures caused by the caller's own input. The circuit
    /// breaker ignores these when counting consecutive failures.
    pub fn is_client_error(&self) -> bool {
        match self {
            Self::Provider(p) => p.is_client_error(),
            Self::InvalidInput(_) => true,
            _ => false,
        }
    }
}
