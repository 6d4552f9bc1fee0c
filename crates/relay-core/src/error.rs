use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Normalized error taxonomy, independent of dialect-specific response formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidRequest,
    InvalidApiKey,
    TokenExpired,
    ContentTooLarge,
    RateLimit,
    RateLimitVariant,
    RateLimitAggressive,
    ModelError,
    InsufficientQuota,
    ProviderResponseError,
    NetworkError,
    QueueFull,
    NoCapacity,
    ProviderNotFound,
    Unknown,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidRequest => "invalid_request",
            ErrorCode::InvalidApiKey => "invalid_api_key",
            ErrorCode::TokenExpired => "token_expired",
            ErrorCode::ContentTooLarge => "content_too_large",
            ErrorCode::RateLimit => "rate_limit",
            ErrorCode::RateLimitVariant => "rate_limit_variant",
            ErrorCode::RateLimitAggressive => "rate_limit_aggressive",
            ErrorCode::ModelError => "model_error",
            ErrorCode::InsufficientQuota => "insufficient_quota",
            ErrorCode::ProviderResponseError => "provider_response_error",
            ErrorCode::NetworkError => "network_error",
            ErrorCode::QueueFull => "queue_full",
            ErrorCode::NoCapacity => "no_capacity",
            ErrorCode::ProviderNotFound => "provider_not_found",
            ErrorCode::Unknown => "unknown",
        }
    }

    /// Whether this code counts as a rate-limit for slot cooldown purposes.
    pub fn is_rate_limit(&self) -> bool {
        matches!(
            self,
            ErrorCode::RateLimit | ErrorCode::RateLimitVariant | ErrorCode::RateLimitAggressive
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A normalized upstream error, produced by the error classifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderError {
    pub code: ErrorCode,
    pub message: String,
    pub http_status: u16,
    pub retryable: bool,
    /// Cooldown hint from a `Retry-After` header or body field, in seconds.
    pub retry_after: Option<u64>,
    pub provider: String,
}

impl ProviderError {
    pub fn new(code: ErrorCode, message: impl Into<String>, http_status: u16) -> Self {
        Self {
            code,
            message: message.into(),
            http_status,
            retryable: false,
            retry_after: None,
            provider: String::new(),
        }
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = provider.into();
        self
    }

    pub fn with_retry_after(mut self, secs: Option<u64>) -> Self {
        self.retry_after = secs;
        self
    }

    /// Whether this error is in the failover set for custom-model dispatch.
    pub fn failover_eligible(&self) -> bool {
        matches!(self.http_status, 429 | 439 | 449 | 502 | 503)
            || self.code == ErrorCode::ProviderResponseError
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({}): HTTP {}: {}",
            self.code, self.provider, self.http_status, self.message
        )
    }
}

/// Unified error type for the relay proxy.
#[derive(Error, Debug)]
pub enum RelayError {
    // ── Upstream errors ────────────────────────────────────────
    #[error("{0}")]
    Provider(ProviderError),

    #[error("all parallel attempts failed: {0}")]
    AllAttemptsFailed(String),

    // ── Capacity errors ────────────────────────────────────────
    #[error("queue full for {provider},{model}")]
    QueueFull { provider: String, model: String },

    #[error("request timeout waiting in queue for {provider},{model}")]
    QueueTimeout { provider: String, model: String },

    #[error("no capacity for {provider},{model}")]
    NoCapacity { provider: String, model: String },

    // ── Routing errors ─────────────────────────────────────────
    #[error("provider not found: {0}")]
    ProviderNotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    // ── Lifecycle ──────────────────────────────────────────────
    #[error("request cancelled")]
    Cancelled,

    #[error("stream error: {0}")]
    Stream(String),

    // ── Config errors ──────────────────────────────────────────
    #[error("config error: {0}")]
    Config(String),

    #[error("config validation failed: {field}: {reason}")]
    ConfigValidation { field: String, reason: String },

    // ── Generic wrappers ───────────────────────────────────────
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl RelayError {
    /// HTTP status code presented to the client for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            RelayError::Provider(e) => {
                // 4xx pass through; everything else is a gateway failure
                if (400..500).contains(&e.http_status) {
                    e.http_status
                } else {
                    502
                }
            }
            RelayError::AllAttemptsFailed(_) => 502,
            RelayError::QueueFull { .. } | RelayError::NoCapacity { .. } => 503,
            RelayError::QueueTimeout { .. } => 504,
            RelayError::ProviderNotFound(_) => 404,
            RelayError::InvalidRequest(_) => 400,
            RelayError::Cancelled => 499,
            RelayError::Stream(_) => 502,
            RelayError::Config(_) | RelayError::ConfigValidation { .. } => 500,
            RelayError::Io(_) | RelayError::Serialization(_) | RelayError::Other(_) => 500,
        }
    }

    /// Machine-readable code for the JSON error body, when one applies.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            RelayError::Provider(e) => Some(e.code),
            RelayError::QueueFull { .. } => Some(ErrorCode::QueueFull),
            RelayError::NoCapacity { .. } => Some(ErrorCode::NoCapacity),
            RelayError::ProviderNotFound(_) => Some(ErrorCode::ProviderNotFound),
            RelayError::InvalidRequest(_) => Some(ErrorCode::InvalidRequest),
            RelayError::AllAttemptsFailed(_) => Some(ErrorCode::ProviderResponseError),
            _ => None,
        }
    }

    /// Cancellation is not a failure for circuit-breaker accounting.
    pub fn counts_as_failure(&self) -> bool {
        !matches!(self, RelayError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failover_eligibility() {
        let rl = ProviderError::new(ErrorCode::RateLimit, "slow down", 429);
        assert!(rl.failover_eligible());
        let variant = ProviderError::new(ErrorCode::RateLimitVariant, "slow down", 439);
        assert!(variant.failover_eligible());
        let upstream = ProviderError::new(ErrorCode::ProviderResponseError, "bad body", 200);
        assert!(upstream.failover_eligible());
        let auth = ProviderError::new(ErrorCode::InvalidApiKey, "nope", 401);
        assert!(!auth.failover_eligible());
    }

    #[test]
    fn test_http_status_mapping() {
        let e = RelayError::QueueTimeout {
            provider: "p".into(),
            model: "m".into(),
        };
        assert_eq!(e.http_status(), 504);
        let e = RelayError::QueueFull {
            provider: "p".into(),
            model: "m".into(),
        };
        assert_eq!(e.http_status(), 503);
        let e = RelayError::Provider(ProviderError::new(ErrorCode::InvalidApiKey, "x", 401));
        assert_eq!(e.http_status(), 401);
        let e = RelayError::Provider(ProviderError::new(ErrorCode::ModelError, "x", 500));
        assert_eq!(e.http_status(), 502);
    }

    #[test]
    fn test_cancellation_not_a_failure() {
        assert!(!RelayError::Cancelled.counts_as_failure());
        assert!(RelayError::InvalidRequest("x".into()).counts_as_failure());
    }
}
