use relay_core::{DialectFamily, ErrorCode, ProviderError};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

/// One row of a provider family's error table.
#[derive(Debug, Clone)]
pub struct TableEntry {
    pub code: ErrorCode,
    /// Overrides the wire status in the normalized error, when set.
    pub http_status: Option<u16>,
    pub retryable: bool,
    /// Cooldown applied when the upstream sent no Retry-After, in seconds.
    pub retry_after_secs: Option<u64>,
}

impl TableEntry {
    fn new(code: ErrorCode, retryable: bool) -> Self {
        Self {
            code,
            http_status: None,
            retryable,
            retry_after_secs: None,
        }
    }

    fn with_retry_after(mut self, secs: u64) -> Self {
        self.retry_after_secs = Some(secs);
        self
    }

    fn with_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }
}

/// Per-family mapping from body error codes and wire statuses to normalized
/// entries.
#[derive(Debug, Clone, Default)]
pub struct ErrorTable {
    by_body_code: HashMap<String, TableEntry>,
    by_status: HashMap<u16, TableEntry>,
}

impl ErrorTable {
    pub fn body_code(mut self, code: &str, entry: TableEntry) -> Self {
        self.by_body_code.insert(code.to_string(), entry);
        self
    }

    pub fn status(mut self, status: u16, entry: TableEntry) -> Self {
        self.by_status.insert(status, entry);
        self
    }
}

/// Normalizes upstream failures into [`ProviderError`]s. Pure classification:
/// per-family tables are registered at startup and new families plug in by
/// registering a table (and, separately, a signer recipe).
pub struct ErrorClassifier {
    tables: HashMap<DialectFamily, ErrorTable>,
}

impl ErrorClassifier {
    /// Classifier preloaded with the shipped family tables.
    pub fn with_defaults() -> Self {
        let mut tables = HashMap::new();

        tables.insert(
            DialectFamily::Anthropic,
            ErrorTable::default()
                .body_code("rate_limit_error", TableEntry::new(ErrorCode::RateLimit, true))
                .body_code(
                    "overloaded_error",
                    TableEntry::new(ErrorCode::RateLimitAggressive, true).with_retry_after(30),
                )
                .body_code(
                    "authentication_error",
                    TableEntry::new(ErrorCode::InvalidApiKey, false),
                )
                .body_code(
                    "invalid_request_error",
                    TableEntry::new(ErrorCode::InvalidRequest, false),
                )
                .body_code(
                    "request_too_large",
                    TableEntry::new(ErrorCode::ContentTooLarge, false),
                )
                .body_code("api_error", TableEntry::new(ErrorCode::ModelError, true)),
        );

        tables.insert(
            DialectFamily::OpenAi,
            ErrorTable::default()
                .body_code("rate_limit_exceeded", TableEntry::new(ErrorCode::RateLimit, true))
                .body_code(
                    "insufficient_quota",
                    TableEntry::new(ErrorCode::InsufficientQuota, false),
                )
                .body_code("invalid_api_key", TableEntry::new(ErrorCode::InvalidApiKey, false))
                .body_code(
                    "context_length_exceeded",
                    TableEntry::new(ErrorCode::ContentTooLarge, false),
                )
                .body_code("server_error", TableEntry::new(ErrorCode::ModelError, true)),
        );

        tables.insert(
            DialectFamily::Gemini,
            ErrorTable::default()
                .body_code("RESOURCE_EXHAUSTED", TableEntry::new(ErrorCode::RateLimit, true))
                .body_code(
                    "UNAUTHENTICATED",
                    TableEntry::new(ErrorCode::InvalidApiKey, false),
                )
                .body_code(
                    "INVALID_ARGUMENT",
                    TableEntry::new(ErrorCode::InvalidRequest, false),
                )
                .body_code("INTERNAL", TableEntry::new(ErrorCode::ModelError, true)),
        );

        // The iflow family reports non-standard rate-limit statuses.
        tables.insert(
            DialectFamily::Iflow,
            ErrorTable::default()
                .status(439, TableEntry::new(ErrorCode::RateLimitVariant, true))
                .status(
                    449,
                    TableEntry::new(ErrorCode::RateLimitAggressive, true).with_retry_after(60),
                )
                .body_code("token_expired", TableEntry::new(ErrorCode::TokenExpired, false))
                .body_code(
                    "1302",
                    TableEntry::new(ErrorCode::RateLimitVariant, true).with_status(439),
                ),
        );

        Self { tables }
    }

    /// Register or replace a family's table.
    pub fn register(&mut self, family: DialectFamily, table: ErrorTable) {
        self.tables.insert(family, table);
    }

    /// Normalize an upstream failure. `retry_after_header` is the parsed
    /// `Retry-After` header, in seconds, which always wins over table
    /// defaults.
    pub fn classify(
        &self,
        family: DialectFamily,
        provider: &str,
        status: u16,
        body: &str,
        retry_after_header: Option<u64>,
    ) -> ProviderError {
        let parsed: Option<Value> = serde_json::from_str(body).ok();
        let body_code = parsed.as_ref().and_then(extract_body_code);

        let table = self.tables.get(&family);
        let entry = table.and_then(|t| {
            body_code
                .as_deref()
                .and_then(|c| t.by_body_code.get(c))
                .or_else(|| t.by_status.get(&status))
        });

        let message = parsed
            .as_ref()
            .and_then(extract_message)
            .unwrap_or_else(|| truncated(body));

        match entry {
            Some(entry) => ProviderError {
                code: entry.code,
                message,
                http_status: entry.http_status.unwrap_or(status),
                retryable: entry.retryable,
                retry_after: retry_after_header.or(entry.retry_after_secs),
                provider: provider.to_string(),
            },
            None => {
                // Unknown failure: retryable iff 5xx or 429.
                let code = default_code_for(status);
                ProviderError {
                    code,
                    message,
                    http_status: status,
                    retryable: status >= 500 || status == 429,
                    retry_after: retry_after_header,
                    provider: provider.to_string(),
                }
            }
        }
    }
}

/// Body code extraction across the dialects: `error.code`, `error.type`,
/// `error.status`, or top-level `code`.
fn extract_body_code(body: &Value) -> Option<String> {
    let error = body.get("error");
    for candidate in [
        error.and_then(|e| e.get("code")),
        error.and_then(|e| e.get("type")),
        error.and_then(|e| e.get("status")),
        body.get("code"),
    ] {
        match candidate {
            Some(Value::String(s)) => return Some(s.clone()),
            Some(Value::Number(n)) => return Some(n.to_string()),
            _ => {}
        }
    }
    None
}

fn extract_message(body: &Value) -> Option<String> {
    body.get("error")
        .and_then(|e| e.get("message"))
        .or_else(|| body.get("message"))
        .and_then(Value::as_str)
        .map(String::from)
}

fn truncated(body: &str) -> String {
    const MAX: usize = 300;
    if body.len() <= MAX {
        return body.to_string();
    }
    let mut end = MAX;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &body[..end])
}

fn default_code_for(status: u16) -> ErrorCode {
    match status {
        400 => ErrorCode::InvalidRequest,
        401 | 403 => ErrorCode::InvalidApiKey,
        404 => ErrorCode::ProviderNotFound,
        413 => ErrorCode::ContentTooLarge,
        429 => ErrorCode::RateLimit,
        500..=599 => ErrorCode::ModelError,
        _ => ErrorCode::Unknown,
    }
}

/// Exponential backoff schedule for the upstream retry loop.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1_000),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (zero-based):
    /// `min(base · mult^attempt, max)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let ms = self.base_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        Duration::from_millis(ms as u64).min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> ErrorClassifier {
        ErrorClassifier::with_defaults()
    }

    #[test]
    fn test_table_hit_by_body_code() {
        let e = classifier().classify(
            DialectFamily::Anthropic,
            "anthropic",
            429,
            r#"{"error": {"type": "rate_limit_error", "message": "slow down"}}"#,
            None,
        );
        assert_eq!(e.code, ErrorCode::RateLimit);
        assert!(e.retryable);
        assert_eq!(e.message, "slow down");
        assert_eq!(e.provider, "anthropic");
    }

    #[test]
    fn test_table_default_retry_after() {
        let e = classifier().classify(
            DialectFamily::Anthropic,
            "anthropic",
            529,
            r#"{"error": {"type": "overloaded_error", "message": "overloaded"}}"#,
            None,
        );
        assert_eq!(e.code, ErrorCode::RateLimitAggressive);
        assert_eq!(e.retry_after, Some(30));
    }

    #[test]
    fn test_header_retry_after_wins() {
        let e = classifier().classify(
            DialectFamily::Anthropic,
            "anthropic",
            529,
            r#"{"error": {"type": "overloaded_error"}}"#,
            Some(7),
        );
        assert_eq!(e.retry_after, Some(7));
    }

    #[test]
    fn test_iflow_status_variants() {
        let e = classifier().classify(DialectFamily::Iflow, "iflow", 439, "{}", None);
        assert_eq!(e.code, ErrorCode::RateLimitVariant);
        assert!(e.retryable);
        assert!(e.failover_eligible());
    }

    #[test]
    fn test_unknown_defaults() {
        // Unknown 503 is retryable.
        let e = classifier().classify(DialectFamily::OpenAi, "o", 503, "bad gateway", None);
        assert!(e.retryable);
        assert_eq!(e.code, ErrorCode::ModelError);
        // Unknown 418 is not.
        let e = classifier().classify(DialectFamily::OpenAi, "o", 418, "teapot", None);
        assert!(!e.retryable);
        assert_eq!(e.code, ErrorCode::Unknown);
        // 429 always is.
        let e = classifier().classify(DialectFamily::OpenAi, "o", 429, "too many", None);
        assert!(e.retryable);
        assert_eq!(e.code, ErrorCode::RateLimit);
    }

    #[test]
    fn test_non_retryable_auth_error() {
        let e = classifier().classify(
            DialectFamily::OpenAi,
            "o",
            401,
            r#"{"error": {"code": "invalid_api_key", "message": "bad key"}}"#,
            None,
        );
        assert_eq!(e.code, ErrorCode::InvalidApiKey);
        assert!(!e.retryable);
    }

    #[test]
    fn test_retry_policy_schedule() {
        let p = RetryPolicy::default();
        assert_eq!(p.delay_for(0), Duration::from_millis(1_000));
        assert_eq!(p.delay_for(1), Duration::from_millis(2_000));
        assert_eq!(p.delay_for(2), Duration::from_millis(4_000));
        // Capped.
        assert_eq!(p.delay_for(20), Duration::from_secs(30));
    }
}
