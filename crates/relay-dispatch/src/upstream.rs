use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use relay_core::{
    DialectFamily, ErrorCode, ProviderError, RelayError, RequestContext, Result,
};
use relay_stream::ByteStream;
use relay_transform::{ErrorClassifier, RetryPolicy, Signer, Transformer};
use serde_json::Value;
use std::io;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::registry::Provider;

/// Outcome of a successful upstream call.
pub enum UpstreamReply {
    Json(Value),
    /// Response headers arrived; the body is a live byte stream.
    Stream(ByteStream),
}

/// The upstream seam: the dispatcher talks to providers through this trait so
/// tests can substitute a scripted transport.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn send(
        &self,
        provider: &Provider,
        ctx: &RequestContext,
        body: &Value,
        stream: bool,
        auth: Option<Arc<dyn Transformer>>,
        cancel: &CancellationToken,
    ) -> Result<UpstreamReply>;
}

/// Retry-aware HTTP client for provider calls.
#[derive(Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    classifier: Arc<ErrorClassifier>,
    policy: RetryPolicy,
}

impl UpstreamClient {
    pub fn new(classifier: Arc<ErrorClassifier>) -> Self {
        Self {
            http: reqwest::Client::new(),
            classifier,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// The chat endpoint for a provider+model, by dialect family.
    pub fn endpoint_url(provider: &Provider, model: &str, stream: bool) -> String {
        let base = &provider.base_url;
        match provider.family {
            DialectFamily::Anthropic => format!("{base}/messages"),
            DialectFamily::Gemini => {
                let verb = if stream {
                    "streamGenerateContent?alt=sse"
                } else {
                    "generateContent"
                };
                format!("{base}/models/{model}:{verb}")
            }
            DialectFamily::OpenAi | DialectFamily::Iflow => format!("{base}/chat/completions"),
        }
    }

    /// Build the final header map for one attempt. The signer re-runs here so
    /// its timestamp stays inside the verification window on retries.
    fn headers_for_attempt(
        provider: &Provider,
        ctx: &RequestContext,
        api_key: &str,
        stream: bool,
        auth: Option<&Arc<dyn Transformer>>,
    ) -> Vec<(String, String)> {
        let mut builder = relay_transform::HeaderBuilder::new(ctx, api_key)
            .stream(stream)
            .custom_headers(provider.headers.clone());
        if let Some(hook) = auth {
            builder = builder.auth_from_transformer(hook.auth_headers(ctx, api_key));
        }
        let mut headers = builder.build();
        if let Some(signer) = Signer::for_family(provider.family) {
            signer.sign(&mut headers, api_key, chrono::Utc::now().timestamp_millis());
        }
        headers
    }

    fn network_error(provider: &Provider, e: &reqwest::Error) -> ProviderError {
        ProviderError::new(ErrorCode::NetworkError, e.to_string(), 502)
            .retryable(true)
            .with_provider(provider.name.clone())
    }
}

fn into_byte_stream(resp: reqwest::Response) -> ByteStream {
    Box::pin(resp.bytes_stream().map(|item: reqwest::Result<Bytes>| {
        item.map_err(|e| io::Error::new(io::ErrorKind::ConnectionReset, e.to_string()))
    }))
}

#[async_trait]
impl Upstream for UpstreamClient {
    /// POST to the provider with the retry loop wrapped around it.
    /// Non-retryable errors short-circuit; cancellation aborts immediately.
    async fn send(
        &self,
        provider: &Provider,
        ctx: &RequestContext,
        body: &Value,
        stream: bool,
        auth: Option<Arc<dyn Transformer>>,
        cancel: &CancellationToken,
    ) -> Result<UpstreamReply> {
        let url = Self::endpoint_url(provider, &ctx.target.model, stream);
        let mut last_err: Option<ProviderError> = None;

        for attempt in 0..=self.policy.max_retries {
            if attempt > 0 {
                let delay = self.policy.delay_for(attempt - 1);
                debug!(
                    provider = %provider.name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "retrying upstream call"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(RelayError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let api_key = provider.next_key();
            let headers =
                Self::headers_for_attempt(provider, ctx, &api_key, stream, auth.as_ref());

            let mut request = self.http.post(&url).json(body);
            for (name, value) in &headers {
                request = request.header(name.as_str(), value.as_str());
            }

            let response = tokio::select! {
                _ = cancel.cancelled() => return Err(RelayError::Cancelled),
                resp = request.send() => resp,
            };

            let response = match response {
                Ok(resp) => resp,
                Err(e) => {
                    let err = Self::network_error(provider, &e);
                    warn!(provider = %provider.name, error = %e, "upstream network error");
                    last_err = Some(err);
                    continue;
                }
            };

            let status = response.status();
            if status.is_success() {
                if stream {
                    return Ok(UpstreamReply::Stream(into_byte_stream(response)));
                }
                return match response.json::<Value>().await {
                    Ok(json) => Ok(UpstreamReply::Json(json)),
                    Err(e) => Err(RelayError::Provider(
                        ProviderError::new(
                            ErrorCode::ProviderResponseError,
                            format!("invalid response body: {e}"),
                            status.as_u16(),
                        )
                        .retryable(false)
                        .with_provider(provider.name.clone()),
                    )),
                };
            }

            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            let body_text = response.text().await.unwrap_or_default();
            let err = self.classifier.classify(
                provider.family,
                &provider.name,
                status.as_u16(),
                &body_text,
                retry_after,
            );
            warn!(
                provider = %provider.name,
                status = status.as_u16(),
                code = %err.code,
                retryable = err.retryable,
                "upstream error"
            );
            if !err.retryable {
                return Err(RelayError::Provider(err));
            }
            last_err = Some(err);
        }

        Err(RelayError::Provider(last_err.expect("at least one attempt")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_config::ProviderConfig;
    use relay_core::RouteTarget;

    fn provider(kind: &str) -> Provider {
        Provider::from_config(&ProviderConfig {
            name: "p".into(),
            kind: kind.into(),
            base_url: "https://api.example.com/v1".into(),
            api_keys: vec!["k".into()],
            ..Default::default()
        })
    }

    fn ctx(family: DialectFamily) -> RequestContext {
        RequestContext::new("r".into(), RouteTarget::new("p", "m"), family)
    }

    #[test]
    fn test_endpoint_urls_by_family() {
        assert_eq!(
            UpstreamClient::endpoint_url(&provider("anthropic"), "m", false),
            "https://api.example.com/v1/messages"
        );
        assert_eq!(
            UpstreamClient::endpoint_url(&provider("openai"), "m", true),
            "https://api.example.com/v1/chat/completions"
        );
        assert_eq!(
            UpstreamClient::endpoint_url(&provider("gemini"), "gemini-2.5-pro", false),
            "https://api.example.com/v1/models/gemini-2.5-pro:generateContent"
        );
        assert_eq!(
            UpstreamClient::endpoint_url(&provider("gemini"), "gemini-2.5-pro", true),
            "https://api.example.com/v1/models/gemini-2.5-pro:streamGenerateContent?alt=sse"
        );
    }

    #[test]
    fn test_attempt_headers_signed_for_iflow() {
        let p = provider("iflow");
        let c = ctx(DialectFamily::Iflow);
        let headers = UpstreamClient::headers_for_attempt(&p, &c, "key", true, None);
        assert!(headers.iter().any(|(k, _)| k == "X-Iflow-Signature"));
        assert!(headers.iter().any(|(k, _)| k == "X-Iflow-Timestamp"));
        // iflow streams still accept JSON.
        let accept = headers.iter().find(|(k, _)| k == "Accept").unwrap();
        assert_eq!(accept.1, "application/json");
    }

    #[test]
    fn test_attempt_headers_unsigned_for_openai() {
        let p = provider("openai");
        let c = ctx(DialectFamily::OpenAi);
        let headers = UpstreamClient::headers_for_attempt(&p, &c, "key", false, None);
        assert!(!headers.iter().any(|(k, _)| k.contains("Signature")));
        assert!(
            headers
                .iter()
                .any(|(k, v)| k == "Authorization" && v == "Bearer key")
        );
    }
}
