use relay_core::{RequestContext, Result};
use serde_json::{Value, json};

use crate::chain::{Capabilities, TransformMessage, Transformer};

/// Clamps `max_tokens` to the limit configured in the transformer options
/// (`{"max_tokens": N}`). Providers with small output windows use this to
/// keep oversized client requests from being rejected upstream.
pub struct MaxTokenTransformer;

impl Transformer for MaxTokenTransformer {
    fn name(&self) -> &'static str {
        "maxtoken"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            request_in: true,
            ..Default::default()
        }
    }

    fn request_in(&self, msg: TransformMessage, _ctx: &RequestContext) -> Result<TransformMessage> {
        let mut msg = msg;
        let limit = msg.config.get("max_tokens").and_then(Value::as_u64);
        if let Some(limit) = limit {
            let requested = msg.body.get("max_tokens").and_then(Value::as_u64);
            match requested {
                Some(n) if n > limit => msg.body["max_tokens"] = json!(limit),
                None => msg.body["max_tokens"] = json!(limit),
                _ => {}
            }
        }
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::{DialectFamily, RouteTarget};

    fn ctx() -> RequestContext {
        RequestContext::new("r".into(), RouteTarget::new("p", "m"), DialectFamily::OpenAi)
    }

    #[test]
    fn test_clamps_oversized_request() {
        let t = MaxTokenTransformer;
        let mut msg = TransformMessage::new(json!({"max_tokens": 100_000}));
        msg.merge_config(json!({"max_tokens": 8192}));
        let out = t.request_in(msg, &ctx()).unwrap();
        assert_eq!(out.body["max_tokens"], 8192);
    }

    #[test]
    fn test_leaves_smaller_request_alone() {
        let t = MaxTokenTransformer;
        let mut msg = TransformMessage::new(json!({"max_tokens": 100}));
        msg.merge_config(json!({"max_tokens": 8192}));
        let out = t.request_in(msg, &ctx()).unwrap();
        assert_eq!(out.body["max_tokens"], 100);
    }

    #[test]
    fn test_fills_missing_max_tokens() {
        let t = MaxTokenTransformer;
        let mut msg = TransformMessage::new(json!({"model": "m"}));
        msg.merge_config(json!({"max_tokens": 4096}));
        let out = t.request_in(msg, &ctx()).unwrap();
        assert_eq!(out.body["max_tokens"], 4096);
    }

    #[test]
    fn test_no_limit_configured_is_identity() {
        let t = MaxTokenTransformer;
        let msg = TransformMessage::new(json!({"max_tokens": 100_000}));
        let out = t.request_in(msg, &ctx()).unwrap();
        assert_eq!(out.body["max_tokens"], 100_000);
    }
}
