use relay_core::{RequestContext, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use relay_config::TransformerSpec;

/// What a transformer can do. Bypass and ordering decisions are closed-form
/// over these flags.
#[derive(Debug, Clone, Copy, Default)]
pub struct Capabilities {
    pub request_out: bool,
    pub request_in: bool,
    pub response_out: bool,
    pub response_in: bool,
    pub auth: bool,
}

/// A payload moving through the chain, with the config deltas accumulated by
/// earlier steps. Deltas merge shallowly; later writers win.
#[derive(Debug, Clone)]
pub struct TransformMessage {
    pub body: Value,
    pub config: Value,
}

impl TransformMessage {
    pub fn new(body: Value) -> Self {
        Self {
            body,
            config: Value::Object(serde_json::Map::new()),
        }
    }

    /// Shallow-merge a config delta into the accumulated config.
    pub fn merge_config(&mut self, delta: Value) {
        if let (Value::Object(acc), Value::Object(delta)) = (&mut self.config, delta) {
            for (k, v) in delta {
                acc.insert(k, v);
            }
        }
    }
}

/// A dialect (or utility) transformer. Every hook defaults to identity so an
/// implementation only writes the directions it participates in; the
/// [`Capabilities`] flags must agree with the overridden hooks.
pub trait Transformer: Send + Sync {
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities;

    /// Client dialect → unified.
    fn request_out(&self, msg: TransformMessage, _ctx: &RequestContext) -> Result<TransformMessage> {
        Ok(msg)
    }

    /// Unified → provider dialect.
    fn request_in(&self, msg: TransformMessage, _ctx: &RequestContext) -> Result<TransformMessage> {
        Ok(msg)
    }

    /// Provider dialect → unified (complete JSON responses).
    fn response_out(&self, body: Value, _ctx: &RequestContext) -> Result<Value> {
        Ok(body)
    }

    /// Unified → client dialect (complete JSON responses), applied last.
    fn response_in(&self, body: Value, _ctx: &RequestContext) -> Result<Value> {
        Ok(body)
    }

    /// Provider dialect → unified for one parsed SSE event payload.
    fn response_event_out(&self, event: Value, _ctx: &RequestContext) -> Result<Value> {
        Ok(event)
    }

    /// Unified → client dialect for one parsed SSE event payload.
    fn response_event_in(&self, event: Value, _ctx: &RequestContext) -> Result<Value> {
        Ok(event)
    }

    /// Auth hook: headers (and optionally a body mutation) when this
    /// transformer owns authorization. Used directly on the bypass path.
    fn auth_headers(&self, _ctx: &RequestContext, _api_key: &str) -> Vec<(String, String)> {
        Vec::new()
    }
}

/// Named registry of transformer values, populated at startup.
#[derive(Default)]
pub struct TransformerRegistry {
    by_name: HashMap<&'static str, Arc<dyn Transformer>>,
}

impl TransformerRegistry {
    /// Registry preloaded with the shipped transformer set.
    pub fn with_defaults() -> Self {
        let mut reg = Self::default();
        reg.register(Arc::new(crate::openai::OpenAiTransformer));
        reg.register(Arc::new(crate::anthropic::AnthropicTransformer));
        reg.register(Arc::new(crate::gemini::GeminiTransformer));
        reg.register(Arc::new(crate::iflow::IflowTransformer));
        reg.register(Arc::new(crate::maxtoken::MaxTokenTransformer));
        reg
    }

    pub fn register(&mut self, t: Arc<dyn Transformer>) {
        self.by_name.insert(t.name(), t);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Transformer>> {
        self.by_name.get(name).cloned()
    }
}

/// The assembled pipeline for one request: the ingress dialect transformer,
/// the provider-level chain, and the model-level chain.
///
/// Requests run ingress `request_out`, then provider chain, then model chain;
/// responses run model chain reversed, provider chain reversed, then ingress
/// `response_in` last.
pub struct TransformerChain {
    ingress: Arc<dyn Transformer>,
    provider_chain: Vec<Arc<dyn Transformer>>,
    model_chain: Vec<Arc<dyn Transformer>>,
    /// Per-transformer options from provider config, shallow-merged into the
    /// message config before that transformer runs.
    options: HashMap<String, Value>,
}

impl TransformerChain {
    /// Assemble a chain from a provider's transformer spec. Unknown names are
    /// skipped with a debug log rather than failing the request.
    pub fn assemble(
        registry: &TransformerRegistry,
        ingress: Arc<dyn Transformer>,
        spec: Option<&TransformerSpec>,
        model: &str,
    ) -> Self {
        let mut provider_chain = Vec::new();
        let mut model_chain = Vec::new();
        let mut options = HashMap::new();

        if let Some(spec) = spec {
            for name in &spec.chain {
                match registry.get(name) {
                    Some(t) => provider_chain.push(t),
                    None => debug!(transformer = %name, "unknown transformer, skipping"),
                }
            }
            if let Some(model_spec) = spec.models.get(model) {
                for name in &model_spec.chain {
                    match registry.get(name) {
                        Some(t) => model_chain.push(t),
                        None => debug!(transformer = %name, "unknown transformer, skipping"),
                    }
                }
            }
            for (name, opts) in &spec.options {
                options.insert(name.clone(), opts.clone());
            }
        }

        Self {
            ingress,
            provider_chain,
            model_chain,
            options,
        }
    }

    /// Bypass: the ingress dialect equals the sole provider-level transformer
    /// and no model-level transformers apply. The request is forwarded as-is
    /// (the caller strips content-length and router-managed headers).
    pub fn is_bypass(&self) -> bool {
        self.model_chain.is_empty()
            && self.provider_chain.len() == 1
            && self.provider_chain[0].name() == self.ingress.name()
    }

    /// The auth hook for the bypass path, when the active transformer has one.
    pub fn bypass_auth(&self) -> Option<Arc<dyn Transformer>> {
        if !self.is_bypass() {
            return None;
        }
        let t = &self.provider_chain[0];
        t.capabilities().auth.then(|| Arc::clone(t))
    }

    fn seed_options(&self, msg: &mut TransformMessage, t: &Arc<dyn Transformer>) {
        if let Some(opts) = self.options.get(t.name()) {
            msg.merge_config(opts.clone());
        }
    }

    /// Run the full request direction: client dialect → provider dialect.
    pub fn transform_request(&self, body: Value, ctx: &RequestContext) -> Result<TransformMessage> {
        if self.is_bypass() {
            return Ok(TransformMessage::new(body));
        }
        let mut msg = self.ingress.request_out(TransformMessage::new(body), ctx)?;
        for t in self.provider_chain.iter().chain(self.model_chain.iter()) {
            self.seed_options(&mut msg, t);
            if t.capabilities().request_in {
                msg = t.request_in(msg, ctx)?;
            }
        }
        Ok(msg)
    }

    /// Run the full response direction: provider dialect → client dialect.
    pub fn transform_response(&self, body: Value, ctx: &RequestContext) -> Result<Value> {
        if self.is_bypass() {
            return Ok(body);
        }
        let mut body = body;
        for t in self
            .model_chain
            .iter()
            .rev()
            .chain(self.provider_chain.iter().rev())
        {
            if t.capabilities().response_out {
                body = t.response_out(body, ctx)?;
            }
        }
        self.ingress.response_in(body, ctx)
    }

    /// Transform one parsed SSE event payload through the response direction.
    pub fn transform_event(&self, event: Value, ctx: &RequestContext) -> Result<Value> {
        if self.is_bypass() {
            return Ok(event);
        }
        let mut event = event;
        for t in self
            .model_chain
            .iter()
            .rev()
            .chain(self.provider_chain.iter().rev())
        {
            if t.capabilities().response_out {
                event = t.response_event_out(event, ctx)?;
            }
        }
        self.ingress.response_event_in(event, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::{DialectFamily, RouteTarget};
    use serde_json::json;

    fn ctx() -> RequestContext {
        RequestContext::new(
            "req".into(),
            RouteTarget::new("prov", "model"),
            DialectFamily::OpenAi,
        )
    }

    fn registry() -> TransformerRegistry {
        TransformerRegistry::with_defaults()
    }

    fn spec(chain: &[&str]) -> TransformerSpec {
        TransformerSpec {
            chain: chain.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_bypass_when_same_dialect() {
        let reg = registry();
        let chain = TransformerChain::assemble(
            &reg,
            reg.get("openai").unwrap(),
            Some(&spec(&["openai"])),
            "m",
        );
        assert!(chain.is_bypass());
        // Bypass forwards the body untouched.
        let body = json!({"model": "m", "messages": [], "unknown_field": 7});
        let out = chain.transform_request(body.clone(), &ctx()).unwrap();
        assert_eq!(out.body, body);
    }

    #[test]
    fn test_no_bypass_with_model_chain() {
        let reg = registry();
        let mut s = spec(&["openai"]);
        s.models.insert(
            "m".into(),
            relay_config::ModelTransformerSpec {
                chain: vec!["maxtoken".into()],
            },
        );
        let chain = TransformerChain::assemble(&reg, reg.get("openai").unwrap(), Some(&s), "m");
        assert!(!chain.is_bypass());
    }

    #[test]
    fn test_no_bypass_with_different_dialect() {
        let reg = registry();
        let chain = TransformerChain::assemble(
            &reg,
            reg.get("anthropic").unwrap(),
            Some(&spec(&["gemini"])),
            "m",
        );
        assert!(!chain.is_bypass());
    }

    #[test]
    fn test_options_reach_transformer_config() {
        let reg = registry();
        let mut s = spec(&["maxtoken"]);
        s.options
            .insert("maxtoken".into(), json!({"max_tokens": 128}));
        let chain = TransformerChain::assemble(&reg, reg.get("openai").unwrap(), Some(&s), "m");
        let out = chain
            .transform_request(json!({"model": "m", "max_tokens": 99999}), &ctx())
            .unwrap();
        assert_eq!(out.body["max_tokens"], json!(128));
    }

    #[test]
    fn test_config_shallow_merge_later_wins() {
        let mut msg = TransformMessage::new(json!({}));
        msg.merge_config(json!({"a": 1, "b": 1}));
        msg.merge_config(json!({"b": 2}));
        assert_eq!(msg.config, json!({"a": 1, "b": 2}));
    }

    #[test]
    fn test_unknown_transformer_skipped() {
        let reg = registry();
        let chain = TransformerChain::assemble(
            &reg,
            reg.get("openai").unwrap(),
            Some(&spec(&["does-not-exist", "openai"])),
            "m",
        );
        // Only the known transformer made it into the chain.
        assert!(chain.is_bypass());
    }
}
