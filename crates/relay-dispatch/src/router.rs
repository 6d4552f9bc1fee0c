use relay_core::{
    DialectFamily, Priority, RelayError, RequestContext, Result, RouteTarget, Scenario,
};
use serde_json::Value;
use tracing::debug;

use relay_config::RelayConfig;

/// Which dialect the client spoke at ingress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngressDialect {
    /// `/v1/messages`
    Anthropic,
    /// `/v1/chat/completions`
    OpenAi,
}

impl IngressDialect {
    pub fn transformer_name(&self) -> &'static str {
        match self {
            IngressDialect::Anthropic => "anthropic",
            IngressDialect::OpenAi => "openai",
        }
    }
}

/// Per-request facts extracted at ingress, before routing.
#[derive(Debug, Clone)]
pub struct IngressMeta {
    pub request_id: String,
    pub session_id: Option<String>,
    pub conversation_id: Option<String>,
    pub priority: Priority,
    pub dialect: IngressDialect,
    pub stream: bool,
}

/// Classifies the scenario, resolves the routing key, and computes the
/// failover alternatives.
pub struct Router;

impl Router {
    /// Build the request context for one ingress request.
    pub fn route(config: &RelayConfig, body: &Value, meta: &IngressMeta) -> Result<RequestContext> {
        let requested_model = body.get("model").and_then(Value::as_str).unwrap_or("");

        // An explicit `provider,model` routes directly. Anything else
        // (`custom-model`, a bare model name, or no model at all) goes
        // through the scenario table as the custom-model alias.
        let (target, scenario, is_custom) = match RouteTarget::parse(requested_model) {
            Some(explicit) => (explicit, Scenario::Default, false),
            None => {
                let scenario = classify_scenario(config, body, requested_model);
                let key = config.router.key_for(scenario);
                let target = RouteTarget::parse(key).ok_or_else(|| {
                    RelayError::Config(format!("no route configured for scenario {scenario}"))
                })?;
                (target, scenario, true)
            }
        };

        let alternatives = if is_custom {
            config.failover.alternatives_for(&target)
        } else {
            Vec::new()
        };

        debug!(
            request_id = %meta.request_id,
            slot = %target,
            scenario = %scenario,
            is_custom,
            alternatives = alternatives.len(),
            "routed"
        );

        let mut ctx = RequestContext::new(meta.request_id.clone(), target, DialectFamily::OpenAi);
        ctx.session_id = meta.session_id.clone();
        ctx.conversation_id = meta.conversation_id.clone();
        ctx.priority = meta.priority;
        ctx.scenario = scenario;
        ctx.is_custom_model = is_custom;
        ctx.alternatives = alternatives;
        ctx.log_stage("routed");
        Ok(ctx)
    }
}

/// Scenario precedence: long-context beats think beats web-search beats
/// background; everything else is default.
fn classify_scenario(config: &RelayConfig, body: &Value, requested_model: &str) -> Scenario {
    if estimate_tokens(body) > config.router.long_context_threshold {
        return Scenario::LongContext;
    }
    if has_thinking(body) {
        return Scenario::Think;
    }
    if has_web_search(body) {
        return Scenario::WebSearch;
    }
    // Small-model hints mark offloaded background work.
    if requested_model.contains("haiku") || requested_model.contains("mini") {
        return Scenario::Background;
    }
    Scenario::Default
}

fn has_thinking(body: &Value) -> bool {
    if body
        .get("thinking")
        .and_then(|t| t.get("type"))
        .and_then(Value::as_str)
        == Some("enabled")
    {
        return true;
    }
    body.get("reasoning").is_some_and(|r| !r.is_null())
}

fn has_web_search(body: &Value) -> bool {
    body.get("tools")
        .and_then(Value::as_array)
        .is_some_and(|tools| {
            tools.iter().any(|t| {
                let name = t
                    .get("type")
                    .and_then(Value::as_str)
                    .or_else(|| t.get("name").and_then(Value::as_str))
                    .unwrap_or("");
                name.contains("web_search")
            })
        })
}

/// Rough token estimate over message text, system prompt, and tool schemas:
/// characters divided by four.
pub fn estimate_tokens(body: &Value) -> usize {
    let mut chars = 0usize;

    if let Some(system) = body.get("system") {
        chars += json_text_len(system);
    }
    for msg in body.get("messages").and_then(Value::as_array).into_iter().flatten() {
        if let Some(content) = msg.get("content") {
            chars += json_text_len(content);
        }
    }
    if let Some(tools) = body.get("tools") {
        chars += tools.to_string().len();
    }
    chars / 4
}

fn json_text_len(value: &Value) -> usize {
    match value {
        Value::String(s) => s.len(),
        Value::Array(items) => items.iter().map(json_text_len).sum(),
        Value::Object(map) => map.values().map(json_text_len).sum(),
        _ => 0,
    }
}
