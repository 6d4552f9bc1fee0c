use relay_core::{RequestContext, Result};
use serde_json::{Value, json};

use crate::chain::{Capabilities, TransformMessage, Transformer};

/// Anthropic Messages API dialect.
///
/// `request_out` lifts an Anthropic-native request into the unified
/// `chat.completions` shape; `response_in` lowers a unified response back.
/// Thinking budgets map to the unified `reasoning.budget_tokens` field.
pub struct AnthropicTransformer;

impl Transformer for AnthropicTransformer {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            request_out: true,
            request_in: true,
            response_out: true,
            response_in: true,
            auth: true,
        }
    }

    fn request_out(&self, msg: TransformMessage, _ctx: &RequestContext) -> Result<TransformMessage> {
        let mut msg = msg;
        msg.body = anthropic_to_unified(msg.body);
        Ok(msg)
    }

    fn request_in(&self, msg: TransformMessage, _ctx: &RequestContext) -> Result<TransformMessage> {
        let mut msg = msg;
        msg.body = unified_to_anthropic(msg.body);
        Ok(msg)
    }

    fn response_out(&self, body: Value, _ctx: &RequestContext) -> Result<Value> {
        Ok(anthropic_response_to_unified(body))
    }

    fn response_in(&self, body: Value, _ctx: &RequestContext) -> Result<Value> {
        Ok(unified_response_to_anthropic(body))
    }

    fn response_event_in(&self, event: Value, _ctx: &RequestContext) -> Result<Value> {
        Ok(unified_chunk_to_anthropic_event(event))
    }

    fn auth_headers(&self, _ctx: &RequestContext, api_key: &str) -> Vec<(String, String)> {
        vec![
            ("x-api-key".into(), api_key.to_string()),
            ("anthropic-version".into(), "2023-06-01".into()),
        ]
    }
}

/// Anthropic request → unified. System prompt becomes a leading system
/// message; tool_use/tool_result content blocks become tool_calls/tool
/// messages; `thinking` becomes `reasoning`.
fn anthropic_to_unified(body: Value) -> Value {
    let mut messages = Vec::new();

    if let Some(system) = body.get("system") {
        let text = match system {
            Value::String(s) => s.clone(),
            Value::Array(blocks) => blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n"),
            _ => String::new(),
        };
        if !text.is_empty() {
            messages.push(json!({"role": "system", "content": text}));
        }
    }

    for msg in body.get("messages").and_then(Value::as_array).into_iter().flatten() {
        let role = msg.get("role").and_then(Value::as_str).unwrap_or("user");
        match msg.get("content") {
            Some(Value::String(text)) => {
                messages.push(json!({"role": role, "content": text}));
            }
            Some(Value::Array(blocks)) => {
                let mut text_parts = Vec::new();
                let mut tool_calls = Vec::new();
                for block in blocks {
                    match block.get("type").and_then(Value::as_str) {
                        Some("text") => {
                            if let Some(t) = block.get("text").and_then(Value::as_str) {
                                text_parts.push(t.to_string());
                            }
                        }
                        Some("tool_use") => {
                            tool_calls.push(json!({
                                "id": block.get("id").cloned().unwrap_or_default(),
                                "type": "function",
                                "function": {
                                    "name": block.get("name").cloned().unwrap_or_default(),
                                    "arguments": block
                                        .get("input")
                                        .map(|v| v.to_string())
                                        .unwrap_or_else(|| "{}".into()),
                                },
                            }));
                        }
                        Some("tool_result") => {
                            messages.push(json!({
                                "role": "tool",
                                "tool_call_id": block.get("tool_use_id").cloned().unwrap_or_default(),
                                "content": block.get("content").cloned().unwrap_or_default(),
                            }));
                        }
                        _ => {}
                    }
                }
                if !text_parts.is_empty() || !tool_calls.is_empty() {
                    let mut m = json!({"role": role, "content": text_parts.join("")});
                    if !tool_calls.is_empty() {
                        m["tool_calls"] = Value::Array(tool_calls);
                    }
                    messages.push(m);
                }
            }
            _ => {}
        }
    }

    let mut out = json!({
        "model": body.get("model").cloned().unwrap_or_default(),
        "messages": messages,
    });

    for (src, dst) in [
        ("max_tokens", "max_tokens"),
        ("temperature", "temperature"),
        ("stream", "stream"),
        ("stop_sequences", "stop"),
    ] {
        if let Some(v) = body.get(src) {
            out[dst] = v.clone();
        }
    }

    if let Some(tools) = body.get("tools").and_then(Value::as_array) {
        let mapped: Vec<Value> = tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.get("name").cloned().unwrap_or_default(),
                        "description": t.get("description").cloned().unwrap_or_default(),
                        "parameters": t.get("input_schema").cloned().unwrap_or(json!({})),
                    },
                })
            })
            .collect();
        out["tools"] = Value::Array(mapped);
    }

    if let Some(thinking) = body.get("thinking")
        && thinking.get("type").and_then(Value::as_str) == Some("enabled")
    {
        out["reasoning"] = json!({
            "budget_tokens": thinking.get("budget_tokens").cloned().unwrap_or(json!(8192)),
        });
    }

    out
}

/// Unified request → Anthropic. The inverse of [`anthropic_to_unified`].
fn unified_to_anthropic(body: Value) -> Value {
    let mut system = Vec::new();
    let mut messages = Vec::new();

    for msg in body.get("messages").and_then(Value::as_array).into_iter().flatten() {
        let role = msg.get("role").and_then(Value::as_str).unwrap_or("user");
        let content = msg.get("content").cloned().unwrap_or(Value::Null);
        match role {
            "system" => {
                if let Some(t) = content.as_str() {
                    system.push(t.to_string());
                }
            }
            "tool" => {
                messages.push(json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": msg.get("tool_call_id").cloned().unwrap_or_default(),
                        "content": content,
                    }],
                }));
            }
            "assistant" => {
                let mut blocks = Vec::new();
                if let Some(t) = content.as_str()
                    && !t.is_empty()
                {
                    blocks.push(json!({"type": "text", "text": t}));
                }
                for tc in msg.get("tool_calls").and_then(Value::as_array).into_iter().flatten() {
                    let args = tc["function"]
                        .get("arguments")
                        .and_then(Value::as_str)
                        .and_then(|s| serde_json::from_str::<Value>(s).ok())
                        .unwrap_or(json!({}));
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": tc.get("id").cloned().unwrap_or_default(),
                        "name": tc["function"].get("name").cloned().unwrap_or_default(),
                        "input": args,
                    }));
                }
                messages.push(json!({"role": "assistant", "content": blocks}));
            }
            _ => {
                messages.push(json!({"role": "user", "content": content}));
            }
        }
    }

    let mut out = json!({
        "model": body.get("model").cloned().unwrap_or_default(),
        "messages": messages,
        "max_tokens": body.get("max_tokens").cloned().unwrap_or(json!(4096)),
    });
    if !system.is_empty() {
        out["system"] = json!(system.join("\n"));
    }
    for (src, dst) in [("temperature", "temperature"), ("stream", "stream"), ("stop", "stop_sequences")] {
        if let Some(v) = body.get(src) {
            out[dst] = v.clone();
        }
    }
    if let Some(tools) = body.get("tools").and_then(Value::as_array) {
        let mapped: Vec<Value> = tools
            .iter()
            .map(|t| {
                json!({
                    "name": t["function"].get("name").cloned().unwrap_or_default(),
                    "description": t["function"].get("description").cloned().unwrap_or_default(),
                    "input_schema": t["function"].get("parameters").cloned().unwrap_or(json!({})),
                })
            })
            .collect();
        out["tools"] = Value::Array(mapped);
    }
    if let Some(reasoning) = body.get("reasoning") {
        out["thinking"] = json!({
            "type": "enabled",
            "budget_tokens": reasoning.get("budget_tokens").cloned().unwrap_or(json!(8192)),
        });
    }
    out
}

/// Anthropic response → unified.
fn anthropic_response_to_unified(body: Value) -> Value {
    let content = body.get("content").and_then(Value::as_array);
    let text: String = content
        .into_iter()
        .flatten()
        .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|b| b.get("text").and_then(Value::as_str))
        .collect();
    let tool_calls: Vec<Value> = body
        .get("content")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter(|b| b.get("type").and_then(Value::as_str) == Some("tool_use"))
        .map(|b| {
            json!({
                "id": b.get("id").cloned().unwrap_or_default(),
                "type": "function",
                "function": {
                    "name": b.get("name").cloned().unwrap_or_default(),
                    "arguments": b.get("input").map(|v| v.to_string()).unwrap_or_else(|| "{}".into()),
                },
            })
        })
        .collect();

    let finish_reason = match body.get("stop_reason").and_then(Value::as_str) {
        Some("tool_use") => "tool_calls",
        Some("max_tokens") => "length",
        _ => "stop",
    };

    let mut message = json!({"role": "assistant", "content": text});
    if !tool_calls.is_empty() {
        message["tool_calls"] = Value::Array(tool_calls);
    }

    json!({
        "id": body.get("id").cloned().unwrap_or_default(),
        "object": "chat.completion",
        "model": body.get("model").cloned().unwrap_or_default(),
        "choices": [{"index": 0, "message": message, "finish_reason": finish_reason}],
        "usage": {
            "prompt_tokens": body["usage"].get("input_tokens").cloned().unwrap_or(json!(0)),
            "completion_tokens": body["usage"].get("output_tokens").cloned().unwrap_or(json!(0)),
        },
    })
}

/// Unified response → Anthropic.
fn unified_response_to_anthropic(body: Value) -> Value {
    let choice = &body["choices"][0];
    let message = &choice["message"];
    let mut content = Vec::new();
    if let Some(t) = message.get("content").and_then(Value::as_str)
        && !t.is_empty()
    {
        content.push(json!({"type": "text", "text": t}));
    }
    for tc in message
        .get("tool_calls")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let args = tc["function"]
            .get("arguments")
            .and_then(Value::as_str)
            .and_then(|s| serde_json::from_str::<Value>(s).ok())
            .unwrap_or(json!({}));
        content.push(json!({
            "type": "tool_use",
            "id": tc.get("id").cloned().unwrap_or_default(),
            "name": tc["function"].get("name").cloned().unwrap_or_default(),
            "input": args,
        }));
    }

    let stop_reason = match choice.get("finish_reason").and_then(Value::as_str) {
        Some("tool_calls") => "tool_use",
        Some("length") => "max_tokens",
        _ => "end_turn",
    };

    json!({
        "id": body.get("id").cloned().unwrap_or_default(),
        "type": "message",
        "role": "assistant",
        "model": body.get("model").cloned().unwrap_or_default(),
        "content": content,
        "stop_reason": stop_reason,
        "usage": {
            "input_tokens": body["usage"].get("prompt_tokens").cloned().unwrap_or(json!(0)),
            "output_tokens": body["usage"].get("completion_tokens").cloned().unwrap_or(json!(0)),
        },
    })
}

/// Unified stream chunk → Anthropic stream event. Text deltas become
/// `content_block_delta`; the final chunk becomes `message_delta`.
fn unified_chunk_to_anthropic_event(chunk: Value) -> Value {
    let choice = &chunk["choices"][0];
    if let Some(text) = choice["delta"].get("content").and_then(Value::as_str) {
        return json!({
            "type": "content_block_delta",
            "index": 0,
            "delta": {"type": "text_delta", "text": text},
        });
    }
    if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
        let stop_reason = match reason {
            "tool_calls" => "tool_use",
            "length" => "max_tokens",
            _ => "end_turn",
        };
        return json!({
            "type": "message_delta",
            "delta": {"stop_reason": stop_reason},
            "usage": chunk.get("usage").cloned().unwrap_or(json!({})),
        });
    }
    chunk
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_round_trip_preserves_semantics() {
        let original = json!({
            "model": "claude-sonnet-4",
            "max_tokens": 1024,
            "system": "be terse",
            "messages": [
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": [
                    {"type": "text", "text": "checking"},
                    {"type": "tool_use", "id": "t1", "name": "search", "input": {"q": "rust"}},
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "t1", "content": "found"},
                ]},
            ],
            "tools": [{"name": "search", "description": "web search", "input_schema": {"type": "object"}}],
            "thinking": {"type": "enabled", "budget_tokens": 2048},
        });

        let unified = anthropic_to_unified(original.clone());
        let back = unified_to_anthropic(unified.clone());

        // Roles and ordering survive.
        assert_eq!(unified["messages"][0]["role"], "system");
        assert_eq!(back["system"], "be terse");
        let roles: Vec<&str> = back["messages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["role"].as_str().unwrap())
            .collect();
        assert_eq!(roles, vec!["user", "assistant", "user"]);

        // Tool call survives with its arguments.
        let tool_use = &back["messages"][1]["content"][1];
        assert_eq!(tool_use["type"], "tool_use");
        assert_eq!(tool_use["name"], "search");
        assert_eq!(tool_use["input"]["q"], "rust");

        // Reasoning budget survives.
        assert_eq!(back["thinking"]["budget_tokens"], 2048);
        // Tool definitions survive.
        assert_eq!(back["tools"][0]["name"], "search");
    }

    #[test]
    fn test_response_mapping() {
        let upstream = json!({
            "id": "msg_1",
            "model": "claude-sonnet-4",
            "content": [
                {"type": "text", "text": "hello"},
                {"type": "tool_use", "id": "t1", "name": "calc", "input": {"x": 1}},
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 10, "output_tokens": 5},
        });
        let unified = anthropic_response_to_unified(upstream);
        assert_eq!(unified["choices"][0]["message"]["content"], "hello");
        assert_eq!(unified["choices"][0]["finish_reason"], "tool_calls");
        assert_eq!(unified["usage"]["prompt_tokens"], 10);

        let back = unified_response_to_anthropic(unified);
        assert_eq!(back["stop_reason"], "tool_use");
        assert_eq!(back["content"][1]["name"], "calc");
        assert_eq!(back["usage"]["input_tokens"], 10);
    }

    #[test]
    fn test_stream_chunk_mapping() {
        let chunk = json!({"choices": [{"delta": {"content": "hi"}, "index": 0}]});
        let event = unified_chunk_to_anthropic_event(chunk);
        assert_eq!(event["type"], "content_block_delta");
        assert_eq!(event["delta"]["text"], "hi");

        let done = json!({"choices": [{"delta": {}, "finish_reason": "stop"}]});
        let event = unified_chunk_to_anthropic_event(done);
        assert_eq!(event["type"], "message_delta");
        assert_eq!(event["delta"]["stop_reason"], "end_turn");
    }
}
