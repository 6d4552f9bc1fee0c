use relay_core::{RequestContext, Result};
use serde_json::{Value, json};

use crate::chain::{Capabilities, TransformMessage, Transformer};

/// Gemini `generateContent` dialect. Lowers unified requests into
/// `contents`/`systemInstruction`/`generationConfig` and lifts candidate
/// responses back into the unified shape.
pub struct GeminiTransformer;

impl Transformer for GeminiTransformer {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            request_in: true,
            response_out: true,
            auth: true,
            ..Default::default()
        }
    }

    fn request_in(&self, msg: TransformMessage, _ctx: &RequestContext) -> Result<TransformMessage> {
        let mut msg = msg;
        msg.body = unified_to_gemini(msg.body);
        Ok(msg)
    }

    fn response_out(&self, body: Value, _ctx: &RequestContext) -> Result<Value> {
        Ok(gemini_response_to_unified(body))
    }

    fn response_event_out(&self, event: Value, _ctx: &RequestContext) -> Result<Value> {
        Ok(gemini_chunk_to_unified(event))
    }

    fn auth_headers(&self, _ctx: &RequestContext, api_key: &str) -> Vec<(String, String)> {
        vec![("x-goog-api-key".into(), api_key.to_string())]
    }
}

fn unified_to_gemini(body: Value) -> Value {
    let mut contents = Vec::new();
    let mut system_parts = Vec::new();

    for msg in body.get("messages").and_then(Value::as_array).into_iter().flatten() {
        let role = msg.get("role").and_then(Value::as_str).unwrap_or("user");
        let text = msg.get("content").and_then(Value::as_str).unwrap_or("");
        match role {
            "system" => system_parts.push(json!({"text": text})),
            "assistant" => contents.push(json!({"role": "model", "parts": [{"text": text}]})),
            _ => contents.push(json!({"role": "user", "parts": [{"text": text}]})),
        }
    }

    let mut generation_config = serde_json::Map::new();
    if let Some(v) = body.get("max_tokens") {
        generation_config.insert("maxOutputTokens".into(), v.clone());
    }
    if let Some(v) = body.get("temperature") {
        generation_config.insert("temperature".into(), v.clone());
    }
    if let Some(v) = body.get("stop") {
        generation_config.insert("stopSequences".into(), v.clone());
    }

    let mut out = json!({"contents": contents});
    if !system_parts.is_empty() {
        out["systemInstruction"] = json!({"parts": system_parts});
    }
    if !generation_config.is_empty() {
        out["generationConfig"] = Value::Object(generation_config);
    }
    if let Some(tools) = body.get("tools").and_then(Value::as_array) {
        let decls: Vec<Value> = tools
            .iter()
            .map(|t| {
                json!({
                    "name": t["function"].get("name").cloned().unwrap_or_default(),
                    "description": t["function"].get("description").cloned().unwrap_or_default(),
                    "parameters": t["function"].get("parameters").cloned().unwrap_or(json!({})),
                })
            })
            .collect();
        out["tools"] = json!([{"functionDeclarations": decls}]);
    }
    out
}

fn gemini_response_to_unified(body: Value) -> Value {
    let candidate = &body["candidates"][0];
    let text: String = candidate["content"]["parts"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|p| p.get("text").and_then(Value::as_str))
        .collect();

    let finish_reason = match candidate.get("finishReason").and_then(Value::as_str) {
        Some("MAX_TOKENS") => "length",
        Some("SAFETY") => "content_filter",
        _ => "stop",
    };

    json!({
        "object": "chat.completion",
        "model": body.get("modelVersion").cloned().unwrap_or_default(),
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": text},
            "finish_reason": finish_reason,
        }],
        "usage": {
            "prompt_tokens": body["usageMetadata"].get("promptTokenCount").cloned().unwrap_or(json!(0)),
            "completion_tokens": body["usageMetadata"].get("candidatesTokenCount").cloned().unwrap_or(json!(0)),
        },
    })
}

fn gemini_chunk_to_unified(event: Value) -> Value {
    let text: String = event["candidates"][0]["content"]["parts"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|p| p.get("text").and_then(Value::as_str))
        .collect();
    json!({
        "object": "chat.completion.chunk",
        "choices": [{"index": 0, "delta": {"content": text}}],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unified_to_gemini_shape() {
        let unified = json!({
            "model": "gemini-2.5-pro",
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": "hello"},
                {"role": "assistant", "content": "hi"},
            ],
            "max_tokens": 256,
            "temperature": 0.5,
        });
        let g = unified_to_gemini(unified);
        assert_eq!(g["systemInstruction"]["parts"][0]["text"], "be brief");
        assert_eq!(g["contents"][0]["role"], "user");
        assert_eq!(g["contents"][1]["role"], "model");
        assert_eq!(g["generationConfig"]["maxOutputTokens"], 256);
    }

    #[test]
    fn test_gemini_response_to_unified() {
        let resp = json!({
            "candidates": [{
                "content": {"parts": [{"text": "answer"}], "role": "model"},
                "finishReason": "STOP",
            }],
            "usageMetadata": {"promptTokenCount": 7, "candidatesTokenCount": 3},
        });
        let u = gemini_response_to_unified(resp);
        assert_eq!(u["choices"][0]["message"]["content"], "answer");
        assert_eq!(u["choices"][0]["finish_reason"], "stop");
        assert_eq!(u["usage"]["prompt_tokens"], 7);
    }
}
