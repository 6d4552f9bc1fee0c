use serde::{Deserialize, Serialize};
use std::fmt;

/// Routing alias whose concrete `provider,model` pair is chosen at request time.
pub const CUSTOM_MODEL: &str = "custom-model";

/// Unique identifier for a request, generated at ingress when absent.
pub type RequestId = String;

/// Session identifier derived from `x-session-id` / `session-id` headers.
pub type SessionId = String;

/// Conversation identifier derived from `x-conversation-id` / `conversation-id` headers.
pub type ConversationId = String;

/// Request priority. Mapped from the `x-ccr-priority` header:
/// `high` → +10, `normal` → 0, `low` → −10.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Priority(pub i32);

impl Priority {
    pub const HIGH: Priority = Priority(10);
    pub const NORMAL: Priority = Priority(0);
    pub const LOW: Priority = Priority(-10);

    /// Parse a priority header value. Unknown values map to normal.
    pub fn from_header(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "high" => Priority::HIGH,
            "low" => Priority::LOW,
            _ => Priority::NORMAL,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::NORMAL
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Request scenario, decided by the router from the request shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Scenario {
    Default,
    Background,
    Think,
    LongContext,
    WebSearch,
}

impl Scenario {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scenario::Default => "default",
            Scenario::Background => "background",
            Scenario::Think => "think",
            Scenario::LongContext => "longContext",
            Scenario::WebSearch => "webSearch",
        }
    }
}

impl Default for Scenario {
    fn default() -> Self {
        Scenario::Default
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A `provider,model` routing key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RouteTarget {
    pub provider: String,
    pub model: String,
}

impl RouteTarget {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }

    /// Parse a `provider,model` string. Returns `None` when either side is empty.
    pub fn parse(raw: &str) -> Option<Self> {
        let (provider, model) = raw.split_once(',')?;
        let provider = provider.trim();
        let model = model.trim();
        if provider.is_empty() || model.is_empty() {
            return None;
        }
        Some(Self::new(provider, model))
    }
}

impl fmt::Display for RouteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.provider, self.model)
    }
}

/// Provider dialect family. Governs header shape, session tracking, and
/// whether streamed responses still use a JSON accept header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DialectFamily {
    Anthropic,
    OpenAi,
    Gemini,
    Iflow,
}

impl DialectFamily {
    /// The iflow family requires per-session exclusivity on the provider side
    /// and `application/json` even for streamed responses.
    pub fn requires_json_accept(&self) -> bool {
        matches!(self, DialectFamily::Iflow)
    }

    /// Whether racers must get a freshly randomized session suffix so that
    /// concurrent attempts do not share a provider-side session.
    pub fn requires_exclusive_session(&self) -> bool {
        matches!(self, DialectFamily::Iflow)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DialectFamily::Anthropic => "anthropic",
            DialectFamily::OpenAi => "openai",
            DialectFamily::Gemini => "gemini",
            DialectFamily::Iflow => "iflow",
        }
    }

    /// Parse a family name from a transformer/provider kind string.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "anthropic" | "claude" => Some(DialectFamily::Anthropic),
            "openai" | "openrouter" => Some(DialectFamily::OpenAi),
            "gemini" | "google" => Some(DialectFamily::Gemini),
            "iflow" => Some(DialectFamily::Iflow),
            _ => None,
        }
    }
}

impl fmt::Display for DialectFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_from_header() {
        assert_eq!(Priority::from_header("high"), Priority(10));
        assert_eq!(Priority::from_header("LOW"), Priority(-10));
        assert_eq!(Priority::from_header("normal"), Priority(0));
        assert_eq!(Priority::from_header("whatever"), Priority(0));
    }

    #[test]
    fn test_route_target_parse() {
        let t = RouteTarget::parse("openrouter,gpt-4o").unwrap();
        assert_eq!(t.provider, "openrouter");
        assert_eq!(t.model, "gpt-4o");
        assert!(RouteTarget::parse("no-comma").is_none());
        assert!(RouteTarget::parse(",model").is_none());
        assert!(RouteTarget::parse("provider,").is_none());
    }

    #[test]
    fn test_iflow_family_flags() {
        assert!(DialectFamily::Iflow.requires_json_accept());
        assert!(DialectFamily::Iflow.requires_exclusive_session());
        assert!(!DialectFamily::Anthropic.requires_json_accept());
    }
}
