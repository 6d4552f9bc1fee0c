use relay_core::{RouteTarget, Scenario};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Root configuration, maps to `relay.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub model_pool: ModelPoolConfig,
    pub model_selector: ModelSelectorConfig,
    pub endpoint_rate_limiting: EndpointRateLimitingConfig,
    pub router: RouterConfig,
    pub failover: FailoverConfig,
    pub streaming: StreamingConfig,
    pub metrics: MetricsConfig,
    pub providers: Vec<ProviderConfig>,
}

// ── Server ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address, e.g. "127.0.0.1:3456".
    pub listen: String,
    /// Enable permissive CORS (needed for browser clients).
    pub cors: bool,
    /// Optional bearer token required on admin routes.
    pub api_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:3456".into(),
            cors: true,
            api_key: None,
        }
    }
}

// ── Logging ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter (e.g. "info", "relay_pool=debug,info").
    pub level: String,
    /// "text" or "json".
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

// ── Model pool ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelPoolConfig {
    /// Capacity per (provider, model) slot.
    pub max_concurrent_per_model: u32,
    /// Prefer admissible alternatives over queueing when the primary is unhealthy.
    pub priority_failover: bool,
    pub circuit_breaker: CircuitBreakerConfig,
    pub rate_limit: RateLimitConfig,
    pub queue: QueueConfig,
}

impl Default for ModelPoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent_per_model: 5,
            priority_failover: true,
            circuit_breaker: CircuitBreakerConfig::default(),
            rate_limit: RateLimitConfig::default(),
            queue: QueueConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// How long the circuit stays open, in milliseconds.
    pub cooldown_period_ms: u64,
    /// Allow a single probe request once the cooldown expires.
    pub test_request_after_cooldown: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_period_ms: 60_000,
            test_request_after_cooldown: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Cooldown used when the upstream gives no Retry-After, in milliseconds.
    pub default_retry_after_ms: u64,
    /// Honor upstream Retry-After headers and adopt them as the new base delay.
    pub respect_retry_after_header: bool,
    /// Exponential backoff multiplier applied per consecutive rate-limit.
    pub backoff_multiplier: f64,
    /// Backoff ceiling, in milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default_retry_after_ms: 60_000,
            respect_retry_after_header: true,
            backoff_multiplier: 1.5,
            max_backoff_ms: 300_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum waiters per slot before "Queue full".
    pub max_queue_size: usize,
    /// Deadline for a queued request, in milliseconds.
    pub queue_timeout_ms: u64,
    /// Number of distinct priority levels surfaced in queue stats.
    pub priority_levels: u32,
    /// Skip rate-limited slots when draining the queue to alternatives.
    pub skip_rate_limited: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 100,
            queue_timeout_ms: 30_000,
            priority_levels: 3,
            skip_rate_limited: true,
        }
    }
}

// ── Model selector ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSelectorConfig {
    /// Enable racing the primary against alternatives when its score is low.
    pub enable_proactive_failover: bool,
    pub enable_health_based_routing: bool,
    pub enable_performance_based_routing: bool,
    pub prefer_healthy_models: bool,
    /// How many alternatives join a race.
    pub max_parallel_alternatives: usize,
    pub score_weights: ScoreWeights,
}

impl Default for ModelSelectorConfig {
    fn default() -> Self {
        Self {
            enable_proactive_failover: false,
            enable_health_based_routing: true,
            enable_performance_based_routing: true,
            prefer_healthy_models: true,
            max_parallel_alternatives: 2,
            score_weights: ScoreWeights::default(),
        }
    }
}

/// Candidate score weights. Should sum to 1.0.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub capacity: f64,
    pub health: f64,
    pub performance: f64,
    pub priority: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            capacity: 0.4,
            health: 0.3,
            performance: 0.2,
            priority: 0.1,
        }
    }
}

impl ScoreWeights {
    pub fn sum(&self) -> f64 {
        self.capacity + self.health + self.performance + self.priority
    }
}

// ── Endpoint rate limiting ─────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointRateLimitingConfig {
    /// When false, the model-pool layer is authoritative and endpoint slots
    /// are never consulted.
    pub enabled: bool,
    pub max_concurrent_per_endpoint: u32,
    /// "round-robin" | "least-loaded" | "random".
    pub strategy: String,
    /// Optional weights for the random strategy, keyed by provider name.
    pub provider_weights: HashMap<String, f64>,
}

impl Default for EndpointRateLimitingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_concurrent_per_endpoint: 10,
            strategy: "round-robin".into(),
            provider_weights: HashMap::new(),
        }
    }
}

// ── Router ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Routing key for the default scenario, "provider,model".
    pub default: String,
    pub background: Option<String>,
    pub think: Option<String>,
    pub long_context: Option<String>,
    /// Estimated-token threshold above which a request is long-context.
    pub long_context_threshold: usize,
    pub web_search: Option<String>,
    pub image: Option<String>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            default: String::new(),
            background: None,
            think: None,
            long_context: None,
            long_context_threshold: 60_000,
            web_search: None,
            image: None,
        }
    }
}

impl RouterConfig {
    /// The configured routing key for a scenario, falling back to `default`.
    pub fn key_for(&self, scenario: Scenario) -> &str {
        let specific = match scenario {
            Scenario::Default => None,
            Scenario::Background => self.background.as_deref(),
            Scenario::Think => self.think.as_deref(),
            Scenario::LongContext => self.long_context.as_deref(),
            Scenario::WebSearch => self.web_search.as_deref(),
        };
        specific.unwrap_or(&self.default)
    }
}

// ── Failover ───────────────────────────────────────────────────

/// A failover alternative: either a bare provider name (inherits the failing
/// model) or an explicit `{provider, model}` pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FailoverEntry {
    Provider(String),
    Target { provider: String, model: String },
}

impl FailoverEntry {
    /// Resolve against the model being failed over from.
    pub fn resolve(&self, inherited_model: &str) -> RouteTarget {
        match self {
            FailoverEntry::Provider(p) => RouteTarget::new(p.clone(), inherited_model),
            FailoverEntry::Target { provider, model } => {
                RouteTarget::new(provider.clone(), model.clone())
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    /// Alternatives applied to every provider.
    pub global: Vec<FailoverEntry>,
    /// Per-provider alternatives, keyed by provider name. Checked first.
    #[serde(flatten)]
    pub per_provider: HashMap<String, Vec<FailoverEntry>>,
}

impl FailoverConfig {
    /// Alternatives for a failing target: per-provider entries first, then
    /// global ones, deduplicated, never including the failing target itself.
    pub fn alternatives_for(&self, target: &RouteTarget) -> Vec<RouteTarget> {
        let mut out: Vec<RouteTarget> = Vec::new();
        let entries = self
            .per_provider
            .get(&target.provider)
            .into_iter()
            .flatten()
            .chain(self.global.iter());
        for entry in entries {
            let alt = entry.resolve(&target.model);
            if alt != *target && !out.contains(&alt) {
                out.push(alt);
            }
        }
        out
    }
}

// ── Streaming ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Comment-line heartbeat interval while the stream is silent.
    pub sse_heartbeat_interval_ms: u64,
    pub sse_enable_keepalive: bool,
    /// How long a blocked downstream write may stall before the stream aborts.
    pub sse_backpressure_timeout_ms: u64,
    pub sse_enable_staggered_detection: bool,
    pub sse_max_inter_chunk_delay_ms: u64,
    /// Tokens per second below which a staggered stream is suspected.
    pub sse_min_token_rate: f64,
    /// Explicit read timeout override. When absent, the scenario default applies.
    pub sse_read_timeout_ms: Option<u64>,
    /// Mid-stream reconnect budget.
    pub sse_max_retries: u32,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            sse_heartbeat_interval_ms: 30_000,
            sse_enable_keepalive: true,
            sse_backpressure_timeout_ms: 60_000,
            sse_enable_staggered_detection: false,
            sse_max_inter_chunk_delay_ms: 10_000,
            sse_min_token_rate: 5.0,
            sse_read_timeout_ms: None,
            sse_max_retries: 2,
        }
    }
}

impl StreamingConfig {
    /// Read timeout for a scenario: think gets the longest window, background
    /// and web-search the shortest.
    pub fn read_timeout_ms(&self, scenario: Scenario) -> u64 {
        if let Some(ms) = self.sse_read_timeout_ms {
            return ms;
        }
        match scenario {
            Scenario::Think => 300_000,
            Scenario::Default | Scenario::LongContext => 180_000,
            Scenario::Background | Scenario::WebSearch => 120_000,
        }
    }
}

// ── Metrics ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// How long request records are retained, in milliseconds.
    pub retention_ms: u64,
    /// Hard cap on retained records; oldest evicted first.
    pub max_records: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            retention_ms: 3_600_000,
            max_records: 10_000,
        }
    }
}

// ── Providers ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub name: String,
    /// Dialect family: "anthropic" | "openai" | "gemini" | "iflow".
    pub kind: String,
    pub base_url: String,
    /// Rotated round-robin across requests.
    pub api_keys: Vec<String>,
    pub models: Vec<String>,
    /// Extra headers sent verbatim, after dedup.
    pub headers: HashMap<String, String>,
    pub transformer: Option<TransformerSpec>,
    pub enabled: bool,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            kind: "openai".into(),
            base_url: String::new(),
            api_keys: Vec::new(),
            models: Vec::new(),
            headers: HashMap::new(),
            transformer: None,
            enabled: true,
        }
    }
}

/// Transformer pipeline spec: a provider-level chain plus optional per-model
/// chains applied after it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformerSpec {
    #[serde(rename = "use")]
    pub chain: Vec<String>,
    /// Per-model chains keyed by model name.
    pub models: HashMap<String, ModelTransformerSpec>,
    /// Per-transformer options keyed by transformer name (shallow-merged
    /// into the request config, later entries win).
    pub options: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelTransformerSpec {
    #[serde(rename = "use")]
    pub chain: Vec<String>,
}

// ── Validation ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct ConfigWarning {
    pub field: String,
    pub message: String,
    pub severity: WarningSeverity,
    pub hint: Option<String>,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)?;
        if let Some(hint) = &self.hint {
            write!(f, " ({hint})")?;
        }
        Ok(())
    }
}

impl RelayConfig {
    /// Validate the config. Errors make the result Err; warnings come back
    /// for logging.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, String> {
        let mut warnings = Vec::new();

        // ── Router ───
        if self.router.default.is_empty() {
            warnings.push(ConfigWarning {
                field: "router.default".into(),
                message: "no default route configured".into(),
                severity: WarningSeverity::Error,
                hint: Some("Set to e.g. 'openrouter,anthropic/claude-sonnet-4'".into()),
            });
        } else if RouteTarget::parse(&self.router.default).is_none() {
            warnings.push(ConfigWarning {
                field: "router.default".into(),
                message: format!(
                    "'{}' is not in 'provider,model' format",
                    self.router.default
                ),
                severity: WarningSeverity::Error,
                hint: None,
            });
        }
        for (field, value) in [
            ("router.background", &self.router.background),
            ("router.think", &self.router.think),
            ("router.long_context", &self.router.long_context),
            ("router.web_search", &self.router.web_search),
            ("router.image", &self.router.image),
        ] {
            if let Some(v) = value
                && RouteTarget::parse(v).is_none()
            {
                warnings.push(ConfigWarning {
                    field: field.into(),
                    message: format!("'{v}' is not in 'provider,model' format"),
                    severity: WarningSeverity::Error,
                    hint: None,
                });
            }
        }

        // ── Pool ───
        if self.model_pool.max_concurrent_per_model == 0 {
            warnings.push(ConfigWarning {
                field: "model_pool.max_concurrent_per_model".into(),
                message: "capacity of 0 admits no requests".into(),
                severity: WarningSeverity::Error,
                hint: Some("Set to e.g. 5".into()),
            });
        }
        if self.model_pool.rate_limit.backoff_multiplier < 1.0 {
            warnings.push(ConfigWarning {
                field: "model_pool.rate_limit.backoff_multiplier".into(),
                message: "multiplier below 1.0 shrinks the cooldown".into(),
                severity: WarningSeverity::Warning,
                hint: None,
            });
        }
        if self.model_pool.queue.priority_levels == 0 {
            warnings.push(ConfigWarning {
                field: "model_pool.queue.priority_levels".into(),
                message: "priority_levels of 0 collapses queue ordering to FIFO".into(),
                severity: WarningSeverity::Warning,
                hint: Some("Use 3 for high/normal/low".into()),
            });
        }

        // ── Selector weights ───
        let sum = self.model_selector.score_weights.sum();
        if (sum - 1.0).abs() > 0.01 {
            warnings.push(ConfigWarning {
                field: "model_selector.score_weights".into(),
                message: format!("weights sum to {sum:.2}, expected 1.0"),
                severity: WarningSeverity::Warning,
                hint: None,
            });
        }

        // ── Endpoint strategy ───
        let strategy = self.endpoint_rate_limiting.strategy.as_str();
        if !matches!(strategy, "round-robin" | "least-loaded" | "random") {
            warnings.push(ConfigWarning {
                field: "endpoint_rate_limiting.strategy".into(),
                message: format!("unknown strategy '{strategy}'"),
                severity: WarningSeverity::Error,
                hint: Some("Use 'round-robin', 'least-loaded', or 'random'".into()),
            });
        }

        // ── Providers ───
        for p in &self.providers {
            if p.name.is_empty() {
                warnings.push(ConfigWarning {
                    field: "providers.name".into(),
                    message: "provider with empty name".into(),
                    severity: WarningSeverity::Error,
                    hint: None,
                });
                continue;
            }
            if p.base_url.is_empty() {
                warnings.push(ConfigWarning {
                    field: format!("providers.{}.base_url", p.name),
                    message: "base_url is empty".into(),
                    severity: WarningSeverity::Error,
                    hint: None,
                });
            }
            if p.api_keys.is_empty() {
                warnings.push(ConfigWarning {
                    field: format!("providers.{}.api_keys", p.name),
                    message: "no API keys configured".into(),
                    severity: WarningSeverity::Warning,
                    hint: Some("Requests to this provider will be unauthenticated".into()),
                });
            }
        }

        let errors: Vec<_> = warnings
            .iter()
            .filter(|w| w.severity == WarningSeverity::Error)
            .collect();
        if !errors.is_empty() {
            let joined = errors
                .iter()
                .map(|w| w.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(joined);
        }
        Ok(warnings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_constants() {
        let c = RelayConfig::default();
        assert_eq!(c.model_pool.circuit_breaker.failure_threshold, 5);
        assert_eq!(c.model_pool.circuit_breaker.cooldown_period_ms, 60_000);
        assert_eq!(c.model_pool.rate_limit.backoff_multiplier, 1.5);
        assert_eq!(c.model_pool.rate_limit.max_backoff_ms, 300_000);
        assert_eq!(c.streaming.sse_heartbeat_interval_ms, 30_000);
        assert_eq!(c.streaming.sse_max_retries, 2);
    }

    #[test]
    fn test_read_timeout_scenario_scaling() {
        let s = StreamingConfig::default();
        assert_eq!(s.read_timeout_ms(Scenario::Think), 300_000);
        assert_eq!(s.read_timeout_ms(Scenario::Default), 180_000);
        assert_eq!(s.read_timeout_ms(Scenario::LongContext), 180_000);
        assert_eq!(s.read_timeout_ms(Scenario::Background), 120_000);
        assert_eq!(s.read_timeout_ms(Scenario::WebSearch), 120_000);

        let s = StreamingConfig {
            sse_read_timeout_ms: Some(42),
            ..Default::default()
        };
        assert_eq!(s.read_timeout_ms(Scenario::Think), 42);
    }

    #[test]
    fn test_failover_entry_forms() {
        let toml_src = r#"
            [failover]
            global = ["openrouter", { provider = "gemini", model = "gemini-2.5-pro" }]
        "#;
        let c: RelayConfig = toml::from_str(toml_src).unwrap();
        let alts = c
            .failover
            .alternatives_for(&RouteTarget::new("anthropic", "claude-sonnet-4"));
        assert_eq!(alts.len(), 2);
        assert_eq!(alts[0], RouteTarget::new("openrouter", "claude-sonnet-4"));
        assert_eq!(alts[1], RouteTarget::new("gemini", "gemini-2.5-pro"));
    }

    #[test]
    fn test_failover_per_provider_precedes_global() {
        let toml_src = r#"
            [failover]
            global = ["glob"]
            anthropic = ["first"]
        "#;
        let c: RelayConfig = toml::from_str(toml_src).unwrap();
        let alts = c
            .failover
            .alternatives_for(&RouteTarget::new("anthropic", "m"));
        assert_eq!(alts[0].provider, "first");
        assert_eq!(alts[1].provider, "glob");
    }

    #[test]
    fn test_failover_excludes_self() {
        let toml_src = r#"
            [failover]
            global = ["anthropic"]
        "#;
        let c: RelayConfig = toml::from_str(toml_src).unwrap();
        let alts = c
            .failover
            .alternatives_for(&RouteTarget::new("anthropic", "m"));
        assert!(alts.is_empty());
    }

    #[test]
    fn test_validate_rejects_bad_route() {
        let c = RelayConfig {
            router: RouterConfig {
                default: "not-a-pair".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_validate_warns_on_weight_sum() {
        let mut c = RelayConfig::default();
        c.router.default = "p,m".into();
        c.model_selector.score_weights.capacity = 0.9;
        let warnings = c.validate().unwrap();
        assert!(
            warnings
                .iter()
                .any(|w| w.field == "model_selector.score_weights")
        );
    }

    #[test]
    fn test_transformer_spec_use_key() {
        let toml_src = r#"
            name = "openrouter"
            kind = "openai"
            base_url = "https://openrouter.ai/api/v1"

            [transformer]
            use = ["openrouter"]
            [transformer.models."gpt-4o"]
            use = ["maxtoken"]
        "#;
        let p: ProviderConfig = toml::from_str(toml_src).unwrap();
        let t = p.transformer.unwrap();
        assert_eq!(t.chain, vec!["openrouter"]);
        assert_eq!(t.models["gpt-4o"].chain, vec!["maxtoken"]);
    }
}
