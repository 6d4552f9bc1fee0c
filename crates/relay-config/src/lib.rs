//! # relay-config
//!
//! Configuration system for the relay proxy. Reads from `relay.toml`,
//! environment variables, and CLI overrides — in that precedence order.
//!
//! Supports hot-reload via filesystem watcher.

pub mod loader;
pub mod schema;

pub use loader::ConfigLoader;
pub use schema::{
    CircuitBreakerConfig, ConfigWarning, EndpointRateLimitingConfig, FailoverConfig,
    FailoverEntry, LoggingConfig, MetricsConfig, ModelPoolConfig, ModelSelectorConfig,
    ModelTransformerSpec, ProviderConfig, QueueConfig, RateLimitConfig, RelayConfig,
    RouterConfig, ScoreWeights, ServerConfig, StreamingConfig, TransformerSpec,
    WarningSeverity,
};
