//! # relay-transform
//!
//! Payload translation between provider dialects. Provides:
//!
//! - the [`Transformer`] trait and [`TransformerChain`] with the bypass
//!   optimization for same-dialect forwarding
//! - shipped dialect transformers: `anthropic`, `openai`, `gemini`, `iflow`,
//!   and the `maxtoken` request clamp
//! - [`HeaderBuilder`] and the per-family HMAC [`Signer`]
//! - the table-driven [`ErrorClassifier`]
//!
//! The unified interchange shape is the OpenAI `chat.completions` format;
//! `request_out` lifts a client dialect into it and `request_in` lowers it
//! into a provider dialect.

pub mod anthropic;
pub mod chain;
pub mod classify;
pub mod gemini;
pub mod headers;
pub mod iflow;
pub mod maxtoken;
pub mod openai;

pub use chain::{
    Capabilities, TransformMessage, Transformer, TransformerChain, TransformerRegistry,
};
pub use classify::{ErrorClassifier, ErrorTable, RetryPolicy, TableEntry};
pub use headers::{HeaderBuilder, Signer};
