//! # relay-core
//!
//! Core types, request context, and error taxonomy for the relay proxy.
//! This crate defines the shared vocabulary used by every other crate in the workspace.

pub mod context;
pub mod error;
pub mod types;

pub use context::{RequestContext, StageLog};
pub use error::{ErrorCode, ProviderError, RelayError, Result};
pub use types::*;
