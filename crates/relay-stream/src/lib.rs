//! # relay-stream
//!
//! Server-sent-event plumbing for proxied streams. Provides:
//!
//! - an incremental SSE parser and serializer ([`sse`])
//! - the [`StreamManager`] pump: heartbeat comments, bounded backpressure,
//!   scenario-scaled read timeouts, client-disconnect propagation, staggered
//!   stream detection, and mid-stream reconnect

pub mod manager;
pub mod sse;

pub use manager::{ByteStream, EventMapFn, ReissueFn, StreamManager, StreamOptions};
pub use sse::{SseEvent, SseParser, heartbeat_frame, serialize_event};
