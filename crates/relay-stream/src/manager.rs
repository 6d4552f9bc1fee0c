use bytes::Bytes;
use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::Stream;
use relay_core::Scenario;
use serde_json::json;
use std::io;
use std::pin::Pin;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant, sleep, sleep_until, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use relay_config::StreamingConfig;

use crate::sse::{SseEvent, SseParser, heartbeat_frame, serialize_event};

/// Upstream bytes as the pump consumes them.
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Caller-supplied closure that re-issues the upstream request for a
/// mid-stream reconnect and yields a fresh byte stream.
pub type ReissueFn = Box<dyn FnMut() -> BoxFuture<'static, relay_core::Result<ByteStream>> + Send>;

/// Per-event rewrite applied in the response direction. Returning `None`
/// swallows the event.
pub type EventMapFn = Box<dyn FnMut(SseEvent) -> Option<SseEvent> + Send>;

/// Tuning for one pumped stream, resolved from config plus the request's
/// scenario.
#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub heartbeat_interval: Duration,
    pub enable_keepalive: bool,
    pub backpressure_timeout: Duration,
    pub read_timeout: Duration,
    pub enable_staggered_detection: bool,
    pub max_inter_chunk_delay: Duration,
    pub min_token_rate: f64,
    pub max_retries: u32,
}

impl StreamOptions {
    pub fn from_config(config: &StreamingConfig, scenario: Scenario) -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(config.sse_heartbeat_interval_ms),
            enable_keepalive: config.sse_enable_keepalive,
            backpressure_timeout: Duration::from_millis(config.sse_backpressure_timeout_ms),
            read_timeout: Duration::from_millis(config.read_timeout_ms(scenario)),
            enable_staggered_detection: config.sse_enable_staggered_detection,
            max_inter_chunk_delay: Duration::from_millis(config.sse_max_inter_chunk_delay_ms),
            min_token_rate: config.sse_min_token_rate,
            max_retries: config.sse_max_retries,
        }
    }
}

/// Drives one upstream stream to one downstream client.
///
/// A single writer task serializes heartbeats and data writes; the bounded
/// channel provides the backpressure signal, and a write that stays blocked
/// past `backpressure_timeout` aborts the stream. Ends on clean upstream EOF,
/// client disconnect, exhausted reconnect retries, read timeout, or
/// cancellation; the end path drops all timers and closes the sink.
pub struct StreamManager;

struct Pump {
    tx: mpsc::Sender<io::Result<Bytes>>,
    options: StreamOptions,
    /// Set when the payload needs per-event rewriting; otherwise bytes are
    /// forwarded untouched.
    map_event: Option<EventMapFn>,
    parser: SseParser,
}

enum WriteOutcome {
    Ok,
    /// Client went away or the write stayed blocked past the bound.
    Closed,
}

impl Pump {
    async fn write(&mut self, bytes: Bytes) -> WriteOutcome {
        match timeout(self.options.backpressure_timeout, self.tx.send(Ok(bytes))).await {
            Ok(Ok(())) => WriteOutcome::Ok,
            Ok(Err(_)) => {
                debug!("client disconnected, ending stream");
                WriteOutcome::Closed
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.options.backpressure_timeout.as_millis() as u64,
                    "backpressure timeout, aborting stream"
                );
                WriteOutcome::Closed
            }
        }
    }

    /// Transform one raw chunk into its outgoing form. Identity when no
    /// event map is installed.
    fn rewrite(&mut self, bytes: Bytes) -> Bytes {
        let Some(map) = self.map_event.as_mut() else {
            return bytes;
        };
        let mut out = Vec::new();
        for event in self.parser.feed(&bytes) {
            if let Some(mapped) = map(event) {
                out.extend_from_slice(&serialize_event(&mapped));
            }
        }
        Bytes::from(out)
    }

    fn rewrite_tail(&mut self) -> Option<Bytes> {
        let map = self.map_event.as_mut()?;
        let event = self.parser.finish()?;
        map(event).map(|e| serialize_event(&e))
    }

    /// Final `event: error` frame, best-effort (the client may be gone).
    async fn emit_error(&mut self, message: &str) {
        let frame = serialize_event(&SseEvent::Data {
            event: Some("error".into()),
            data: json!({"error": message}).to_string(),
        });
        let _ = timeout(self.options.backpressure_timeout, self.tx.send(Ok(frame))).await;
    }
}

impl StreamManager {
    /// Start pumping. The returned receiver is the downstream sink: wrap it
    /// into the response body. Dropping it is the client-disconnect signal.
    pub fn pump(
        upstream: ByteStream,
        mut reissue: Option<ReissueFn>,
        options: StreamOptions,
        cancel: CancellationToken,
        map_event: Option<EventMapFn>,
        on_staggered: Option<Box<dyn FnOnce() + Send>>,
    ) -> mpsc::Receiver<io::Result<Bytes>> {
        let (tx, rx) = mpsc::channel(16);
        let mut pump = Pump {
            tx,
            options: options.clone(),
            map_event,
            parser: SseParser::new(),
        };
        let mut on_staggered = on_staggered;

        tokio::spawn(async move {
            let mut upstream = upstream;
            let started = Instant::now();
            let mut last_emit = Instant::now();
            let mut last_data = Instant::now();
            let mut chunks: u64 = 0;
            let mut approx_tokens: f64 = 0.0;
            let mut reconnect_attempt: u32 = 0;
            let mut stagger_armed = false;
            // The read deadline survives heartbeat wakeups; only data arrival
            // (or a reconnect) pushes it out.
            let mut read_deadline = Instant::now() + options.read_timeout;

            loop {
                let heartbeat_at = last_emit + options.heartbeat_interval;
                let stagger_at = last_data + options.max_inter_chunk_delay;
                let stagger_watch = options.enable_staggered_detection
                    && on_staggered.is_some()
                    && stagger_armed;

                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("stream cancelled");
                        break;
                    }

                    _ = sleep_until(heartbeat_at), if options.enable_keepalive => {
                        // Heartbeats keep idle streams alive but do not touch
                        // the data-activity clock.
                        if matches!(pump.write(heartbeat_frame()).await, WriteOutcome::Closed) {
                            break;
                        }
                        last_emit = Instant::now();
                    }

                    _ = sleep_until(stagger_at), if stagger_watch => {
                        stagger_armed = false;
                        let live = started.elapsed();
                        let rate = approx_tokens / live.as_secs_f64().max(f64::MIN_POSITIVE);
                        if chunks >= 3
                            && live >= Duration::from_secs(5)
                            && rate < options.min_token_rate
                        {
                            warn!(chunks, rate, "staggered stream detected");
                            if let Some(cb) = on_staggered.take() {
                                cb();
                            }
                        }
                    }

                    read = tokio::time::timeout_at(read_deadline, upstream.next()) => {
                        match read {
                            // Read timeout.
                            Err(_) => {
                                warn!(
                                    timeout_ms = options.read_timeout.as_millis() as u64,
                                    "upstream read timeout, aborting stream"
                                );
                                pump.emit_error("upstream read timeout").await;
                                break;
                            }
                            // Clean upstream EOF.
                            Ok(None) => {
                                if let Some(tail) = pump.rewrite_tail() {
                                    let _ = pump.write(tail).await;
                                }
                                debug!(chunks, "upstream stream complete");
                                break;
                            }
                            Ok(Some(Ok(bytes))) => {
                                chunks += 1;
                                last_data = Instant::now();
                                read_deadline = last_data + options.read_timeout;
                                stagger_armed = true;
                                // Rough token estimate for rate detection.
                                approx_tokens += bytes.len() as f64 / 4.0;
                                let out = pump.rewrite(bytes);
                                if !out.is_empty()
                                    && matches!(pump.write(out).await, WriteOutcome::Closed)
                                {
                                    break;
                                }
                                last_emit = Instant::now();
                            }
                            // Upstream connection error: reconnect while the
                            // retry budget lasts.
                            Ok(Some(Err(e))) => {
                                if reconnect_attempt >= options.max_retries {
                                    warn!(error = %e, "stream failed, retries exhausted");
                                    pump.emit_error(&e.to_string()).await;
                                    break;
                                }
                                let wait = Duration::from_secs(u64::from(reconnect_attempt) + 1);
                                reconnect_attempt += 1;
                                warn!(
                                    error = %e,
                                    attempt = reconnect_attempt,
                                    wait_ms = wait.as_millis() as u64,
                                    "upstream connection error, reconnecting"
                                );
                                let Some(reissue) = reissue.as_mut() else {
                                    pump.emit_error(&e.to_string()).await;
                                    break;
                                };
                                sleep(wait).await;
                                match reissue().await {
                                    Ok(fresh) => {
                                        upstream = fresh;
                                        read_deadline = Instant::now() + options.read_timeout;
                                    }
                                    Err(reissue_err) => {
                                        warn!(error = %reissue_err, "reconnect failed");
                                        pump.emit_error(&reissue_err.to_string()).await;
                                        break;
                                    }
                                }
                            }
                        }
                    }
                }
            }
            // Sink closes when `pump.tx` drops here; pending timers die with
            // the task.
        });

        rx
    }
}
