//! Process-wide counter metrics, rendered in Prometheus text exposition
//! format on `/metrics/prometheus`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Global metrics registry.
#[derive(Debug, Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    /// Total HTTP requests served.
    http_requests_total: AtomicU64,
    /// Total HTTP errors (4xx + 5xx).
    http_errors_total: AtomicU64,
    /// Total chat completions proxied (JSON).
    chat_requests_total: AtomicU64,
    /// Total streamed completions proxied.
    stream_requests_total: AtomicU64,
    /// Server start time for uptime calculation.
    started_at: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                http_requests_total: AtomicU64::new(0),
                http_errors_total: AtomicU64::new(0),
                chat_requests_total: AtomicU64::new(0),
                stream_requests_total: AtomicU64::new(0),
                started_at: Instant::now(),
            }),
        }
    }

    pub fn inc_http_requests(&self) {
        self.inner
            .http_requests_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_http_errors(&self) {
        self.inner.http_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_chat_requests(&self) {
        self.inner
            .chat_requests_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_stream_requests(&self) {
        self.inner
            .stream_requests_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime_secs(&self) -> u64 {
        self.inner.started_at.elapsed().as_secs()
    }

    /// Render metrics in Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        let m = &self.inner;
        format!(
            r#"# HELP relay_uptime_seconds Time since the server started.
# TYPE relay_uptime_seconds gauge
relay_uptime_seconds {}

# HELP relay_http_requests_total Total HTTP requests served.
# TYPE relay_http_requests_total counter
relay_http_requests_total {}

# HELP relay_http_errors_total Total HTTP errors (4xx/5xx).
# TYPE relay_http_errors_total counter
relay_http_errors_total {}

# HELP relay_chat_requests_total Total chat completions proxied.
# TYPE relay_chat_requests_total counter
relay_chat_requests_total {}

# HELP relay_stream_requests_total Total streamed completions proxied.
# TYPE relay_stream_requests_total counter
relay_stream_requests_total {}
"#,
            self.uptime_secs(),
            m.http_requests_total.load(Ordering::Relaxed),
            m.http_errors_total.load(Ordering::Relaxed),
            m.chat_requests_total.load(Ordering::Relaxed),
            m.stream_requests_total.load(Ordering::Relaxed),
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_increments() {
        let m = Metrics::new();
        m.inc_http_requests();
        m.inc_http_requests();
        m.inc_chat_requests();
        let output = m.render_prometheus();
        assert!(output.contains("relay_http_requests_total 2"));
        assert!(output.contains("relay_chat_requests_total 1"));
    }

    #[test]
    fn test_prometheus_format() {
        let m = Metrics::new();
        let output = m.render_prometheus();
        assert!(output.contains("# HELP relay_uptime_seconds"));
        assert!(output.contains("# TYPE relay_http_requests_total counter"));
    }
}
