//! Per-request record tracker: append-only ring of finished requests with a
//! retention sweeper and time-window aggregation for the metrics endpoints.

use parking_lot::Mutex;
use relay_dispatch::{RequestObserver, RequestRecord};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::time::Duration;

/// Aggregated view over the retained records.
#[derive(Debug, Clone, Serialize)]
pub struct AggregateStats {
    pub total_requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    pub max_latency_ms: u64,
    pub failovers: u64,
    pub races: u64,
    pub streamed: u64,
    pub by_provider: HashMap<String, u64>,
}

/// Append-only request tracker. Records arrive from any task; a single
/// background sweeper evicts entries older than the retention window, and
/// the ring caps total size by evicting the oldest first.
pub struct RequestTracker {
    records: Mutex<VecDeque<RequestRecord>>,
    retention_ms: u64,
    max_records: usize,
}

impl RequestTracker {
    pub fn new(retention_ms: u64, max_records: usize) -> Arc<Self> {
        Arc::new(Self {
            records: Mutex::new(VecDeque::new()),
            retention_ms,
            max_records,
        })
    }

    /// The most recent records, newest first, optionally filtered by
    /// provider.
    pub fn recent(&self, limit: usize, provider: Option<&str>) -> Vec<RequestRecord> {
        let records = self.records.lock();
        records
            .iter()
            .rev()
            .filter(|r| provider.is_none_or(|p| r.provider == p))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Aggregate over records inside the time window (milliseconds back from
    /// now), optionally filtered by provider.
    pub fn aggregate(&self, time_window_ms: Option<u64>, provider: Option<&str>) -> AggregateStats {
        let cutoff = time_window_ms
            .map(|w| chrono::Utc::now().timestamp_millis() - w as i64)
            .unwrap_or(i64::MIN);

        let records = self.records.lock();
        let mut stats = AggregateStats {
            total_requests: 0,
            successes: 0,
            failures: 0,
            success_rate: 0.0,
            avg_latency_ms: 0.0,
            max_latency_ms: 0,
            failovers: 0,
            races: 0,
            streamed: 0,
            by_provider: HashMap::new(),
        };
        let mut latency_sum: u128 = 0;

        for r in records.iter() {
            if r.timestamp_ms < cutoff {
                continue;
            }
            if provider.is_some_and(|p| r.provider != p) {
                continue;
            }
            stats.total_requests += 1;
            if r.success {
                stats.successes += 1;
            } else {
                stats.failures += 1;
            }
            if r.had_failover {
                stats.failovers += 1;
            }
            if r.raced {
                stats.races += 1;
            }
            if r.streamed {
                stats.streamed += 1;
            }
            latency_sum += u128::from(r.latency_ms);
            stats.max_latency_ms = stats.max_latency_ms.max(r.latency_ms);
            *stats.by_provider.entry(r.provider.clone()).or_insert(0) += 1;
        }

        if stats.total_requests > 0 {
            stats.success_rate = stats.successes as f64 / stats.total_requests as f64;
            stats.avg_latency_ms = latency_sum as f64 / stats.total_requests as f64;
        }
        stats
    }

    fn sweep(&self) {
        let cutoff = chrono::Utc::now().timestamp_millis() - self.retention_ms as i64;
        let mut records = self.records.lock();
        while let Some(front) = records.front() {
            if front.timestamp_ms < cutoff {
                records.pop_front();
            } else {
                break;
            }
        }
    }

    /// Background sweeper evicting expired records once a minute.
    pub fn start_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                tracker.sweep();
            }
        })
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl RequestObserver for RequestTracker {
    fn record(&self, record: RequestRecord) {
        let mut records = self.records.lock();
        records.push_back(record);
        // Size cap: oldest evicted first.
        while records.len() > self.max_records {
            records.pop_front();
        }
    }
}
