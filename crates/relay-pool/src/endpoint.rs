use dashmap::DashMap;
use parking_lot::Mutex;
use rand::RngExt;
use relay_core::{Priority, RelayError, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

use relay_config::{EndpointRateLimitingConfig, ModelPoolConfig};

use crate::slot::{QueueEntry, SlotState};

/// How a provider is picked among peers sharing one base URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionStrategy {
    RoundRobin,
    LeastLoaded,
    Random,
}

impl SelectionStrategy {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "least-loaded" => SelectionStrategy::LeastLoaded,
            "random" => SelectionStrategy::Random,
            _ => SelectionStrategy::RoundRobin,
        }
    }
}

struct EndpointMeta {
    /// Provider names sharing this base URL, in registration order.
    peers: Vec<String>,
    /// Active requests attributed per provider, for least-loaded selection.
    per_provider_active: HashMap<String, u32>,
    /// Round-robin cursor.
    cursor: usize,
}

struct EndpointEntry {
    state: Mutex<SlotState>,
    meta: Mutex<EndpointMeta>,
}

/// Await-able admission to an endpoint slot, mirroring the model-pool ticket.
pub struct EndpointTicket {
    rx: oneshot::Receiver<Result<()>>,
}

impl EndpointTicket {
    pub async fn wait(self) -> Result<()> {
        match self.rx.await {
            Ok(res) => res,
            Err(_) => Err(RelayError::Cancelled),
        }
    }
}

/// Serializable snapshot of one endpoint slot.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointStatus {
    pub base_url: String,
    pub providers: Vec<String>,
    pub active: u32,
    pub reserved_confirm_pending: u32,
    pub reserved_for_queue: u32,
    pub max_concurrent: u32,
    pub queue_length: usize,
    pub circuit_open: bool,
    pub rate_limited: bool,
    pub failure_count: u32,
    pub success_count: u64,
}

/// Capacity accounting keyed by upstream base URL, for providers that share
/// one endpoint and are rate-limited together. The reservation protocol,
/// circuit breaker, and rate-limit behavior mirror the model pool; endpoint
/// and model reservations are independent and both must be released.
pub struct EndpointGroupManager {
    endpoints: DashMap<String, Arc<EndpointEntry>>,
    config: EndpointRateLimitingConfig,
    pool_config: ModelPoolConfig,
    strategy: SelectionStrategy,
    next_queue_id: AtomicU64,
}

impl EndpointGroupManager {
    pub fn new(config: EndpointRateLimitingConfig, pool_config: ModelPoolConfig) -> Arc<Self> {
        let strategy = SelectionStrategy::parse(&config.strategy);
        Arc::new(Self {
            endpoints: DashMap::new(),
            config,
            pool_config,
            strategy,
            next_queue_id: AtomicU64::new(1),
        })
    }

    /// Whether the endpoint layer participates in admission at all.
    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    fn entry(&self, base_url: &str) -> Arc<EndpointEntry> {
        self.endpoints
            .entry(base_url.to_string())
            .or_insert_with(|| {
                Arc::new(EndpointEntry {
                    state: Mutex::new(SlotState::new(
                        self.config.max_concurrent_per_endpoint,
                        &self.pool_config.rate_limit,
                    )),
                    meta: Mutex::new(EndpointMeta {
                        peers: Vec::new(),
                        per_provider_active: HashMap::new(),
                        cursor: 0,
                    }),
                })
            })
            .clone()
    }

    /// Register a provider as a peer of its base URL.
    pub fn register_provider(&self, base_url: &str, provider: &str) {
        let entry = self.entry(base_url);
        let mut meta = entry.meta.lock();
        if !meta.peers.iter().any(|p| p == provider) {
            meta.peers.push(provider.to_string());
            meta.per_provider_active.insert(provider.to_string(), 0);
        }
    }

    pub fn remove_provider(&self, base_url: &str, provider: &str) {
        if let Some(entry) = self.endpoints.get(base_url) {
            let mut meta = entry.meta.lock();
            meta.peers.retain(|p| p != provider);
            meta.per_provider_active.remove(provider);
        }
    }

    /// Pick a provider among the endpoint's peers. A preferred provider wins
    /// when it is registered; otherwise the configured strategy decides.
    pub fn select_provider(&self, base_url: &str, preferred: Option<&str>) -> Option<String> {
        let entry = self.endpoints.get(base_url)?;
        let mut meta = entry.meta.lock();
        if meta.peers.is_empty() {
            return None;
        }
        if let Some(p) = preferred
            && meta.peers.iter().any(|peer| peer == p)
        {
            return Some(p.to_string());
        }
        let picked = match self.strategy {
            SelectionStrategy::RoundRobin => {
                let idx = meta.cursor % meta.peers.len();
                meta.cursor = meta.cursor.wrapping_add(1);
                meta.peers[idx].clone()
            }
            SelectionStrategy::LeastLoaded => meta
                .peers
                .iter()
                .min_by_key(|p| meta.per_provider_active.get(*p).copied().unwrap_or(0))
                .cloned()?,
            SelectionStrategy::Random => {
                let weights: Vec<f64> = meta
                    .peers
                    .iter()
                    .map(|p| {
                        self.config
                            .provider_weights
                            .get(p)
                            .copied()
                            .unwrap_or(1.0)
                            .max(0.0)
                    })
                    .collect();
                let total: f64 = weights.iter().sum();
                let mut roll = rand::rng().random_range(0.0..total.max(f64::MIN_POSITIVE));
                let mut idx = 0;
                for (i, w) in weights.iter().enumerate() {
                    if roll < *w {
                        idx = i;
                        break;
                    }
                    roll -= w;
                }
                meta.peers[idx].clone()
            }
        };
        Some(picked)
    }

    pub fn has_capacity(&self, base_url: &str) -> bool {
        let entry = self.entry(base_url);
        let mut state = entry.state.lock();
        let now = Instant::now();
        if self.pool_config.circuit_breaker.test_request_after_cooldown {
            state.maybe_close_circuit(now);
        }
        state.is_admissible(now)
    }

    /// Admit directly, attributing the unit to `provider`.
    pub fn try_acquire(&self, base_url: &str, provider: &str) -> bool {
        let entry = self.entry(base_url);
        let mut state = entry.state.lock();
        let now = Instant::now();
        if self.pool_config.circuit_breaker.test_request_after_cooldown {
            state.maybe_close_circuit(now);
        }
        if !state.is_admissible(now) {
            return false;
        }
        state.active += 1;
        state.last_used = Some(now);
        drop(state);
        let mut meta = entry.meta.lock();
        *meta.per_provider_active.entry(provider.to_string()).or_insert(0) += 1;
        debug!(endpoint = base_url, provider, "endpoint slot acquired");
        true
    }

    /// Take a confirm-pending reservation on the endpoint, capacity-gated only.
    pub fn reserve_slot(
        self: &Arc<Self>,
        base_url: &str,
        timeout: Duration,
        reservation_id: &str,
    ) -> bool {
        let entry = self.entry(base_url);
        let mut state = entry.state.lock();
        if !state.has_free_capacity() {
            return false;
        }
        state.reserved_confirm_pending += 1;

        let mgr = Arc::clone(self);
        let slot = Arc::clone(&entry);
        let key = base_url.to_string();
        let id = reservation_id.to_string();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let expired = {
                let mut state = slot.state.lock();
                if state.reservations.remove(&id).is_some() {
                    state.reserved_confirm_pending =
                        state.reserved_confirm_pending.saturating_sub(1);
                    true
                } else {
                    false
                }
            };
            if expired {
                warn!(endpoint = %key, reservation = %id, "endpoint reservation expired");
                mgr.process_queue(&key);
            }
        });
        state
            .reservations
            .insert(reservation_id.to_string(), timer.abort_handle());
        true
    }

    pub fn confirm_slot(&self, base_url: &str, reservation_id: &str, provider: &str) -> bool {
        let entry = self.entry(base_url);
        let mut state = entry.state.lock();
        let Some(timer) = state.reservations.remove(reservation_id) else {
            return false;
        };
        timer.abort();
        state.reserved_confirm_pending = state.reserved_confirm_pending.saturating_sub(1);
        state.active += 1;
        state.last_used = Some(Instant::now());
        drop(state);
        let mut meta = entry.meta.lock();
        *meta.per_provider_active.entry(provider.to_string()).or_insert(0) += 1;
        true
    }

    pub fn release_reservation(self: &Arc<Self>, base_url: &str, reservation_id: &str) {
        let entry = self.entry(base_url);
        {
            let mut state = entry.state.lock();
            let Some(timer) = state.reservations.remove(reservation_id) else {
                return;
            };
            timer.abort();
            state.reserved_confirm_pending = state.reserved_confirm_pending.saturating_sub(1);
        }
        self.process_queue(base_url);
    }

    /// Release an active unit with health attribution.
    pub fn release_slot(self: &Arc<Self>, base_url: &str, provider: &str, success: bool) {
        let entry = self.entry(base_url);
        {
            let mut state = entry.state.lock();
            state.active = state.active.saturating_sub(1);
            if success {
                state.mark_success(&self.pool_config.rate_limit);
            } else if state.mark_failure(&self.pool_config.circuit_breaker, Instant::now()) {
                warn!(endpoint = base_url, "endpoint circuit breaker open");
            }
        }
        {
            let mut meta = entry.meta.lock();
            if let Some(n) = meta.per_provider_active.get_mut(provider) {
                *n = n.saturating_sub(1);
            }
        }
        self.process_queue(base_url);
    }

    /// Release without blame (cancellation).
    pub fn release_slot_uncounted(self: &Arc<Self>, base_url: &str, provider: &str) {
        let entry = self.entry(base_url);
        {
            let mut state = entry.state.lock();
            state.active = state.active.saturating_sub(1);
        }
        {
            let mut meta = entry.meta.lock();
            if let Some(n) = meta.per_provider_active.get_mut(provider) {
                *n = n.saturating_sub(1);
            }
        }
        self.process_queue(base_url);
    }

    pub fn mark_rate_limit(&self, base_url: &str, retry_after: Option<Duration>) {
        let entry = self.entry(base_url);
        let mut state = entry.state.lock();
        let delay =
            state.mark_rate_limit(&self.pool_config.rate_limit, retry_after, Instant::now());
        warn!(
            endpoint = base_url,
            cooldown_ms = delay.as_millis() as u64,
            "endpoint rate-limited"
        );
    }

    /// Join the endpoint's wait queue. Resolving `Ok` means the request holds
    /// an active unit attributed to `provider`.
    pub fn enqueue(
        self: &Arc<Self>,
        base_url: &str,
        provider: &str,
        priority: Priority,
    ) -> Result<EndpointTicket> {
        let entry = self.entry(base_url);
        let mut state = entry.state.lock();
        if state.queue.len() >= self.pool_config.queue.max_queue_size {
            return Err(RelayError::QueueFull {
                provider: provider.to_string(),
                model: base_url.to_string(),
            });
        }
        let id = self.next_queue_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        let mgr = Arc::clone(self);
        let key = base_url.to_string();
        let prov = provider.to_string();
        let timeout = Duration::from_millis(self.pool_config.queue.queue_timeout_ms);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let timed_out = {
                let entry = mgr.entry(&key);
                let mut state = entry.state.lock();
                state.remove_queued(id)
            };
            if let Some(victim) = timed_out {
                let _ = victim.responder.send(Err(RelayError::QueueTimeout {
                    provider: prov.clone(),
                    model: key.clone(),
                }));
                mgr.process_queue(&key);
            }
        });

        state.reserved_for_queue += 1;
        state.insert_queued(QueueEntry {
            id,
            priority,
            enqueued_at: Instant::now(),
            responder: tx,
            deadline_timer: timer.abort_handle(),
        });
        Ok(EndpointTicket { rx })
    }

    /// Attribute a queue admission to a provider. Called by the dispatcher
    /// after an [`EndpointTicket`] resolves, pairing the eventual release.
    pub fn attribute_admission(&self, base_url: &str, provider: &str) {
        let entry = self.entry(base_url);
        let mut meta = entry.meta.lock();
        *meta
            .per_provider_active
            .entry(provider.to_string())
            .or_insert(0) += 1;
    }

    pub fn process_queue(self: &Arc<Self>, base_url: &str) {
        let entry = self.entry(base_url);
        let mut state = entry.state.lock();
        while state.has_free_capacity() && !state.queue.is_empty() {
            let head = state.queue.remove(0);
            state.reserved_for_queue = state.reserved_for_queue.saturating_sub(1);
            state.active += 1;
            state.last_used = Some(Instant::now());
            head.deadline_timer.abort();
            if head.responder.send(Ok(())).is_err() {
                state.active = state.active.saturating_sub(1);
            }
        }
    }

    pub fn reset_circuit_breakers(&self) -> usize {
        let mut reset = 0;
        for kv in self.endpoints.iter() {
            let mut state = kv.value().state.lock();
            if state.circuit_open {
                reset += 1;
            }
            state.circuit_open = false;
            state.circuit_open_until = None;
            state.failure_count = 0;
        }
        reset
    }

    pub fn snapshot(&self) -> Vec<EndpointStatus> {
        let now = Instant::now();
        self.endpoints
            .iter()
            .map(|kv| {
                let state = kv.value().state.lock();
                let meta = kv.value().meta.lock();
                EndpointStatus {
                    base_url: kv.key().clone(),
                    providers: meta.peers.clone(),
                    active: state.active,
                    reserved_confirm_pending: state.reserved_confirm_pending,
                    reserved_for_queue: state.reserved_for_queue,
                    max_concurrent: state.max_concurrent,
                    queue_length: state.queue.len(),
                    circuit_open: state.circuit_open,
                    rate_limited: state.is_rate_limited(now),
                    failure_count: state.failure_count,
                    success_count: state.success_count,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(strategy: &str) -> Arc<EndpointGroupManager> {
        let mut config = EndpointRateLimitingConfig::default();
        config.enabled = true;
        config.strategy = strategy.into();
        config.max_concurrent_per_endpoint = 2;
        EndpointGroupManager::new(config, ModelPoolConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_robin_selection() {
        let mgr = manager("round-robin");
        mgr.register_provider("https://api.example.com", "a");
        mgr.register_provider("https://api.example.com", "b");

        let first = mgr.select_provider("https://api.example.com", None).unwrap();
        let second = mgr.select_provider("https://api.example.com", None).unwrap();
        let third = mgr.select_provider("https://api.example.com", None).unwrap();
        assert_ne!(first, second);
        assert_eq!(first, third);
    }

    #[tokio::test(start_paused = true)]
    async fn test_preferred_provider_wins() {
        let mgr = manager("round-robin");
        mgr.register_provider("https://api.example.com", "a");
        mgr.register_provider("https://api.example.com", "b");
        for _ in 0..4 {
            assert_eq!(
                mgr.select_provider("https://api.example.com", Some("b"))
                    .unwrap(),
                "b"
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_least_loaded_selection() {
        let mgr = manager("least-loaded");
        mgr.register_provider("https://api.example.com", "a");
        mgr.register_provider("https://api.example.com", "b");

        assert!(mgr.try_acquire("https://api.example.com", "a"));
        let picked = mgr.select_provider("https://api.example.com", None).unwrap();
        assert_eq!(picked, "b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_endpoint_capacity_shared_across_peers() {
        let mgr = manager("round-robin");
        mgr.register_provider("https://api.example.com", "a");
        mgr.register_provider("https://api.example.com", "b");

        assert!(mgr.try_acquire("https://api.example.com", "a"));
        assert!(mgr.try_acquire("https://api.example.com", "b"));
        // Peers share the endpoint cap of 2.
        assert!(!mgr.try_acquire("https://api.example.com", "a"));

        mgr.release_slot("https://api.example.com", "a", true);
        assert!(mgr.try_acquire("https://api.example.com", "a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_endpoint_reservation_protocol() {
        let mgr = manager("round-robin");
        mgr.register_provider("https://api.example.com", "a");

        assert!(mgr.reserve_slot("https://api.example.com", Duration::from_secs(5), "r1"));
        assert!(mgr.confirm_slot("https://api.example.com", "r1", "a"));
        let status = mgr.snapshot();
        assert_eq!(status[0].active, 1);
        assert_eq!(status[0].reserved_confirm_pending, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_selection_on_unknown_endpoint() {
        let mgr = manager("round-robin");
        assert!(mgr.select_provider("https://nowhere.example.com", None).is_none());
    }
}
