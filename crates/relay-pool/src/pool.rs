use dashmap::DashMap;
use parking_lot::Mutex;
use relay_core::{Priority, RelayError, Result, RouteTarget};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;
use tokio::time::{Duration, Instant};
use tracing::{debug, error, warn};

use relay_config::ModelPoolConfig;

use crate::slot::{QueueEntry, SlotState, SlotStatus};

/// Identifier for a confirm-pending reservation, chosen by the caller.
pub type ReservationId = String;

struct SlotEntry {
    state: Mutex<SlotState>,
}

/// A successfully enqueued request. Await [`QueueTicket::wait`] for admission;
/// once it resolves `Ok`, the request holds an active unit on the slot and the
/// caller must eventually `release_slot`.
#[derive(Debug)]
pub struct QueueTicket {
    rx: oneshot::Receiver<Result<()>>,
}

impl QueueTicket {
    pub async fn wait(self) -> Result<()> {
        match self.rx.await {
            Ok(res) => res,
            // Sender dropped without resolution: the pool is shutting down.
            Err(_) => Err(RelayError::Cancelled),
        }
    }
}

/// Depth snapshot of one slot's queue.
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueueStatus {
    pub provider: String,
    pub model: String,
    pub depth: usize,
    pub max_queue_size: usize,
    /// Milliseconds the current head has been waiting, if any.
    pub head_waiting_ms: Option<u64>,
}

/// Per-`(provider, model)` capacity pool.
///
/// Slots are created on first reference and never destroyed. Counters move
/// only under the slot lock; every timer cancellation is paired with the
/// counter update it guards.
pub struct ModelPool {
    slots: DashMap<RouteTarget, Arc<SlotEntry>>,
    config: ModelPoolConfig,
    next_queue_id: AtomicU64,
}

impl ModelPool {
    pub fn new(config: ModelPoolConfig) -> Arc<Self> {
        Arc::new(Self {
            slots: DashMap::new(),
            config,
            next_queue_id: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &ModelPoolConfig {
        &self.config
    }

    fn entry(&self, target: &RouteTarget) -> Arc<SlotEntry> {
        self.slots
            .entry(target.clone())
            .or_insert_with(|| {
                Arc::new(SlotEntry {
                    state: Mutex::new(SlotState::new(
                        self.config.max_concurrent_per_model,
                        &self.config.rate_limit,
                    )),
                })
            })
            .clone()
    }

    /// Whether the slot can admit a request right now. Clears an expired
    /// circuit as a side effect (the implicit half-open probe).
    pub fn has_capacity(&self, target: &RouteTarget) -> bool {
        let entry = self.entry(target);
        let mut state = entry.state.lock();
        let now = Instant::now();
        if self.config.circuit_breaker.test_request_after_cooldown
            && state.maybe_close_circuit(now)
        {
            debug!(slot = %target, "circuit cooldown expired, admitting probe");
        }
        state.is_admissible(now)
    }

    /// Admit a request directly: one unit of `active` if the slot is
    /// admissible. The caller must pair this with `release_slot`.
    pub fn try_acquire(&self, target: &RouteTarget) -> bool {
        let entry = self.entry(target);
        let mut state = entry.state.lock();
        let now = Instant::now();
        if self.config.circuit_breaker.test_request_after_cooldown {
            state.maybe_close_circuit(now);
        }
        if !state.is_admissible(now) {
            return false;
        }
        state.active += 1;
        state.last_used = Some(now);
        debug!(slot = %target, active = state.active, "slot acquired");
        true
    }

    /// Take a confirm-pending reservation. Checks only free capacity; health
    /// gating (rate-limit, circuit) is the dispatcher's responsibility, which
    /// keeps queue-admission reservations orthogonal from health state.
    ///
    /// The reservation expires after `timeout` unless confirmed or released.
    pub fn reserve_slot(
        self: &Arc<Self>,
        target: &RouteTarget,
        timeout: Duration,
        reservation_id: &str,
    ) -> bool {
        let entry = self.entry(target);
        let mut state = entry.state.lock();
        if !state.has_free_capacity() {
            return false;
        }
        state.reserved_confirm_pending += 1;

        let pool = Arc::clone(self);
        let slot = Arc::clone(&entry);
        let key = target.clone();
        let id = reservation_id.to_string();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let expired = {
                let mut state = slot.state.lock();
                // Confirmed or released reservations are gone from the table;
                // only a live entry surrenders its unit here.
                if state.reservations.remove(&id).is_some() {
                    state.reserved_confirm_pending =
                        state.reserved_confirm_pending.saturating_sub(1);
                    true
                } else {
                    false
                }
            };
            if expired {
                warn!(slot = %key, reservation = %id, "reservation expired unconfirmed");
                pool.process_queue(&key);
            }
        });
        state
            .reservations
            .insert(reservation_id.to_string(), timer.abort_handle());
        debug!(slot = %target, reservation = reservation_id, "slot reserved");
        true
    }

    /// Promote a reservation to an active request. Returns false when the
    /// reservation already expired.
    pub fn confirm_slot(&self, target: &RouteTarget, reservation_id: &str) -> bool {
        let entry = self.entry(target);
        let mut state = entry.state.lock();
        let Some(timer) = state.reservations.remove(reservation_id) else {
            return false;
        };
        timer.abort();
        state.reserved_confirm_pending = state.reserved_confirm_pending.saturating_sub(1);
        state.active += 1;
        state.last_used = Some(Instant::now());
        debug!(slot = %target, reservation = reservation_id, "reservation confirmed");
        true
    }

    /// Give back an unconfirmed reservation.
    pub fn release_reservation(self: &Arc<Self>, target: &RouteTarget, reservation_id: &str) {
        let entry = self.entry(target);
        {
            let mut state = entry.state.lock();
            let Some(timer) = state.reservations.remove(reservation_id) else {
                return;
            };
            timer.abort();
            state.reserved_confirm_pending = state.reserved_confirm_pending.saturating_sub(1);
        }
        debug!(slot = %target, reservation = reservation_id, "reservation released");
        self.process_queue(target);
    }

    /// Release an active unit, attributing the outcome to the slot's health.
    pub fn release_slot(self: &Arc<Self>, target: &RouteTarget, success: bool) {
        let entry = self.entry(target);
        {
            let mut state = entry.state.lock();
            state.active = state.active.saturating_sub(1);
            if success {
                state.mark_success(&self.config.rate_limit);
            } else if state.mark_failure(&self.config.circuit_breaker, Instant::now()) {
                warn!(
                    slot = %target,
                    failures = state.failure_count,
                    cooldown_ms = self.config.circuit_breaker.cooldown_period_ms,
                    "circuit breaker open"
                );
            }
        }
        self.process_queue(target);
    }

    /// Release an active unit without health attribution. Used when a request
    /// is cancelled (e.g. a race loser): cancellation is not the slot's fault.
    pub fn release_slot_uncounted(self: &Arc<Self>, target: &RouteTarget) {
        let entry = self.entry(target);
        {
            let mut state = entry.state.lock();
            state.active = state.active.saturating_sub(1);
        }
        self.process_queue(target);
    }

    /// Record a success without an active unit (used by tests and by callers
    /// that track their own admission).
    pub fn mark_success(&self, target: &RouteTarget) {
        let entry = self.entry(target);
        entry.state.lock().mark_success(&self.config.rate_limit);
    }

    /// Record a failure without an active unit.
    pub fn mark_failure(&self, target: &RouteTarget) {
        let entry = self.entry(target);
        let mut state = entry.state.lock();
        if state.mark_failure(&self.config.circuit_breaker, Instant::now()) {
            warn!(slot = %target, "circuit breaker open");
        }
    }

    /// Put the slot into rate-limit cooldown.
    pub fn mark_rate_limit(&self, target: &RouteTarget, retry_after: Option<Duration>) {
        let entry = self.entry(target);
        let mut state = entry.state.lock();
        let delay = state.mark_rate_limit(&self.config.rate_limit, retry_after, Instant::now());
        warn!(
            slot = %target,
            backoff_count = state.rate_limit_backoff_count,
            cooldown_ms = delay.as_millis() as u64,
            "slot rate-limited"
        );
    }

    pub fn is_rate_limited(&self, target: &RouteTarget) -> bool {
        let entry = self.entry(target);
        entry.state.lock().is_rate_limited(Instant::now())
    }

    pub fn is_circuit_open(&self, target: &RouteTarget) -> bool {
        let entry = self.entry(target);
        entry.state.lock().circuit_open
    }

    /// Join the slot's wait queue. The returned ticket resolves when the
    /// request reaches the head and capacity frees up; at that point the
    /// request holds an active unit.
    pub fn enqueue(
        self: &Arc<Self>,
        target: &RouteTarget,
        priority: Priority,
    ) -> Result<QueueTicket> {
        let entry = self.entry(target);
        let mut state = entry.state.lock();
        if state.queue.len() >= self.config.queue.max_queue_size {
            warn!(slot = %target, depth = state.queue.len(), "queue full");
            return Err(RelayError::QueueFull {
                provider: target.provider.clone(),
                model: target.model.clone(),
            });
        }

        let id = self.next_queue_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        let pool = Arc::clone(self);
        let key = target.clone();
        let timeout = Duration::from_millis(self.config.queue.queue_timeout_ms);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let timed_out = {
                let entry = pool.entry(&key);
                let mut state = entry.state.lock();
                state.remove_queued(id)
            };
            if let Some(victim) = timed_out {
                warn!(slot = %key, queue_id = id, "queued request timed out");
                let _ = victim.responder.send(Err(RelayError::QueueTimeout {
                    provider: key.provider.clone(),
                    model: key.model.clone(),
                }));
                pool.process_queue(&key);
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
        debug!(slot = %target, queue_id = id, priority = %priority, depth = state.queue.len(), "request queued");
        Ok(QueueTicket { rx })
    }

    /// Admit queued requests while capacity allows. The
    /// `reserved_for_queue → active` transition happens in one critical
    /// section, so concurrent invocations never over-admit.
    pub fn process_queue(self: &Arc<Self>, target: &RouteTarget) {
        let entry = self.entry(target);
        let mut state = entry.state.lock();
        while state.has_free_capacity() && !state.queue.is_empty() {
            let head = state.queue.remove(0);
            state.reserved_for_queue = state.reserved_for_queue.saturating_sub(1);
            state.active += 1;
            state.last_used = Some(Instant::now());
            head.deadline_timer.abort();
            debug!(slot = %target, queue_id = head.id, "queued request admitted");
            if head.responder.send(Ok(())).is_err() {
                // Waiter went away (client disconnect); undo the admission.
                state.active = state.active.saturating_sub(1);
            }
        }
    }

    /// Filter alternatives to those admissible right now.
    pub fn available_alternatives(&self, alternatives: &[RouteTarget]) -> Vec<RouteTarget> {
        alternatives
            .iter()
            .filter(|t| self.has_capacity(t))
            .cloned()
            .collect()
    }

    /// Close every circuit and zero failure counts. Admin operation.
    pub fn reset_circuit_breakers(&self) -> usize {
        let mut reset = 0;
        for slot in self.slots.iter() {
            let mut state = slot.value().state.lock();
            if state.circuit_open {
                reset += 1;
            }
            state.circuit_open = false;
            state.circuit_open_until = None;
            state.failure_count = 0;
        }
        reset
    }

    /// Reject all waiters, on one slot or everywhere. Admin operation.
    pub fn clear_queue(&self, target: Option<&RouteTarget>) -> usize {
        let mut cleared = 0;
        match target {
            Some(t) => {
                let entry = self.entry(t);
                let mut state = entry.state.lock();
                cleared += state.queue.len();
                state.drain_queue_with(|| RelayError::Cancelled);
            }
            None => {
                for slot in self.slots.iter() {
                    let mut state = slot.value().state.lock();
                    cleared += state.queue.len();
                    state.drain_queue_with(|| RelayError::Cancelled);
                }
            }
        }
        cleared
    }

    /// Status of one slot, for candidate scoring.
    pub fn status_of(&self, target: &RouteTarget) -> SlotStatus {
        let entry = self.entry(target);
        entry
            .state
            .lock()
            .status(&target.provider, &target.model, Instant::now())
    }

    /// Status of every slot, for the admin endpoints.
    pub fn snapshot(&self) -> Vec<SlotStatus> {
        let now = Instant::now();
        self.slots
            .iter()
            .map(|kv| {
                let key = kv.key();
                kv.value().state.lock().status(&key.provider, &key.model, now)
            })
            .collect()
    }

    /// Queue depths of every slot.
    pub fn queue_snapshot(&self) -> Vec<QueueStatus> {
        let now = Instant::now();
        self.slots
            .iter()
            .map(|kv| {
                let key = kv.key();
                let state = kv.value().state.lock();
                QueueStatus {
                    provider: key.provider.clone(),
                    model: key.model.clone(),
                    depth: state.queue.len(),
                    max_queue_size: self.config.queue.max_queue_size,
                    head_waiting_ms: state
                        .queue
                        .first()
                        .map(|e| now.duration_since(e.enqueued_at).as_millis() as u64),
                }
            })
            .collect()
    }

    /// Background ticker: drains queues, clears expired cooldowns, and alerts
    /// on queue depth (warn at 80%, critical at 95%).
    pub fn start_ticker(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let keys: Vec<RouteTarget> =
                    pool.slots.iter().map(|kv| kv.key().clone()).collect();
                for key in keys {
                    {
                        let entry = pool.entry(&key);
                        let mut state = entry.state.lock();
                        state.maybe_close_circuit(Instant::now());
                        let depth = state.queue.len();
                        let cap = pool.config.queue.max_queue_size;
                        if cap > 0 {
                            let pct = depth * 100 / cap;
                            if pct >= 95 {
                                error!(slot = %key, depth, cap, "queue depth critical");
                            } else if pct >= 80 {
                                warn!(slot = %key, depth, cap, "queue depth high");
                            }
                        }
                    }
                    pool.process_queue(&key);
                }
            }
        })
    }
}
