use relay_core::{Priority, RelayError, Result};
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::{Duration, Instant};

use relay_config::{CircuitBreakerConfig, RateLimitConfig};

/// A request waiting for a slot. Each entry owns exactly one unit of
/// `reserved_for_queue` and one deadline timer. FIFO order within a priority
/// falls out of sorted insertion.
pub(crate) struct QueueEntry {
    pub id: u64,
    pub priority: Priority,
    pub enqueued_at: Instant,
    pub responder: oneshot::Sender<Result<()>>,
    pub deadline_timer: AbortHandle,
}

/// Mutable state of one capacity slot. All mutation happens under the owning
/// entry's lock; transitions here are synchronous and never await.
pub(crate) struct SlotState {
    pub active: u32,
    pub reserved_confirm_pending: u32,
    pub reserved_for_queue: u32,
    pub max_concurrent: u32,
    pub queue: Vec<QueueEntry>,
    pub rate_limit_until: Option<Instant>,
    pub rate_limit_backoff_count: u32,
    pub rate_limit_base_delay: Duration,
    pub circuit_open: bool,
    pub circuit_open_until: Option<Instant>,
    pub failure_count: u32,
    pub success_count: u64,
    pub last_used: Option<Instant>,
    /// Outstanding confirm-pending reservations and their expiry timers.
    pub reservations: HashMap<String, AbortHandle>,
}

impl SlotState {
    pub fn new(max_concurrent: u32, rate_limit: &RateLimitConfig) -> Self {
        Self {
            active: 0,
            reserved_confirm_pending: 0,
            reserved_for_queue: 0,
            max_concurrent,
            queue: Vec::new(),
            rate_limit_until: None,
            rate_limit_backoff_count: 0,
            rate_limit_base_delay: Duration::from_millis(rate_limit.default_retry_after_ms),
            circuit_open: false,
            circuit_open_until: None,
            failure_count: 0,
            success_count: 0,
            last_used: None,
            reservations: HashMap::new(),
        }
    }

    /// Total committed capacity: active plus both reservation kinds.
    pub fn committed(&self) -> u32 {
        self.active + self.reserved_confirm_pending + self.reserved_for_queue
    }

    pub fn has_free_capacity(&self) -> bool {
        self.committed() < self.max_concurrent
    }

    pub fn is_rate_limited(&self, now: Instant) -> bool {
        self.rate_limit_until.is_some_and(|until| now < until)
    }

    /// Clear an expired circuit, allowing a probe. Returns true when the
    /// circuit transitioned from open to closed.
    pub fn maybe_close_circuit(&mut self, now: Instant) -> bool {
        if self.circuit_open
            && let Some(until) = self.circuit_open_until
            && now >= until
        {
            self.circuit_open = false;
            self.circuit_open_until = None;
            self.failure_count = 0;
            return true;
        }
        false
    }

    /// Admissible: circuit closed, no live rate-limit cooldown, free capacity.
    pub fn is_admissible(&self, now: Instant) -> bool {
        !self.circuit_open && !self.is_rate_limited(now) && self.has_free_capacity()
    }

    /// Record a success: drain one failure, reset rate-limit backoff.
    pub fn mark_success(&mut self, rate_limit: &RateLimitConfig) {
        self.success_count += 1;
        self.failure_count = self.failure_count.saturating_sub(1);
        self.rate_limit_backoff_count = 0;
        self.rate_limit_base_delay = Duration::from_millis(rate_limit.default_retry_after_ms);
    }

    /// Record a failure; trips the circuit at the threshold. Returns true when
    /// the circuit opened on this call.
    pub fn mark_failure(&mut self, breaker: &CircuitBreakerConfig, now: Instant) -> bool {
        self.failure_count += 1;
        if self.failure_count >= breaker.failure_threshold && !self.circuit_open {
            self.circuit_open = true;
            self.circuit_open_until = Some(now + Duration::from_millis(breaker.cooldown_period_ms));
            return true;
        }
        false
    }

    /// Apply a rate-limit mark: bump the backoff counter and compute the
    /// cooldown. An upstream Retry-After (when respected) becomes the new base.
    pub fn mark_rate_limit(
        &mut self,
        rate_limit: &RateLimitConfig,
        retry_after: Option<Duration>,
        now: Instant,
    ) -> Duration {
        self.rate_limit_backoff_count += 1;
        let delay = match retry_after {
            Some(hint) if rate_limit.respect_retry_after_header => {
                self.rate_limit_base_delay = hint;
                hint
            }
            _ => {
                let base = self.rate_limit_base_delay.as_millis() as f64;
                let exp = (self.rate_limit_backoff_count - 1) as i32;
                let scaled = base * rate_limit.backoff_multiplier.powi(exp);
                Duration::from_millis((scaled as u64).min(rate_limit.max_backoff_ms))
            }
        };
        self.rate_limit_until = Some(now + delay);
        delay
    }

    /// Insert a queue entry keeping `(priority DESC, seq ASC)` order.
    pub fn insert_queued(&mut self, entry: QueueEntry) {
        let pos = self
            .queue
            .iter()
            .position(|e| e.priority < entry.priority)
            .unwrap_or(self.queue.len());
        self.queue.insert(pos, entry);
    }

    /// Remove a queue entry by id, surrendering its queue reservation.
    /// Returns the entry when it was still queued.
    pub fn remove_queued(&mut self, id: u64) -> Option<QueueEntry> {
        let pos = self.queue.iter().position(|e| e.id == id)?;
        let entry = self.queue.remove(pos);
        self.reserved_for_queue = self.reserved_for_queue.saturating_sub(1);
        Some(entry)
    }

    /// Reject every waiter with the given error, cancelling deadline timers.
    pub fn drain_queue_with<F>(&mut self, mut err: F)
    where
        F: FnMut() -> RelayError,
    {
        for entry in self.queue.drain(..) {
            entry.deadline_timer.abort();
            let _ = entry.responder.send(Err(err()));
        }
        self.reserved_for_queue = 0;
    }
}

/// Serializable snapshot of one slot for the status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct SlotStatus {
    pub provider: String,
    pub model: String,
    pub active: u32,
    pub reserved_confirm_pending: u32,
    pub reserved_for_queue: u32,
    pub max_concurrent: u32,
    pub queue_length: usize,
    pub circuit_open: bool,
    pub rate_limited: bool,
    pub rate_limit_backoff_count: u32,
    pub failure_count: u32,
    pub success_count: u64,
}

impl SlotState {
    pub fn status(&self, provider: &str, model: &str, now: Instant) -> SlotStatus {
        SlotStatus {
            provider: provider.to_string(),
            model: model.to_string(),
            active: self.active,
            reserved_confirm_pending: self.reserved_confirm_pending,
            reserved_for_queue: self.reserved_for_queue,
            max_concurrent: self.max_concurrent,
            queue_length: self.queue.len(),
            circuit_open: self.circuit_open,
            rate_limited: self.is_rate_limited(now),
            rate_limit_backoff_count: self.rate_limit_backoff_count,
            failure_count: self.failure_count,
            success_count: self.success_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> SlotState {
        SlotState::new(2, &RateLimitConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_progression() {
        let rl = RateLimitConfig::default();
        let mut s = state();
        let now = Instant::now();

        // base 60s, mult 1.5: 60s, 90s, 135s
        assert_eq!(s.mark_rate_limit(&rl, None, now), Duration::from_millis(60_000));
        assert_eq!(s.mark_rate_limit(&rl, None, now), Duration::from_millis(90_000));
        assert_eq!(s.mark_rate_limit(&rl, None, now), Duration::from_millis(135_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_caps_at_max() {
        let rl = RateLimitConfig::default();
        let mut s = state();
        let now = Instant::now();
        let mut last = Duration::ZERO;
        for _ in 0..20 {
            last = s.mark_rate_limit(&rl, None, now);
        }
        assert_eq!(last, Duration::from_millis(300_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_becomes_new_base() {
        let rl = RateLimitConfig::default();
        let mut s = state();
        let now = Instant::now();
        s.mark_rate_limit(&rl, Some(Duration::from_secs(10)), now);
        assert_eq!(s.rate_limit_base_delay, Duration::from_secs(10));
        // next un-hinted mark scales off the adopted base
        let d = s.mark_rate_limit(&rl, None, now);
        assert_eq!(d, Duration::from_millis(15_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_backoff() {
        let rl = RateLimitConfig::default();
        let mut s = state();
        let now = Instant::now();
        s.mark_rate_limit(&rl, None, now);
        s.mark_rate_limit(&rl, None, now);
        s.mark_success(&rl);
        assert_eq!(s.rate_limit_backoff_count, 0);
        // next mark starts over at the default base
        assert_eq!(s.mark_rate_limit(&rl, None, now), Duration::from_millis(60_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_trips_at_threshold() {
        let cb = CircuitBreakerConfig::default();
        let mut s = state();
        let now = Instant::now();
        for i in 0..5 {
            let opened = s.mark_failure(&cb, now);
            assert_eq!(opened, i == 4);
        }
        assert!(s.circuit_open);
        assert!(!s.is_admissible(now));
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_clears_after_cooldown() {
        let cb = CircuitBreakerConfig::default();
        let mut s = state();
        let now = Instant::now();
        for _ in 0..5 {
            s.mark_failure(&cb, now);
        }
        let later = now + Duration::from_millis(60_001);
        assert!(s.maybe_close_circuit(later));
        assert!(!s.circuit_open);
        assert_eq!(s.failure_count, 0);
        assert!(s.is_admissible(later));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_drains_failures_floored_at_zero() {
        let rl = RateLimitConfig::default();
        let cb = CircuitBreakerConfig::default();
        let mut s = state();
        let now = Instant::now();
        s.mark_failure(&cb, now);
        s.mark_success(&rl);
        s.mark_success(&rl);
        assert_eq!(s.failure_count, 0);
        assert_eq!(s.success_count, 2);
    }
}
