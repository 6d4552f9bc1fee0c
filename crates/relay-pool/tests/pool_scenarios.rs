use relay_config::ModelPoolConfig;
use relay_core::{Priority, RouteTarget};
use relay_pool::ModelPool;
use std::sync::Arc;
use tokio::time::Duration;

fn pool_with(max_concurrent: u32) -> Arc<ModelPool> {
    let mut config = ModelPoolConfig::default();
    config.max_concurrent_per_model = max_concurrent;
    ModelPool::new(config)
}

fn target() -> RouteTarget {
    RouteTarget::new("acme", "acme-large")
}

// ── Admission under load ───────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn admission_never_exceeds_capacity() {
    let pool = pool_with(3);
    let t = target();

    let mut admitted = 0;
    for _ in 0..10 {
        if pool.try_acquire(&t) {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 3);

    let status = &pool.snapshot()[0];
    assert_eq!(status.active, 3);
    assert!(
        status.active + status.reserved_confirm_pending + status.reserved_for_queue
            <= status.max_concurrent
    );
}

#[tokio::test(start_paused = true)]
async fn mixed_reservations_and_admissions_respect_cap() {
    let pool = pool_with(3);
    let t = target();

    assert!(pool.try_acquire(&t));
    assert!(pool.reserve_slot(&t, Duration::from_secs(30), "r1"));
    assert!(pool.reserve_slot(&t, Duration::from_secs(30), "r2"));
    // 1 active + 2 confirm-pending = 3 = cap
    assert!(!pool.try_acquire(&t));
    assert!(!pool.reserve_slot(&t, Duration::from_secs(30), "r3"));

    assert!(pool.confirm_slot(&t, "r1"));
    pool.release_reservation(&t, "r2");
    let status = &pool.snapshot()[0];
    assert_eq!(status.active, 2);
    assert_eq!(status.reserved_confirm_pending, 0);
    assert!(pool.try_acquire(&t));
}

// ── Queue drains in priority order across releases ─────────────

#[tokio::test(start_paused = true)]
async fn queue_admits_by_priority_then_fifo() {
    let pool = pool_with(1);
    let t = target();
    assert!(pool.try_acquire(&t));

    let tickets = vec![
        ("low", pool.enqueue(&t, Priority::LOW).unwrap()),
        ("norm-1", pool.enqueue(&t, Priority::NORMAL).unwrap()),
        ("high", pool.enqueue(&t, Priority::HIGH).unwrap()),
        ("norm-2", pool.enqueue(&t, Priority::NORMAL).unwrap()),
    ];

    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let mut handles = Vec::new();
    for (name, ticket) in tickets {
        let order = Arc::clone(&order);
        handles.push(tokio::spawn(async move {
            ticket.wait().await.unwrap();
            order.lock().push(name);
        }));
    }
    tokio::task::yield_now().await;

    for _ in 0..4 {
        pool.release_slot(&t, true);
        tokio::task::yield_now().await;
    }
    for h in handles {
        h.await.unwrap();
    }
    assert_eq!(*order.lock(), vec!["high", "norm-1", "norm-2", "low"]);
}

// ── Circuit breaker end-to-end ─────────────────────────────────

#[tokio::test(start_paused = true)]
async fn circuit_opens_then_probe_after_cooldown() {
    let pool = pool_with(2);
    let t = target();

    for _ in 0..5 {
        assert!(pool.try_acquire(&t));
        pool.release_slot(&t, false);
    }
    assert!(pool.is_circuit_open(&t));
    assert!(!pool.has_capacity(&t));
    assert!(!pool.try_acquire(&t));

    tokio::time::sleep(Duration::from_millis(60_001)).await;
    assert!(pool.has_capacity(&t));
    assert!(!pool.is_circuit_open(&t));
    assert!(pool.try_acquire(&t));
}

#[tokio::test(start_paused = true)]
async fn success_heals_failure_count_before_trip() {
    let pool = pool_with(2);
    let t = target();

    // Four failures, one success, two more failures: the success drains one
    // failure, so the trip needs two further failures instead of one.
    for _ in 0..4 {
        assert!(pool.try_acquire(&t));
        pool.release_slot(&t, false);
    }
    assert!(pool.try_acquire(&t));
    pool.release_slot(&t, true);
    for i in 0..2 {
        assert!(pool.try_acquire(&t), "iteration {i}");
        pool.release_slot(&t, false);
    }
    assert!(pool.is_circuit_open(&t));
}

// ── Rate-limit backoff end-to-end ──────────────────────────────

#[tokio::test(start_paused = true)]
async fn rate_limit_cooldown_expires() {
    let pool = pool_with(2);
    let t = target();

    pool.mark_rate_limit(&t, Some(Duration::from_secs(30)));
    assert!(!pool.has_capacity(&t));
    tokio::time::sleep(Duration::from_secs(31)).await;
    assert!(pool.has_capacity(&t));
}

#[tokio::test(start_paused = true)]
async fn backoff_restarts_after_success() {
    let pool = pool_with(2);
    let t = target();

    pool.mark_rate_limit(&t, None);
    pool.mark_rate_limit(&t, None);
    pool.mark_rate_limit(&t, None);
    // 60s * 1.5^2 = 135s
    tokio::time::sleep(Duration::from_millis(134_000)).await;
    assert!(!pool.has_capacity(&t));
    tokio::time::sleep(Duration::from_millis(1_001)).await;
    assert!(pool.has_capacity(&t));

    pool.mark_success(&t);
    pool.mark_rate_limit(&t, None);
    // Back to the 60s base.
    tokio::time::sleep(Duration::from_millis(60_001)).await;
    assert!(pool.has_capacity(&t));
}
