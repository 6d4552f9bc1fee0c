use relay_core::{Priority, RouteTarget, Scenario};
use relay_pool::ModelPool;
use serde::Serialize;
use tracing::debug;

use relay_config::ModelSelectorConfig;

/// One scored candidate. Disqualified candidates carry a zero score and the
/// reason they were ruled out.
#[derive(Debug, Clone, Serialize)]
pub struct CandidateScore {
    pub target: RouteTarget,
    pub score: f64,
    pub disqualified: Option<String>,
}

/// The selector's verdict for one request.
#[derive(Debug, Clone)]
pub struct SelectionDecision {
    pub selected: RouteTarget,
    pub should_race: bool,
    pub race_candidates: Vec<RouteTarget>,
    pub scores: Vec<CandidateScore>,
}

/// Ranks the primary and its alternatives by a weighted health/capacity
/// score and decides whether to race.
pub struct ModelSelector;

/// Scores at or above this never race; below [`RACE_ALWAYS_BELOW`] a race is
/// mandatory whenever an alternative is admissible.
const RACE_BELOW: f64 = 70.0;
const RACE_ALWAYS_BELOW: f64 = 50.0;

impl ModelSelector {
    /// Score a candidate. Zero with a reason when the pool disqualifies it.
    fn score(
        pool: &ModelPool,
        config: &ModelSelectorConfig,
        target: &RouteTarget,
        is_primary: bool,
        request_priority: Priority,
    ) -> CandidateScore {
        // has_capacity first: it clears an expired circuit, so a cooled-down
        // slot is not disqualified by stale circuit state.
        let admissible = pool.has_capacity(target);
        if pool.is_circuit_open(target) {
            return CandidateScore {
                target: target.clone(),
                score: 0.0,
                disqualified: Some("circuit open".into()),
            };
        }
        if pool.is_rate_limited(target) {
            return CandidateScore {
                target: target.clone(),
                score: 0.0,
                disqualified: Some("rate limited".into()),
            };
        }
        if !admissible {
            return CandidateScore {
                target: target.clone(),
                score: 0.0,
                disqualified: Some("saturated".into()),
            };
        }

        let status = pool.status_of(target);
        let committed =
            status.active + status.reserved_confirm_pending + status.reserved_for_queue;
        let capacity_score = if status.max_concurrent > 0 {
            f64::from(status.max_concurrent - committed) / f64::from(status.max_concurrent) * 100.0
        } else {
            0.0
        };

        let health_score = if config.enable_health_based_routing {
            let attempts = status.success_count + u64::from(status.failure_count);
            if attempts == 0 {
                100.0
            } else {
                status.success_count as f64 / attempts as f64 * 100.0
            }
        } else {
            100.0
        };

        let performance_score = if config.enable_performance_based_routing {
            (100.0 - 10.0 * f64::from(status.failure_count)).max(0.0)
        } else {
            100.0
        };

        let candidate_priority = if is_primary { 10.0 } else { 0.0 };
        let priority_score = candidate_priority + f64::from(request_priority.0);

        let w = &config.score_weights;
        let score = w.capacity * capacity_score
            + w.health * health_score
            + w.performance * performance_score
            + w.priority * priority_score;

        CandidateScore {
            target: target.clone(),
            score,
            disqualified: None,
        }
    }

    /// Rank `primary` and `alternatives`; pick the best admissible candidate
    /// and decide whether to race it against the runners-up.
    pub fn select(
        pool: &ModelPool,
        config: &ModelSelectorConfig,
        primary: &RouteTarget,
        alternatives: &[RouteTarget],
        scenario: Scenario,
        request_priority: Priority,
    ) -> SelectionDecision {
        let mut scores = vec![Self::score(pool, config, primary, true, request_priority)];
        for alt in alternatives {
            scores.push(Self::score(pool, config, alt, false, request_priority));
        }

        // Highest score among admissible candidates; the primary wins ties
        // through its candidate-priority bonus. With prefer_healthy_models
        // off, an admissible primary keeps the selection regardless of score.
        let primary_admissible = scores[0].disqualified.is_none();
        let selected = if !config.prefer_healthy_models && primary_admissible {
            primary.clone()
        } else {
            scores
                .iter()
                .filter(|s| s.disqualified.is_none())
                .max_by(|a, b| a.score.total_cmp(&b.score))
                .map(|s| s.target.clone())
                .unwrap_or_else(|| primary.clone())
        };

        let selected_score = scores
            .iter()
            .find(|s| s.target == selected)
            .map(|s| s.score)
            .unwrap_or(0.0);

        // Race candidates: the next-best admissible candidates, capped.
        let mut runners_up: Vec<&CandidateScore> = scores
            .iter()
            .filter(|s| s.disqualified.is_none() && s.target != selected)
            .collect();
        runners_up.sort_by(|a, b| b.score.total_cmp(&a.score));
        let race_candidates: Vec<RouteTarget> = runners_up
            .into_iter()
            .take(config.max_parallel_alternatives)
            .map(|s| s.target.clone())
            .collect();

        // Racing needs proactive failover on, the default scenario, at least
        // one admissible alternative, and a low-to-moderate selected score.
        // Below RACE_ALWAYS_BELOW the race is unconditional; between the two
        // thresholds it happens because alternatives exist; at or above
        // RACE_BELOW it never does.
        let should_race = config.enable_proactive_failover
            && scenario == Scenario::Default
            && !race_candidates.is_empty()
            && (selected_score < RACE_ALWAYS_BELOW || selected_score < RACE_BELOW);

        if should_race {
            debug!(
                selected = %selected,
                score = selected_score,
                racers = race_candidates.len(),
                "racing primary against alternatives"
            );
        }

        SelectionDecision {
            selected,
            should_race,
            race_candidates,
            scores,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_config::ModelPoolConfig;
    use std::sync::Arc;

    fn pool() -> Arc<ModelPool> {
        ModelPool::new(ModelPoolConfig::default())
    }

    fn selector_config() -> ModelSelectorConfig {
        ModelSelectorConfig {
            enable_proactive_failover: true,
            ..Default::default()
        }
    }

    fn primary() -> RouteTarget {
        RouteTarget::new("primary", "m")
    }

    fn alt(n: u32) -> RouteTarget {
        RouteTarget::new(format!("alt{n}"), "m")
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_primary_wins_without_race() {
        let pool = pool();
        let decision = ModelSelector::select(
            &pool,
            &selector_config(),
            &primary(),
            &[alt(1), alt(2)],
            Scenario::Default,
            Priority::NORMAL,
        );
        assert_eq!(decision.selected, primary());
        // Fresh slots score high: full capacity, perfect health.
        assert!(!decision.should_race);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disqualified_candidates_score_zero() {
        let pool = pool();
        pool.mark_rate_limit(&primary(), None);
        let decision = ModelSelector::select(
            &pool,
            &selector_config(),
            &primary(),
            &[alt(1)],
            Scenario::Default,
            Priority::NORMAL,
        );
        let primary_score = &decision.scores[0];
        assert_eq!(primary_score.score, 0.0);
        assert_eq!(primary_score.disqualified.as_deref(), Some("rate limited"));
        assert_eq!(decision.selected, alt(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_degraded_primary_loses_selection() {
        let pool = pool();
        let p = primary();
        // Beat the health and performance scores down without tripping the
        // circuit (threshold 5).
        for _ in 0..4 {
            assert!(pool.try_acquire(&p));
            pool.release_slot(&p, false);
        }
        // Occupy most of the capacity.
        for _ in 0..4 {
            assert!(pool.try_acquire(&p));
        }

        let decision = ModelSelector::select(
            &pool,
            &selector_config(),
            &p,
            &[alt(1), alt(2), alt(3)],
            Scenario::Default,
            Priority::NORMAL,
        );
        // The healthy alternative outranks the battered primary, and a
        // high-scoring selection does not race.
        assert_ne!(decision.selected, p);
        assert!(!decision.should_race);
    }

    /// Saturate both targets down to one free unit so every admissible
    /// candidate scores in the race band.
    fn degrade(pool: &ModelPool, targets: &[RouteTarget]) {
        for t in targets {
            for _ in 0..4 {
                assert!(pool.try_acquire(t));
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_low_score_races_in_default_scenario() {
        let pool = pool();
        let p = primary();
        degrade(&pool, &[p.clone(), alt(1)]);

        let decision = ModelSelector::select(
            &pool,
            &selector_config(),
            &p,
            &[alt(1)],
            Scenario::Default,
            Priority::NORMAL,
        );
        assert_eq!(decision.selected, p);
        assert!(decision.should_race);
        assert_eq!(decision.race_candidates, vec![alt(1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_race_only_in_default_scenario() {
        let pool = pool();
        let p = primary();
        degrade(&pool, &[p.clone(), alt(1)]);

        let decision = ModelSelector::select(
            &pool,
            &selector_config(),
            &p,
            &[alt(1)],
            Scenario::Think,
            Priority::NORMAL,
        );
        assert!(!decision.should_race);
    }

    #[tokio::test(start_paused = true)]
    async fn test_race_needs_proactive_failover_enabled() {
        let pool = pool();
        let p = primary();
        degrade(&pool, &[p.clone(), alt(1)]);

        let mut config = selector_config();
        config.enable_proactive_failover = false;
        let decision = ModelSelector::select(
            &pool,
            &config,
            &p,
            &[alt(1)],
            Scenario::Default,
            Priority::NORMAL,
        );
        assert!(!decision.should_race);
    }

    #[tokio::test(start_paused = true)]
    async fn test_race_candidates_capped() {
        let pool = pool();
        let mut config = selector_config();
        config.max_parallel_alternatives = 2;
        let p = primary();
        // Degrade the primary so it loses the selection but stays admissible.
        for _ in 0..4 {
            assert!(pool.try_acquire(&p));
        }
        let decision = ModelSelector::select(
            &pool,
            &config,
            &p,
            &[alt(1), alt(2), alt(3), alt(4)],
            Scenario::Default,
            Priority::NORMAL,
        );
        assert!(decision.race_candidates.len() <= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_admissible_candidates_falls_back_to_primary() {
        let pool = pool();
        pool.mark_rate_limit(&primary(), None);
        pool.mark_rate_limit(&alt(1), None);
        let decision = ModelSelector::select(
            &pool,
            &selector_config(),
            &primary(),
            &[alt(1)],
            Scenario::Default,
            Priority::NORMAL,
        );
        assert_eq!(decision.selected, primary());
        assert!(!decision.should_race);
    }
}
