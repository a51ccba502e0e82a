//! Per-target rate limiting, independent of global concurrency.

use dashmap::DashMap;
use std::time::{Duration, Instant};

use crate::config::PolitenessConfig;

// In-memory politeness window per target
#[derive(Debug)]
struct TargetBudget {
    /// When the next dispatch to this target is allowed.
    ready_at: Instant,
    /// Current concurrent dispatches to this target.
    in_flight: usize,
}

/// Enforces a minimum interval and an in-flight cap per target (typically a
/// host). Budgets are created lazily on first dispatch and never persisted;
/// rebuilding from scratch after a restart is acceptable.
pub struct PolitenessGovernor {
    budgets: DashMap<String, TargetBudget>,
    config: PolitenessConfig,
}

impl PolitenessGovernor {
    pub fn new(config: PolitenessConfig) -> Self {
        Self {
            budgets: DashMap::new(),
            config,
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.config.min_interval
    }

    /// Whether a dispatch to `target` would violate either constraint.
    /// Unknown targets are always eligible.
    pub fn may_dispatch(&self, target: &str) -> bool {
        match self.budgets.get(target) {
            Some(budget) => {
                budget.in_flight < self.config.max_concurrent_per_target
                    && Instant::now() >= budget.ready_at
            }
            None => true,
        }
    }

    /// Record that a dispatch to `target` happened: starts the min-interval
    /// window and takes an in-flight slot.
    pub fn record_dispatch(&self, target: &str) {
        let mut budget = self
            .budgets
            .entry(target.to_string())
            .or_insert_with(|| TargetBudget {
                ready_at: Instant::now(),
                in_flight: 0,
            });
        budget.ready_at = Instant::now() + self.config.min_interval;
        budget.in_flight += 1;
    }

    /// Release the in-flight slot after the item completes or fails.
    pub fn record_completion(&self, target: &str) {
        if let Some(mut budget) = self.budgets.get_mut(target) {
            budget.in_flight = budget.in_flight.saturating_sub(1);
        }
    }

    pub fn tracked_targets(&self) -> usize {
        self.budgets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn governor(interval_ms: u64, max_concurrent: usize) -> PolitenessGovernor {
        PolitenessGovernor::new(PolitenessConfig {
            min_interval: Duration::from_millis(interval_ms),
            max_concurrent_per_target: max_concurrent,
        })
    }

    #[test]
    fn test_unknown_target_is_eligible() {
        let gov = governor(100, 2);
        assert!(gov.may_dispatch("a.local"));
    }

    #[test]
    fn test_min_interval_blocks_then_releases() {
        let gov = governor(50, 10);
        gov.record_dispatch("a.local");
        gov.record_completion("a.local");

        assert!(!gov.may_dispatch("a.local"));
        std::thread::sleep(Duration::from_millis(60));
        assert!(gov.may_dispatch("a.local"));
    }

    #[test]
    fn test_in_flight_cap() {
        let gov = governor(0, 2);
        gov.record_dispatch("a.local");
        gov.record_dispatch("a.local");
        assert!(!gov.may_dispatch("a.local"));

        gov.record_completion("a.local");
        assert!(gov.may_dispatch("a.local"));
    }

    #[test]
    fn test_targets_independent() {
        let gov = governor(1000, 1);
        gov.record_dispatch("a.local");
        assert!(!gov.may_dispatch("a.local"));
        assert!(gov.may_dispatch("b.local"));
    }
}
