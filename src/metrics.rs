use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

// Atomic counter for lock-free metric updates
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl Clone for Counter {
    fn clone(&self) -> Self {
        Self {
            value: AtomicU64::new(self.value.load(Ordering::Relaxed)),
        }
    }
}

/// Frontier and pipeline counters, shared by workers and the coordinator.
#[derive(Debug, Default)]
pub struct Metrics {
    pub admitted: Counter,
    pub duplicates: Counter,
    pub dispatched: Counter,
    pub completed: Counter,
    pub retried: Counter,
    pub failed: Counter,
    pub lease_expired: Counter,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            admitted: self.admitted.get(),
            duplicates: self.duplicates.get(),
            dispatched: self.dispatched.get(),
            completed: self.completed.get(),
            retried: self.retried.get(),
            failed: self.failed.get(),
            lease_expired: self.lease_expired.get(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub admitted: u64,
    pub duplicates: u64,
    pub dispatched: u64,
    pub completed: u64,
    pub retried: u64,
    pub failed: u64,
    pub lease_expired: u64,
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "admitted={} dup={} dispatched={} completed={} retried={} failed={} reclaimed={}",
            self.admitted,
            self.duplicates,
            self.dispatched,
            self.completed,
            self.retried,
            self.failed,
            self.lease_expired
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let counter = Counter::new();
        counter.inc();
        counter.add(5);
        assert_eq!(counter.get(), 6);
    }

    #[test]
    fn test_snapshot() {
        let metrics = Metrics::new();
        metrics.admitted.inc();
        metrics.admitted.inc();
        metrics.completed.inc();

        let snap = metrics.snapshot();
        assert_eq!(snap.admitted, 2);
        assert_eq!(snap.completed, 1);
        assert_eq!(snap.failed, 0);
    }
}
