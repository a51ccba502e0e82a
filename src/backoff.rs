use rand::Rng;
use std::time::Duration;

/// Capped exponential delay schedule with percentage jitter.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
    jitter_percent: u64,
}

impl ExponentialBackoff {
    pub const fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter_percent: 10,
        }
    }

    pub fn with_jitter(mut self, jitter_percent: u64) -> Self {
        self.jitter_percent = jitter_percent;
        self
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base.as_millis() as u64;
        let max_ms = self.max.as_millis() as u64;
        let exponential = base_ms.saturating_mul(2u64.saturating_pow(attempt.min(20)));
        let capped = exponential.min(max_ms);
        let jitter = if self.jitter_percent > 0 {
            rand::thread_rng().gen_range(0..capped / self.jitter_percent + 1)
        } else {
            0
        };
        Duration::from_millis(capped + jitter)
    }
}

/// Tracks consecutive idle polls for a frontier-bound worker: each empty
/// poll lengthens the sleep, any dispatched item resets it.
#[derive(Debug, Clone)]
pub struct IdleBackoff {
    policy: ExponentialBackoff,
    attempt: u32,
}

impl IdleBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            policy: ExponentialBackoff::new(base, max),
            attempt: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.policy.delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_growth() {
        let backoff =
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(10))
                .with_jitter(0);
        assert_eq!(backoff.delay(0).as_millis(), 100);
        assert_eq!(backoff.delay(1).as_millis(), 200);
        assert_eq!(backoff.delay(2).as_millis(), 400);
    }

    #[test]
    fn test_max_cap() {
        let backoff =
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(1))
                .with_jitter(0);
        assert!(backoff.delay(10).as_millis() <= 1000);
    }

    #[test]
    fn test_idle_backoff_grows_and_resets() {
        let mut idle = IdleBackoff::new(Duration::from_millis(10), Duration::from_millis(80));
        idle.policy = idle.policy.clone().with_jitter(0);

        assert_eq!(idle.next_delay().as_millis(), 10);
        assert_eq!(idle.next_delay().as_millis(), 20);
        assert_eq!(idle.next_delay().as_millis(), 40);

        idle.reset();
        assert_eq!(idle.next_delay().as_millis(), 10);
    }
}
