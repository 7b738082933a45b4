//! Exponential backoff for reconnection

use std::time::Duration;

use nc_core::config::BackoffConfig;

/// Exponential backoff with jitter and an optional attempt limit
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    current: Duration,
    max: Duration,
    multiplier: f64,
    /// Jitter factor (0.0 to 1.0)
    jitter: f64,
    max_attempts: Option<u32>,
    attempts: u32,
}

impl ExponentialBackoff {
    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(config.initial, config.max, config.multiplier, config.jitter)
            .with_max_attempts(config.max_attempts)
    }

    pub fn new(initial: Duration, max: Duration, multiplier: f64, jitter: f64) -> Self {
        Self {
            initial,
            current: initial,
            max,
            multiplier,
            jitter: jitter.clamp(0.0, 1.0),
            max_attempts: None,
            attempts: 0,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Delay before the next attempt, or `None` once the attempt limit is
    /// reached
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.max_attempts.is_some_and(|max| self.attempts >= max) {
            return None;
        }
        self.attempts += 1;

        let delay = self.current;
        let next = Duration::from_secs_f64(self.current.as_secs_f64() * self.multiplier);
        self.current = std::cmp::min(next, self.max);

        let jitter_amount = delay.as_secs_f64() * self.jitter * rand::random::<f64>();
        Some(delay + Duration::from_secs_f64(jitter_amount))
    }

    /// Start over after a successful connection
    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_secs(15), Duration::from_secs(60), 2.0, 0.0);

        let delays: Vec<_> = (0..4).map(|_| backoff.next_delay().unwrap()).collect();
        assert_eq!(
            delays,
            [15, 30, 60, 60].map(Duration::from_secs).to_vec()
        );
    }

    #[test]
    fn test_backoff_attempt_limit_and_reset() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(60), 2.0, 0.0)
                .with_max_attempts(Some(2));

        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(1)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(2)));
        assert_eq!(backoff.next_delay(), None);

        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_secs(10), Duration::from_secs(60), 1.0, 0.5);

        for _ in 0..20 {
            let delay = backoff.next_delay().unwrap();
            assert!(delay >= Duration::from_secs(10));
            assert!(delay <= Duration::from_secs(15));
        }
    }
}
