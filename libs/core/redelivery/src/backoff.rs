//! Exponential backoff with full jitter
//!
//! Used for broker reconnects and for restarting crashed workers.

use std::time::Duration;

/// Backoff schedule: `min(cap, base * 2^(attempt-1))`, full jitter
#[derive(Debug, Clone)]
pub struct Backoff {
    /// Ceiling of the first delay
    pub base: Duration,

    /// Upper bound for any single delay
    pub cap: Duration,

    /// Attempts allowed before giving up (None = retry forever)
    pub max_attempts: Option<u32>,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(60),
            max_attempts: None,
        }
    }
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Upper bound of the delay before attempt `attempt + 1` (attempts are 1-based)
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exp)
            .unwrap_or(self.cap)
            .min(self.cap)
    }

    /// Jittered delay, uniform in `[0, ceiling(attempt)]`
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt).as_millis() as u64;
        Duration::from_millis(full_jitter(ceiling))
    }

    /// Whether `attempt` failed attempts use up the budget
    pub fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempt >= max)
    }
}

/// Uniform value in `[0, ceiling]`
fn full_jitter(ceiling: u64) -> u64 {
    if ceiling == 0 {
        return 0;
    }
    let mut rng = rand::rng();
    rand::RngExt::random_range(&mut rng, 0..=ceiling)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ceiling_doubles_until_cap() {
        let backoff = Backoff::default();
        assert_eq!(backoff.ceiling(1), Duration::from_secs(1));
        assert_eq!(backoff.ceiling(2), Duration::from_secs(2));
        assert_eq!(backoff.ceiling(3), Duration::from_secs(4));
        assert_eq!(backoff.ceiling(6), Duration::from_secs(32));
        assert_eq!(backoff.ceiling(7), Duration::from_secs(60));
        assert_eq!(backoff.ceiling(500), Duration::from_secs(60));
    }

    #[test]
    fn test_delay_within_ceiling() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(5));
        for attempt in 1..20 {
            assert!(backoff.delay(attempt) <= backoff.ceiling(attempt));
        }
    }

    #[test]
    fn test_delay_spreads_across_range() {
        let backoff = Backoff::new(Duration::from_secs(10), Duration::from_secs(10));
        let delays: std::collections::HashSet<Duration> =
            (0..64).map(|_| backoff.delay(1)).collect();
        assert!(delays.len() > 1);
        assert!(delays.iter().all(|d| *d <= Duration::from_secs(10)));
    }

    #[test]
    fn test_zero_base_never_sleeps() {
        let backoff = Backoff::new(Duration::ZERO, Duration::ZERO);
        assert_eq!(backoff.delay(3), Duration::ZERO);
    }

    #[test]
    fn test_exhausted() {
        let unbounded = Backoff::default();
        assert!(!unbounded.exhausted(u32::MAX));

        let bounded = Backoff::default().with_max_attempts(3);
        assert!(!bounded.exhausted(2));
        assert!(bounded.exhausted(3));
    }
}
