use rand::Rng;
use std::time::Duration;

/// Reconnect schedule for the event stream: capped exponential backoff with
/// jitter, and an optional ceiling on consecutive failed attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnect attempt.
    pub initial_delay: Duration,
    /// Upper bound for any single delay, before jitter.
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Fraction of the delay randomly added or removed, in `[0, 1]`.
    pub jitter: f64,
    /// Consecutive failures tolerated before giving up. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(120),
            multiplier: 2.0,
            jitter: 0.2,
            max_attempts: Some(12),
        }
    }
}

impl ReconnectPolicy {
    /// The historic behaviour: a fixed delay, retried forever.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
            jitter: 0.0,
            max_attempts: None,
        }
    }

    /// Whether reconnect attempt number `attempt` (1-based) may run.
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempt <= max)
    }

    /// Un-jittered delay before attempt `attempt` (1-based).
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let secs = self.initial_delay.as_secs_f64() * factor;
        let capped = secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Delay before attempt `attempt`, with jitter applied.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, &mut rand::rng())
    }

    pub fn delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(attempt).as_secs_f64();
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || base == 0.0 {
            return Duration::from_secs_f64(base);
        }
        let spread = base * jitter;
        let offset = rng.random_range(-spread..=spread);
        Duration::from_secs_f64((base + offset).max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_double_until_cap() {
        let policy = ReconnectPolicy {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.0,
            max_attempts: None,
        };

        let delays: Vec<u64> = (1..=6).map(|n| policy.base_delay(n).as_secs()).collect();
        assert_eq!(delays, vec![5, 10, 20, 30, 30, 30]);
        assert_eq!(policy.delay(3), Duration::from_secs(20));
    }

    #[test]
    fn test_jitter_stays_within_spread() {
        let policy = ReconnectPolicy::default();
        for attempt in 1..=10 {
            let base = policy.base_delay(attempt).as_secs_f64();
            let delay = policy.delay(attempt).as_secs_f64();
            assert!(delay >= base * (1.0 - policy.jitter) - 1e-9);
            assert!(delay <= base * (1.0 + policy.jitter) + 1e-9);
        }
    }

    #[test]
    fn test_attempt_ceiling() {
        let policy = ReconnectPolicy {
            max_attempts: Some(3),
            ..Default::default()
        };
        assert!(policy.allows(1));
        assert!(policy.allows(3));
        assert!(!policy.allows(4));
        assert!(ReconnectPolicy::fixed(Duration::from_secs(5)).allows(u32::MAX));
    }

    #[test]
    fn test_huge_attempt_numbers_do_not_overflow() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.base_delay(u32::MAX), policy.max_delay);
    }
}
