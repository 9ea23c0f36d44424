//! Reconnect backoff

use rand::Rng;
use std::time::Duration;

/// Exponential backoff with jitter.
///
/// The base delay for attempt `n` (0-based) is `min(initial * multiplier^n, max)`;
/// the actual delay is the base perturbed by up to `jitter` in either direction.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    multiplier: f64,
    max: Duration,
    jitter: f64,
}

impl Backoff {
    pub fn new(initial: Duration, multiplier: f64, max: Duration) -> Self {
        Self {
            initial,
            multiplier: multiplier.max(1.0),
            max,
            jitter: 0.2,
        }
    }

    /// Override the jitter fraction (clamped to `0.0..=1.0`)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before attempt `attempt` without jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial.as_secs_f64() * self.multiplier.powi(exp);
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(secs)
    }

    /// Delay before attempt `attempt`
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter == 0.0 {
            return base;
        }
        let factor = 1.0 + rand::rng().random_range(-self.jitter..=self.jitter);
        base.mul_f64(factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_delay_grows_and_caps() {
        let backoff = Backoff::new(Duration::from_secs(5), 1.5, Duration::from_secs(300));
        assert_eq!(backoff.base_delay(0), Duration::from_secs(5));
        assert_eq!(backoff.base_delay(1), Duration::from_secs_f64(7.5));
        assert_eq!(backoff.base_delay(2), Duration::from_secs_f64(11.25));
        assert_eq!(backoff.base_delay(50), Duration::from_secs(300));
        assert_eq!(backoff.base_delay(u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let backoff = Backoff::new(Duration::from_secs(10), 2.0, Duration::from_secs(60));
        for _ in 0..100 {
            let d = backoff.delay(0);
            assert!(d >= Duration::from_secs(8) && d <= Duration::from_secs(12), "{:?}", d);
        }
    }

    #[test]
    fn test_zero_jitter_is_deterministic() {
        let backoff =
            Backoff::new(Duration::from_millis(100), 2.0, Duration::from_secs(1)).with_jitter(0.0);
        assert_eq!(backoff.delay(3), Duration::from_millis(800));
        assert_eq!(backoff.delay(4), Duration::from_secs(1));
    }
}
