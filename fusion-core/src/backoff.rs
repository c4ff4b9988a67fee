use std::time::Duration;

use rand::Rng;

/// Exponential back-off with full-base jitter:
/// `delay_n = base * multiplier^(n-1) + rand[0, base)`, capped at `max`.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    /// First-attempt delay and jitter bound.
    pub base: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Hard cap on any single delay.
    pub max: Duration,
}

impl Backoff {
    /// Construct a policy. `multiplier` below 1.0 is clamped to 1.0.
    pub fn new(base: Duration, multiplier: f64, max: Duration) -> Self {
        Self {
            base,
            multiplier: multiplier.max(1.0),
            max,
        }
    }

    /// Delay before attempt `n` (1-based). Attempt 0 is treated as 1.
    pub fn delay(&self, attempt: u32) -> Duration {
        let n = attempt.max(1);
        let base_ms = self.base.as_millis() as f64;
        let exp = base_ms * self.multiplier.powi(n as i32 - 1);
        let jitter = if self.base.is_zero() {
            0.0
        } else {
            rand::thread_rng().gen_range(0.0..base_ms)
        };
        let total = Duration::from_millis((exp + jitter) as u64);
        total.min(self.max)
    }

    /// Deterministic delay without the jitter term, for spacing decisions
    /// that must be reproducible.
    pub fn delay_without_jitter(&self, attempt: u32) -> Duration {
        let n = attempt.max(1);
        let base_ms = self.base.as_millis() as f64;
        let exp = base_ms * self.multiplier.powi(n as i32 - 1);
        Duration::from_millis(exp as u64).min(self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), 2.0, Duration::from_secs(60))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn grows_exponentially_and_caps() {
        let backoff = Backoff::new(Duration::from_millis(100), 2.0, Duration::from_secs(1));
        assert_eq!(
            backoff.delay_without_jitter(1),
            Duration::from_millis(100)
        );
        assert_eq!(
            backoff.delay_without_jitter(3),
            Duration::from_millis(400)
        );
        assert_eq!(backoff.delay_without_jitter(10), Duration::from_secs(1));
    }

    #[test]
    fn jitter_stays_under_one_base() {
        let backoff = Backoff::new(Duration::from_millis(100), 2.0, Duration::from_secs(10));
        for _ in 0..100 {
            let d = backoff.delay(2);
            assert!(d >= Duration::from_millis(200));
            assert!(d < Duration::from_millis(300));
        }
    }

    #[test]
    fn zero_attempt_behaves_like_first() {
        let backoff = Backoff::new(Duration::from_millis(50), 3.0, Duration::from_secs(5));
        assert_eq!(
            backoff.delay_without_jitter(0),
            backoff.delay_without_jitter(1)
        );
    }
}
