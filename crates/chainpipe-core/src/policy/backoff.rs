//! Exponential backoff with random jitter.

use rand::Rng;
use std::time::Duration;

/// Configuration for [`Backoff`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub initial: Duration,
    /// Upper bound on any single delay, jitter included.
    pub max: Duration,
    /// Multiplier applied per attempt.
    pub multiplier: f64,
    /// Add ±`jitter * delay` random jitter (0.0 = no jitter).
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl BackoffConfig {
    /// Delay before the `attempt`-th retry (1-based). Never exceeds `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let base_ms = self.initial.as_millis() as f64 * self.multiplier.max(1.0).powi(exp);
        let cap_ms = self.max.as_millis() as f64;
        let capped = base_ms.min(cap_ms);

        let jittered = if self.jitter > 0.0 {
            let spread = capped * self.jitter.min(1.0);
            let offset = rand::thread_rng().gen_range(-spread..=spread);
            (capped + offset).clamp(0.0, cap_ms)
        } else {
            capped
        };
        Duration::from_millis(jittered as u64)
    }
}

/// Stateful attempt counter over a [`BackoffConfig`].
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Advance the counter and return the delay to wait.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        self.config.delay(self.attempt)
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> BackoffConfig {
        BackoffConfig {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.0,
        }
    }

    #[test]
    fn doubles_per_attempt() {
        let cfg = no_jitter();
        assert_eq!(cfg.delay(1).as_millis(), 100);
        assert_eq!(cfg.delay(2).as_millis(), 200);
        assert_eq!(cfg.delay(3).as_millis(), 400);
    }

    #[test]
    fn capped_at_max() {
        let cfg = BackoffConfig {
            max: Duration::from_millis(500),
            multiplier: 10.0,
            ..no_jitter()
        };
        assert_eq!(cfg.delay(5), Duration::from_millis(500));
        assert_eq!(cfg.delay(u32::MAX), Duration::from_millis(500));
    }

    #[test]
    fn jitter_stays_in_bounds() {
        let cfg = BackoffConfig {
            jitter: 0.5,
            ..no_jitter()
        };
        for _ in 0..200 {
            let d = cfg.delay(2).as_millis();
            assert!((100..=300).contains(&d), "d={d}");
        }
    }

    #[test]
    fn stateful_counter_resets() {
        let mut b = Backoff::new(no_jitter());
        assert_eq!(b.next_delay().as_millis(), 100);
        assert_eq!(b.next_delay().as_millis(), 200);
        assert_eq!(b.attempt(), 2);
        b.reset();
        assert_eq!(b.next_delay().as_millis(), 100);
    }
}
