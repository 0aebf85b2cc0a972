use rand::Rng;
use std::time::Duration;
use tracing::trace;

/// Delay policy between retries
pub trait Backoff: Send + Sync {
    /// Delay before retry number `attempt` (0-based)
    fn next_delay(&self, attempt: u32) -> Duration;

    /// Reset any internal state
    fn reset(&mut self);
}

/// Exponential backoff with jitter.
///
/// Retry `n` has a base of `initial * multiplier^n`, capped at `max`. Jitter
/// only pulls the delay down, by up to `jitter_factor` of the gap to the
/// previous base, so delays strictly increase for as long as the bases do.
/// The result never exceeds `max`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    jitter_factor: f64,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    pub fn with_jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor.clamp(0.0, 1.0);
        self
    }

    /// The capped delay before jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let nanos = self.initial.as_nanos() as f64 * self.multiplier.powi(exponent);
        if !nanos.is_finite() || nanos >= self.max.as_nanos() as f64 {
            return self.max;
        }
        Duration::from_nanos(nanos.round() as u64)
    }
}

impl Backoff for ExponentialBackoff {
    fn next_delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let previous = match attempt {
            0 => Duration::ZERO,
            n => self.base_delay(n - 1),
        };
        let gap = base.saturating_sub(previous);

        let delay = if self.jitter_factor > 0.0 && !gap.is_zero() {
            let pull = rand::thread_rng().gen_range(0.0..self.jitter_factor);
            base.saturating_sub(gap.mul_f64(pull))
                .max(previous + Duration::from_nanos(1))
        } else {
            base
        };

        trace!(
            attempt,
            base_ms = ?base.as_millis(),
            delay_ms = ?delay.as_millis(),
            "Backoff delay"
        );
        delay
    }

    fn reset(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_grow_and_respect_cap() {
        let max = Duration::from_secs(10);
        let backoff = ExponentialBackoff::new(Duration::from_millis(100), max).with_jitter(0.1);

        let delays: Vec<Duration> = (0..5).map(|attempt| backoff.next_delay(attempt)).collect();
        assert!(
            delays.windows(2).all(|w| w[0] < w[1]),
            "delays not increasing: {:?}",
            delays
        );

        assert!(backoff.next_delay(20) <= max);
        assert_eq!(backoff.base_delay(u32::MAX), max);
    }

    #[test]
    fn test_jitter_stays_within_band() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(30))
            .with_jitter(0.5);

        let delays: Vec<Duration> = (0..100).map(|_| backoff.next_delay(1)).collect();
        let unique: std::collections::HashSet<_> = delays.iter().collect();
        assert!(unique.len() > 1);

        // base 200ms, previous base 100ms
        for delay in delays {
            assert!(delay >= Duration::from_millis(150), "{:?}", delay);
            assert!(delay <= Duration::from_millis(200), "{:?}", delay);
        }
    }

    #[test]
    fn test_full_jitter_still_increases_up_to_cap() {
        let max = Duration::from_millis(800);
        let backoff = ExponentialBackoff::new(Duration::from_millis(100), max).with_jitter(1.0);

        for _ in 0..200 {
            // bases 100, 200, 400, 800 (the cap), 800
            let delays: Vec<Duration> = (0..4).map(|attempt| backoff.next_delay(attempt)).collect();
            assert!(
                delays.windows(2).all(|w| w[0] < w[1]),
                "delays not increasing: {:?}",
                delays
            );
            assert!(delays.iter().all(|d| *d <= max && !d.is_zero()));
        }

        // past the cap there is no gap left to jitter
        assert_eq!(backoff.next_delay(4), max);
        assert_eq!(backoff.next_delay(9), max);
    }

    #[test]
    fn test_zero_jitter_is_deterministic() {
        let backoff =
            ExponentialBackoff::new(Duration::from_millis(10), Duration::from_secs(1)).with_jitter(0.0);

        assert_eq!(backoff.next_delay(0), Duration::from_millis(10));
        assert_eq!(backoff.next_delay(3), Duration::from_millis(80));
        assert_eq!(backoff.next_delay(10), Duration::from_secs(1));
    }

    #[test]
    fn test_settings_are_clamped() {
        let backoff = ExponentialBackoff::new(Duration::from_secs(5), Duration::from_secs(1))
            .with_jitter(1.5)
            .with_multiplier(0.5);
        assert_eq!(backoff.jitter_factor, 1.0);
        assert_eq!(backoff.multiplier, 1.0);
        assert_eq!(backoff.max, Duration::from_secs(5));
    }
}
