//! Exponential backoff with jitter.

use rand::Rng;
use std::time::Duration;
use tokio_retry::strategy::ExponentialBackoff;

/// Retry schedule for one export batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Cap on any single delay.
    pub max_delay: Duration,
    /// Growth factor per retry. Values below 1 behave as 1.
    pub multiplier: u64,
    /// Total attempts per batch, the first one included. Zero behaves as one.
    pub max_attempts: u32,
    /// Randomizes each delay by +/- this fraction.
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            multiplier: 2,
            max_attempts: 4,
            jitter_factor: 0.25,
        }
    }
}

impl BackoffConfig {
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delays between attempts, one per retry.
    ///
    /// `ExponentialBackoff` yields `base^n * factor`, so the base is the
    /// multiplier and the factor scales the first delay to `initial_delay`.
    pub fn strategy(&self) -> impl Iterator<Item = Duration> {
        let base = self.multiplier.max(1);
        let initial_ms = u64::try_from(self.initial_delay.as_millis()).unwrap_or(u64::MAX);
        let jitter_factor = self.jitter_factor.clamp(0.0, 1.0);

        ExponentialBackoff::from_millis(base)
            .factor((initial_ms / base).max(1))
            .max_delay(self.max_delay)
            .map(move |delay| jitter(delay, jitter_factor))
            .take(self.attempts() as usize - 1)
    }
}

fn jitter(delay: Duration, factor: f64) -> Duration {
    if factor == 0.0 {
        return delay;
    }
    let scale = rand::thread_rng().gen_range(1.0 - factor..=1.0 + factor);
    delay.mul_f64(scale).max(Duration::from_micros(1))
}
