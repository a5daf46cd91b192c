use std::time::Duration;

use rand::Rng;

/// Exponential backoff with factor 2 and optional jitter.
///
/// Each call to [`Backoff::next_delay`] doubles the base delay up to `max`.
/// With jitter the returned delay is drawn uniformly from `[min, base]`.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    jitter: bool,
    attempt: u32,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
            jitter: true,
            attempt: 0,
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Cap both bounds at one second.
    pub fn clamped_for_dev(mut self) -> Self {
        let cap = Duration::from_secs(1);
        self.min = self.min.min(cap);
        self.max = self.max.min(cap);
        self
    }

    pub fn next_delay(&mut self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        let base = self.min.saturating_mul(factor).min(self.max);
        if self.jitter && base > self.min {
            rand::thread_rng().gen_range(self.min..=base)
        } else {
            base
        }
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
