//! Reconnect delays: exponential growth, capped, with jitter.
use std::time::Duration;

use rand::Rng;

use crate::config::BackoffConfig;

#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Delay before the next retry, or `None` once retries are exhausted.
    ///
    /// The delay is drawn uniformly from the upper half of the current
    /// ceiling so that clients dropped together do not return together.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.config.max_retries {
            return None;
        }
        let ceiling = self.ceiling(self.attempt);
        self.attempt += 1;

        let ceiling_ms = ceiling.as_millis() as u64;
        let half = ceiling_ms / 2;
        let jittered = half + rand::rng().random_range(0..=ceiling_ms - half);
        Some(Duration::from_millis(jittered))
    }

    /// Upper bound of the delay for a given attempt
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = self.config.multiplier.max(1.0).powi(attempt as i32);
        let ms = self.config.initial.as_millis() as f64 * factor;
        let max_ms = self.config.max.as_millis() as f64;
        Duration::from_millis(ms.min(max_ms) as u64)
    }

    /// Forget past failures after a successful connection
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}
