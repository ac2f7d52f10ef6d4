use std::time::Duration;

use rand::Rng;

use crate::cfg::BackoffConfig;

/// Exponential retry delays, doubling from `base` up to `cap`. Up to 10% jitter is added to each delay, but never
/// beyond `cap`.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    failures: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Backoff {
            config,
            failures: 0,
        }
    }

    /// The delay before the next retry, without jitter.
    pub fn current(&self) -> Duration {
        let factor = 1u32.checked_shl(self.failures).unwrap_or(u32::MAX);
        self.config
            .base
            .checked_mul(factor)
            .map_or(self.config.cap, |d| d.min(self.config.cap))
    }

    /// Records a failure and returns how long to wait before trying again.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current();
        self.failures = self.failures.saturating_add(1);
        let jitter_ceiling = delay.as_millis() as u64 / 10;
        if jitter_ceiling == 0 {
            return delay;
        }
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ceiling));
        (delay + jitter).min(self.config.cap.max(delay))
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }
}
