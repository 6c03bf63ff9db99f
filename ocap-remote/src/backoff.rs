//! Reconnection delay computation.
//!
//! The scheduler holds no per-peer state. Callers pass the peer's current
//! attempt count and a random source, so every peer shares one scheduler.

use std::time::Duration;

use ocap_core::RandomProvider;

use crate::BackoffConfig;

/// Exponent cap. `base * 2^MAX_EXPONENT` already exceeds any sane `max_delay`.
const MAX_EXPONENT: u32 = 30;

/// Exponential backoff with multiplicative jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffScheduler {
    base: Duration,
    max: Duration,
    jitter: f64,
}

impl BackoffScheduler {
    /// Build a scheduler from validated configuration.
    pub fn new(config: &BackoffConfig) -> Self {
        Self {
            base: config.base_delay,
            max: config.max_delay,
            jitter: config.jitter.clamp(0.0, 1.0),
        }
    }

    /// Un-jittered delay for `attempt`: `min(max, base * 2^attempt)`.
    ///
    /// Non-decreasing in `attempt` and never overflows.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(MAX_EXPONENT);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Jittered delay for `attempt`, uniform in
    /// `[nominal * (1 - jitter), nominal * (1 + jitter)]` and never above
    /// `max_delay`.
    pub fn next_delay<R: RandomProvider>(&self, attempt: u32, random: &R) -> Duration {
        let nominal = self.nominal_delay(attempt);
        if self.jitter == 0.0 {
            return nominal;
        }
        let factor = 1.0 - self.jitter + 2.0 * self.jitter * random.random_ratio();
        Duration::try_from_secs_f64(nominal.as_secs_f64() * factor)
            .unwrap_or(nominal)
            .min(self.max)
    }
}

impl Default for BackoffScheduler {
    fn default() -> Self {
        Self::new(&BackoffConfig::default())
    }
}
