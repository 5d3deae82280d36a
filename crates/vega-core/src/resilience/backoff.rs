//! Exponential backoff schedules.
//!
//! [`Backoff`] drives reconnect loops (bounded attempts, bounded delay,
//! optional jitter). [`retry_delay`] is the closed-form `min(base^n, cap)`
//! used to schedule order task retries.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

fn default_initial_ms() -> u64 {
    100
}

fn default_max_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_attempts() -> u32 {
    10
}

fn default_jitter() -> f64 {
    0.2
}

/// Parameters of an exponential backoff schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_initial_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Attempts allowed before [`Backoff::next_delay`] gives up.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Fraction of each delay that is randomized away (0.0 to 1.0).
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_ms(),
            max_delay_ms: default_max_ms(),
            multiplier: default_multiplier(),
            max_attempts: default_max_attempts(),
            jitter: default_jitter(),
        }
    }
}

/// Stateful backoff iterator.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Delay before the next attempt, or `None` once `max_attempts` delays
    /// have been handed out.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.config.max_attempts {
            return None;
        }
        let delay = self.delay_for(self.attempt);
        self.attempt += 1;
        Some(delay)
    }

    /// Deterministic part of the delay for `attempt` (zero-based), capped.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = self
            .config
            .multiplier
            .max(1.0)
            .powi(i32::try_from(attempt).unwrap_or(i32::MAX));
        let ms = (self.config.initial_delay_ms as f64 * exp).min(self.config.max_delay_ms as f64);
        Duration::from_millis(ms as u64)
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let jitter = self.config.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || base.is_zero() {
            return base;
        }
        let factor = 1.0 - jitter * rand::rng().random_range(0.0..1.0);
        base.mul_f64(factor)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn exhausted(&self) -> bool {
        self.attempt >= self.config.max_attempts
    }
}

/// Retry delay after `attempts` failed executions: `min(base^attempts, cap)`
/// seconds.
pub fn retry_delay(base_secs: f64, attempts: u32, cap: Duration) -> Duration {
    let secs = base_secs
        .max(1.0)
        .powi(i32::try_from(attempts).unwrap_or(i32::MAX));
    if !secs.is_finite() || secs >= cap.as_secs_f64() {
        return cap;
    }
    Duration::from_secs_f64(secs)
}
