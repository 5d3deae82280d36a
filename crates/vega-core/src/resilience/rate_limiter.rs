//! Token-bucket admission control per endpoint category.
//!
//! Each [`EndpointCategory`] gets its own bucket behind its own lock. Tokens
//! refill continuously at `refill_per_sec` up to `capacity`; on top of that
//! every bucket is topped up at a fixed exchange-local time of day, matching
//! the brokerage's daily quota reset. Categories without a configured bucket
//! are unlimited.

use std::time::Duration;

use ahash::AHashMap;
use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{Result, VegaError};
use crate::time_util;
use crate::types::EndpointCategory;

/// One bucket definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub category: EndpointCategory,
    /// Burst size and daily reset level.
    pub capacity: u32,
    /// Continuous refill rate.
    pub refill_per_sec: f64,
}

/// Fixed time of day at which every bucket is refilled to capacity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyReset {
    pub at: NaiveTime,
    #[serde(default)]
    pub utc_offset_minutes: i32,
}

#[derive(Debug)]
struct Bucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
    next_reset: Option<DateTime<Utc>>,
}

impl Bucket {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Apply the daily reset if its scheduled time has passed. Returns `true`
    /// when a reset happened.
    fn reset_if_due(&mut self, wall: DateTime<Utc>, schedule: Option<&DailyReset>) -> bool {
        let (Some(schedule), Some(due)) = (schedule, self.next_reset) else {
            return false;
        };
        if wall < due {
            return false;
        }
        self.tokens = self.capacity;
        self.next_reset = Some(time_util::next_daily(
            wall,
            schedule.at,
            schedule.utc_offset_minutes,
        ));
        true
    }

    /// Time until one token is available at the current refill rate.
    fn wait_for_token(&self) -> Option<Duration> {
        if self.refill_per_sec <= 0.0 {
            return None;
        }
        let missing = (1.0 - self.tokens).max(0.0);
        Some(Duration::from_secs_f64(missing / self.refill_per_sec))
    }
}

/// Shared rate limiter for every outbound call category.
#[derive(Debug)]
pub struct RateLimiter {
    buckets: AHashMap<EndpointCategory, Mutex<Bucket>>,
    daily_reset: Option<DailyReset>,
}

impl RateLimiter {
    pub fn new(configs: &[RateLimitConfig], daily_reset: Option<DailyReset>) -> Self {
        let now = Instant::now();
        let wall = Utc::now();
        let buckets = configs
            .iter()
            .map(|c| {
                let capacity = f64::from(c.capacity.max(1));
                let next_reset = daily_reset
                    .as_ref()
                    .map(|r| time_util::next_daily(wall, r.at, r.utc_offset_minutes));
                let bucket = Bucket {
                    capacity,
                    tokens: capacity,
                    refill_per_sec: c.refill_per_sec.max(0.0),
                    last_refill: now,
                    next_reset,
                };
                (c.category, Mutex::new(bucket))
            })
            .collect();
        Self {
            buckets,
            daily_reset,
        }
    }

    /// Limiter with no buckets: every acquire succeeds.
    pub fn unlimited() -> Self {
        Self::new(&[], None)
    }

    /// Take one token from `category`.
    ///
    /// With `wait = false` this fails fast with [`VegaError::RateLimited`].
    /// With `wait = true` it sleeps for refills until a token is taken or
    /// `timeout` would be exceeded. The bucket lock is released while
    /// sleeping.
    pub async fn acquire(
        &self,
        category: EndpointCategory,
        wait: bool,
        timeout: Duration,
    ) -> Result<()> {
        let Some(bucket) = self.buckets.get(&category) else {
            return Ok(());
        };
        // `None` waits without bound.
        let deadline = Instant::now().checked_add(timeout);

        loop {
            let wait_for = {
                let mut b = bucket.lock().await;
                let now = Instant::now();
                if b.reset_if_due(Utc::now(), self.daily_reset.as_ref()) {
                    info!("[rate-limiter] daily reset of '{category}' bucket");
                }
                b.refill(now);
                if b.tokens >= 1.0 {
                    b.tokens -= 1.0;
                    return Ok(());
                }
                b.wait_for_token()
            };

            let limited = || VegaError::RateLimited {
                category: category.to_string(),
            };
            if !wait {
                return Err(limited());
            }
            let Some(wait_for) = wait_for else {
                return Err(limited());
            };
            let past_deadline = match (deadline, Instant::now().checked_add(wait_for)) {
                (Some(deadline), Some(ready_at)) => ready_at > deadline,
                (Some(_), None) => true,
                (None, _) => false,
            };
            if past_deadline {
                debug!("[rate-limiter] '{category}' token not available within {timeout:?}");
                return Err(limited());
            }
            tokio::time::sleep(wait_for).await;
        }
    }

    /// Fail-fast acquire for latency-sensitive paths.
    pub async fn try_acquire(&self, category: EndpointCategory) -> Result<()> {
        self.acquire(category, false, Duration::ZERO).await
    }

    /// Tokens currently available, or `None` for an unlimited category.
    pub async fn available(&self, category: EndpointCategory) -> Option<f64> {
        let bucket = self.buckets.get(&category)?;
        let mut b = bucket.lock().await;
        b.refill(Instant::now());
        Some(b.tokens)
    }

    /// Refill every bucket to capacity.
    pub async fn reset_all(&self) {
        for bucket in self.buckets.values() {
            let mut b = bucket.lock().await;
            b.tokens = b.capacity;
            b.last_refill = Instant::now();
        }
    }
}
