//! Consecutive-failure circuit breaker.
//!
//! # State Machine
//!
//! ```text
//! CLOSED → OPEN          (consecutive failures >= failure_threshold)
//! OPEN → HALF_OPEN       (recovery_timeout elapsed)
//! HALF_OPEN → CLOSED     (success_threshold consecutive trial successes)
//! HALF_OPEN → OPEN       (any trial failure)
//! ```
//!
//! In `HALF_OPEN` at most `half_open_max_attempts` calls are admitted. Every
//! counter and transition lives behind one `tokio::sync::Mutex` per breaker,
//! so instances never share state and the lock is never held across the
//! guarded call itself.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::{ErrorKind, Result, VegaError};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    /// Calls flow normally.
    Closed,
    /// Calls are rejected.
    Open,
    /// A limited number of trial calls are admitted.
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_ms() -> u64 {
    30_000
}

fn default_half_open_max_attempts() -> u32 {
    3
}

fn default_success_threshold() -> u32 {
    2
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Time spent `OPEN` before trial calls are admitted.
    #[serde(default = "default_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,
    /// Trial calls admitted per `HALF_OPEN` round.
    #[serde(default = "default_half_open_max_attempts")]
    pub half_open_max_attempts: u32,
    /// Consecutive trial successes that close the circuit. Clamped to
    /// `half_open_max_attempts`.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_ms: default_recovery_timeout_ms(),
            half_open_max_attempts: default_half_open_max_attempts(),
            success_threshold: default_success_threshold(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }

    fn normalized(mut self) -> Self {
        self.failure_threshold = self.failure_threshold.max(1);
        self.half_open_max_attempts = self.half_open_max_attempts.max(1);
        self.success_threshold = self.success_threshold.clamp(1, self.half_open_max_attempts);
        self
    }
}

/// Point-in-time view of a breaker, for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub half_open_attempts: u32,
    pub total_calls: u64,
    pub total_failures: u64,
    pub rejected_calls: u64,
    pub state_transitions: u64,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    opened_at_wall: Option<DateTime<Utc>>,
    half_open_since: Option<Instant>,
    half_open_attempts: u32,
    half_open_successes: u32,
    total_calls: u64,
    total_failures: u64,
    rejected_calls: u64,
    state_transitions: u64,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            opened_at_wall: None,
            half_open_since: None,
            half_open_attempts: 0,
            half_open_successes: 0,
            total_calls: 0,
            total_failures: 0,
            rejected_calls: 0,
            state_transitions: 0,
        }
    }
}

/// Circuit breaker guarding one external dependency.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config: config.normalized(),
            inner: Mutex::new(Inner::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state, applying a due `OPEN → HALF_OPEN` transition.
    pub async fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock().await;
        self.refresh(&mut inner, Instant::now());
        inner.state
    }

    /// Ask permission for one call.
    ///
    /// Returns [`VegaError::CircuitOpen`] without waiting when the circuit
    /// is open or the half-open trial budget is spent. Every admitted call
    /// must be followed by [`record_success`](Self::record_success) or
    /// [`record_failure`](Self::record_failure).
    pub async fn try_acquire(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        self.refresh(&mut inner, now);

        let admitted = match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => false,
            BreakerState::HalfOpen => {
                if inner.half_open_attempts < self.config.half_open_max_attempts {
                    inner.half_open_attempts += 1;
                    true
                } else {
                    false
                }
            }
        };

        if admitted {
            inner.total_calls += 1;
            Ok(())
        } else {
            inner.rejected_calls += 1;
            Err(VegaError::CircuitOpen {
                name: self.name.clone(),
            })
        }
    }

    pub async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        match inner.state {
            BreakerState::Closed => inner.consecutive_failures = 0,
            BreakerState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.success_threshold {
                    self.transition(&mut inner, BreakerState::Closed, Instant::now());
                }
            }
            // A call admitted before the circuit opened finished late.
            BreakerState::Open => {}
        }
    }

    pub async fn record_failure(&self) {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        inner.total_failures += 1;
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    self.transition(&mut inner, BreakerState::Open, now);
                }
            }
            BreakerState::HalfOpen => self.transition(&mut inner, BreakerState::Open, now),
            BreakerState::Open => {}
        }
    }

    /// Run `f` through the breaker.
    ///
    /// Transient errors count as failures. Validation errors mean the
    /// dependency answered, so they count as successes and are returned
    /// unchanged.
    pub async fn call<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.try_acquire().await?;
        let result = f().await;
        match &result {
            Err(e) if e.kind() == ErrorKind::Transient => self.record_failure().await,
            _ => self.record_success().await,
        }
        result
    }

    /// Force the circuit open, e.g. after an authentication failure.
    pub async fn trip(&self) {
        let mut inner = self.inner.lock().await;
        self.transition(&mut inner, BreakerState::Open, Instant::now());
    }

    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        self.transition(&mut inner, BreakerState::Closed, Instant::now());
    }

    pub async fn snapshot(&self) -> BreakerSnapshot {
        let mut inner = self.inner.lock().await;
        self.refresh(&mut inner, Instant::now());
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            opened_at: inner.opened_at_wall,
            half_open_attempts: inner.half_open_attempts,
            total_calls: inner.total_calls,
            total_failures: inner.total_failures,
            rejected_calls: inner.rejected_calls,
            state_transitions: inner.state_transitions,
        }
    }

    fn refresh(&self, inner: &mut Inner, now: Instant) {
        let recovery = self.config.recovery_timeout();
        match inner.state {
            BreakerState::Open => {
                let due = inner
                    .opened_at
                    .is_none_or(|at| now.duration_since(at) >= recovery);
                if due {
                    self.transition(inner, BreakerState::HalfOpen, now);
                }
            }
            BreakerState::HalfOpen => {
                // Trial callers that never reported back must not wedge the
                // breaker: start a fresh round after another recovery period.
                let spent = inner.half_open_attempts >= self.config.half_open_max_attempts;
                let stale = inner
                    .half_open_since
                    .is_some_and(|at| now.duration_since(at) >= recovery);
                if spent && stale {
                    inner.half_open_since = Some(now);
                    inner.half_open_attempts = 0;
                    inner.half_open_successes = 0;
                }
            }
            BreakerState::Closed => {}
        }
    }

    fn transition(&self, inner: &mut Inner, to: BreakerState, now: Instant) {
        let from = inner.state;
        inner.state = to;
        inner.state_transitions += 1;
        inner.half_open_attempts = 0;
        inner.half_open_successes = 0;
        match to {
            BreakerState::Open => {
                inner.opened_at = Some(now);
                inner.opened_at_wall = Some(Utc::now());
                inner.half_open_since = None;
                warn!(
                    "[breaker-{}] {from} -> OPEN after {} consecutive failures",
                    self.name, inner.consecutive_failures
                );
            }
            BreakerState::HalfOpen => {
                inner.half_open_since = Some(now);
                info!("[breaker-{}] {from} -> HALF_OPEN", self.name);
            }
            BreakerState::Closed => {
                inner.consecutive_failures = 0;
                inner.opened_at = None;
                inner.opened_at_wall = None;
                inner.half_open_since = None;
                info!("[breaker-{}] {from} -> CLOSED", self.name);
            }
        }
    }
}
