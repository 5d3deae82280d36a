//! Failure isolation and admission control shared by the ingestion and
//! execution paths.

pub mod backoff;
pub mod circuit_breaker;
pub mod rate_limiter;

pub use backoff::{Backoff, BackoffConfig, retry_delay};
pub use circuit_breaker::{BreakerSnapshot, BreakerState, CircuitBreaker, CircuitBreakerConfig};
pub use rate_limiter::{DailyReset, RateLimitConfig, RateLimiter};
