//! Typed error definitions for the vega runtime.
//!
//! [`VegaError`] carries the failure taxonomy shared by the ingestion and
//! execution paths. Callers branch on [`VegaError::kind`] rather than on
//! individual variants: transient errors are retried, capacity and validation
//! errors are surfaced immediately, fatal errors stop a subsystem from starting.

use std::time::Duration;

use thiserror::Error;

/// Convenience alias used by every component API.
pub type Result<T> = std::result::Result<T, VegaError>;

/// Coarse classification of a [`VegaError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Network timeout, rate limit, open breaker. Retried with backoff.
    Transient,
    /// Pool full or task store full. Rejected to the caller.
    Capacity,
    /// Malformed input or an explicit API rejection. Never retried.
    Validation,
    /// Missing credentials or an unavailable mandatory dependency.
    Fatal,
}

/// Domain-specific errors for the vega runtime.
#[derive(Debug, Error)]
pub enum VegaError {
    /// Configuration parsing or validation error.
    #[error("config error: {0}")]
    Config(String),

    /// WebSocket connection, handshake, or communication error.
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// HTTP or socket level failure talking to an external service.
    #[error("transport error: {0}")]
    Transport(String),

    /// Operation did not complete within its deadline.
    #[error("{operation} timed out after {elapsed:?}")]
    Timeout { operation: String, elapsed: Duration },

    /// No token available in the named rate-limit bucket.
    #[error("rate limited: {category}")]
    RateLimited { category: String },

    /// The named circuit breaker is short-circuiting calls.
    #[error("circuit breaker '{name}' is open")]
    CircuitOpen { name: String },

    /// Subscription or task capacity exhausted.
    #[error("capacity exceeded: {0}")]
    Capacity(String),

    /// Caller supplied invalid input.
    #[error("validation error: {0}")]
    Validation(String),

    /// The brokerage explicitly rejected the request.
    #[error("rejected by broker (status {status}): {message}")]
    Rejected { status: u16, message: String },

    /// Market data or response parsing error.
    #[error("parse error: {0}")]
    Parse(String),

    /// Message bus publish error.
    #[error("bus error: {0}")]
    Bus(String),

    /// Referenced account is not configured.
    #[error("unknown account: {0}")]
    UnknownAccount(String),

    /// Background task supervision is unavailable.
    #[error("supervisor error: {0}")]
    Supervisor(String),

    /// Component is stopping or already stopped.
    #[error("{0} is shut down")]
    Shutdown(String),
}

impl VegaError {
    /// Classify this error into the shared taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::WebSocket(_)
            | Self::Transport(_)
            | Self::Timeout { .. }
            | Self::RateLimited { .. }
            | Self::CircuitOpen { .. }
            | Self::Bus(_) => ErrorKind::Transient,
            Self::Capacity(_) => ErrorKind::Capacity,
            Self::Validation(_)
            | Self::Rejected { .. }
            | Self::Parse(_)
            | Self::UnknownAccount(_) => ErrorKind::Validation,
            Self::Config(_) | Self::Supervisor(_) | Self::Shutdown(_) => ErrorKind::Fatal,
        }
    }

    /// `true` when retrying the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    pub fn timeout(operation: impl Into<String>, elapsed: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy() {
        assert!(VegaError::timeout("place_order", Duration::from_secs(1)).is_retryable());
        assert!(VegaError::CircuitOpen { name: "acc1".into() }.is_retryable());
        assert!(VegaError::RateLimited { category: "orders".into() }.is_retryable());
        assert_eq!(VegaError::Capacity("pool".into()).kind(), ErrorKind::Capacity);
        assert_eq!(
            VegaError::Rejected { status: 400, message: "bad qty".into() }.kind(),
            ErrorKind::Validation
        );
        assert_eq!(VegaError::Config("no api key".into()).kind(), ErrorKind::Fatal);
    }

    #[test]
    fn display() {
        let e = VegaError::CircuitOpen { name: "bus".into() };
        assert_eq!(e.to_string(), "circuit breaker 'bus' is open");
    }
}
