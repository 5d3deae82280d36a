//! # vega-core
//!
//! Core crate for the vega market-data and order runtime, providing:
//!
//! - **Types** (`types`): enums, ticks and snapshots, order tasks, instrument metadata
//! - **Configuration** (`config`): JSON config deserialization and validation
//! - **Error types** (`error`): `VegaError` via thiserror, classified by `ErrorKind`
//! - **Resilience** (`resilience`): circuit breaker, token-bucket rate limiter, backoff
//! - **Supervision** (`supervisor`): task monitor with shutdown signalling
//! - **Message bus** (`bus`, `udp`): broadcast and UDP publishers
//! - **Ports** (`ports`): instrument registry, Greeks calculator and status reporter traits
//! - **WebSocket** (`ws`): WS client with auto-reconnect
//! - **Monotonic guard** (`monotonic`): per-instrument timestamp ordering
//! - **Time utilities** (`time_util`): market hours, daily boundaries, year fractions
//! - **Logging** (`logging`): tracing-based structured logging

pub mod bus;
pub mod config;
pub mod error;
pub mod logging;
pub mod monotonic;
pub mod ports;
pub mod resilience;
pub mod supervisor;
pub mod time_util;
pub mod types;
pub mod udp;
pub mod ws;

pub use error::{ErrorKind, Result, VegaError};
// Re-export types at crate root for convenience.
pub use types::*;
