//! Interfaces to external collaborators.
//!
//! The runtime never reaches for a concrete registry, pricing library or
//! persistence layer; it is handed implementations of these traits at
//! construction time.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::types::{Greeks, InstrumentMeta, OptionKind, OrderTask};

// ---------------------------------------------------------------------------
// Instrument metadata
// ---------------------------------------------------------------------------

/// Lookup of static instrument data by token.
///
/// Called once per tick on the pipeline task, so implementations are expected
/// to answer from memory.
pub trait InstrumentRegistry: Send + Sync {
    fn fetch_metadata(&self, instrument_token: u32) -> Option<Arc<InstrumentMeta>>;
}

// ---------------------------------------------------------------------------
// Greeks
// ---------------------------------------------------------------------------

/// Inputs of one option valuation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GreeksInput {
    pub market_price: f64,
    pub spot: f64,
    pub strike: f64,
    pub expiry: DateTime<Utc>,
    pub valuation_time: DateTime<Utc>,
    pub kind: OptionKind,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum GreeksError {
    #[error("contract has no time to expiry")]
    Expired,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("implied volatility did not converge after {iterations} iterations")]
    NoConvergence { iterations: u32 },

    #[error("no implied volatility reproduces price {price}")]
    NoSolution { price: f64 },
}

/// CPU-bound option pricing. Must be a pure function of its input.
pub trait GreeksCalculator: Send + Sync {
    fn compute(&self, input: &GreeksInput) -> Result<Greeks, GreeksError>;
}

// ---------------------------------------------------------------------------
// Status persistence
// ---------------------------------------------------------------------------

/// Subscription state reported back to the subscription store.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Failed(String),
    CapacityRejected,
    Removed,
}

/// Sink for status transitions the persistence layer wants to record.
///
/// Called outside of every internal lock. Implementations must not block.
pub trait StatusReporter: Send + Sync {
    fn subscription_status(&self, account_id: &str, instrument_token: u32, status: &SubscriptionStatus);

    fn task_transition(&self, task: &OrderTask);
}

/// Reporter that only logs, for deployments without a store.
pub struct LogReporter;

impl StatusReporter for LogReporter {
    fn subscription_status(&self, account_id: &str, instrument_token: u32, status: &SubscriptionStatus) {
        debug!("[status] {account_id}/{instrument_token}: {status:?}");
    }

    fn task_transition(&self, task: &OrderTask) {
        debug!(
            "[status] task {} ({}) -> {} after {} attempt(s)",
            task.task_id, task.idempotency_key, task.status, task.attempts
        );
    }
}
