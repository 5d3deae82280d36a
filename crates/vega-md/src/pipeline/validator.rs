//! First pipeline stage: reject ticks that cannot be published.

use std::sync::Arc;

use vega_core::monotonic::TimestampGuard;
use vega_core::ports::InstrumentRegistry;
use vega_core::types::{InstrumentMeta, RawTick};

/// Why a tick was dropped. The discriminant indexes the stats counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    MissingPrice = 0,
    InvalidPrice = 1,
    UnknownInstrument = 2,
    InactiveInstrument = 3,
    /// Option without strike or expiry.
    IncompleteMetadata = 4,
    BadTimestamp = 5,
    StaleTimestamp = 6,
}

impl Rejection {
    pub const COUNT: usize = 7;

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingPrice => "missing_price",
            Self::InvalidPrice => "invalid_price",
            Self::UnknownInstrument => "unknown_instrument",
            Self::InactiveInstrument => "inactive_instrument",
            Self::IncompleteMetadata => "incomplete_metadata",
            Self::BadTimestamp => "bad_timestamp",
            Self::StaleTimestamp => "stale_timestamp",
        }
    }
}

/// A tick that passed validation, with its metadata attached.
#[derive(Debug, Clone)]
pub struct ValidTick {
    pub tick: RawTick,
    pub meta: Arc<InstrumentMeta>,
    pub last_price: f64,
    pub timestamp_ms: i64,
}

pub struct Validator {
    registry: Arc<dyn InstrumentRegistry>,
    guard: TimestampGuard,
    max_future_skew_ms: i64,
}

impl Validator {
    pub fn new(registry: Arc<dyn InstrumentRegistry>, max_future_skew_ms: i64) -> Self {
        Self {
            registry,
            guard: TimestampGuard::new(),
            max_future_skew_ms,
        }
    }

    /// Check one tick. A tick without an exchange timestamp is stamped with
    /// `received_at_ms`.
    pub fn validate(&mut self, tick: RawTick, received_at_ms: i64) -> Result<ValidTick, Rejection> {
        let last_price = match tick.last_price {
            None => return Err(Rejection::MissingPrice),
            Some(p) if !p.is_finite() || p < 0.0 => return Err(Rejection::InvalidPrice),
            Some(p) => p,
        };

        let meta = self
            .registry
            .fetch_metadata(tick.instrument_token)
            .ok_or(Rejection::UnknownInstrument)?;
        if !meta.is_active {
            return Err(Rejection::InactiveInstrument);
        }
        if meta.is_option() && (meta.strike.is_none() || meta.expiry.is_none()) {
            return Err(Rejection::IncompleteMetadata);
        }

        let timestamp_ms = tick.timestamp_ms.unwrap_or(received_at_ms);
        if timestamp_ms <= 0 || timestamp_ms > received_at_ms + self.max_future_skew_ms {
            return Err(Rejection::BadTimestamp);
        }
        if !self.guard.check_and_update(tick.instrument_token, timestamp_ms) {
            return Err(Rejection::StaleTimestamp);
        }

        Ok(ValidTick {
            tick,
            meta,
            last_price,
            timestamp_ms,
        })
    }

    /// Forget per-token ordering, e.g. at a session boundary.
    pub fn reset(&mut self) {
        self.guard.clear();
    }
}
