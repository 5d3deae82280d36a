//! Second pipeline stage: turn validated ticks into snapshots.
//!
//! Underlying ticks feed the spot cache. Option ticks are paired with the
//! cached spot of their underlying and handed back as Greeks work; the
//! pricing itself happens on the worker pool, never here.

use ahash::AHashMap;
use chrono::{DateTime, Utc};
use vega_core::ports::GreeksInput;
use vega_core::time_util::MarketHours;
use vega_core::types::{GreeksOutcome, OptionSnapshot, QuoteSnapshot, Snapshot};

use super::validator::ValidTick;

/// Result of enriching one tick.
#[derive(Debug)]
pub enum Enriched {
    /// Nothing left to compute.
    Ready(Snapshot),
    /// Option snapshot waiting for its Greeks. The placeholder outcome is
    /// replaced once the worker answers.
    NeedsGreeks {
        snapshot: OptionSnapshot,
        input: GreeksInput,
    },
}

pub struct Enricher {
    spot: AHashMap<u32, f64>,
    default_underlying: Option<u32>,
    market: MarketHours,
    session_open: Option<bool>,
}

impl Enricher {
    pub fn new(market: MarketHours, default_underlying: Option<u32>) -> Self {
        Self {
            spot: AHashMap::new(),
            default_underlying,
            market,
            session_open: None,
        }
    }

    pub fn spot(&self, token: u32) -> Option<f64> {
        self.spot.get(&token).copied()
    }

    /// Track the session state. On an open/close transition the spot cache
    /// is dropped and `true` is returned so the caller can reset whatever
    /// else is per-session.
    pub fn observe_boundary(&mut self, now: DateTime<Utc>) -> bool {
        let open = self.market.is_open(now);
        let crossed = matches!(self.session_open, Some(prev) if prev != open);
        self.session_open = Some(open);
        if crossed {
            self.spot.clear();
        }
        crossed
    }

    pub fn enrich(&mut self, valid: ValidTick) -> Enriched {
        let ValidTick {
            tick,
            meta,
            last_price,
            timestamp_ms,
        } = valid;

        let quote = QuoteSnapshot {
            instrument_token: tick.instrument_token,
            trading_symbol: meta.trading_symbol.clone(),
            last_price,
            volume: tick.volume,
            oi: tick.oi,
            bid: tick.best_bid(),
            ask: tick.best_ask(),
            depth: tick.depth,
            timestamp_ms,
        };

        // The validator guarantees strike and expiry on options.
        let (kind, strike, expiry) =
            match (meta.instrument_type.option_kind(), meta.strike, meta.expiry) {
                (Some(kind), Some(strike), Some(expiry)) => (kind, strike, expiry),
                _ => {
                    if last_price > 0.0 {
                        self.spot.insert(tick.instrument_token, last_price);
                    }
                    return Enriched::Ready(Snapshot::Underlying(quote));
                }
            };

        let spot = meta
            .underlying_token
            .or(self.default_underlying)
            .and_then(|u| self.spot(u));
        let mut snapshot = OptionSnapshot {
            quote,
            strike,
            expiry,
            option_kind: kind,
            underlying_price: spot,
            greeks: GreeksOutcome::unavailable("no_spot"),
        };
        let Some(spot) = spot else {
            return Enriched::Ready(Snapshot::Option(snapshot));
        };

        let valuation_time = DateTime::from_timestamp_millis(timestamp_ms).unwrap_or_else(Utc::now);
        let input = GreeksInput {
            market_price: last_price,
            spot,
            strike,
            expiry: self.market.expiry_instant(expiry),
            valuation_time,
            kind,
        };
        snapshot.greeks = GreeksOutcome::unavailable("pending");
        Enriched::NeedsGreeks { snapshot, input }
    }
}
