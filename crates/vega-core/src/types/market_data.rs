//! Tick and snapshot structures flowing through the pipeline.
//!
//! [`RawTick`] is what a streaming connection decodes off the wire. After
//! validation and enrichment it becomes a [`Snapshot`], which is what gets
//! batched and published. None of these are persisted.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::enums::{OptionKind, StreamCategory};

/// One level of the order book.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DepthLevel {
    pub price: f64,
    pub quantity: u64,
    #[serde(default)]
    pub orders: u32,
}

/// Best bids and asks, best first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketDepth {
    #[serde(default)]
    pub buy: Vec<DepthLevel>,
    #[serde(default)]
    pub sell: Vec<DepthLevel>,
}

/// A single market data update as decoded from a streaming connection.
///
/// Every field except the token is optional: the amount of detail depends on
/// the subscription mode and the validator decides what is usable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawTick {
    pub instrument_token: u32,
    #[serde(default)]
    pub last_price: Option<f64>,
    #[serde(default, alias = "volume_traded")]
    pub volume: Option<u64>,
    #[serde(default)]
    pub oi: Option<u64>,
    #[serde(default)]
    pub bid: Option<f64>,
    #[serde(default)]
    pub ask: Option<f64>,
    #[serde(default)]
    pub depth: Option<MarketDepth>,
    /// Exchange timestamp, milliseconds since the Unix epoch.
    #[serde(default, alias = "timestamp")]
    pub timestamp_ms: Option<i64>,
}

impl RawTick {
    /// Explicit bid, falling back to the top of the buy side of the book.
    pub fn best_bid(&self) -> Option<f64> {
        self.bid
            .or_else(|| self.depth.as_ref().and_then(|d| d.buy.first()).map(|l| l.price))
    }

    /// Explicit ask, falling back to the top of the sell side of the book.
    pub fn best_ask(&self) -> Option<f64> {
        self.ask
            .or_else(|| self.depth.as_ref().and_then(|d| d.sell.first()).map(|l| l.price))
    }
}

/// Validated quote for any instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteSnapshot {
    pub instrument_token: u32,
    pub trading_symbol: String,
    pub last_price: f64,
    pub volume: Option<u64>,
    pub oi: Option<u64>,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depth: Option<MarketDepth>,
    pub timestamp_ms: i64,
}

/// Implied volatility and sensitivities for one option quote.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Greeks {
    pub iv: f64,
    pub delta: f64,
    pub gamma: f64,
    pub theta: f64,
    pub vega: f64,
}

/// Whether the Greeks fields of an [`OptionSnapshot`] can be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GreeksStatus {
    /// Computed from a fresh spot and the option's own price.
    Computed,
    /// The calculator rejected the inputs or panicked.
    Failed,
    /// Not attempted: no spot cached yet, or the worker pool was saturated.
    Unavailable,
}

/// Greeks outcome attached to an option snapshot.
///
/// Fields are `None` unless `status` is [`GreeksStatus::Computed`]; `error`
/// names the reason otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GreeksOutcome {
    #[serde(rename = "greeks_status")]
    pub status: GreeksStatus,
    #[serde(rename = "greeks_error", skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub iv: Option<f64>,
    pub delta: Option<f64>,
    pub gamma: Option<f64>,
    pub theta: Option<f64>,
    pub vega: Option<f64>,
}

impl GreeksOutcome {
    pub fn computed(g: Greeks) -> Self {
        Self {
            status: GreeksStatus::Computed,
            error: None,
            iv: Some(g.iv),
            delta: Some(g.delta),
            gamma: Some(g.gamma),
            theta: Some(g.theta),
            vega: Some(g.vega),
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self::degraded(GreeksStatus::Failed, reason)
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::degraded(GreeksStatus::Unavailable, reason)
    }

    fn degraded(status: GreeksStatus, reason: impl Into<String>) -> Self {
        Self {
            status,
            error: Some(reason.into()),
            iv: None,
            delta: None,
            gamma: None,
            theta: None,
            vega: None,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.status != GreeksStatus::Computed
    }
}

/// Option quote enriched with contract terms and Greeks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionSnapshot {
    #[serde(flatten)]
    pub quote: QuoteSnapshot,
    pub strike: f64,
    pub expiry: NaiveDate,
    pub option_kind: OptionKind,
    pub underlying_price: Option<f64>,
    #[serde(flatten)]
    pub greeks: GreeksOutcome,
}

/// Unit of output of the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "category", rename_all = "lowercase")]
pub enum Snapshot {
    Underlying(QuoteSnapshot),
    Option(OptionSnapshot),
}

impl Snapshot {
    pub fn category(&self) -> StreamCategory {
        match self {
            Self::Underlying(_) => StreamCategory::Underlying,
            Self::Option(_) => StreamCategory::Option,
        }
    }

    pub fn instrument_token(&self) -> u32 {
        match self {
            Self::Underlying(q) => q.instrument_token,
            Self::Option(o) => o.quote.instrument_token,
        }
    }
}
