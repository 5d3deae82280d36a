//! Instrument metadata as served by the registry.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::enums::InstrumentType;

fn default_active() -> bool {
    true
}

/// Static description of a tradable instrument, keyed by token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentMeta {
    pub instrument_token: u32,
    #[serde(alias = "tradingsymbol")]
    pub trading_symbol: String,
    pub instrument_type: InstrumentType,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub strike: Option<f64>,
    #[serde(default)]
    pub expiry: Option<NaiveDate>,
    /// Token whose ticks provide the spot price for this option.
    #[serde(default)]
    pub underlying_token: Option<u32>,
    #[serde(default)]
    pub exchange: Option<String>,
}

impl InstrumentMeta {
    pub fn is_option(&self) -> bool {
        self.instrument_type.is_option()
    }
}
