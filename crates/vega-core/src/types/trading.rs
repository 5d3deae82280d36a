//! Trading-related data structures: order parameters, tasks and results.
//!
//! These types flow from the inbound API into the order executor and on to
//! the brokerage session.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::{Direction, OrderOperation, OrderType, TaskStatus};
use crate::error::{Result, VegaError};

/// Configured account identifier.
pub type AccountId = String;

fn default_variety() -> String {
    "regular".to_string()
}

// ---------------------------------------------------------------------------
// Order parameters (API layer → executor)
// ---------------------------------------------------------------------------

/// Parameters of a place, modify or cancel request.
///
/// Which fields are required depends on the [`OrderOperation`]; see
/// [`OrderParams::validate`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderParams {
    /// Order variety path segment (`regular`, `amo`, `co`, `iceberg`).
    #[serde(default = "default_variety")]
    pub variety: String,
    #[serde(default)]
    pub exchange: String,
    #[serde(default)]
    pub trading_symbol: String,
    pub transaction_type: Option<Direction>,
    pub quantity: Option<u32>,
    pub order_type: Option<OrderType>,
    /// Margin product (`CNC`, `MIS`, `NRML`).
    pub product: Option<String>,
    pub price: Option<f64>,
    pub trigger_price: Option<f64>,
    pub validity: Option<String>,
    /// Broker order id, required for modify and cancel.
    pub order_id: Option<String>,
    pub tag: Option<String>,
}

impl OrderParams {
    /// Reject parameters that can never succeed for `operation`.
    pub fn validate(&self, operation: OrderOperation) -> Result<()> {
        match operation {
            OrderOperation::Place => {
                if self.exchange.is_empty() || self.trading_symbol.is_empty() {
                    return Err(VegaError::Validation(
                        "exchange and trading_symbol are required".into(),
                    ));
                }
                if self.transaction_type.is_none() {
                    return Err(VegaError::Validation("transaction_type is required".into()));
                }
                match self.quantity {
                    Some(q) if q > 0 => {}
                    _ => return Err(VegaError::Validation("quantity must be positive".into())),
                }
                let order_type = self
                    .order_type
                    .ok_or_else(|| VegaError::Validation("order_type is required".into()))?;
                self.validate_prices(order_type)
            }
            OrderOperation::Modify => {
                self.require_order_id()?;
                if self.quantity.is_none()
                    && self.price.is_none()
                    && self.trigger_price.is_none()
                    && self.order_type.is_none()
                {
                    return Err(VegaError::Validation("modify changes nothing".into()));
                }
                if self.quantity == Some(0) {
                    return Err(VegaError::Validation("quantity must be positive".into()));
                }
                match self.order_type {
                    Some(t) => self.validate_prices(t),
                    None => Ok(()),
                }
            }
            OrderOperation::Cancel => self.require_order_id(),
        }
    }

    fn validate_prices(&self, order_type: OrderType) -> Result<()> {
        let positive = |v: Option<f64>| v.is_some_and(|p| p.is_finite() && p > 0.0);
        match order_type {
            OrderType::Limit if !positive(self.price) => {
                Err(VegaError::Validation("LIMIT order needs a positive price".into()))
            }
            OrderType::StopLoss if !positive(self.price) || !positive(self.trigger_price) => Err(
                VegaError::Validation("SL order needs price and trigger_price".into()),
            ),
            OrderType::StopLossMarket if !positive(self.trigger_price) => {
                Err(VegaError::Validation("SL-M order needs trigger_price".into()))
            }
            _ => Ok(()),
        }
    }

    fn require_order_id(&self) -> Result<()> {
        match self.order_id.as_deref() {
            Some(id) if !id.is_empty() => Ok(()),
            _ => Err(VegaError::Validation("order_id is required".into())),
        }
    }
}

/// Broker acknowledgement of a successful order call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
}

// ---------------------------------------------------------------------------
// Order task (executor bookkeeping)
// ---------------------------------------------------------------------------

/// One submitted order operation and its execution state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderTask {
    pub task_id: Uuid,
    pub idempotency_key: String,
    pub operation: OrderOperation,
    pub params: OrderParams,
    pub account_id: AccountId,
    pub status: TaskStatus,
    /// Number of execution attempts started so far.
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Earliest time a `RETRYING` task may run again.
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub result: Option<OrderAck>,
}

impl OrderTask {
    pub fn new(
        idempotency_key: String,
        operation: OrderOperation,
        params: OrderParams,
        account_id: AccountId,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            idempotency_key,
            operation,
            params,
            account_id,
            status: TaskStatus::Pending,
            attempts: 0,
            created_at: now,
            updated_at: now,
            next_attempt_at: None,
            last_error: None,
            result: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Historical data
// ---------------------------------------------------------------------------

/// Candle range request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalRequest {
    pub instrument_token: u32,
    /// Candle width (`minute`, `5minute`, `day`, ...).
    pub interval: String,
    pub from: NaiveDateTime,
    pub to: NaiveDateTime,
    #[serde(default)]
    pub continuous: bool,
    #[serde(default)]
    pub oi: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
    pub oi: Option<u64>,
}
