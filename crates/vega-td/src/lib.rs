//! # vega-td
//!
//! Order execution for the vega runtime.
//!
//! Each broker account is reached through a [`BrokerSession`], which provides
//! a uniform interface for order placement, modification, cancellation and
//! historical data. The [`executor::OrderExecutor`] never holds a session
//! itself: it borrows one per attempt through a [`lease::SessionProvider`],
//! which serializes calls per account and supplies the account's breaker.
//!
//! ## Modules
//!
//! | Module     | Purpose                                                   |
//! |------------|-----------------------------------------------------------|
//! | `executor` | task queue, workers, retries, dead letters                |
//! | `store`    | bounded task map with its idempotency index               |
//! | `lease`    | exclusive per-account session leases                      |
//! | `event`    | task status transitions for downstream consumers          |
//! | `rest`     | HTTP implementation of [`BrokerSession`]                  |

pub mod event;
pub mod executor;
pub mod lease;
pub mod rest;
pub mod store;

use async_trait::async_trait;
use vega_core::Result;
use vega_core::types::{Candle, HistoricalRequest, OrderAck, OrderOperation, OrderParams};

/// Authenticated brokerage session of one account.
///
/// All operations take `&self`; the lease layer decides how many calls may
/// be in flight per account.
#[async_trait]
pub trait BrokerSession: Send + Sync {
    fn account_id(&self) -> &str;

    /// Submit a new order. Returns the broker order id.
    async fn place_order(&self, params: &OrderParams) -> Result<OrderAck>;

    /// Change an open order identified by `params.order_id`.
    async fn modify_order(&self, params: &OrderParams) -> Result<OrderAck>;

    async fn cancel_order(&self, params: &OrderParams) -> Result<OrderAck>;

    async fn fetch_historical(&self, request: &HistoricalRequest) -> Result<Vec<Candle>>;
}

/// Route one order operation to the matching session call.
pub async fn dispatch(
    session: &dyn BrokerSession,
    operation: OrderOperation,
    params: &OrderParams,
) -> Result<OrderAck> {
    match operation {
        OrderOperation::Place => session.place_order(params).await,
        OrderOperation::Modify => session.modify_order(params).await,
        OrderOperation::Cancel => session.cancel_order(params).await,
    }
}
