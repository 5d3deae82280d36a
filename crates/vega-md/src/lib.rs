//! # vega-md
//!
//! Market data ingestion for the vega runtime.
//!
//! ## Architecture
//!
//! Each broker account owns a [`pool::ConnectionPool`] that spreads its
//! instrument subscriptions over a bounded number of streaming connections.
//! Every connection decodes frames on its own task and hands ticks to the
//! shared [`pipeline::TickPipeline`] through a bounded, non-blocking queue.
//! The pipeline validates, enriches, batches and publishes them to the bus.
//!
//! ## Modules
//!
//! - [`pool`]: per-account connection pool, subscription planning, health checks
//! - [`transport`]: connector/connection traits and the tick handoff queue
//! - [`ws_ticker`]: WebSocket implementation of the transport
//! - [`codec`]: JSON tick frames and control messages
//! - [`pipeline`]: validator, enricher, Greeks workers, batcher, publisher
//! - [`registry`]: instrument metadata loaded from a JSON file

pub mod codec;
pub mod pipeline;
pub mod pool;
pub mod registry;
pub mod transport;
pub mod ws_ticker;

pub use pipeline::{PipelineDeps, TickPipeline};
pub use pool::{ConnectionPool, PoolDeps, PoolLimits};
pub use transport::{TickBatch, TickSink, TickerConnection, TickerConnector};
