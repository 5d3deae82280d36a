//! # vega-runner
//!
//! Process assembly for the vega runtime: the per-account
//! [`orchestrator::AccountOrchestrator`] and the [`runtime::Runtime`] that
//! wires pools, pipeline and executor together and serves the inbound API.
//! The `vega-runner` binary builds a runtime from a JSON config file.

pub mod orchestrator;
pub mod runtime;

pub use orchestrator::{AccountHealth, AccountOrchestrator, AccountSlot};
pub use runtime::{AccountWiring, Runtime, RuntimeDeps, RuntimeState, SubscriptionReceipt};
