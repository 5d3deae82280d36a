//! Tick processing pipeline.
//!
//! # Architecture
//!
//! ```text
//! TickBatch ──► Validator ──► Enricher ──► GreeksPool ──► Batcher ──► Publisher ──► bus
//!  (handoff)     rejects       spot cache    OS threads     per category   breaker
//! ```
//!
//! Batches arrive from the connection sinks on one bounded queue and are
//! processed by a single ingest task, so per-connection arrival order is kept
//! all the way to the bus. The validator and enricher share one lock that is
//! released before waiting on Greeks results. A second task flushes batches
//! whose age trigger fired.

pub mod batcher;
pub mod enricher;
pub mod greeks;
pub mod publisher;
pub mod stats;
pub mod validator;
pub mod worker;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, warn};
use vega_core::bus::MessageBus;
use vega_core::config::PipelineSettings;
use vega_core::ports::{GreeksCalculator, InstrumentRegistry};
use vega_core::resilience::CircuitBreaker;
use vega_core::supervisor::TaskMonitor;
use vega_core::time_util::MarketHours;
use vega_core::types::{GreeksOutcome, GreeksStatus, OptionSnapshot, Snapshot, StreamCategory};
use vega_core::{Result, VegaError};

use crate::transport::TickBatch;
use batcher::{Admission, Batcher};
use enricher::{Enriched, Enricher};
use publisher::Publisher;
use stats::PipelineStats;
pub use stats::StatsSnapshot;
use validator::Validator;
use worker::{GreeksPool, GreeksTicket};

/// Collaborators the pipeline is wired with.
pub struct PipelineDeps {
    pub registry: Arc<dyn InstrumentRegistry>,
    pub calculator: Arc<dyn GreeksCalculator>,
    pub bus: Arc<dyn MessageBus>,
    /// Breaker shared by every publish to the bus.
    pub breaker: Arc<CircuitBreaker>,
}

struct Stage {
    validator: Validator,
    enricher: Enricher,
}

enum Work {
    Ready(Snapshot),
    Waiting(OptionSnapshot, GreeksTicket),
}

pub struct TickPipeline {
    settings: PipelineSettings,
    stage: Mutex<Stage>,
    greeks: GreeksPool,
    batcher: Batcher,
    publisher: Publisher,
    stats: Arc<PipelineStats>,
    inbound: Mutex<Option<mpsc::Receiver<TickBatch>>>,
}

impl TickPipeline {
    /// Build the pipeline around the receiving end of the tick handoff.
    pub fn new(
        settings: PipelineSettings,
        market: MarketHours,
        deps: PipelineDeps,
        inbound: mpsc::Receiver<TickBatch>,
    ) -> Result<Self> {
        let stats = Arc::new(PipelineStats::default());
        let greeks = GreeksPool::new(
            deps.calculator,
            settings.greeks_workers,
            settings.greeks_queue_capacity,
        )
        .map_err(|e| VegaError::Supervisor(format!("greeks workers: {e}")))?;
        let batcher = Batcher::new(
            settings.max_batch_size,
            settings.flush_interval(),
            settings.max_pending_per_category,
            stats.clone(),
        );
        let publisher = Publisher::new(
            deps.bus,
            deps.breaker,
            settings.publish_timeout(),
            stats.clone(),
        );
        let stage = Stage {
            validator: Validator::new(deps.registry, settings.max_future_skew_ms),
            enricher: Enricher::new(market, settings.default_underlying_token),
        };
        Ok(Self {
            settings,
            stage: Mutex::new(stage),
            greeks,
            batcher,
            publisher,
            stats,
            inbound: Mutex::new(Some(inbound)),
        })
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        self.publisher.breaker()
    }

    fn channel(&self, category: StreamCategory) -> &str {
        match category {
            StreamCategory::Underlying => &self.settings.underlying_channel,
            StreamCategory::Option => &self.settings.option_channel,
        }
    }

    /// Run one handoff batch through every stage.
    pub async fn process(&self, batch: TickBatch) {
        self.stats.received(batch.ticks.len() as u64);

        let mut work = Vec::with_capacity(batch.ticks.len());
        {
            let mut stage = self.stage.lock().await;
            if stage.enricher.observe_boundary(Utc::now()) {
                stage.validator.reset();
                self.stats.boundary_resets(1);
                info!("[pipeline] session boundary crossed, spot cache and ordering reset");
            }
            for tick in batch.ticks {
                let token = tick.instrument_token;
                match stage.validator.validate(tick, batch.received_at_ms) {
                    Ok(valid) => {
                        self.stats.accepted(1);
                        work.push(stage.enricher.enrich(valid));
                    }
                    Err(reason) => {
                        self.stats.reject(reason);
                        debug!(
                            "[pipeline] conn {} token {token} rejected: {}",
                            batch.connection_id,
                            reason.as_str()
                        );
                    }
                }
            }
        }

        // Submit everything first so the workers run in parallel, then
        // collect in arrival order.
        let work: Vec<Work> = work
            .into_iter()
            .map(|e| match e {
                Enriched::Ready(s) => Work::Ready(s),
                Enriched::NeedsGreeks {
                    mut snapshot,
                    input,
                } => match self.greeks.submit(input) {
                    Some(ticket) => Work::Waiting(snapshot, ticket),
                    None => {
                        snapshot.greeks = GreeksOutcome::unavailable("greeks_pool_saturated");
                        Work::Ready(Snapshot::Option(snapshot))
                    }
                },
            })
            .collect();

        for w in work {
            let snapshot = match w {
                Work::Ready(s) => s,
                Work::Waiting(mut o, ticket) => {
                    o.greeks = ticket.outcome().await;
                    Snapshot::Option(o)
                }
            };
            if let Snapshot::Option(o) = &snapshot {
                self.record_greeks(o);
            }
            self.enqueue(snapshot).await;
        }
    }

    fn record_greeks(&self, o: &OptionSnapshot) {
        match o.greeks.status {
            GreeksStatus::Computed => self.stats.greeks_computed(1),
            GreeksStatus::Failed => {
                self.stats.greeks_failed(1);
                debug!(
                    "[pipeline] greeks failed for {}: {}",
                    o.quote.trading_symbol,
                    o.greeks.error.as_deref().unwrap_or_default()
                );
            }
            GreeksStatus::Unavailable => self.stats.greeks_unavailable(1),
        }
    }

    async fn enqueue(&self, snapshot: Snapshot) {
        let category = snapshot.category();
        if let Admission::Queued { ready: true } = self.batcher.add(snapshot).await {
            self.flush(category, false).await;
        }
    }

    /// Publish the next due batch of `category`. Returns the number of
    /// snapshots published.
    pub async fn flush(&self, category: StreamCategory, force: bool) -> usize {
        let Some(ticket) = self.batcher.take_ready(category, force).await else {
            return 0;
        };
        let payload = match serde_json::to_vec(&ticket.snapshots()) {
            Ok(p) => p,
            Err(e) => {
                error!("[pipeline] dropping {} batch of {}: {e}", category.as_str(), ticket.len());
                self.batcher.complete(ticket, true).await;
                return 0;
            }
        };

        match self.publisher.publish(self.channel(category), &payload).await {
            Ok(()) => {
                let n = ticket.len();
                self.stats.published_batches(1);
                self.stats.published_snapshots(n as u64);
                self.batcher.complete(ticket, true).await;
                n
            }
            Err(e) => {
                self.stats.publish_failures(1);
                if !matches!(e, VegaError::CircuitOpen { .. }) {
                    warn!("[pipeline] {} batch of {} kept for retry: {e}", category.as_str(), ticket.len());
                }
                self.batcher.complete(ticket, false).await;
                0
            }
        }
    }

    /// Force out everything queued, stopping at the first failed publish.
    pub async fn flush_all(&self) -> usize {
        let mut total = 0;
        for category in StreamCategory::ALL {
            while self.batcher.pending(category).await > 0 {
                let n = self.flush(category, true).await;
                if n == 0 {
                    break;
                }
                total += n;
            }
        }
        total
    }

    /// Spawn the ingest and flush-timer tasks. Can only be called once.
    pub async fn start(self: &Arc<Self>, monitor: &TaskMonitor) -> Result<()> {
        let mut inbound = self
            .inbound
            .lock()
            .await
            .take()
            .ok_or_else(|| VegaError::Config("pipeline already started".into()))?;

        let pipeline = self.clone();
        let mut shutdown = monitor.shutdown_signal();
        monitor
            .spawn("pipeline-ingest", async move {
                loop {
                    tokio::select! {
                        batch = inbound.recv() => match batch {
                            Some(batch) => pipeline.process(batch).await,
                            None => break,
                        },
                        _ = shutdown.changed() => break,
                    }
                }
                // Drain what already arrived, then push out the remainder.
                while let Ok(batch) = inbound.try_recv() {
                    pipeline.process(batch).await;
                }
                let flushed = pipeline.flush_all().await;
                info!("[pipeline] ingest stopped, {flushed} snapshot(s) flushed on the way out");
                Ok(())
            })
            .await?;

        let pipeline = self.clone();
        let mut shutdown = monitor.shutdown_signal();
        let period = (self.settings.flush_interval() / 2).max(Duration::from_millis(1));
        monitor
            .spawn("pipeline-flush", async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            for category in StreamCategory::ALL {
                                pipeline.flush(category, false).await;
                            }
                        }
                        _ = shutdown.changed() => break,
                    }
                }
                Ok(())
            })
            .await?;

        info!(
            "[pipeline] started: {} greeks worker(s), batch {} / {:?}",
            self.greeks.workers(),
            self.settings.max_batch_size,
            self.settings.flush_interval()
        );
        Ok(())
    }
}
