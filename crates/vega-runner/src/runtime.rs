//! Composition root and inbound interface.
//!
//! [`Runtime`] owns the task monitor, the account orchestrator, the tick
//! pipeline and the order executor, and wires them through narrow handles:
//! pools push ticks into the pipeline's hand-off queue, the executor borrows
//! sessions from the orchestrator. The runtime itself only keeps the
//! subscription target table and routes inbound calls.
//!
//! # Subscription targets
//!
//! A target is `(token, mode)` plus an optional pinned account. Unpinned
//! targets are assigned to an account once, round-robin over the accounts
//! whose breaker is closed, and stay there until deleted or rejected for
//! capacity. [`Runtime::reconcile`] converges every pool to its share of the
//! table; it runs at startup and then periodically.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use ahash::AHashMap;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vega_core::bus::MessageBus;
use vega_core::config::AppConfig;
use vega_core::ports::{GreeksCalculator, InstrumentRegistry, StatusReporter, SubscriptionStatus};
use vega_core::resilience::{BreakerSnapshot, CircuitBreaker, RateLimiter};
use vega_core::supervisor::{MonitorStats, TaskMonitor};
use vega_core::types::{
    AccountId, Candle, HistoricalRequest, OrderOperation, OrderParams, OrderTask, StreamMode,
};
use vega_core::{Result, VegaError};
use vega_md::pipeline::StatsSnapshot;
use vega_md::pool::{PoolEvent, PoolEventCallback, SyncReport};
use vega_md::{
    ConnectionPool, PipelineDeps, PoolDeps, PoolLimits, TickPipeline, TickSink, TickerConnector,
};
use vega_td::BrokerSession;
use vega_td::event::TaskEventReceiver;
use vega_td::executor::{ExecutorDeps, ExecutorStats, OrderExecutor};
use vega_td::lease::SessionProvider;

use crate::orchestrator::{AccountHealth, AccountOrchestrator, AccountSlot};

/// Transport and session of one configured account.
pub struct AccountWiring {
    pub account_id: AccountId,
    pub connector: Arc<dyn TickerConnector>,
    pub session: Arc<dyn BrokerSession>,
}

/// External collaborators of the runtime.
pub struct RuntimeDeps {
    pub accounts: Vec<AccountWiring>,
    pub registry: Arc<dyn InstrumentRegistry>,
    pub calculator: Arc<dyn GreeksCalculator>,
    pub bus: Arc<dyn MessageBus>,
    pub reporter: Arc<dyn StatusReporter>,
}

#[derive(Debug, Clone)]
struct Target {
    mode: StreamMode,
    pinned: Option<AccountId>,
    assigned: Option<AccountId>,
}

/// Answer to [`Runtime::create_subscription`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscriptionReceipt {
    pub instrument_token: u32,
    pub account_id: AccountId,
    pub mode: StreamMode,
    pub status: SubscriptionStatus,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HandoffStats {
    pub delivered: u64,
    pub dropped: u64,
    pub malformed: u64,
}

#[derive(Debug, Default)]
struct PoolEventCounters {
    subscribe_failed: AtomicU64,
    unsubscribe_failed: AtomicU64,
    capacity_rejected: AtomicU64,
    approaching_limit: AtomicU64,
    reconnected: AtomicU64,
    retired: AtomicU64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolEventCounts {
    pub subscribe_failed: u64,
    pub unsubscribe_failed: u64,
    pub capacity_rejected: u64,
    pub approaching_limit: u64,
    pub reconnected: u64,
    pub retired: u64,
}

impl PoolEventCounters {
    fn record(&self, account_id: &str, event: &PoolEvent) {
        let counter = match event {
            PoolEvent::SubscribeFailed { .. } => &self.subscribe_failed,
            PoolEvent::UnsubscribeFailed { .. } => &self.unsubscribe_failed,
            PoolEvent::CapacityRejected { .. } => &self.capacity_rejected,
            PoolEvent::ApproachingLimit { .. } => &self.approaching_limit,
            PoolEvent::Reconnected { .. } => &self.reconnected,
            PoolEvent::ConnectionRetired { .. } => &self.retired,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        debug!("[runtime] pool {account_id}: {event:?}");
    }

    fn snapshot(&self) -> PoolEventCounts {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        PoolEventCounts {
            subscribe_failed: load(&self.subscribe_failed),
            unsubscribe_failed: load(&self.unsubscribe_failed),
            capacity_rejected: load(&self.capacity_rejected),
            approaching_limit: load(&self.approaching_limit),
            reconnected: load(&self.reconnected),
            retired: load(&self.retired),
        }
    }
}

/// Everything an operator asks about a running process.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeState {
    pub running: bool,
    /// Tokens currently subscribed on some connection.
    pub active_subscriptions: usize,
    /// Entries of the target table.
    pub target_subscriptions: usize,
    pub accounts: Vec<AccountHealth>,
    pub pool_events: PoolEventCounts,
    pub handoff: HandoffStats,
    pub pipeline: StatsSnapshot,
    pub publisher_breaker: BreakerSnapshot,
    pub executor: ExecutorStats,
    pub monitor: MonitorStats,
}

pub struct Runtime {
    monitor: TaskMonitor,
    orchestrator: Arc<AccountOrchestrator>,
    pipeline: Arc<TickPipeline>,
    executor: Arc<OrderExecutor>,
    handoff: TickSink,
    targets: Mutex<BTreeMap<u32, Target>>,
    /// Serializes create, delete and reconcile. Never taken by the pools.
    subscription_ops: Mutex<()>,
    task_events: Mutex<Option<TaskEventReceiver>>,
    pool_events: Arc<PoolEventCounters>,
    reconcile_interval: Duration,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl Runtime {
    /// Build every component. Nothing is connected until [`start`](Self::start).
    ///
    /// Each account in `config` must have exactly one entry in
    /// `deps.accounts`.
    pub fn new(config: &AppConfig, deps: RuntimeDeps) -> Result<Self> {
        let limiter = Arc::new(RateLimiter::new(
            &config.rate_limits,
            config.rate_limit_reset.clone(),
        ));
        let (handoff, inbound) = TickSink::channel(config.pipeline.handoff_capacity);

        let pool_events = Arc::new(PoolEventCounters::default());
        let counters = pool_events.clone();
        let on_event: PoolEventCallback = Arc::new(move |account_id, event| {
            counters.record(account_id, event);
        });

        let mut wiring: AHashMap<AccountId, AccountWiring> = deps
            .accounts
            .into_iter()
            .map(|w| (w.account_id.clone(), w))
            .collect();
        let mut slots = Vec::with_capacity(config.accounts.len());
        for acc in &config.accounts {
            let wired = wiring.remove(&acc.account_id).ok_or_else(|| {
                VegaError::Config(format!("account '{}' has no session wired", acc.account_id))
            })?;
            let pool = ConnectionPool::new(
                acc.account_id.clone(),
                PoolLimits {
                    max_connections: acc.max_connections,
                    max_instruments_per_connection: acc.max_instruments_per_connection,
                },
                config.pool.clone(),
                config.market.clone(),
                PoolDeps {
                    connector: wired.connector,
                    handoff: handoff.clone(),
                    limiter: limiter.clone(),
                    reporter: deps.reporter.clone(),
                    on_event: Some(on_event.clone()),
                },
            );
            let breaker = CircuitBreaker::new(
                format!("session-{}", acc.account_id),
                config.breakers.session.clone(),
            );
            slots.push(AccountSlot::new(
                acc.account_id.clone(),
                Arc::new(pool),
                wired.session,
                Arc::new(breaker),
            ));
        }
        if let Some(extra) = wiring.keys().next() {
            return Err(VegaError::Config(format!(
                "session wired for unconfigured account '{extra}'"
            )));
        }
        let orchestrator = Arc::new(AccountOrchestrator::new(slots)?);

        let pipeline = TickPipeline::new(
            config.pipeline.clone(),
            config.market.clone(),
            PipelineDeps {
                registry: deps.registry,
                calculator: deps.calculator,
                bus: deps.bus,
                breaker: Arc::new(CircuitBreaker::new(
                    "publisher",
                    config.breakers.publisher.clone(),
                )),
            },
            inbound,
        )?;

        let (executor, task_events) = OrderExecutor::new(
            config.executor.clone(),
            ExecutorDeps {
                sessions: orchestrator.clone(),
                limiter,
                reporter: deps.reporter,
            },
        );

        let mut targets = BTreeMap::new();
        for sub in &config.subscriptions {
            if let Some(id) = &sub.account_id {
                if !orchestrator.has_account(id) {
                    return Err(VegaError::UnknownAccount(id.clone()));
                }
            }
            targets.insert(
                sub.instrument_token,
                Target {
                    mode: sub.mode,
                    pinned: sub.account_id.clone(),
                    assigned: None,
                },
            );
        }

        Ok(Self {
            monitor: TaskMonitor::new(),
            orchestrator,
            pipeline: Arc::new(pipeline),
            executor: Arc::new(executor),
            handoff,
            targets: Mutex::new(targets),
            subscription_ops: Mutex::new(()),
            task_events: Mutex::new(Some(task_events)),
            pool_events,
            reconcile_interval: config.pool.reconcile_interval(),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn orchestrator(&self) -> &Arc<AccountOrchestrator> {
        &self.orchestrator
    }

    pub fn pipeline(&self) -> &Arc<TickPipeline> {
        &self.pipeline
    }

    pub fn executor(&self) -> &Arc<OrderExecutor> {
        &self.executor
    }

    pub fn monitor(&self) -> &TaskMonitor {
        &self.monitor
    }

    /// Take the task transition stream. Must be called before `start`,
    /// otherwise the runtime drains it into the log.
    pub async fn take_task_events(&self) -> Option<TaskEventReceiver> {
        self.task_events.lock().await.take()
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::Acquire)
            && !self.stopped.load(Ordering::Acquire)
            && self.monitor.is_running()
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(VegaError::Supervisor("runtime is not running".into()))
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Start pipeline, pools and executor under the monitor, then bring the
    /// configured subscriptions up. Refuses to start without a running
    /// monitor.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if !self.monitor.is_running() {
            return Err(VegaError::Supervisor("task monitor is not running".into()));
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(VegaError::Config("runtime already started".into()));
        }

        self.pipeline.start(&self.monitor).await?;
        self.orchestrator.start(&self.monitor).await?;
        self.executor.start(&self.monitor).await?;
        self.drain_unclaimed_events().await?;

        match self.reconcile().await {
            Ok(reports) => log_reconcile(&reports),
            Err(e) => warn!("[runtime] initial reconcile failed: {e}"),
        }

        let runtime = self.clone();
        let mut shutdown = self.monitor.shutdown_signal();
        let period = self.reconcile_interval;
        self.monitor
            .spawn("runtime-reconcile", async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if let Err(e) = runtime.reconcile().await {
                                warn!("[runtime] reconcile failed: {e}");
                            }
                        }
                        _ = shutdown.changed() => break,
                    }
                }
                Ok(())
            })
            .await?;

        info!(
            "[runtime] started with {} account(s)",
            self.orchestrator.account_ids().len()
        );
        Ok(())
    }

    async fn drain_unclaimed_events(&self) -> Result<()> {
        let Some(mut events) = self.task_events.lock().await.take() else {
            return Ok(());
        };
        let mut shutdown = self.monitor.shutdown_signal();
        self.monitor
            .spawn("task-events", async move {
                loop {
                    tokio::select! {
                        event = events.recv() => match event {
                            Some(e) => debug!(
                                "[runtime] task {} ({}) {:?} -> {}",
                                e.task_id, e.idempotency_key, e.from, e.to
                            ),
                            None => break,
                        },
                        _ = shutdown.changed() => break,
                    }
                }
                Ok(())
            })
            .await
    }

    /// Refuse new work, close every connection, then stop all background
    /// tasks. The pipeline flushes what it holds on the way out; order tasks
    /// whose workers did not finish in time end up `FAILED`.
    pub async fn shutdown(&self, grace: Duration) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("[runtime] shutting down");
        self.executor.shutdown();
        self.orchestrator.stop().await;
        self.monitor.shutdown(grace).await;
        let interrupted = self.executor.fail_in_flight().await;
        if interrupted > 0 {
            warn!("[runtime] {interrupted} order task(s) were still running");
        }
        info!("[runtime] stopped");
    }

    // -----------------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------------

    /// Add or update a subscription target and subscribe it right away.
    ///
    /// Without `account_id` the token keeps its current account, or gets the
    /// next healthy one. A transport failure leaves the target in place for
    /// the next reconcile and is reported as [`SubscriptionStatus::Failed`];
    /// an account at its limit fails with [`VegaError::Capacity`] and leaves
    /// any existing subscription of the token untouched.
    pub async fn create_subscription(
        &self,
        instrument_token: u32,
        mode: StreamMode,
        account_id: Option<AccountId>,
    ) -> Result<SubscriptionReceipt> {
        self.ensure_running()?;
        if let Some(id) = &account_id {
            if !self.orchestrator.has_account(id) {
                return Err(VegaError::UnknownAccount(id.clone()));
            }
        }
        let _ops = self.subscription_ops.lock().await;
        let previous = self.targets.lock().await.get(&instrument_token).cloned();
        let current = previous.as_ref().and_then(|t| t.assigned.clone());
        let account = match (account_id.clone(), current.clone()) {
            (Some(id), _) => id,
            (None, Some(id)) => id,
            (None, None) => self
                .orchestrator
                .pick_account()
                .await
                .ok_or_else(|| VegaError::Capacity("no healthy account available".into()))?,
        };

        self.targets.lock().await.insert(
            instrument_token,
            Target {
                mode,
                pinned: account_id,
                assigned: Some(account.clone()),
            },
        );

        let report = match self
            .orchestrator
            .pool(&account)?
            .subscribe(&[instrument_token], mode)
            .await
        {
            Ok(report) => report,
            Err(e) => {
                self.restore_target(instrument_token, previous).await;
                return Err(e);
            }
        };

        // A rejected move keeps the token where it was.
        if report.rejected.contains(&instrument_token) {
            self.restore_target(instrument_token, previous).await;
            return Err(VegaError::Capacity(format!(
                "account {account} is at its subscription limit"
            )));
        }

        // The old account keeps streaming until the new one has the token;
        // after a failed batch the next reconcile finishes the move.
        let moved = !report.failed.contains_key(&instrument_token);
        if let Some(old_account) = current.filter(|p| moved && *p != account) {
            let old = self.orchestrator.pool(&old_account)?;
            if let Err(e) = old.unsubscribe(&[instrument_token]).await {
                warn!("[runtime] moving {instrument_token} off {old_account} failed: {e}");
            }
        }

        let status = match report.failed.get(&instrument_token) {
            Some(e) => SubscriptionStatus::Failed(e.clone()),
            None => SubscriptionStatus::Active,
        };
        Ok(SubscriptionReceipt {
            instrument_token,
            account_id: account,
            mode,
            status,
        })
    }

    async fn restore_target(&self, instrument_token: u32, previous: Option<Target>) {
        let mut targets = self.targets.lock().await;
        match previous {
            Some(t) => {
                targets.insert(instrument_token, t);
            }
            None => {
                targets.remove(&instrument_token);
            }
        }
    }

    /// Drop a target and unsubscribe it. Returns `false` for unknown tokens.
    pub async fn delete_subscription(&self, instrument_token: u32) -> Result<bool> {
        self.ensure_running()?;
        let _ops = self.subscription_ops.lock().await;
        let Some(target) = self.targets.lock().await.remove(&instrument_token) else {
            return Ok(false);
        };
        if let Some(account) = target.assigned {
            let report = self
                .orchestrator
                .pool(&account)?
                .unsubscribe(&[instrument_token])
                .await?;
            if let Some(e) = report.failed.get(&instrument_token) {
                warn!("[runtime] unsubscribe of {instrument_token} on {account} failed: {e}");
            }
        }
        Ok(true)
    }

    /// Converge every pool to its share of the target table.
    ///
    /// Unassigned targets are distributed first. Targets a pool rejects for
    /// capacity lose their assignment and are distributed again next time.
    /// An account whose sync fails is logged and skipped; the others still
    /// converge.
    pub async fn reconcile(&self) -> Result<BTreeMap<AccountId, SyncReport>> {
        let _ops = self.subscription_ops.lock().await;
        let mut per_account: BTreeMap<AccountId, Vec<(u32, StreamMode)>> = BTreeMap::new();
        let unassigned: Vec<(u32, StreamMode)> = {
            let targets = self.targets.lock().await;
            let mut unassigned = Vec::new();
            for (&token, t) in targets.iter() {
                match t.pinned.as_ref().or(t.assigned.as_ref()) {
                    Some(account) => per_account
                        .entry(account.clone())
                        .or_default()
                        .push((token, t.mode)),
                    None => unassigned.push((token, t.mode)),
                }
            }
            unassigned
        };

        if !unassigned.is_empty() {
            match self.orchestrator.distribute(unassigned).await {
                Ok(spread) => {
                    let mut targets = self.targets.lock().await;
                    for (account, items) in spread {
                        for &(token, mode) in &items {
                            if let Some(t) = targets.get_mut(&token) {
                                if t.assigned.is_none() && t.mode == mode {
                                    t.assigned = Some(account.clone());
                                }
                            }
                        }
                        per_account.entry(account).or_default().extend(items);
                    }
                }
                Err(e) => warn!("[runtime] targets left unassigned: {e}"),
            }
        }

        let mut reports = BTreeMap::new();
        for account in self.orchestrator.account_ids() {
            let wanted = per_account.remove(&account).unwrap_or_default();
            let report = match self.orchestrator.pool(&account)?.sync_to(&wanted).await {
                Ok(report) => report,
                Err(e) => {
                    warn!("[runtime] sync of {account} failed: {e}");
                    continue;
                }
            };
            if !report.subscribe.rejected.is_empty() {
                let mut targets = self.targets.lock().await;
                for token in &report.subscribe.rejected {
                    if let Some(t) = targets.get_mut(token) {
                        if t.pinned.is_none() && t.assigned.as_deref() == Some(account.as_str()) {
                            t.assigned = None;
                        }
                    }
                }
            }
            reports.insert(account, report);
        }
        Ok(reports)
    }

    // -----------------------------------------------------------------------
    // Orders
    // -----------------------------------------------------------------------

    /// Queue an order operation; see [`OrderExecutor::submit`].
    pub async fn submit_order(
        &self,
        operation: OrderOperation,
        params: OrderParams,
        idempotency_key: &str,
        account_id: Option<AccountId>,
    ) -> Result<Uuid> {
        self.ensure_running()?;
        self.executor
            .submit(operation, params, idempotency_key, account_id)
            .await
    }

    pub async fn task_status(&self, task_id: &Uuid) -> Option<OrderTask> {
        self.executor.task(task_id).await
    }

    pub async fn dead_letters(&self) -> Vec<OrderTask> {
        self.executor.dead_letters().await
    }

    pub async fn fetch_historical(
        &self,
        account_id: Option<AccountId>,
        request: &HistoricalRequest,
    ) -> Result<Vec<Candle>> {
        self.ensure_running()?;
        self.executor.fetch_historical(account_id, request).await
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    pub async fn runtime_state(&self) -> RuntimeState {
        let accounts = self.orchestrator.health().await;
        let active_subscriptions = accounts.iter().map(|a| a.pool.assigned).sum();
        RuntimeState {
            running: self.is_running(),
            active_subscriptions,
            target_subscriptions: self.targets.lock().await.len(),
            accounts,
            pool_events: self.pool_events.snapshot(),
            handoff: HandoffStats {
                delivered: self.handoff.delivered(),
                dropped: self.handoff.dropped(),
                malformed: self.handoff.malformed(),
            },
            pipeline: self.pipeline.stats(),
            publisher_breaker: self.pipeline.breaker().snapshot().await,
            executor: self.executor.stats().await,
            monitor: self.monitor.stats().await,
        }
    }
}

fn log_reconcile(reports: &BTreeMap<AccountId, SyncReport>) {
    for (account, r) in reports {
        info!(
            "[runtime] {account}: +{} ={} -{} failed {} rejected {}",
            r.subscribe.subscribed.len(),
            r.subscribe.unchanged.len(),
            r.unsubscribe.removed.len(),
            r.subscribe.failed.len(),
            r.subscribe.rejected.len()
        );
    }
}
