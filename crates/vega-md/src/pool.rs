//! Per-account pool of streaming connections.
//!
//! The pool converges the set of subscribed tokens to a target set while
//! respecting the account's connection and per-connection instrument limits.
//! Tokens are spread over the least-loaded connections in fixed-size batches;
//! a new socket is opened only when no existing one has room.
//!
//! # Locking
//!
//! One `tokio::sync::Mutex` guards the token map, the target set and the
//! in-flight reservations. Every operation runs in three phases: plan under
//! the lock, perform network I/O without it, then re-lock to record results.
//! Reservations taken in the first phase keep concurrent callers from
//! over-filling a connection while the lock is released.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use ahash::{AHashMap, AHashSet};
use chrono::Utc;
use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use vega_core::config::PoolSettings;
use vega_core::error::{Result, VegaError};
use vega_core::ports::{StatusReporter, SubscriptionStatus};
use vega_core::resilience::{Backoff, RateLimiter};
use vega_core::supervisor::TaskMonitor;
use vega_core::time_util::MarketHours;
use vega_core::types::{AccountId, EndpointCategory, StreamMode};

use crate::transport::{ConnectionSink, TickSink, TickerConnection, TickerConnector};

/// Utilization above which subscribes log an "approaching limit" event.
const APPROACHING_LIMIT: f64 = 0.9;

#[derive(Debug, Clone, Copy)]
pub struct PoolLimits {
    pub max_connections: usize,
    pub max_instruments_per_connection: usize,
}

impl PoolLimits {
    pub fn capacity(&self) -> usize {
        self.max_connections * self.max_instruments_per_connection
    }
}

/// Things the pool wants its owner to know about. Never raised inside a
/// connection's inbound task.
#[derive(Debug, Clone, PartialEq)]
pub enum PoolEvent {
    SubscribeFailed { tokens: Vec<u32>, error: String },
    UnsubscribeFailed { tokens: Vec<u32>, error: String },
    CapacityRejected { tokens: Vec<u32>, capacity: usize },
    ApproachingLimit { utilization: f64 },
    Reconnected { connection_id: u64 },
    ConnectionRetired { connection_id: u64, tokens: Vec<u32> },
}

pub type PoolEventCallback = Arc<dyn Fn(&str, &PoolEvent) + Send + Sync>;

#[derive(Debug, Clone, Default, Serialize)]
pub struct SubscribeReport {
    /// Newly subscribed, or re-issued with a new mode.
    pub subscribed: Vec<u32>,
    /// Already subscribed (or being subscribed) with the requested mode.
    pub unchanged: Vec<u32>,
    /// Still in the target set; retried by the next `sync_to`.
    pub failed: BTreeMap<u32, String>,
    /// Over the account's subscription limit; dropped from the target set.
    pub rejected: Vec<u32>,
}

impl SubscribeReport {
    fn merge(&mut self, other: SubscribeReport) {
        self.subscribed.extend(other.subscribed);
        self.unchanged.extend(other.unchanged);
        self.failed.extend(other.failed);
        self.rejected.extend(other.rejected);
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UnsubscribeReport {
    pub removed: Vec<u32>,
    pub not_found: Vec<u32>,
    /// Dropped from tracking, but the server may still be streaming them.
    pub failed: BTreeMap<u32, String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub subscribe: SubscribeReport,
    pub unsubscribe: UnsubscribeReport,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HealthReport {
    pub checked: usize,
    pub reconnected: usize,
    pub reconnect_failed: usize,
    pub retired: usize,
    pub rehomed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionHealth {
    pub connection_id: u64,
    pub connected: bool,
    pub tokens: usize,
    pub idle_ms: u64,
    pub reconnect_attempts: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    pub account_id: AccountId,
    pub capacity: usize,
    pub assigned: usize,
    pub targets: usize,
    pub in_flight: usize,
    pub utilization: f64,
    pub connections: Vec<ConnectionHealth>,
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

struct ConnEntry {
    conn: Arc<dyn TickerConnection>,
    sink: Arc<ConnectionSink>,
    tokens: AHashMap<u32, StreamMode>,
    /// Slots promised to subscribes that are still in phase two.
    reserved: usize,
    backoff: Backoff,
    retry_at: Option<Instant>,
}

impl ConnEntry {
    fn load(&self) -> usize {
        self.tokens.len() + self.reserved
    }
}

#[derive(Default)]
struct PoolState {
    connections: BTreeMap<u64, ConnEntry>,
    assigned: AHashMap<u32, u64>,
    targets: AHashMap<u32, StreamMode>,
    in_flight: AHashSet<u32>,
    pending_opens: usize,
    next_id: u64,
    stopped: bool,
}

enum Slot {
    Existing(u64, Arc<dyn TickerConnection>),
    /// Index into `SubscribePlan::new_connections`.
    New(usize),
}

struct PlannedBatch {
    slot: Slot,
    tokens: Vec<u32>,
}

#[derive(Default)]
struct SubscribePlan {
    batches: Vec<PlannedBatch>,
    new_connections: Vec<u64>,
    mode_changes: Vec<(u64, Arc<dyn TickerConnection>, Vec<u32>)>,
    unchanged: Vec<u32>,
    rejected: Vec<u32>,
}

impl PoolState {
    fn plan_subscribe(
        &mut self,
        tokens: &[u32],
        mode: StreamMode,
        limits: PoolLimits,
        batch_size: usize,
    ) -> SubscribePlan {
        let mut plan = SubscribePlan::default();
        let mut fresh = Vec::new();
        let mut mode_changes: BTreeMap<u64, Vec<u32>> = BTreeMap::new();
        let mut seen = AHashSet::new();

        for &t in tokens {
            if !seen.insert(t) {
                continue;
            }
            if let Some(&id) = self.assigned.get(&t) {
                self.targets.insert(t, mode);
                let current = self.connections.get(&id).and_then(|e| e.tokens.get(&t));
                if current == Some(&mode) {
                    plan.unchanged.push(t);
                } else {
                    mode_changes.entry(id).or_default().push(t);
                }
            } else if self.in_flight.contains(&t) {
                self.targets.insert(t, mode);
                plan.unchanged.push(t);
            } else {
                fresh.push(t);
            }
        }

        let used = self.assigned.len() + self.in_flight.len();
        let room = limits.capacity().saturating_sub(used);
        if fresh.len() > room {
            plan.rejected = fresh.split_off(room);
            for t in &plan.rejected {
                self.targets.remove(t);
            }
        }

        let per_conn = limits.max_instruments_per_connection;
        let mut new_loads: Vec<usize> = Vec::new();
        let mut rest: &[u32] = &fresh;
        while !rest.is_empty() {
            // Least-loaded candidate; existing sockets win ties.
            let existing = self
                .connections
                .iter()
                .filter(|(_, e)| e.load() < per_conn)
                .map(|(id, e)| (e.load(), 0u8, *id))
                .min();
            let planned = new_loads
                .iter()
                .enumerate()
                .filter(|(_, load)| **load < per_conn)
                .map(|(i, load)| (*load, 1u8, i as u64))
                .min();

            let slot = match (existing, planned) {
                (Some(e), Some(p)) if p < e => Slot::New(p.2 as usize),
                (Some(e), _) => {
                    let conn = self.connections[&e.2].conn.clone();
                    Slot::Existing(e.2, conn)
                }
                (None, Some(p)) => Slot::New(p.2 as usize),
                (None, None) => {
                    if self.connections.len() + self.pending_opens >= limits.max_connections {
                        break;
                    }
                    self.next_id += 1;
                    self.pending_opens += 1;
                    plan.new_connections.push(self.next_id);
                    new_loads.push(0);
                    continue;
                }
            };

            let load = match &slot {
                Slot::Existing(id, _) => self.connections[id].load(),
                Slot::New(i) => new_loads[*i],
            };
            let take = (per_conn - load).min(batch_size.max(1)).min(rest.len());
            let (batch, tail) = rest.split_at(take);
            rest = tail;
            match &slot {
                Slot::Existing(id, _) => {
                    if let Some(e) = self.connections.get_mut(id) {
                        e.reserved += take;
                    }
                }
                Slot::New(i) => new_loads[*i] += take,
            }
            for &t in batch {
                self.targets.insert(t, mode);
                self.in_flight.insert(t);
            }
            plan.batches.push(PlannedBatch {
                slot,
                tokens: batch.to_vec(),
            });
        }
        // Only reachable if the connection budget ran out mid-plan.
        for &t in rest {
            self.targets.remove(&t);
            plan.rejected.push(t);
        }

        for (id, toks) in mode_changes {
            if let Some(e) = self.connections.get(&id) {
                plan.mode_changes.push((id, e.conn.clone(), toks));
            }
        }
        plan
    }

    fn utilization(&self, limits: PoolLimits) -> f64 {
        let cap = limits.capacity();
        if cap == 0 {
            return 1.0;
        }
        (self.assigned.len() + self.in_flight.len()) as f64 / cap as f64
    }
}

// ---------------------------------------------------------------------------
// ConnectionPool
// ---------------------------------------------------------------------------

pub struct ConnectionPool {
    account_id: AccountId,
    limits: PoolLimits,
    settings: PoolSettings,
    market: MarketHours,
    connector: Arc<dyn TickerConnector>,
    handoff: TickSink,
    limiter: Arc<RateLimiter>,
    reporter: Arc<dyn StatusReporter>,
    on_event: Option<PoolEventCallback>,
    state: Mutex<PoolState>,
}

pub struct PoolDeps {
    pub connector: Arc<dyn TickerConnector>,
    pub handoff: TickSink,
    pub limiter: Arc<RateLimiter>,
    pub reporter: Arc<dyn StatusReporter>,
    pub on_event: Option<PoolEventCallback>,
}

impl ConnectionPool {
    pub fn new(
        account_id: AccountId,
        limits: PoolLimits,
        settings: PoolSettings,
        market: MarketHours,
        deps: PoolDeps,
    ) -> Self {
        Self {
            account_id,
            limits,
            settings,
            market,
            connector: deps.connector,
            handoff: deps.handoff,
            limiter: deps.limiter,
            reporter: deps.reporter,
            on_event: deps.on_event,
            state: Mutex::new(PoolState::default()),
        }
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn limits(&self) -> PoolLimits {
        self.limits
    }

    /// Subscribe `tokens` with `mode`, adding them to the target set.
    pub async fn subscribe(&self, tokens: &[u32], mode: StreamMode) -> Result<SubscribeReport> {
        // Phase 1: plan.
        let plan = {
            let mut st = self.state.lock().await;
            if st.stopped {
                return Err(VegaError::Shutdown(format!("pool {}", self.account_id)));
            }
            st.plan_subscribe(tokens, mode, self.limits, self.settings.subscribe_batch_size)
        };

        let mut report = SubscribeReport {
            unchanged: plan.unchanged,
            rejected: plan.rejected,
            ..Default::default()
        };
        if !report.rejected.is_empty() {
            warn!(
                "[pool-{}] over subscription limit ({}), rejecting {} token(s)",
                self.account_id,
                self.limits.capacity(),
                report.rejected.len()
            );
            self.emit(PoolEvent::CapacityRejected {
                tokens: report.rejected.clone(),
                capacity: self.limits.capacity(),
            });
        }

        // Phase 2: network I/O, lock released.
        let mut opened = Vec::with_capacity(plan.new_connections.len());
        for &id in &plan.new_connections {
            opened.push(self.open_connection(id).await);
        }

        let mut outcomes = Vec::with_capacity(plan.batches.len());
        for batch in &plan.batches {
            let (conn_id, conn) = match &batch.slot {
                Slot::Existing(id, conn) => (*id, Ok(conn.clone())),
                Slot::New(i) => (
                    plan.new_connections[*i],
                    opened[*i]
                        .as_ref()
                        .map(|(conn, _)| conn.clone())
                        .map_err(|e| VegaError::Transport(format!("connection open failed: {e}"))),
                ),
            };
            let result = match conn {
                Ok(conn) => self.subscribe_batch(conn.as_ref(), &batch.tokens, mode).await,
                Err(e) => Err(e),
            };
            outcomes.push((conn_id, matches!(batch.slot, Slot::Existing(..)), result));
        }

        let mut mode_outcomes = Vec::with_capacity(plan.mode_changes.len());
        for (id, conn, toks) in &plan.mode_changes {
            let result = self.subscribe_batch(conn.as_ref(), toks, mode).await;
            mode_outcomes.push((*id, toks, result));
        }

        // Phase 3: record.
        let mut orphaned: Vec<(Arc<dyn TickerConnection>, Vec<u32>)> = Vec::new();
        let mut late: Vec<Arc<dyn TickerConnection>> = Vec::new();
        let utilization = {
            let mut st = self.state.lock().await;
            st.pending_opens = st.pending_opens.saturating_sub(plan.new_connections.len());

            for (&id, result) in plan.new_connections.iter().zip(opened) {
                if let Ok((conn, sink)) = result {
                    if st.stopped {
                        late.push(conn);
                    } else {
                        st.connections.insert(
                            id,
                            ConnEntry {
                                conn,
                                sink,
                                tokens: AHashMap::new(),
                                reserved: 0,
                                backoff: Backoff::new(self.settings.reconnect.clone()),
                                retry_at: None,
                            },
                        );
                    }
                }
            }

            for ((conn_id, reserved, result), batch) in outcomes.into_iter().zip(&plan.batches) {
                for t in &batch.tokens {
                    st.in_flight.remove(t);
                }
                let st = &mut *st;
                let entry = st.connections.get_mut(&conn_id);
                match (result, entry) {
                    (Ok(()), Some(entry)) => {
                        if reserved {
                            entry.reserved = entry.reserved.saturating_sub(batch.tokens.len());
                        }
                        let mut stray = Vec::new();
                        for &t in &batch.tokens {
                            if st.targets.contains_key(&t) {
                                entry.tokens.insert(t, mode);
                                st.assigned.insert(t, conn_id);
                                report.subscribed.push(t);
                            } else {
                                stray.push(t);
                            }
                        }
                        if !stray.is_empty() {
                            orphaned.push((entry.conn.clone(), stray));
                        }
                    }
                    (Ok(()), None) => {
                        for &t in &batch.tokens {
                            report.failed.insert(t, "connection closed during subscribe".into());
                        }
                    }
                    (Err(e), entry) => {
                        if let Some(entry) = entry.filter(|_| reserved) {
                            entry.reserved = entry.reserved.saturating_sub(batch.tokens.len());
                        }
                        for &t in &batch.tokens {
                            report.failed.insert(t, e.to_string());
                        }
                    }
                }
            }

            for (id, toks, result) in mode_outcomes {
                match result {
                    Ok(()) => {
                        if let Some(entry) = st.connections.get_mut(&id) {
                            for &t in toks {
                                if entry.tokens.contains_key(&t) {
                                    entry.tokens.insert(t, mode);
                                }
                            }
                        }
                        report.subscribed.extend(toks.iter().copied());
                    }
                    Err(e) => {
                        for &t in toks {
                            report.failed.insert(t, e.to_string());
                        }
                    }
                }
            }
            st.utilization(self.limits)
        };

        for (conn, stray) in orphaned {
            debug!("[pool-{}] dropping {} token(s) unsubscribed mid-flight", self.account_id, stray.len());
            if let Err(e) = self.unsubscribe_batch(conn.as_ref(), &stray).await {
                warn!("[pool-{}] cleanup unsubscribe failed: {e}", self.account_id);
            }
        }
        for conn in late {
            self.close_connection(conn).await;
        }

        self.report_subscribe(&report);
        if utilization >= APPROACHING_LIMIT {
            warn!(
                "[pool-{}] approaching subscription limit: {:.0}% used",
                self.account_id,
                utilization * 100.0
            );
            self.emit(PoolEvent::ApproachingLimit { utilization });
        }
        Ok(report)
    }

    /// Remove `tokens` from the target set and the sockets serving them.
    pub async fn unsubscribe(&self, tokens: &[u32]) -> Result<UnsubscribeReport> {
        let mut report = UnsubscribeReport::default();
        let mut groups: BTreeMap<u64, (Arc<dyn TickerConnection>, Vec<u32>)> = BTreeMap::new();
        let mut idle = Vec::new();
        {
            let mut st = self.state.lock().await;
            if st.stopped {
                report.not_found = tokens.to_vec();
                return Ok(report);
            }
            for &t in tokens {
                let was_target = st.targets.remove(&t).is_some();
                if let Some(id) = st.assigned.remove(&t) {
                    if let Some(entry) = st.connections.get_mut(&id) {
                        entry.tokens.remove(&t);
                        groups
                            .entry(id)
                            .or_insert_with(|| (entry.conn.clone(), Vec::new()))
                            .1
                            .push(t);
                    }
                    report.removed.push(t);
                } else if was_target {
                    // In flight or failed earlier; phase three of the
                    // subscribe drops in-flight ones.
                    report.removed.push(t);
                } else {
                    report.not_found.push(t);
                }
            }
            if self.settings.close_idle_connections {
                let empty: Vec<u64> = groups
                    .keys()
                    .copied()
                    .filter(|id| {
                        st.connections
                            .get(id)
                            .is_some_and(|e| e.tokens.is_empty() && e.reserved == 0)
                    })
                    .collect();
                for id in empty {
                    if let Some(entry) = st.connections.remove(&id) {
                        idle.push(entry.conn);
                    }
                }
            }
        }

        for (id, (conn, toks)) in groups {
            if idle.iter().any(|c| c.id() == id) {
                continue;
            }
            if let Err(e) = self.unsubscribe_batch(conn.as_ref(), &toks).await {
                warn!("[pool-{}] unsubscribe of {} token(s) failed: {e}", self.account_id, toks.len());
                for &t in &toks {
                    report.failed.insert(t, e.to_string());
                }
                self.emit(PoolEvent::UnsubscribeFailed {
                    tokens: toks,
                    error: e.to_string(),
                });
            }
        }
        for conn in idle {
            info!("[pool-{}] closing idle connection {}", self.account_id, conn.id());
            self.close_connection(conn).await;
        }

        for &t in &report.removed {
            self.reporter
                .subscription_status(&self.account_id, t, &SubscriptionStatus::Removed);
        }
        Ok(report)
    }

    /// Converge to exactly `targets`.
    pub async fn sync_to(&self, targets: &[(u32, StreamMode)]) -> Result<SyncReport> {
        let desired: AHashMap<u32, StreamMode> = targets.iter().copied().collect();
        let stale: Vec<u32> = {
            let st = self.state.lock().await;
            if st.stopped {
                return Err(VegaError::Shutdown(format!("pool {}", self.account_id)));
            }
            st.targets
                .keys()
                .chain(st.assigned.keys())
                .filter(|t| !desired.contains_key(t))
                .copied()
                .collect::<BTreeSet<u32>>()
                .into_iter()
                .collect()
        };

        let mut report = SyncReport::default();
        if !stale.is_empty() {
            report.unsubscribe = self.unsubscribe(&stale).await?;
        }
        for mode in [StreamMode::Ltp, StreamMode::Quote, StreamMode::Full] {
            let mut group: Vec<u32> = desired
                .iter()
                .filter(|(_, m)| **m == mode)
                .map(|(t, _)| *t)
                .collect();
            if group.is_empty() {
                continue;
            }
            group.sort_unstable();
            report.subscribe.merge(self.subscribe(&group, mode).await?);
        }
        Ok(report)
    }

    /// Close every connection and clear all tracking. Idempotent.
    pub async fn stop_all(&self) {
        let conns: Vec<Arc<dyn TickerConnection>> = {
            let mut st = self.state.lock().await;
            st.stopped = true;
            st.assigned.clear();
            st.targets.clear();
            st.in_flight.clear();
            std::mem::take(&mut st.connections)
                .into_values()
                .map(|e| e.conn)
                .collect()
        };
        if conns.is_empty() {
            return;
        }
        info!("[pool-{}] stopping {} connection(s)", self.account_id, conns.len());
        join_all(conns.into_iter().map(|conn| self.close_connection(conn))).await;
    }

    /// Assigned tokens over total capacity.
    pub async fn capacity_utilization(&self) -> f64 {
        self.state.lock().await.utilization(self.limits)
    }

    pub async fn assigned_tokens(&self) -> BTreeSet<u32> {
        self.state.lock().await.assigned.keys().copied().collect()
    }

    pub async fn target_tokens(&self) -> BTreeSet<u32> {
        self.state.lock().await.targets.keys().copied().collect()
    }

    pub async fn connection_count(&self) -> usize {
        self.state.lock().await.connections.len()
    }

    pub async fn snapshot(&self) -> PoolSnapshot {
        let st = self.state.lock().await;
        PoolSnapshot {
            account_id: self.account_id.clone(),
            capacity: self.limits.capacity(),
            assigned: st.assigned.len(),
            targets: st.targets.len(),
            in_flight: st.in_flight.len(),
            utilization: st.utilization(self.limits),
            connections: st
                .connections
                .iter()
                .map(|(id, e)| ConnectionHealth {
                    connection_id: *id,
                    connected: e.conn.is_connected(),
                    tokens: e.tokens.len(),
                    idle_ms: e.sink.idle_for().as_millis() as u64,
                    reconnect_attempts: e.backoff.attempts(),
                })
                .collect(),
        }
    }

    /// Re-open the pool after `stop_all` and run the health check under the
    /// monitor.
    pub async fn start(self: &Arc<Self>, monitor: &TaskMonitor) -> Result<()> {
        self.state.lock().await.stopped = false;
        let pool = self.clone();
        let mut shutdown = monitor.shutdown_signal();
        let period = self.settings.health_check_interval();
        monitor
            .spawn(format!("pool-health-{}", self.account_id), async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            pool.check_health().await;
                        }
                        _ = shutdown.changed() => break,
                    }
                }
                Ok(())
            })
            .await
    }

    /// One health pass: reconnect stale sockets on their backoff schedule and
    /// retire the ones that ran out of attempts, re-homing their tokens.
    pub async fn check_health(&self) -> HealthReport {
        let mut report = HealthReport::default();
        let mut reconnects = Vec::new();
        let mut retired = Vec::new();
        {
            let mut st = self.state.lock().await;
            if st.stopped {
                return report;
            }
            let now = Instant::now();
            let session_open = self.market.is_open(Utc::now());
            let stale_after = self.settings.stale_after();
            let mut exhausted = Vec::new();

            for (&id, e) in st.connections.iter_mut() {
                report.checked += 1;
                let stale =
                    !e.conn.is_connected() || (session_open && e.sink.idle_for() >= stale_after);
                if !stale {
                    e.backoff.reset();
                    e.retry_at = None;
                    continue;
                }
                if e.retry_at.is_some_and(|at| now < at) {
                    continue;
                }
                match e.backoff.next_delay() {
                    Some(delay) => {
                        e.retry_at = Some(now + delay);
                        let toks: Vec<(u32, StreamMode)> =
                            e.tokens.iter().map(|(t, m)| (*t, *m)).collect();
                        reconnects.push((id, e.conn.clone(), e.sink.clone(), toks));
                    }
                    None => exhausted.push(id),
                }
            }
            for id in exhausted {
                if let Some(entry) = st.connections.remove(&id) {
                    for t in entry.tokens.keys() {
                        st.assigned.remove(t);
                    }
                    let toks: Vec<(u32, StreamMode)> =
                        entry.tokens.into_iter().collect();
                    retired.push((id, entry.conn, toks));
                }
            }
        }

        let timeout = self.settings.subscribe_timeout();
        for (id, conn, sink, toks) in reconnects {
            warn!(
                "[pool-{}] connection {id} stale, reconnecting with {} token(s)",
                self.account_id,
                toks.len()
            );
            match tokio::time::timeout(timeout, conn.reconnect(&toks)).await {
                Ok(Ok(())) => {
                    sink.touch();
                    report.reconnected += 1;
                    self.emit(PoolEvent::Reconnected { connection_id: id });
                }
                Ok(Err(e)) => {
                    report.reconnect_failed += 1;
                    warn!("[pool-{}] reconnect of {id} failed: {e}", self.account_id);
                }
                Err(_) => {
                    report.reconnect_failed += 1;
                    warn!("[pool-{}] reconnect of {id} timed out after {timeout:?}", self.account_id);
                }
            }
        }

        for (id, conn, toks) in retired {
            warn!(
                "[pool-{}] connection {id} exhausted reconnect attempts, re-homing {} token(s)",
                self.account_id,
                toks.len()
            );
            report.retired += 1;
            self.emit(PoolEvent::ConnectionRetired {
                connection_id: id,
                tokens: toks.iter().map(|(t, _)| *t).collect(),
            });
            conn.abort().await;

            // Only what is still wanted and not already picked up elsewhere.
            let still_wanted: Vec<(u32, StreamMode)> = {
                let st = self.state.lock().await;
                toks.into_iter()
                    .filter(|(t, _)| !st.assigned.contains_key(t) && st.targets.contains_key(t))
                    .map(|(t, _)| (t, st.targets[&t]))
                    .collect()
            };
            for mode in [StreamMode::Ltp, StreamMode::Quote, StreamMode::Full] {
                let group: Vec<u32> = still_wanted
                    .iter()
                    .filter(|(_, m)| *m == mode)
                    .map(|(t, _)| *t)
                    .collect();
                if group.is_empty() {
                    continue;
                }
                match self.subscribe(&group, mode).await {
                    Ok(r) => report.rehomed += r.subscribed.len(),
                    Err(e) => warn!("[pool-{}] re-home failed: {e}", self.account_id),
                }
            }
        }
        report
    }

    // -----------------------------------------------------------------------
    // I/O helpers (never called with the state lock held)
    // -----------------------------------------------------------------------

    async fn open_connection(
        &self,
        id: u64,
    ) -> Result<(Arc<dyn TickerConnection>, Arc<ConnectionSink>)> {
        let sink = Arc::new(ConnectionSink::new(
            id,
            self.account_id.clone(),
            self.handoff.clone(),
        ));
        let timeout = self.settings.subscribe_timeout();
        let conn = tokio::time::timeout(timeout, self.connector.connect(id, sink.clone()))
            .await
            .map_err(|_| VegaError::timeout(format!("open connection {id}"), timeout))??;
        info!("[pool-{}] opened connection {id}", self.account_id);
        Ok((conn, sink))
    }

    async fn subscribe_batch(
        &self,
        conn: &dyn TickerConnection,
        tokens: &[u32],
        mode: StreamMode,
    ) -> Result<()> {
        let timeout = self.settings.subscribe_timeout();
        let mut last_err = VegaError::Transport("subscribe not attempted".into());
        for attempt in 0..=self.settings.subscribe_retries {
            let result = async {
                self.limiter
                    .acquire(EndpointCategory::Subscriptions, true, timeout)
                    .await?;
                tokio::time::timeout(timeout, conn.subscribe(tokens, mode))
                    .await
                    .map_err(|_| {
                        VegaError::timeout(format!("subscribe {} token(s)", tokens.len()), timeout)
                    })?
            }
            .await;
            match result {
                Ok(()) => {
                    debug!(
                        "[pool-{}] conn {} subscribed {} token(s) in {mode} mode",
                        self.account_id,
                        conn.id(),
                        tokens.len()
                    );
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        "[pool-{}] subscribe batch on conn {} failed (attempt {}): {e}",
                        self.account_id,
                        conn.id(),
                        attempt + 1
                    );
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    async fn unsubscribe_batch(&self, conn: &dyn TickerConnection, tokens: &[u32]) -> Result<()> {
        let timeout = self.settings.subscribe_timeout();
        self.limiter
            .acquire(EndpointCategory::Subscriptions, true, timeout)
            .await?;
        tokio::time::timeout(timeout, conn.unsubscribe(tokens))
            .await
            .map_err(|_| VegaError::timeout(format!("unsubscribe {} token(s)", tokens.len()), timeout))?
    }

    /// Close with the grace timeout, then abort.
    async fn close_connection(&self, conn: Arc<dyn TickerConnection>) {
        let grace = self.settings.close_grace();
        match tokio::time::timeout(grace, conn.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("[pool-{}] close of {} failed: {e}, aborting", self.account_id, conn.id());
                conn.abort().await;
            }
            Err(_) => {
                warn!(
                    "[pool-{}] connection {} did not close within {grace:?}, aborting",
                    self.account_id,
                    conn.id()
                );
                conn.abort().await;
            }
        }
    }

    fn report_subscribe(&self, report: &SubscribeReport) {
        for &t in &report.subscribed {
            self.reporter
                .subscription_status(&self.account_id, t, &SubscriptionStatus::Active);
        }
        for &t in &report.rejected {
            self.reporter
                .subscription_status(&self.account_id, t, &SubscriptionStatus::CapacityRejected);
        }
        if report.failed.is_empty() {
            return;
        }
        let mut by_error: BTreeMap<&str, Vec<u32>> = BTreeMap::new();
        for (t, e) in &report.failed {
            self.reporter.subscription_status(
                &self.account_id,
                *t,
                &SubscriptionStatus::Failed(e.clone()),
            );
            by_error.entry(e.as_str()).or_default().push(*t);
        }
        for (error, tokens) in by_error {
            self.emit(PoolEvent::SubscribeFailed {
                tokens,
                error: error.to_string(),
            });
        }
    }

    fn emit(&self, event: PoolEvent) {
        if let Some(cb) = &self.on_event {
            cb(&self.account_id, &event);
        }
    }
}
