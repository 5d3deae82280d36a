//! End-to-end scenarios over a fully wired runtime with in-memory transport,
//! sessions and bus.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use vega_core::bus::{BroadcastBus, BusMessage, MessageBus};
use vega_core::config::AppConfig;
use vega_core::ports::{GreeksCalculator, GreeksError, GreeksInput, LogReporter};
use vega_core::resilience::BreakerState;
use vega_core::time_util;
use vega_core::types::{
    Candle, Direction, Greeks, HistoricalRequest, InstrumentMeta, InstrumentType, OrderAck,
    OrderOperation, OrderParams, OrderType, RawTick, StreamMode, TaskStatus,
};
use vega_core::{Result, VegaError};
use vega_md::registry::StaticInstrumentRegistry;
use vega_md::transport::{ConnectionSink, TickerConnection, TickerConnector};
use vega_runner::{AccountWiring, Runtime, RuntimeDeps, RuntimeState};
use vega_td::BrokerSession;

const NIFTY: u32 = 256265;
const BANKNIFTY: u32 = 260105;
const FINNIFTY: u32 = 257801;
const UNKNOWN: u32 = 999_999;

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

struct FakeConnection {
    id: u64,
    tokens: Mutex<BTreeMap<u32, StreamMode>>,
    connected: AtomicBool,
}

#[async_trait]
impl TickerConnection for FakeConnection {
    fn id(&self) -> u64 {
        self.id
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn subscribe(&self, tokens: &[u32], mode: StreamMode) -> Result<()> {
        let mut set = self.tokens.lock().unwrap();
        for &t in tokens {
            set.insert(t, mode);
        }
        Ok(())
    }

    async fn unsubscribe(&self, tokens: &[u32]) -> Result<()> {
        let mut set = self.tokens.lock().unwrap();
        for t in tokens {
            set.remove(t);
        }
        Ok(())
    }

    async fn reconnect(&self, tokens: &[(u32, StreamMode)]) -> Result<()> {
        *self.tokens.lock().unwrap() = tokens.iter().copied().collect();
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn abort(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct FakeConnector {
    opened: Mutex<Vec<Arc<FakeConnection>>>,
    sinks: Mutex<Vec<Arc<ConnectionSink>>>,
}

impl FakeConnector {
    fn opened(&self) -> Vec<Arc<FakeConnection>> {
        self.opened.lock().unwrap().clone()
    }

    /// Deliver ticks as if they arrived on the first socket.
    fn feed(&self, ticks: Vec<RawTick>) {
        let sink = self.sinks.lock().unwrap()[0].clone();
        sink.push(ticks);
    }
}

#[async_trait]
impl TickerConnector for FakeConnector {
    async fn connect(
        &self,
        connection_id: u64,
        sink: Arc<ConnectionSink>,
    ) -> Result<Arc<dyn TickerConnection>> {
        let conn = Arc::new(FakeConnection {
            id: connection_id,
            tokens: Mutex::new(BTreeMap::new()),
            connected: AtomicBool::new(true),
        });
        self.opened.lock().unwrap().push(conn.clone());
        self.sinks.lock().unwrap().push(sink);
        Ok(conn)
    }
}

struct FakeSession {
    id: String,
    placed: AtomicUsize,
}

#[async_trait]
impl BrokerSession for FakeSession {
    fn account_id(&self) -> &str {
        &self.id
    }

    async fn place_order(&self, _params: &OrderParams) -> Result<OrderAck> {
        let n = self.placed.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        Ok(OrderAck {
            order_id: format!("{}-{n}", self.id),
        })
    }

    async fn modify_order(&self, params: &OrderParams) -> Result<OrderAck> {
        self.place_order(params).await
    }

    async fn cancel_order(&self, params: &OrderParams) -> Result<OrderAck> {
        self.place_order(params).await
    }

    async fn fetch_historical(&self, _request: &HistoricalRequest) -> Result<Vec<Candle>> {
        Ok(Vec::new())
    }
}

/// Broadcast bus with an outage switch.
struct FlakyBus {
    inner: BroadcastBus,
    failing: AtomicBool,
    calls: AtomicUsize,
}

#[async_trait]
impl MessageBus for FlakyBus {
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(VegaError::Bus("connection refused".into()));
        }
        self.inner.publish(channel, payload).await
    }
}

struct FlatGreeks;

impl GreeksCalculator for FlatGreeks {
    fn compute(&self, _input: &GreeksInput) -> std::result::Result<Greeks, GreeksError> {
        Ok(Greeks {
            iv: 0.2,
            delta: 0.5,
            gamma: 0.01,
            theta: -1.0,
            vega: 2.0,
        })
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    runtime: Arc<Runtime>,
    connectors: BTreeMap<String, Arc<FakeConnector>>,
    sessions: BTreeMap<String, Arc<FakeSession>>,
    bus: Arc<FlakyBus>,
}

fn account(id: &str, max_connections: usize, per_connection: usize) -> Value {
    json!({
        "account_id": id,
        "credentials": { "api_key": "key", "access_token": "token" },
        "max_connections": max_connections,
        "max_instruments_per_connection": per_connection
    })
}

fn base_config(accounts: Vec<Value>) -> Value {
    json!({
        "accounts": accounts,
        "pool": {
            "health_check_interval_ms": 60_000,
            "reconcile_interval_ms": 60_000,
            "subscribe_timeout_ms": 1_000
        },
        "pipeline": {
            "max_batch_size": 1,
            "flush_interval_ms": 20,
            "greeks_workers": 1,
            "publish_timeout_ms": 200
        },
        "executor": { "workers": 2, "backoff_cap_secs": 0 },
        "market": {
            "open": "00:00:00",
            "close": "23:59:59",
            "utc_offset_minutes": 0,
            "weekdays_only": false
        },
        "breakers": {
            "publisher": {
                "failure_threshold": 2,
                "recovery_timeout_ms": 300,
                "half_open_max_attempts": 1,
                "success_threshold": 1
            }
        }
    })
}

fn instruments() -> StaticInstrumentRegistry {
    let index = |token: u32, symbol: &str| InstrumentMeta {
        instrument_token: token,
        trading_symbol: symbol.into(),
        instrument_type: InstrumentType::Index,
        is_active: true,
        strike: None,
        expiry: None,
        underlying_token: None,
        exchange: Some("NSE".into()),
    };
    StaticInstrumentRegistry::new([
        index(NIFTY, "NIFTY 50"),
        index(BANKNIFTY, "NIFTY BANK"),
        index(FINNIFTY, "NIFTY FIN SERVICE"),
    ])
}

async fn harness(config: Value) -> Harness {
    let config: AppConfig = serde_json::from_value(config).unwrap();
    config.validate().unwrap();

    let mut connectors = BTreeMap::new();
    let mut sessions = BTreeMap::new();
    let mut wiring = Vec::new();
    for acc in &config.accounts {
        let connector = Arc::new(FakeConnector::default());
        let session = Arc::new(FakeSession {
            id: acc.account_id.clone(),
            placed: AtomicUsize::new(0),
        });
        connectors.insert(acc.account_id.clone(), connector.clone());
        sessions.insert(acc.account_id.clone(), session.clone());
        wiring.push(AccountWiring {
            account_id: acc.account_id.clone(),
            connector,
            session,
        });
    }

    let bus = Arc::new(FlakyBus {
        inner: BroadcastBus::new(64),
        failing: AtomicBool::new(false),
        calls: AtomicUsize::new(0),
    });
    let runtime = Runtime::new(
        &config,
        RuntimeDeps {
            accounts: wiring,
            registry: Arc::new(instruments()),
            calculator: Arc::new(FlatGreeks),
            bus: bus.clone(),
            reporter: Arc::new(LogReporter),
        },
    )
    .unwrap();
    let runtime = Arc::new(runtime);
    runtime.start().await.unwrap();

    Harness {
        runtime,
        connectors,
        sessions,
        bus,
    }
}

async fn wait_for_state(
    runtime: &Runtime,
    what: &str,
    pred: impl Fn(&RuntimeState) -> bool,
) -> RuntimeState {
    for _ in 0..300 {
        let state = runtime.runtime_state().await;
        if pred(&state) {
            return state;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

fn tick(token: u32, price: f64, ts: i64) -> RawTick {
    RawTick {
        instrument_token: token,
        last_price: Some(price),
        timestamp_ms: Some(ts),
        ..Default::default()
    }
}

fn market_buy() -> OrderParams {
    OrderParams {
        exchange: "NFO".into(),
        trading_symbol: "NIFTY24DEC24000CE".into(),
        transaction_type: Some(Direction::Buy),
        quantity: Some(50),
        order_type: Some(OrderType::Market),
        product: Some("NRML".into()),
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn scenario_a_one_instrument_per_connection_opens_two_sockets() {
    let h = harness(base_config(vec![account("A", 2, 1)])).await;

    for token in [NIFTY, BANKNIFTY] {
        let receipt = h
            .runtime
            .create_subscription(token, StreamMode::Full, None)
            .await
            .unwrap();
        assert_eq!(receipt.account_id, "A");
    }

    let opened = h.connectors["A"].opened();
    assert_eq!(opened.len(), 2);
    for conn in &opened {
        assert_eq!(conn.tokens.lock().unwrap().len(), 1);
    }
    let state = h.runtime.runtime_state().await;
    assert_eq!(state.active_subscriptions, 2);
    assert_eq!(state.accounts[0].pool.connections.len(), 2);

    // The account is full now.
    let err = h
        .runtime
        .create_subscription(FINNIFTY, StreamMode::Full, None)
        .await
        .unwrap_err();
    assert!(matches!(err, VegaError::Capacity(_)));
    assert_eq!(h.runtime.runtime_state().await.target_subscriptions, 2);

    h.runtime.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn scenario_b_same_idempotency_key_executes_once() {
    let h = harness(base_config(vec![account("A", 1, 10)])).await;

    let first = h
        .runtime
        .submit_order(OrderOperation::Place, market_buy(), "X", Some("A".into()))
        .await
        .unwrap();
    let second = h
        .runtime
        .submit_order(OrderOperation::Place, market_buy(), "X", Some("A".into()))
        .await
        .unwrap();
    assert_eq!(first, second);

    let mut done = None;
    for _ in 0..300 {
        let task = h.runtime.task_status(&first).await.unwrap();
        if task.status.is_terminal() {
            done = Some(task);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let task = done.expect("task did not finish");
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.attempts, 1);
    assert_eq!(task.result.unwrap().order_id, "A-0");

    // A third submit after completion is still deduplicated.
    let third = h
        .runtime
        .submit_order(OrderOperation::Place, market_buy(), "X", None)
        .await
        .unwrap();
    assert_eq!(third, first);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.sessions["A"].placed.load(Ordering::SeqCst), 1);

    let state = h.runtime.runtime_state().await;
    assert_eq!(state.executor.store.live, 1);
    assert_eq!(state.executor.deduplicated, 2);

    h.runtime.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn scenario_c_bus_outage_opens_breaker_then_recovers() {
    let h = harness(base_config(vec![account("A", 1, 10)])).await;
    let mut rx = h.bus.inner.subscribe();
    h.runtime
        .create_subscription(NIFTY, StreamMode::Quote, None)
        .await
        .unwrap();

    h.bus.failing.store(true, Ordering::SeqCst);
    h.connectors["A"].feed(vec![tick(NIFTY, 24_000.0, time_util::now_ms())]);

    let state = wait_for_state(&h.runtime, "publisher breaker to open", |s| {
        s.publisher_breaker.state == BreakerState::Open
    })
    .await;
    assert_eq!(state.pipeline.published_snapshots, 0);
    let calls_when_opened = h.bus.calls.load(Ordering::SeqCst);

    // While open, flush attempts are short-circuited without touching the bus.
    wait_for_state(&h.runtime, "short-circuited publishes", |s| {
        s.pipeline.short_circuited >= 3
    })
    .await;
    assert_eq!(h.bus.calls.load(Ordering::SeqCst), calls_when_opened);

    // Bus comes back: the half-open trial succeeds and the held batch goes out.
    h.bus.failing.store(false, Ordering::SeqCst);
    let state = wait_for_state(&h.runtime, "held batch to be published", |s| {
        s.pipeline.published_snapshots >= 1
    })
    .await;
    assert_eq!(state.publisher_breaker.state, BreakerState::Closed);

    let msg: BusMessage = rx.recv().await.unwrap();
    assert_eq!(msg.channel, "ticks:underlying");
    let batch: Value = serde_json::from_slice(&msg.payload).unwrap();
    assert_eq!(batch[0]["instrument_token"], NIFTY);
    assert_eq!(batch[0]["category"], "underlying");

    h.runtime.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn scenario_d_unknown_token_is_rejected_not_published() {
    let h = harness(base_config(vec![account("A", 1, 10)])).await;
    let mut rx = h.bus.inner.subscribe();
    h.runtime
        .create_subscription(NIFTY, StreamMode::Quote, None)
        .await
        .unwrap();

    h.connectors["A"].feed(vec![tick(UNKNOWN, 10.0, time_util::now_ms())]);

    let state = wait_for_state(&h.runtime, "tick to be processed", |s| {
        s.pipeline.received == 1
    })
    .await;
    assert_eq!(state.pipeline.rejected.unknown_instrument, 1);
    assert_eq!(state.pipeline.accepted, 0);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let state = h.runtime.runtime_state().await;
    assert_eq!(state.pipeline.published_snapshots, 0);
    assert!(rx.try_recv().is_err());

    h.runtime.shutdown(Duration::from_secs(1)).await;
}

// ---------------------------------------------------------------------------
// Runtime behavior around the scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn configured_targets_are_spread_over_accounts() {
    let mut config = base_config(vec![account("A", 1, 10), account("B", 1, 10)]);
    config["subscriptions"] = json!([
        { "instrument_token": NIFTY, "mode": "full" },
        { "instrument_token": BANKNIFTY, "mode": "quote" },
        { "instrument_token": FINNIFTY, "mode": "ltp", "account_id": "B" }
    ]);
    let h = harness(config).await;

    let state = h.runtime.runtime_state().await;
    assert_eq!(state.active_subscriptions, 3);
    let assigned: BTreeMap<&str, usize> = state
        .accounts
        .iter()
        .map(|a| (a.account_id.as_str(), a.pool.assigned))
        .collect();
    // FINNIFTY is pinned to B; the other two alternate starting with A.
    assert_eq!(assigned["A"], 1);
    assert_eq!(assigned["B"], 2);

    // A second pass changes nothing.
    let reports = h.runtime.reconcile().await.unwrap();
    for report in reports.values() {
        assert!(report.subscribe.subscribed.is_empty());
        assert!(report.unsubscribe.removed.is_empty());
    }

    assert!(h.runtime.delete_subscription(NIFTY).await.unwrap());
    assert!(!h.runtime.delete_subscription(NIFTY).await.unwrap());
    let state = h.runtime.runtime_state().await;
    assert_eq!(state.active_subscriptions, 2);
    assert_eq!(state.target_subscriptions, 2);

    h.runtime.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn move_to_full_account_keeps_existing_subscription() {
    let h = harness(base_config(vec![account("A", 1, 10), account("B", 1, 1)])).await;
    h.runtime
        .create_subscription(BANKNIFTY, StreamMode::Quote, Some("B".into()))
        .await
        .unwrap();
    h.runtime
        .create_subscription(NIFTY, StreamMode::Quote, Some("A".into()))
        .await
        .unwrap();

    let err = h
        .runtime
        .create_subscription(NIFTY, StreamMode::Quote, Some("B".into()))
        .await
        .unwrap_err();
    assert!(matches!(err, VegaError::Capacity(_)));

    let state = h.runtime.runtime_state().await;
    assert_eq!(state.active_subscriptions, 2);
    assert_eq!(state.target_subscriptions, 2);
    let on_a = h.connectors["A"].opened();
    assert!(on_a[0].tokens.lock().unwrap().contains_key(&NIFTY));

    // NIFTY is still pinned to A, so a reconcile leaves it there.
    let reports = h.runtime.reconcile().await.unwrap();
    assert!(reports["A"].unsubscribe.removed.is_empty());
    assert!(reports["B"].subscribe.rejected.is_empty());

    h.runtime.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn move_between_accounts_unsubscribes_the_old_one() {
    let h = harness(base_config(vec![account("A", 1, 10), account("B", 1, 10)])).await;
    h.runtime
        .create_subscription(NIFTY, StreamMode::Quote, Some("A".into()))
        .await
        .unwrap();
    let receipt = h
        .runtime
        .create_subscription(NIFTY, StreamMode::Quote, Some("B".into()))
        .await
        .unwrap();
    assert_eq!(receipt.account_id, "B");

    let state = h.runtime.runtime_state().await;
    assert_eq!(state.active_subscriptions, 1);
    assert_eq!(state.target_subscriptions, 1);
    let on_b = h.connectors["B"].opened();
    assert!(on_b[0].tokens.lock().unwrap().contains_key(&NIFTY));
    let on_a = h.connectors["A"].opened();
    assert!(on_a.iter().all(|c| !c.tokens.lock().unwrap().contains_key(&NIFTY)));

    h.runtime.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn creates_racing_reconcile_stay_subscribed() {
    let h = harness(base_config(vec![account("A", 2, 10), account("B", 2, 10)])).await;

    let reconciler = {
        let runtime = h.runtime.clone();
        tokio::spawn(async move {
            for _ in 0..20 {
                runtime.reconcile().await.unwrap();
                tokio::task::yield_now().await;
            }
        })
    };
    let mut creates = Vec::new();
    for token in [NIFTY, BANKNIFTY, FINNIFTY, NIFTY, BANKNIFTY] {
        let runtime = h.runtime.clone();
        creates.push(tokio::spawn(async move {
            runtime
                .create_subscription(token, StreamMode::Quote, None)
                .await
                .unwrap()
        }));
    }
    for c in creates {
        c.await.unwrap();
    }
    reconciler.await.unwrap();

    let state = h.runtime.runtime_state().await;
    assert_eq!(state.target_subscriptions, 3);
    assert_eq!(state.active_subscriptions, 3);
    let mut streamed: Vec<u32> = h
        .connectors
        .values()
        .flat_map(|c| c.opened())
        .flat_map(|c| c.tokens.lock().unwrap().keys().copied().collect::<Vec<_>>())
        .collect();
    streamed.sort_unstable();
    let mut expected = vec![NIFTY, BANKNIFTY, FINNIFTY];
    expected.sort_unstable();
    assert_eq!(streamed, expected);

    h.runtime.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn reconcile_continues_past_a_stopped_pool() {
    let mut config = base_config(vec![account("A", 1, 10), account("B", 1, 10)]);
    config["subscriptions"] = json!([
        { "instrument_token": NIFTY, "mode": "full", "account_id": "A" },
        { "instrument_token": BANKNIFTY, "mode": "full", "account_id": "B" }
    ]);
    let h = harness(config).await;

    h.runtime.orchestrator().pool("A").unwrap().stop_all().await;
    h.runtime.delete_subscription(BANKNIFTY).await.unwrap();
    h.runtime
        .create_subscription(FINNIFTY, StreamMode::Ltp, Some("B".into()))
        .await
        .unwrap();

    let reports = h.runtime.reconcile().await.unwrap();
    assert!(!reports.contains_key("A"));
    assert!(reports.contains_key("B"));
    let state = h.runtime.runtime_state().await;
    let b = state.accounts.iter().find(|a| a.account_id == "B").unwrap();
    assert_eq!(b.pool.assigned, 1);

    h.runtime.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn ticks_flow_through_to_the_bus() {
    let h = harness(base_config(vec![account("A", 1, 10)])).await;
    let mut rx = h.bus.inner.subscribe();
    h.runtime
        .create_subscription(NIFTY, StreamMode::Quote, None)
        .await
        .unwrap();

    let now = time_util::now_ms();
    h.connectors["A"].feed(vec![tick(NIFTY, 24_000.0, now), tick(NIFTY, 24_001.0, now + 1)]);

    let state = wait_for_state(&h.runtime, "two snapshots", |s| {
        s.pipeline.published_snapshots == 2
    })
    .await;
    assert_eq!(state.handoff.delivered, 2);
    assert_eq!(state.handoff.dropped, 0);

    let mut prices = Vec::new();
    for _ in 0..2 {
        let msg = rx.recv().await.unwrap();
        let batch: Value = serde_json::from_slice(&msg.payload).unwrap();
        prices.push(batch[0]["last_price"].as_f64().unwrap());
    }
    assert_eq!(prices, vec![24_000.0, 24_001.0]);

    h.runtime.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn lifecycle_guards() {
    let h = harness(base_config(vec![account("A", 1, 10)])).await;
    assert!(h.runtime.is_running());
    assert!(matches!(
        h.runtime.start().await,
        Err(VegaError::Config(_))
    ));
    assert!(matches!(
        h.runtime
            .create_subscription(NIFTY, StreamMode::Ltp, Some("Z".into()))
            .await,
        Err(VegaError::UnknownAccount(_))
    ));

    h.runtime.shutdown(Duration::from_secs(1)).await;
    let state = h.runtime.runtime_state().await;
    assert!(!state.running);
    assert!(!state.monitor.running);
    assert_eq!(state.active_subscriptions, 0);

    assert!(matches!(
        h.runtime
            .submit_order(OrderOperation::Place, market_buy(), "late", None)
            .await,
        Err(VegaError::Supervisor(_))
    ));
    // The monitor is gone, so the runtime cannot come back.
    assert!(matches!(
        h.runtime.start().await,
        Err(VegaError::Supervisor(_))
    ));
    // Idempotent.
    h.runtime.shutdown(Duration::from_secs(1)).await;
}

#[test]
fn unwired_account_is_a_config_error() {
    let config: AppConfig =
        serde_json::from_value(base_config(vec![account("A", 1, 1)])).unwrap();
    let result = Runtime::new(
        &config,
        RuntimeDeps {
            accounts: Vec::new(),
            registry: Arc::new(instruments()),
            calculator: Arc::new(FlatGreeks),
            bus: Arc::new(BroadcastBus::new(4)),
            reporter: Arc::new(LogReporter),
        },
    );
    assert!(matches!(result, Err(VegaError::Config(_))));
}
