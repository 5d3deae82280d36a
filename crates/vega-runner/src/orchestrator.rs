//! Per-account resources and the routing between them.
//!
//! Every configured account owns exactly one connection pool, one
//! authenticated brokerage session and one circuit breaker. The orchestrator
//! hands sessions out as exclusive leases and spreads work over the accounts
//! whose breaker is not open.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use ahash::AHashMap;
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::info;
use vega_core::resilience::{BreakerSnapshot, BreakerState, CircuitBreaker};
use vega_core::supervisor::TaskMonitor;
use vega_core::types::AccountId;
use vega_core::{Result, VegaError};
use vega_md::ConnectionPool;
use vega_md::pool::PoolSnapshot;
use vega_td::BrokerSession;
use vega_td::lease::{SessionLease, SessionProvider};

/// Resources of one account.
pub struct AccountSlot {
    pub account_id: AccountId,
    pub pool: Arc<ConnectionPool>,
    pub session: Arc<dyn BrokerSession>,
    pub breaker: Arc<CircuitBreaker>,
    lock: Arc<Mutex<()>>,
}

impl AccountSlot {
    pub fn new(
        account_id: AccountId,
        pool: Arc<ConnectionPool>,
        session: Arc<dyn BrokerSession>,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            account_id,
            pool,
            session,
            breaker,
            lock: Arc::new(Mutex::new(())),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountHealth {
    pub account_id: AccountId,
    pub healthy: bool,
    pub breaker: BreakerSnapshot,
    pub pool: PoolSnapshot,
}

pub struct AccountOrchestrator {
    slots: Vec<AccountSlot>,
    index: AHashMap<AccountId, usize>,
    cursor: AtomicUsize,
}

impl AccountOrchestrator {
    pub fn new(slots: Vec<AccountSlot>) -> Result<Self> {
        if slots.is_empty() {
            return Err(VegaError::Config("no accounts configured".into()));
        }
        let mut index = AHashMap::new();
        for (i, slot) in slots.iter().enumerate() {
            if index.insert(slot.account_id.clone(), i).is_some() {
                return Err(VegaError::Config(format!(
                    "duplicate account_id '{}'",
                    slot.account_id
                )));
            }
        }
        Ok(Self {
            slots,
            index,
            cursor: AtomicUsize::new(0),
        })
    }

    fn slot(&self, account_id: &str) -> Result<&AccountSlot> {
        self.index
            .get(account_id)
            .map(|&i| &self.slots[i])
            .ok_or_else(|| VegaError::UnknownAccount(account_id.to_string()))
    }

    /// Configured account ids in configuration order.
    pub fn account_ids(&self) -> Vec<AccountId> {
        self.slots.iter().map(|s| s.account_id.clone()).collect()
    }

    pub fn pool(&self, account_id: &str) -> Result<&Arc<ConnectionPool>> {
        self.slot(account_id).map(|s| &s.pool)
    }

    pub fn breaker(&self, account_id: &str) -> Result<&Arc<CircuitBreaker>> {
        self.slot(account_id).map(|s| &s.breaker)
    }

    /// Accounts whose breaker is not `OPEN`, in configuration order.
    pub async fn available_accounts(&self) -> Vec<AccountId> {
        let mut out = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            if slot.breaker.state().await != BreakerState::Open {
                out.push(slot.account_id.clone());
            }
        }
        out
    }

    /// Round-robin `items` over the available accounts, starting with the
    /// first one. Fails with [`VegaError::Capacity`] when every breaker is
    /// open.
    pub async fn distribute<T>(&self, items: Vec<T>) -> Result<BTreeMap<AccountId, Vec<T>>> {
        let accounts = self.available_accounts().await;
        if accounts.is_empty() {
            return Err(VegaError::Capacity("no healthy account available".into()));
        }
        let mut out: BTreeMap<AccountId, Vec<T>> = BTreeMap::new();
        for (i, item) in items.into_iter().enumerate() {
            out.entry(accounts[i % accounts.len()].clone())
                .or_default()
                .push(item);
        }
        Ok(out)
    }

    /// Exclusive use of `account_id`'s session, waiting at most `timeout`.
    pub async fn lease(&self, account_id: &str, timeout: Duration) -> Result<SessionLease> {
        let slot = self.slot(account_id)?;
        let guard = tokio::time::timeout(timeout, slot.lock.clone().lock_owned())
            .await
            .map_err(|_| VegaError::timeout(format!("lease {account_id}"), timeout))?;
        Ok(SessionLease::new(
            slot.account_id.clone(),
            slot.session.clone(),
            slot.breaker.clone(),
            guard,
        ))
    }

    /// Next available account in rotation.
    pub async fn pick_account(&self) -> Option<AccountId> {
        let accounts = self.available_accounts().await;
        if accounts.is_empty() {
            return None;
        }
        let i = self.cursor.fetch_add(1, Ordering::Relaxed);
        Some(accounts[i % accounts.len()].clone())
    }

    /// Open every pool and start its health check.
    pub async fn start(&self, monitor: &TaskMonitor) -> Result<()> {
        for slot in &self.slots {
            slot.pool.start(monitor).await?;
        }
        info!("[orchestrator] started {} account(s)", self.slots.len());
        Ok(())
    }

    /// Close every pool. Idempotent.
    pub async fn stop(&self) {
        for slot in &self.slots {
            slot.pool.stop_all().await;
        }
        info!("[orchestrator] all pools stopped");
    }

    pub async fn health(&self) -> Vec<AccountHealth> {
        let mut out = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            let breaker = slot.breaker.snapshot().await;
            out.push(AccountHealth {
                account_id: slot.account_id.clone(),
                healthy: breaker.state != BreakerState::Open,
                breaker,
                pool: slot.pool.snapshot().await,
            });
        }
        out
    }
}

#[async_trait]
impl SessionProvider for AccountOrchestrator {
    async fn lease(&self, account_id: &str, timeout: Duration) -> Result<SessionLease> {
        AccountOrchestrator::lease(self, account_id, timeout).await
    }

    async fn pick_account(&self) -> Option<AccountId> {
        AccountOrchestrator::pick_account(self).await
    }

    fn has_account(&self, account_id: &str) -> bool {
        self.index.contains_key(account_id)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use vega_core::config::PoolSettings;
    use vega_core::ports::LogReporter;
    use vega_core::resilience::{CircuitBreakerConfig, RateLimiter};
    use vega_core::time_util::MarketHours;
    use vega_core::types::{Candle, HistoricalRequest, OrderAck, OrderParams};
    use vega_md::transport::{ConnectionSink, TickSink, TickerConnection, TickerConnector};
    use vega_md::{PoolDeps, PoolLimits};

    use super::*;

    struct NoConnector;

    #[async_trait]
    impl TickerConnector for NoConnector {
        async fn connect(
            &self,
            _connection_id: u64,
            _sink: Arc<ConnectionSink>,
        ) -> Result<Arc<dyn TickerConnection>> {
            Err(VegaError::Transport("offline".into()))
        }
    }

    struct CountingSession {
        id: AccountId,
        calls: AtomicU32,
    }

    #[async_trait]
    impl BrokerSession for CountingSession {
        fn account_id(&self) -> &str {
            &self.id
        }

        async fn place_order(&self, _params: &OrderParams) -> Result<OrderAck> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
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

    fn slot(id: &str) -> AccountSlot {
        let (handoff, _rx) = TickSink::channel(8);
        let pool = ConnectionPool::new(
            id.to_string(),
            PoolLimits {
                max_connections: 1,
                max_instruments_per_connection: 10,
            },
            PoolSettings::default(),
            MarketHours::always_open(),
            PoolDeps {
                connector: Arc::new(NoConnector),
                handoff,
                limiter: Arc::new(RateLimiter::unlimited()),
                reporter: Arc::new(LogReporter),
                on_event: None,
            },
        );
        let breaker = CircuitBreaker::new(
            format!("session-{id}"),
            CircuitBreakerConfig {
                failure_threshold: 1,
                recovery_timeout_ms: 60_000,
                ..Default::default()
            },
        );
        AccountSlot::new(
            id.to_string(),
            Arc::new(pool),
            Arc::new(CountingSession {
                id: id.to_string(),
                calls: AtomicU32::new(0),
            }),
            Arc::new(breaker),
        )
    }

    fn orchestrator(ids: &[&str]) -> AccountOrchestrator {
        AccountOrchestrator::new(ids.iter().map(|id| slot(id)).collect()).unwrap()
    }

    #[test]
    fn rejects_empty_and_duplicate_accounts() {
        assert!(matches!(
            AccountOrchestrator::new(Vec::new()),
            Err(VegaError::Config(_))
        ));
        assert!(matches!(
            AccountOrchestrator::new(vec![slot("A"), slot("A")]),
            Err(VegaError::Config(_))
        ));
    }

    #[tokio::test]
    async fn distribute_round_robins_and_skips_open_breakers() {
        let orch = orchestrator(&["A", "B", "C"]);
        let spread = orch.distribute(vec![1, 2, 3, 4, 5]).await.unwrap();
        assert_eq!(spread["A"], vec![1, 4]);
        assert_eq!(spread["B"], vec![2, 5]);
        assert_eq!(spread["C"], vec![3]);

        orch.breaker("B").unwrap().record_failure().await;
        assert_eq!(orch.available_accounts().await, vec!["A".to_string(), "C".to_string()]);
        let spread = orch.distribute(vec![1, 2, 3]).await.unwrap();
        assert!(!spread.contains_key("B"));
        assert_eq!(spread["A"], vec![1, 3]);

        orch.breaker("A").unwrap().trip().await;
        orch.breaker("C").unwrap().trip().await;
        assert!(matches!(
            orch.distribute(vec![1]).await,
            Err(VegaError::Capacity(_))
        ));
        assert!(orch.pick_account().await.is_none());
    }

    #[tokio::test]
    async fn pick_account_rotates() {
        let orch = orchestrator(&["A", "B"]);
        let picks = [
            orch.pick_account().await.unwrap(),
            orch.pick_account().await.unwrap(),
            orch.pick_account().await.unwrap(),
        ];
        assert_eq!(picks, ["A".to_string(), "B".to_string(), "A".to_string()]);
    }

    #[tokio::test]
    async fn lease_is_exclusive_per_account() {
        let orch = orchestrator(&["A", "B"]);
        let held = orch.lease("A", Duration::from_millis(10)).await.unwrap();
        assert_eq!(held.account_id(), "A");

        let err = orch.lease("A", Duration::from_millis(20)).await.err().unwrap();
        assert!(matches!(err, VegaError::Timeout { .. }));
        // Other accounts are unaffected.
        assert!(orch.lease("B", Duration::from_millis(10)).await.is_ok());

        drop(held);
        assert!(orch.lease("A", Duration::from_millis(10)).await.is_ok());
        assert!(matches!(
            orch.lease("Z", Duration::from_millis(10)).await.err().unwrap(),
            VegaError::UnknownAccount(_)
        ));
    }

    #[tokio::test]
    async fn lease_is_released_when_the_holder_panics() {
        let orch = Arc::new(orchestrator(&["A"]));
        let holder = orch.clone();
        let joined = tokio::spawn(async move {
            let _lease = holder.lease("A", Duration::from_millis(10)).await.unwrap();
            panic!("worker died holding the lease");
        })
        .await;
        assert!(joined.is_err());
        assert!(orch.lease("A", Duration::from_millis(10)).await.is_ok());
    }

    #[tokio::test]
    async fn health_reports_each_account() {
        let orch = orchestrator(&["A", "B"]);
        orch.breaker("A").unwrap().trip().await;
        let health = orch.health().await;
        assert_eq!(health.len(), 2);
        assert!(!health[0].healthy);
        assert_eq!(health[0].breaker.state, BreakerState::Open);
        assert!(health[1].healthy);
        assert_eq!(health[1].pool.capacity, 10);
        assert!(orch.has_account("B"));
        assert!(!orch.has_account("Z"));
    }
}
