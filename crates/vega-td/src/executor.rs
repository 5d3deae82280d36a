//! Order execution engine.
//!
//! # Task lifecycle
//!
//! ```text
//! PENDING ──► RUNNING ──► COMPLETED
//!                │
//!                ├──► FAILED        (rejected by the broker / invalid)
//!                │
//!                └──► RETRYING ──► RUNNING ...   (transient error)
//!                          │
//!                          └──► DEAD_LETTER     (max_attempts reached)
//! ```
//!
//! Submission only validates, deduplicates and queues. Workers claim ready
//! tasks, lease the account session, take an `orders` rate-limit token and
//! call the broker through the account's circuit breaker. The store lock is
//! never held across any of those awaits.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use futures_util::FutureExt;
use serde::Serialize;
use tokio::sync::{Mutex, Notify, mpsc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use vega_core::config::ExecutorSettings;
use vega_core::ports::StatusReporter;
use vega_core::resilience::{RateLimiter, retry_delay};
use vega_core::supervisor::TaskMonitor;
use vega_core::types::{
    AccountId, Candle, EndpointCategory, HistoricalRequest, OrderAck, OrderOperation, OrderParams,
    OrderTask, TaskStatus,
};
use vega_core::{ErrorKind, Result, VegaError};

use crate::dispatch;
use crate::event::{TaskEvent, TaskEventReceiver, TaskEventSender};
use crate::lease::SessionProvider;
use crate::store::{Outcome, StoreCounts, TaskStore};

/// Longest idle sleep of a worker between store checks.
const IDLE_POLL: Duration = Duration::from_secs(1);

/// Collaborators of the executor.
pub struct ExecutorDeps {
    pub sessions: Arc<dyn SessionProvider>,
    pub limiter: Arc<RateLimiter>,
    pub reporter: Arc<dyn StatusReporter>,
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    deduplicated: AtomicU64,
    rejected_capacity: AtomicU64,
    attempts: AtomicU64,
    cleaned: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutorStats {
    pub store: StoreCounts,
    pub submitted: u64,
    pub deduplicated: u64,
    pub rejected_capacity: u64,
    pub attempts: u64,
    pub cleaned: u64,
}

pub struct OrderExecutor {
    settings: ExecutorSettings,
    store: Mutex<TaskStore>,
    sessions: Arc<dyn SessionProvider>,
    limiter: Arc<RateLimiter>,
    reporter: Arc<dyn StatusReporter>,
    events: TaskEventSender,
    wake: Notify,
    stopped: AtomicBool,
    counters: Counters,
}

impl OrderExecutor {
    pub fn new(settings: ExecutorSettings, deps: ExecutorDeps) -> (Self, TaskEventReceiver) {
        let (events, rx) = mpsc::unbounded_channel();
        let store = TaskStore::new(
            settings.max_tasks,
            settings.retention(),
            settings.idempotency_window(),
        );
        let executor = Self {
            settings,
            store: Mutex::new(store),
            sessions: deps.sessions,
            limiter: deps.limiter,
            reporter: deps.reporter,
            events,
            wake: Notify::new(),
            stopped: AtomicBool::new(false),
            counters: Counters::default(),
        };
        (executor, rx)
    }

    fn emit(&self, from: Option<TaskStatus>, task: &OrderTask) {
        self.reporter.task_transition(task);
        // Nobody listening is fine.
        let _ = self.events.send(TaskEvent::new(from, task));
    }

    /// Validate and queue an order operation.
    ///
    /// Returns the id of the task registered under `idempotency_key`, which
    /// is the existing one if the key was seen within its window. Execution
    /// errors are never returned from here; they show up on the task.
    pub async fn submit(
        &self,
        operation: OrderOperation,
        params: OrderParams,
        idempotency_key: &str,
        account_id: Option<AccountId>,
    ) -> Result<Uuid> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(VegaError::Shutdown("order executor".into()));
        }
        if idempotency_key.trim().is_empty() {
            return Err(VegaError::Validation("idempotency_key is required".into()));
        }
        params.validate(operation)?;

        let account_id = match account_id {
            Some(id) if self.sessions.has_account(&id) => id,
            Some(id) => return Err(VegaError::UnknownAccount(id)),
            None => self
                .sessions
                .pick_account()
                .await
                .ok_or_else(|| VegaError::Capacity("no healthy account available".into()))?,
        };

        let now = Utc::now();
        let (admitted, created) = {
            let mut store = self.store.lock().await;
            let admitted = match store.insert(idempotency_key, operation, params, account_id, now) {
                Ok(a) => a,
                Err(e) => {
                    self.counters.rejected_capacity.fetch_add(1, Ordering::Relaxed);
                    return Err(e);
                }
            };
            let created = admitted
                .created
                .then(|| store.get(&admitted.task_id).cloned())
                .flatten();
            (admitted, created)
        };

        if let Some(task) = created {
            self.counters.submitted.fetch_add(1, Ordering::Relaxed);
            info!(
                "[executor] task {} ({operation} on {}) queued, key '{idempotency_key}'",
                task.task_id, task.account_id
            );
            self.emit(None, &task);
            self.wake.notify_one();
        } else {
            self.counters.deduplicated.fetch_add(1, Ordering::Relaxed);
            debug!("[executor] key '{idempotency_key}' maps to task {}", admitted.task_id);
        }
        Ok(admitted.task_id)
    }

    pub async fn task(&self, task_id: &Uuid) -> Option<OrderTask> {
        self.store.lock().await.get(task_id).cloned()
    }

    pub async fn dead_letters(&self) -> Vec<OrderTask> {
        self.store.lock().await.dead_letters()
    }

    pub async fn stats(&self) -> ExecutorStats {
        let store = self.store.lock().await.counts();
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        ExecutorStats {
            store,
            submitted: load(&self.counters.submitted),
            deduplicated: load(&self.counters.deduplicated),
            rejected_capacity: load(&self.counters.rejected_capacity),
            attempts: load(&self.counters.attempts),
            cleaned: load(&self.counters.cleaned),
        }
    }

    /// Remove expired terminal tasks now.
    pub async fn cleanup(&self) -> usize {
        let removed = self.store.lock().await.cleanup(Utc::now());
        if removed > 0 {
            self.counters.cleaned.fetch_add(removed as u64, Ordering::Relaxed);
            debug!("[executor] cleanup removed {removed} task(s)");
        }
        removed
    }

    /// Candle data through the account's lease, `historical` rate-limit
    /// category and breaker.
    pub async fn fetch_historical(
        &self,
        account_id: Option<AccountId>,
        request: &HistoricalRequest,
    ) -> Result<Vec<Candle>> {
        let account_id = match account_id {
            Some(id) => id,
            None => self
                .sessions
                .pick_account()
                .await
                .ok_or_else(|| VegaError::Capacity("no healthy account available".into()))?,
        };
        let lease = self
            .sessions
            .lease(&account_id, self.settings.lease_timeout())
            .await?;
        self.limiter
            .acquire(EndpointCategory::Historical, true, self.settings.rate_limit_wait())
            .await?;
        let session = lease.session().clone();
        let timeout = self.settings.call_timeout();
        lease
            .breaker()
            .call(|| async move {
                tokio::time::timeout(timeout, session.fetch_historical(request))
                    .await
                    .map_err(|_| VegaError::timeout("fetch_historical", timeout))?
            })
            .await
    }

    /// Spawn the workers and the periodic cleanup under `monitor`.
    pub async fn start(self: &Arc<Self>, monitor: &TaskMonitor) -> Result<()> {
        self.stopped.store(false, Ordering::Release);
        for i in 0..self.settings.workers.max(1) {
            let executor = self.clone();
            let shutdown = monitor.shutdown_signal();
            monitor
                .spawn(format!("executor-worker-{i}"), async move {
                    executor.worker_loop(i, shutdown).await;
                    Ok(())
                })
                .await?;
        }

        let executor = self.clone();
        let mut shutdown = monitor.shutdown_signal();
        let period = self.settings.cleanup_interval();
        monitor
            .spawn("executor-cleanup", async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            executor.cleanup().await;
                        }
                        _ = shutdown.changed() => break,
                    }
                }
                Ok(())
            })
            .await?;

        info!("[executor] started {} worker(s)", self.settings.workers.max(1));
        Ok(())
    }

    /// Refuse new submissions and wake idle workers so they see the stop.
    pub fn shutdown(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            info!("[executor] shutting down");
        }
        self.wake.notify_waiters();
    }

    /// Fail every task still marked `RUNNING`. Meant for after the workers
    /// are gone, when nothing will finish those attempts.
    pub async fn fail_in_flight(&self) -> usize {
        let now = Utc::now();
        let finished: Vec<(TaskStatus, OrderTask)> = {
            let mut store = self.store.lock().await;
            store
                .running_ids()
                .into_iter()
                .filter_map(|id| {
                    store.finish(&id, Outcome::Failed("interrupted by shutdown".into()), now)
                })
                .collect()
        };
        for (from, task) in &finished {
            warn!("[executor] task {} interrupted by shutdown", task.task_id);
            self.emit(Some(*from), task);
        }
        finished.len()
    }

    async fn worker_loop(
        &self,
        worker: usize,
        mut shutdown: vega_core::supervisor::ShutdownSignal,
    ) {
        loop {
            if *shutdown.borrow() || self.stopped.load(Ordering::Acquire) {
                break;
            }
            let now = Utc::now();
            let (claimed, next_due) = {
                let mut store = self.store.lock().await;
                let claimed = store.claim_next(now);
                let next_due = store.next_due(now);
                (claimed, next_due)
            };

            if let Some((from, task)) = claimed {
                self.emit(Some(from), &task);
                self.execute(worker, task).await;
                continue;
            }

            let idle = next_due
                .and_then(|at| (at - now).to_std().ok())
                .map_or(IDLE_POLL, |d| d.min(IDLE_POLL));
            tokio::select! {
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(idle) => {}
                _ = shutdown.changed() => break,
            }
        }
        debug!("[executor-{worker}] stopped");
    }

    async fn execute(&self, worker: usize, task: OrderTask) {
        self.counters.attempts.fetch_add(1, Ordering::Relaxed);
        let result = AssertUnwindSafe(self.attempt(&task)).catch_unwind().await;
        let now = Utc::now();

        let outcome = match result {
            Err(_) => {
                error!(
                    "[executor-{worker}] task {} panicked during execution",
                    task.task_id
                );
                Outcome::Failed("execution panicked".into())
            }
            Ok(Ok(ack)) => {
                info!(
                    "[executor-{worker}] task {} completed, order {}",
                    task.task_id, ack.order_id
                );
                Outcome::Completed(ack)
            }
            Ok(Err(e)) if matches!(e.kind(), ErrorKind::Transient | ErrorKind::Capacity) => {
                if task.attempts >= self.settings.max_attempts {
                    warn!(
                        "[executor-{worker}] task {} dead-lettered after {} attempt(s): {e}",
                        task.task_id, task.attempts
                    );
                    Outcome::DeadLetter(e.to_string())
                } else {
                    let delay = retry_delay(
                        self.settings.backoff_base,
                        task.attempts,
                        self.settings.backoff_cap(),
                    );
                    debug!(
                        "[executor-{worker}] task {} attempt {} failed, retry in {delay:?}: {e}",
                        task.task_id, task.attempts
                    );
                    let at = now + chrono::Duration::from_std(delay).unwrap_or_default();
                    Outcome::Retry {
                        error: e.to_string(),
                        at,
                    }
                }
            }
            Ok(Err(e)) => {
                warn!("[executor-{worker}] task {} failed: {e}", task.task_id);
                Outcome::Failed(e.to_string())
            }
        };

        let retrying = matches!(outcome, Outcome::Retry { .. });
        let finished = self.store.lock().await.finish(&task.task_id, outcome, now);
        if let Some((from, updated)) = finished {
            self.emit(Some(from), &updated);
        }
        if retrying {
            self.wake.notify_one();
        }
    }

    async fn attempt(&self, task: &OrderTask) -> Result<OrderAck> {
        let lease = self
            .sessions
            .lease(&task.account_id, self.settings.lease_timeout())
            .await?;
        self.limiter
            .acquire(EndpointCategory::Orders, true, self.settings.rate_limit_wait())
            .await?;

        let session = lease.session().clone();
        let timeout = self.settings.call_timeout();
        let (operation, params) = (task.operation, &task.params);
        lease
            .breaker()
            .call(|| async move {
                tokio::time::timeout(timeout, dispatch(session.as_ref(), operation, params))
                    .await
                    .map_err(|_| VegaError::timeout(format!("{operation} order"), timeout))?
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::AtomicU32;

    use async_trait::async_trait;
    use vega_core::ports::LogReporter;
    use vega_core::resilience::{CircuitBreaker, CircuitBreakerConfig};
    use vega_core::types::{Direction, OrderType};

    use super::*;
    use crate::BrokerSession;
    use crate::lease::SessionLease;

    /// Session whose place results are scripted per call.
    struct ScriptedSession {
        script: std::sync::Mutex<Vec<Result<OrderAck>>>,
        calls: AtomicU32,
        panic_next: AtomicBool,
        hang: AtomicBool,
    }

    impl ScriptedSession {
        fn new(script: Vec<Result<OrderAck>>) -> Arc<Self> {
            Arc::new(Self {
                script: std::sync::Mutex::new(script),
                calls: AtomicU32::new(0),
                panic_next: AtomicBool::new(false),
                hang: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl BrokerSession for ScriptedSession {
        fn account_id(&self) -> &str {
            "acc1"
        }

        async fn place_order(&self, _params: &OrderParams) -> Result<OrderAck> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.panic_next.swap(false, Ordering::SeqCst) {
                panic!("session blew up");
            }
            if self.hang.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                return Ok(OrderAck {
                    order_id: format!("ord-{n}"),
                });
            }
            script.remove(0)
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

    struct Provider {
        accounts: HashMap<String, (Arc<dyn BrokerSession>, Arc<CircuitBreaker>, Arc<Mutex<()>>)>,
    }

    #[async_trait]
    impl SessionProvider for Provider {
        async fn lease(&self, account_id: &str, timeout: Duration) -> Result<SessionLease> {
            let (session, breaker, lock) = self
                .accounts
                .get(account_id)
                .ok_or_else(|| VegaError::UnknownAccount(account_id.into()))?;
            let guard = tokio::time::timeout(timeout, lock.clone().lock_owned())
                .await
                .map_err(|_| VegaError::timeout("lease", timeout))?;
            Ok(SessionLease::new(account_id.into(), session.clone(), breaker.clone(), guard))
        }

        async fn pick_account(&self) -> Option<AccountId> {
            self.accounts.keys().next().cloned()
        }

        fn has_account(&self, account_id: &str) -> bool {
            self.accounts.contains_key(account_id)
        }
    }

    fn settings() -> ExecutorSettings {
        ExecutorSettings {
            workers: 2,
            max_attempts: 3,
            backoff_cap_secs: 0,
            call_timeout_ms: 200,
            ..Default::default()
        }
    }

    fn executor(
        session: Arc<ScriptedSession>,
        settings: ExecutorSettings,
    ) -> (Arc<OrderExecutor>, TaskEventReceiver) {
        let breaker = Arc::new(CircuitBreaker::new("acc1", CircuitBreakerConfig::default()));
        let mut accounts = HashMap::new();
        accounts.insert(
            "acc1".to_string(),
            (session as Arc<dyn BrokerSession>, breaker, Arc::new(Mutex::new(()))),
        );
        let deps = ExecutorDeps {
            sessions: Arc::new(Provider { accounts }),
            limiter: Arc::new(RateLimiter::unlimited()),
            reporter: Arc::new(LogReporter),
        };
        let (e, rx) = OrderExecutor::new(settings, deps);
        (Arc::new(e), rx)
    }

    fn params() -> OrderParams {
        OrderParams {
            exchange: "NFO".into(),
            trading_symbol: "NIFTY24DEC24000CE".into(),
            transaction_type: Some(Direction::Buy),
            quantity: Some(50),
            order_type: Some(OrderType::Market),
            ..Default::default()
        }
    }

    async fn wait_terminal(e: &OrderExecutor, id: &Uuid) -> OrderTask {
        for _ in 0..400 {
            if let Some(t) = e.task(id).await {
                if t.status.is_terminal() {
                    return t;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("task {id} did not finish");
    }

    #[tokio::test]
    async fn concurrent_same_key_yields_one_task() {
        let (e, _rx) = executor(ScriptedSession::new(vec![]), settings());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let e = e.clone();
            handles.push(tokio::spawn(async move {
                e.submit(OrderOperation::Place, params(), "same", None).await.unwrap()
            }));
        }
        let mut ids = Vec::new();
        for h in handles {
            ids.push(h.await.unwrap());
        }
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        let s = e.stats().await;
        assert_eq!(s.store.live, 1);
        assert_eq!(s.submitted, 1);
        assert_eq!(s.deduplicated, 15);
    }

    #[tokio::test]
    async fn validation_and_unknown_account() {
        let (e, _rx) = executor(ScriptedSession::new(vec![]), settings());
        let err = e
            .submit(OrderOperation::Cancel, params(), "k", None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        let err = e
            .submit(OrderOperation::Place, params(), "k", Some("nope".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, VegaError::UnknownAccount(_)));
        assert!(e.submit(OrderOperation::Place, params(), " ", None).await.is_err());
    }

    #[tokio::test]
    async fn transient_errors_retry_then_complete() {
        let session = ScriptedSession::new(vec![
            Err(VegaError::Transport("reset".into())),
            Err(VegaError::RateLimited { category: "orders".into() }),
        ]);
        let (e, mut rx) = executor(session.clone(), settings());
        let id = e.submit(OrderOperation::Place, params(), "r", None).await.unwrap();
        let monitor = TaskMonitor::new();
        e.start(&monitor).await.unwrap();

        let t = wait_terminal(&e, &id).await;
        assert_eq!(t.status, TaskStatus::Completed);
        assert_eq!(t.attempts, 3);
        assert_eq!(session.calls.load(Ordering::SeqCst), 3);

        let mut seen = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            seen.push(ev.to);
        }
        assert_eq!(
            seen,
            vec![
                TaskStatus::Pending,
                TaskStatus::Running,
                TaskStatus::Retrying,
                TaskStatus::Running,
                TaskStatus::Retrying,
                TaskStatus::Running,
                TaskStatus::Completed,
            ]
        );
        monitor.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn rejection_fails_and_exhaustion_dead_letters() {
        let session = ScriptedSession::new(vec![
            Err(VegaError::Rejected { status: 400, message: "bad qty".into() }),
            Err(VegaError::Transport("1".into())),
            Err(VegaError::Transport("2".into())),
            Err(VegaError::Transport("3".into())),
        ]);
        let mut s = settings();
        s.workers = 1;
        let (e, _rx) = executor(session, s);
        let monitor = TaskMonitor::new();
        e.start(&monitor).await.unwrap();

        let rejected = e.submit(OrderOperation::Place, params(), "a", None).await.unwrap();
        assert_eq!(wait_terminal(&e, &rejected).await.status, TaskStatus::Failed);

        let doomed = e.submit(OrderOperation::Place, params(), "b", None).await.unwrap();
        let t = wait_terminal(&e, &doomed).await;
        assert_eq!(t.status, TaskStatus::DeadLetter);
        assert_eq!(t.attempts, 3);
        assert_eq!(t.last_error.as_deref(), Some("transport error: 3"));
        assert_eq!(e.dead_letters().await.len(), 1);
        monitor.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn shutdown_refuses_submissions() {
        let (e, _rx) = executor(ScriptedSession::new(vec![]), settings());
        e.shutdown();
        let err = e.submit(OrderOperation::Place, params(), "x", None).await.unwrap_err();
        assert!(matches!(err, VegaError::Shutdown(_)));
    }

    #[tokio::test]
    async fn panicking_attempt_fails_the_task_and_worker_survives() {
        let session = ScriptedSession::new(vec![]);
        session.panic_next.store(true, Ordering::SeqCst);
        let mut s = settings();
        s.workers = 1;
        let (e, _rx) = executor(session.clone(), s);
        let monitor = TaskMonitor::new();
        e.start(&monitor).await.unwrap();

        let boom = e.submit(OrderOperation::Place, params(), "boom", None).await.unwrap();
        let t = wait_terminal(&e, &boom).await;
        assert_eq!(t.status, TaskStatus::Failed);
        assert_eq!(t.last_error.as_deref(), Some("execution panicked"));

        // Same single worker picks up the next task; the lease was released.
        let next = e.submit(OrderOperation::Place, params(), "next", None).await.unwrap();
        assert_eq!(wait_terminal(&e, &next).await.status, TaskStatus::Completed);
        monitor.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn tasks_running_at_shutdown_are_failed() {
        let session = ScriptedSession::new(vec![]);
        session.hang.store(true, Ordering::SeqCst);
        let mut s = settings();
        s.call_timeout_ms = 60_000;
        let (e, mut rx) = executor(session, s);
        let monitor = TaskMonitor::new();
        e.start(&monitor).await.unwrap();

        let id = e.submit(OrderOperation::Place, params(), "stuck", None).await.unwrap();
        for _ in 0..400 {
            if e.task(&id).await.is_some_and(|t| t.status == TaskStatus::Running) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        e.shutdown();
        monitor.shutdown(Duration::from_millis(50)).await;

        assert_eq!(e.fail_in_flight().await, 1);
        let t = e.task(&id).await.unwrap();
        assert_eq!(t.status, TaskStatus::Failed);
        assert_eq!(t.last_error.as_deref(), Some("interrupted by shutdown"));
        let mut last = None;
        while let Ok(ev) = rx.try_recv() {
            last = Some(ev.to);
        }
        assert_eq!(last, Some(TaskStatus::Failed));
        assert_eq!(e.fail_in_flight().await, 0);
    }
}
