//! Bounded OS-thread pool for Greeks computation.
//!
//! Pricing is CPU-bound, so it runs on dedicated threads fed by a bounded
//! crossbeam channel and never on the async scheduler. Each job answers on
//! a oneshot channel. A full queue is reported back to the caller instead of
//! blocking, and a panicking calculator only fails its own job.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use crossbeam_channel::{Sender, TrySendError, bounded};
use tokio::sync::oneshot;
use tracing::{error, info};
use vega_core::ports::{GreeksCalculator, GreeksInput};
use vega_core::types::GreeksOutcome;

struct Job {
    input: GreeksInput,
    reply: oneshot::Sender<GreeksOutcome>,
}

/// Pending result of a submitted job.
pub struct GreeksTicket(oneshot::Receiver<GreeksOutcome>);

impl GreeksTicket {
    pub async fn outcome(self) -> GreeksOutcome {
        self.0
            .await
            .unwrap_or_else(|_| GreeksOutcome::failed("greeks worker lost"))
    }
}

pub struct GreeksPool {
    tx: Sender<Job>,
    workers: usize,
}

impl GreeksPool {
    pub fn new(
        calculator: Arc<dyn GreeksCalculator>,
        workers: usize,
        queue_capacity: usize,
    ) -> std::io::Result<Self> {
        let workers = workers.max(1);
        let (tx, rx) = bounded::<Job>(queue_capacity.max(1));
        for i in 0..workers {
            let rx = rx.clone();
            let calculator = calculator.clone();
            std::thread::Builder::new()
                .name(format!("greeks-{i}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        let outcome = match std::panic::catch_unwind(AssertUnwindSafe(|| {
                            calculator.compute(&job.input)
                        })) {
                            Ok(Ok(g)) => GreeksOutcome::computed(g),
                            Ok(Err(e)) => GreeksOutcome::failed(e.to_string()),
                            Err(_) => {
                                error!("[greeks-{i}] calculator panicked");
                                GreeksOutcome::failed("greeks calculator panicked")
                            }
                        };
                        // Receiver gone means the pipeline gave up on it.
                        let _ = job.reply.send(outcome);
                    }
                })?;
        }
        info!("[greeks] started {workers} worker thread(s)");
        Ok(Self { tx, workers })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Queue a job without blocking. `None` means the queue is full.
    pub fn submit(&self, input: GreeksInput) -> Option<GreeksTicket> {
        let (reply, rx) = oneshot::channel();
        match self.tx.try_send(Job { input, reply }) {
            Ok(()) => Some(GreeksTicket(rx)),
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => None,
        }
    }

    /// Submit and wait; saturation yields an `unavailable` outcome.
    pub async fn compute(&self, input: GreeksInput) -> GreeksOutcome {
        match self.submit(input) {
            Some(ticket) => ticket.outcome().await,
            None => GreeksOutcome::unavailable("greeks_pool_saturated"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;

    use chrono::{Duration, Utc};
    use vega_core::ports::GreeksError;
    use vega_core::types::{Greeks, GreeksStatus, OptionKind};

    use super::*;

    fn input(price: f64) -> GreeksInput {
        let now = Utc::now();
        GreeksInput {
            market_price: price,
            spot: 100.0,
            strike: 100.0,
            expiry: now + Duration::days(30),
            valuation_time: now,
            kind: OptionKind::Call,
        }
    }

    struct Scripted;

    impl GreeksCalculator for Scripted {
        fn compute(&self, input: &GreeksInput) -> Result<Greeks, GreeksError> {
            if input.market_price < 0.0 {
                panic!("negative price");
            }
            if input.market_price == 0.0 {
                return Err(GreeksError::InvalidInput("zero".into()));
            }
            Ok(Greeks {
                iv: input.market_price,
                delta: 0.5,
                gamma: 0.1,
                theta: -0.01,
                vega: 0.2,
            })
        }
    }

    #[tokio::test]
    async fn outcomes_and_panic_isolation() {
        let pool = GreeksPool::new(Arc::new(Scripted), 2, 8).unwrap();
        let ok = pool.compute(input(0.3)).await;
        assert_eq!(ok.status, GreeksStatus::Computed);
        assert_eq!(ok.iv, Some(0.3));

        let failed = pool.compute(input(0.0)).await;
        assert_eq!(failed.status, GreeksStatus::Failed);
        assert!(failed.iv.is_none());

        let panicked = pool.compute(input(-1.0)).await;
        assert_eq!(panicked.status, GreeksStatus::Failed);

        // Workers survive the panic.
        assert_eq!(pool.compute(input(0.4)).await.iv, Some(0.4));
    }

    struct Blocking(Arc<Barrier>);

    impl GreeksCalculator for Blocking {
        fn compute(&self, _input: &GreeksInput) -> Result<Greeks, GreeksError> {
            self.0.wait();
            Err(GreeksError::Expired)
        }
    }

    #[tokio::test]
    async fn saturated_queue_is_unavailable() {
        let barrier = Arc::new(Barrier::new(2));
        let pool = GreeksPool::new(Arc::new(Blocking(barrier.clone())), 1, 1).unwrap();
        // One job held by the worker, one in the queue.
        let first = pool.submit(input(1.0)).unwrap();
        let mut queued = None;
        for _ in 0..100 {
            if let Some(t) = pool.submit(input(1.0)) {
                queued = Some(t);
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        let queued = queued.unwrap();
        let rejected = pool.compute(input(1.0)).await;
        assert_eq!(rejected.status, GreeksStatus::Unavailable);

        barrier.wait();
        assert_eq!(first.outcome().await.status, GreeksStatus::Failed);
        barrier.wait();
        assert_eq!(queued.outcome().await.status, GreeksStatus::Failed);
    }
}
