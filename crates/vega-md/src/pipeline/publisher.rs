//! Breaker-guarded bus publisher.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;
use vega_core::bus::MessageBus;
use vega_core::resilience::CircuitBreaker;
use vega_core::{Result, VegaError};

use super::stats::PipelineStats;

const ATTEMPTS: u32 = 2;

pub struct Publisher {
    bus: Arc<dyn MessageBus>,
    breaker: Arc<CircuitBreaker>,
    timeout: Duration,
    stats: Arc<PipelineStats>,
}

impl Publisher {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        breaker: Arc<CircuitBreaker>,
        timeout: Duration,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            bus,
            breaker,
            timeout,
            stats,
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Publish one payload. An open breaker returns
    /// [`VegaError::CircuitOpen`] without touching the bus; otherwise the
    /// publish is tried twice and only then recorded as one breaker failure.
    pub async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()> {
        if let Err(e) = self.breaker.try_acquire().await {
            self.stats.short_circuited(1);
            return Err(e);
        }

        let mut last_err = None;
        for attempt in 1..=ATTEMPTS {
            let err = match tokio::time::timeout(self.timeout, self.bus.publish(channel, payload)).await
            {
                Ok(Ok(())) => {
                    self.breaker.record_success().await;
                    return Ok(());
                }
                Ok(Err(e)) => e,
                Err(_) => VegaError::timeout(format!("publish to {channel}"), self.timeout),
            };
            debug!("[publisher] {channel} attempt {attempt}/{ATTEMPTS} failed: {err}");
            last_err = Some(err);
        }
        self.breaker.record_failure().await;
        Err(last_err.unwrap_or_else(|| VegaError::Bus(format!("publish to {channel} failed"))))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use async_trait::async_trait;
    use vega_core::resilience::{BreakerState, CircuitBreakerConfig};

    use super::*;

    #[derive(Default)]
    struct FlakyBus {
        failing: AtomicBool,
        calls: AtomicU32,
    }

    #[async_trait]
    impl MessageBus for FlakyBus {
        async fn publish(&self, _channel: &str, _payload: &[u8]) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                Err(VegaError::Bus("down".into()))
            } else {
                Ok(())
            }
        }
    }

    fn publisher(bus: Arc<FlakyBus>) -> (Publisher, Arc<PipelineStats>) {
        let breaker = Arc::new(CircuitBreaker::new(
            "bus",
            CircuitBreakerConfig {
                failure_threshold: 2,
                recovery_timeout_ms: 1_000,
                half_open_max_attempts: 1,
                success_threshold: 1,
            },
        ));
        let stats = Arc::new(PipelineStats::default());
        let p = Publisher::new(bus, breaker, Duration::from_millis(100), stats.clone());
        (p, stats)
    }

    #[tokio::test]
    async fn retries_once_before_recording_failure() {
        let bus = Arc::new(FlakyBus::default());
        bus.failing.store(true, Ordering::SeqCst);
        let (p, _) = publisher(bus.clone());

        assert!(p.publish("c", b"[]").await.is_err());
        assert_eq!(bus.calls.load(Ordering::SeqCst), 2);
        assert_eq!(p.breaker().snapshot().await.consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn open_breaker_short_circuits_then_recovers() {
        let bus = Arc::new(FlakyBus::default());
        bus.failing.store(true, Ordering::SeqCst);
        let (p, stats) = publisher(bus.clone());

        p.publish("c", b"1").await.unwrap_err();
        p.publish("c", b"2").await.unwrap_err();
        assert_eq!(p.breaker().state().await, BreakerState::Open);

        let calls = bus.calls.load(Ordering::SeqCst);
        let err = p.publish("c", b"3").await.unwrap_err();
        assert!(matches!(err, VegaError::CircuitOpen { .. }));
        assert_eq!(bus.calls.load(Ordering::SeqCst), calls);
        assert_eq!(stats.snapshot().short_circuited, 1);

        bus.failing.store(false, Ordering::SeqCst);
        tokio::time::advance(Duration::from_millis(1_000)).await;
        p.publish("c", b"4").await.unwrap();
        assert_eq!(p.breaker().state().await, BreakerState::Closed);
    }
}
