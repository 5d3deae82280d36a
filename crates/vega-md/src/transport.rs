//! Streaming transport seam and the tick hand-off queue.
//!
//! A [`TickerConnector`] opens one socket per call. The socket's own inbound
//! task decodes frames and pushes ticks into its [`ConnectionSink`], which
//! forwards them to the pipeline through a bounded [`TickSink`]. Pushing never
//! blocks: a full queue drops the frame and counts it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::warn;
use vega_core::error::Result;
use vega_core::time_util;
use vega_core::types::{AccountId, RawTick, StreamMode};

/// Ticks decoded from one inbound frame.
#[derive(Debug, Clone)]
pub struct TickBatch {
    pub connection_id: u64,
    pub account_id: AccountId,
    pub ticks: Vec<RawTick>,
    pub received_at_ms: i64,
}

#[derive(Debug, Default)]
struct HandoffCounters {
    delivered: AtomicU64,
    dropped: AtomicU64,
    dropped_frames: AtomicU64,
    malformed: AtomicU64,
}

/// Producer side of the connection → pipeline queue. Cheap to clone.
#[derive(Clone)]
pub struct TickSink {
    tx: mpsc::Sender<TickBatch>,
    counters: Arc<HandoffCounters>,
}

impl TickSink {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<TickBatch>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let sink = Self {
            tx,
            counters: Arc::new(HandoffCounters::default()),
        };
        (sink, rx)
    }

    /// Hand a batch over without waiting. Returns `false` if it was dropped.
    pub fn deliver(&self, batch: TickBatch) -> bool {
        let n = batch.ticks.len() as u64;
        match self.tx.try_send(batch) {
            Ok(()) => {
                self.counters.delivered.fetch_add(n, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Full(b)) => {
                let total = self.counters.dropped.fetch_add(n, Ordering::Relaxed) + n;
                let frames = self.counters.dropped_frames.fetch_add(1, Ordering::Relaxed) + 1;
                // Log at powers of two to keep a flood readable.
                if frames.is_power_of_two() {
                    warn!(
                        "[handoff] queue full, dropped frame from conn {} ({total} dropped ticks total)",
                        b.connection_id
                    );
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.counters.dropped.fetch_add(n, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn record_malformed(&self, n: usize) {
        self.counters.malformed.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn delivered(&self) -> u64 {
        self.counters.delivered.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }

    pub fn malformed(&self) -> u64 {
        self.counters.malformed.load(Ordering::Relaxed)
    }
}

/// Per-connection view of the hand-off queue that also tracks tick recency.
pub struct ConnectionSink {
    connection_id: u64,
    account_id: AccountId,
    handoff: TickSink,
    created: Instant,
    /// Milliseconds after `created` at which the last tick arrived.
    last_tick_offset_ms: AtomicU64,
}

impl ConnectionSink {
    pub fn new(connection_id: u64, account_id: AccountId, handoff: TickSink) -> Self {
        Self {
            connection_id,
            account_id,
            handoff,
            created: Instant::now(),
            last_tick_offset_ms: AtomicU64::new(0),
        }
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    /// Forward decoded ticks. Called from the connection's inbound task.
    pub fn push(&self, ticks: Vec<RawTick>) {
        if ticks.is_empty() {
            return;
        }
        self.touch();
        self.handoff.deliver(TickBatch {
            connection_id: self.connection_id,
            account_id: self.account_id.clone(),
            ticks,
            received_at_ms: time_util::now_ms(),
        });
    }

    pub fn record_malformed(&self, n: usize) {
        if n > 0 {
            self.handoff.record_malformed(n);
        }
    }

    /// Mark the connection as live without a tick (e.g. after a reconnect).
    pub fn touch(&self) {
        let offset = Instant::now().saturating_duration_since(self.created).as_millis() as u64;
        self.last_tick_offset_ms.store(offset, Ordering::Relaxed);
    }

    /// Time since the last tick, or since creation if none arrived yet.
    pub fn idle_for(&self) -> Duration {
        let last = self.created
            + Duration::from_millis(self.last_tick_offset_ms.load(Ordering::Relaxed));
        Instant::now().saturating_duration_since(last)
    }
}

/// Opens streaming connections for one account.
#[async_trait]
pub trait TickerConnector: Send + Sync {
    /// Open a socket and return once it is ready to accept subscriptions.
    async fn connect(
        &self,
        connection_id: u64,
        sink: Arc<ConnectionSink>,
    ) -> Result<Arc<dyn TickerConnection>>;
}

/// One open streaming socket.
#[async_trait]
pub trait TickerConnection: Send + Sync {
    fn id(&self) -> u64;

    fn is_connected(&self) -> bool;

    async fn subscribe(&self, tokens: &[u32], mode: StreamMode) -> Result<()>;

    async fn unsubscribe(&self, tokens: &[u32]) -> Result<()>;

    /// Drop the socket, connect again and subscribe exactly `tokens`.
    async fn reconnect(&self, tokens: &[(u32, StreamMode)]) -> Result<()>;

    /// Close handshake; may wait on the network.
    async fn close(&self) -> Result<()>;

    /// Tear down immediately.
    async fn abort(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(token: u32) -> RawTick {
        RawTick {
            instrument_token: token,
            last_price: Some(1.0),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn full_queue_drops_and_counts() {
        let (sink, mut rx) = TickSink::channel(1);
        let conn = ConnectionSink::new(1, "A".into(), sink.clone());
        conn.push(vec![tick(1), tick(2)]);
        conn.push(vec![tick(3)]);
        conn.push(Vec::new());
        assert_eq!(sink.delivered(), 2);
        assert_eq!(sink.dropped(), 1);

        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.connection_id, 1);
        assert_eq!(batch.account_id, "A");
        assert_eq!(batch.ticks.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_time_resets_on_tick() {
        let (sink, _rx) = TickSink::channel(8);
        let conn = ConnectionSink::new(1, "A".into(), sink);
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(conn.idle_for() >= Duration::from_secs(10));
        conn.push(vec![tick(1)]);
        assert!(conn.idle_for() < Duration::from_secs(1));
    }
}
