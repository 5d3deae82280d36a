//! Pub/sub bus abstraction.
//!
//! The pipeline publishes encoded snapshot batches through [`MessageBus`].
//! [`BroadcastBus`] fans messages out to in-process subscribers; the UDP
//! transport lives in [`crate::udp`].

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::Result;

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish `payload` on `channel`. An `Err` means the message was not
    /// accepted by the transport.
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()>;
}

/// One published message as seen by an in-process subscriber.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub channel: String,
    pub payload: Arc<[u8]>,
}

/// In-process bus backed by a tokio broadcast channel.
///
/// Publishing never blocks; slow subscribers observe `Lagged` and skip ahead.
pub struct BroadcastBus {
    tx: broadcast::Sender<BusMessage>,
}

impl BroadcastBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl MessageBus for BroadcastBus {
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()> {
        let msg = BusMessage {
            channel: channel.to_string(),
            payload: Arc::from(payload),
        };
        // Having no subscriber is not a transport failure.
        let _ = self.tx.send(msg);
        Ok(())
    }
}
