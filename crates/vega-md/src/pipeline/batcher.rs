//! Per-category batching with size and age triggers.
//!
//! Each category owns one queue behind its own lock. A flush takes a
//! [`FlushTicket`] holding the drained snapshots; while a ticket is out no
//! second flush of that category can start, so duplicate triggers never
//! publish the same contents twice. A failed flush hands its ticket back and
//! the snapshots return to the front of the queue in their original order.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::warn;
use vega_core::types::{Snapshot, StreamCategory};

use super::stats::PipelineStats;

struct Pending {
    queued_at: Instant,
    snapshot: Snapshot,
}

#[derive(Default)]
struct CategoryQueue {
    pending: VecDeque<Pending>,
    flushing: bool,
}

/// Outcome of [`Batcher::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Queued; `ready` is set once the size trigger fired.
    Queued { ready: bool },
    /// Pending cap reached, snapshot discarded.
    Dropped,
}

/// Exclusive right to publish one batch.
pub struct FlushTicket {
    category: StreamCategory,
    items: Vec<Pending>,
}

impl FlushTicket {
    pub fn category(&self) -> StreamCategory {
        self.category
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn snapshots(&self) -> Vec<&Snapshot> {
        self.items.iter().map(|p| &p.snapshot).collect()
    }
}

pub struct Batcher {
    underlying: Mutex<CategoryQueue>,
    option: Mutex<CategoryQueue>,
    max_batch_size: usize,
    flush_interval: Duration,
    max_pending: usize,
    stats: Arc<PipelineStats>,
}

impl Batcher {
    pub fn new(
        max_batch_size: usize,
        flush_interval: Duration,
        max_pending: usize,
        stats: Arc<PipelineStats>,
    ) -> Self {
        let max_batch_size = max_batch_size.max(1);
        Self {
            underlying: Mutex::default(),
            option: Mutex::default(),
            max_batch_size,
            flush_interval,
            max_pending: max_pending.max(max_batch_size),
            stats,
        }
    }

    fn queue(&self, category: StreamCategory) -> &Mutex<CategoryQueue> {
        match category {
            StreamCategory::Underlying => &self.underlying,
            StreamCategory::Option => &self.option,
        }
    }

    pub async fn add(&self, snapshot: Snapshot) -> Admission {
        let category = snapshot.category();
        let mut q = self.queue(category).lock().await;
        if q.pending.len() >= self.max_pending {
            self.stats.dropped_pending(1);
            let dropped = self.stats.snapshot().dropped_pending;
            if dropped.is_power_of_two() {
                warn!(
                    "[pipeline] {} queue full ({} pending), {dropped} snapshot(s) dropped so far",
                    category.as_str(),
                    q.pending.len()
                );
            }
            return Admission::Dropped;
        }
        q.pending.push_back(Pending {
            queued_at: Instant::now(),
            snapshot,
        });
        Admission::Queued {
            ready: q.pending.len() >= self.max_batch_size,
        }
    }

    pub async fn pending(&self, category: StreamCategory) -> usize {
        self.queue(category).lock().await.pending.len()
    }

    /// Take the next batch if a trigger fired (or `force`), no other flush of
    /// this category is in progress, and anything is queued.
    pub async fn take_ready(&self, category: StreamCategory, force: bool) -> Option<FlushTicket> {
        let mut q = self.queue(category).lock().await;
        if q.flushing {
            return None;
        }
        let oldest = q.pending.front()?.queued_at;
        let due = force
            || q.pending.len() >= self.max_batch_size
            || oldest.elapsed() >= self.flush_interval;
        if !due {
            return None;
        }
        let n = q.pending.len().min(self.max_batch_size);
        let items: Vec<Pending> = q.pending.drain(..n).collect();
        q.flushing = true;
        Some(FlushTicket { category, items })
    }

    /// Finish a flush. On failure the batch goes back to the front; anything
    /// then beyond the pending cap is dropped from the back.
    pub async fn complete(&self, ticket: FlushTicket, published: bool) {
        let mut q = self.queue(ticket.category).lock().await;
        q.flushing = false;
        if published {
            return;
        }
        for item in ticket.items.into_iter().rev() {
            q.pending.push_front(item);
        }
        let excess = q.pending.len().saturating_sub(self.max_pending);
        if excess > 0 {
            q.pending.truncate(self.max_pending);
            self.stats.dropped_pending(excess as u64);
        }
    }
}

#[cfg(test)]
mod tests {
    use vega_core::types::QuoteSnapshot;

    use super::*;

    fn snap(token: u32) -> Snapshot {
        Snapshot::Underlying(QuoteSnapshot {
            instrument_token: token,
            trading_symbol: format!("SYM{token}"),
            last_price: 1.0,
            volume: None,
            oi: None,
            bid: None,
            ask: None,
            depth: None,
            timestamp_ms: 1,
        })
    }

    fn tokens(t: &FlushTicket) -> Vec<u32> {
        t.snapshots().iter().map(|s| s.instrument_token()).collect()
    }

    fn batcher(max_batch: usize, max_pending: usize) -> (Batcher, Arc<PipelineStats>) {
        let stats = Arc::new(PipelineStats::default());
        let b = Batcher::new(max_batch, Duration::from_millis(100), max_pending, stats.clone());
        (b, stats)
    }

    #[tokio::test]
    async fn size_trigger() {
        let (b, _) = batcher(3, 10);
        assert_eq!(b.add(snap(1)).await, Admission::Queued { ready: false });
        assert_eq!(b.add(snap(2)).await, Admission::Queued { ready: false });
        assert!(b.take_ready(StreamCategory::Underlying, false).await.is_none());
        assert_eq!(b.add(snap(3)).await, Admission::Queued { ready: true });
        let t = b.take_ready(StreamCategory::Underlying, false).await.unwrap();
        assert_eq!(tokens(&t), vec![1, 2, 3]);
        assert!(b.take_ready(StreamCategory::Option, true).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn age_trigger() {
        let (b, _) = batcher(10, 100);
        b.add(snap(1)).await;
        assert!(b.take_ready(StreamCategory::Underlying, false).await.is_none());
        tokio::time::advance(Duration::from_millis(100)).await;
        let t = b.take_ready(StreamCategory::Underlying, false).await.unwrap();
        assert_eq!(t.len(), 1);
    }

    #[tokio::test]
    async fn one_flush_at_a_time() {
        let (b, _) = batcher(2, 10);
        for i in 0..4 {
            b.add(snap(i)).await;
        }
        let first = b.take_ready(StreamCategory::Underlying, true).await.unwrap();
        // A duplicate trigger while the first is in flight gets nothing.
        assert!(b.take_ready(StreamCategory::Underlying, true).await.is_none());
        b.complete(first, true).await;
        let second = b.take_ready(StreamCategory::Underlying, true).await.unwrap();
        assert_eq!(tokens(&second), vec![2, 3]);
    }

    #[tokio::test]
    async fn failed_flush_requeues_in_order_and_caps() {
        let (b, stats) = batcher(2, 3);
        for i in 0..3 {
            b.add(snap(i)).await;
        }
        let t = b.take_ready(StreamCategory::Underlying, true).await.unwrap();
        b.add(snap(3)).await;
        b.add(snap(4)).await;
        assert_eq!(b.add(snap(5)).await, Admission::Dropped);
        b.complete(t, false).await;

        assert_eq!(b.pending(StreamCategory::Underlying).await, 3);
        let t = b.take_ready(StreamCategory::Underlying, true).await.unwrap();
        assert_eq!(tokens(&t), vec![0, 1]);
        b.complete(t, true).await;
        let t = b.take_ready(StreamCategory::Underlying, true).await.unwrap();
        assert_eq!(tokens(&t), vec![2]);
        // One dropped on add, two (3 and 4) dropped after the requeue.
        assert_eq!(stats.snapshot().dropped_pending, 3);
    }
}
