//! Pipeline counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use super::validator::Rejection;

#[derive(Debug, Default)]
pub struct PipelineStats {
    received: AtomicU64,
    accepted: AtomicU64,
    rejected: [AtomicU64; Rejection::COUNT],
    greeks_computed: AtomicU64,
    greeks_failed: AtomicU64,
    greeks_unavailable: AtomicU64,
    published_batches: AtomicU64,
    published_snapshots: AtomicU64,
    publish_failures: AtomicU64,
    short_circuited: AtomicU64,
    dropped_pending: AtomicU64,
    boundary_resets: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RejectionCounts {
    pub missing_price: u64,
    pub invalid_price: u64,
    pub unknown_instrument: u64,
    pub inactive_instrument: u64,
    pub incomplete_metadata: u64,
    pub bad_timestamp: u64,
    pub stale_timestamp: u64,
}

impl RejectionCounts {
    pub fn total(&self) -> u64 {
        self.missing_price
            + self.invalid_price
            + self.unknown_instrument
            + self.inactive_instrument
            + self.incomplete_metadata
            + self.bad_timestamp
            + self.stale_timestamp
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub received: u64,
    pub accepted: u64,
    pub rejected: RejectionCounts,
    pub greeks_computed: u64,
    pub greeks_failed: u64,
    pub greeks_unavailable: u64,
    pub published_batches: u64,
    pub published_snapshots: u64,
    pub publish_failures: u64,
    pub short_circuited: u64,
    pub dropped_pending: u64,
    pub boundary_resets: u64,
}

macro_rules! bump {
    ($name:ident) => {
        pub fn $name(&self, n: u64) {
            self.$name.fetch_add(n, Ordering::Relaxed);
        }
    };
}

impl PipelineStats {
    bump!(received);
    bump!(accepted);
    bump!(greeks_computed);
    bump!(greeks_failed);
    bump!(greeks_unavailable);
    bump!(published_batches);
    bump!(published_snapshots);
    bump!(publish_failures);
    bump!(short_circuited);
    bump!(dropped_pending);
    bump!(boundary_resets);

    pub fn reject(&self, reason: Rejection) {
        self.rejected[reason as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn rejected(&self, reason: Rejection) -> u64 {
        self.rejected[reason as usize].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            received: load(&self.received),
            accepted: load(&self.accepted),
            rejected: RejectionCounts {
                missing_price: self.rejected(Rejection::MissingPrice),
                invalid_price: self.rejected(Rejection::InvalidPrice),
                unknown_instrument: self.rejected(Rejection::UnknownInstrument),
                inactive_instrument: self.rejected(Rejection::InactiveInstrument),
                incomplete_metadata: self.rejected(Rejection::IncompleteMetadata),
                bad_timestamp: self.rejected(Rejection::BadTimestamp),
                stale_timestamp: self.rejected(Rejection::StaleTimestamp),
            },
            greeks_computed: load(&self.greeks_computed),
            greeks_failed: load(&self.greeks_failed),
            greeks_unavailable: load(&self.greeks_unavailable),
            published_batches: load(&self.published_batches),
            published_snapshots: load(&self.published_snapshots),
            publish_failures: load(&self.publish_failures),
            short_circuited: load(&self.short_circuited),
            dropped_pending: load(&self.dropped_pending),
            boundary_resets: load(&self.boundary_resets),
        }
    }
}
