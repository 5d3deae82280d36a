//! Per-instrument monotonic timestamp guard.
//!
//! Ticks for one instrument may arrive more than once (reconnect replays,
//! overlapping subscriptions) or out of order. [`TimestampGuard`] remembers
//! the last accepted exchange timestamp per token and accepts a tick only if
//! its timestamp is strictly greater.
//!
//! # Thread safety
//!
//! Not thread-safe. The pipeline task owns its instance.

use ahash::AHashMap;

#[derive(Debug, Default)]
pub struct TimestampGuard {
    last: AHashMap<u32, i64>,
}

impl TimestampGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` and records `ts` if it is newer than the last accepted
    /// timestamp for `token`; returns `false` for duplicates and regressions.
    #[inline]
    pub fn check_and_update(&mut self, token: u32, ts: i64) -> bool {
        match self.last.get_mut(&token) {
            Some(last) if ts <= *last => false,
            Some(last) => {
                *last = ts;
                true
            }
            None => {
                self.last.insert(token, ts);
                true
            }
        }
    }

    pub fn last(&self, token: u32) -> Option<i64> {
        self.last.get(&token).copied()
    }

    pub fn forget(&mut self, token: u32) {
        self.last.remove(&token);
    }

    /// Clear all state.
    pub fn clear(&mut self) {
        self.last.clear();
    }
}
