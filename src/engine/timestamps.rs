//! Timestamp coordination
//!
//! Owns the four authoritative values: the stable timestamp (nothing at
//! or before it will be rolled back), the oldest timestamp (earliest
//! still-readable snapshot), the initial data timestamp (lower bound on
//! meaningful data), and the floor under the all-durable timestamp. The
//! oldest timestamp is derived from stable through a configurable
//! history window; with a zero window it follows stable exactly.
//!
//! The fields are atomics: readers never block writers. The only lock
//! guards the all-durable floor, which must read-modify-write.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::types::Timestamp;

/// Result of publishing a stable timestamp; the engine uses the
/// previous value to decide whether to trigger the first stable
/// checkpoint.
#[derive(Debug, Clone, Copy)]
pub struct StableUpdate {
    pub prev: Timestamp,
    pub applied: bool,
}

pub struct TimestampCoordinator {
    stable: AtomicU64,
    oldest: AtomicU64,
    initial_data: AtomicU64,
    /// Published by the replication layer; backs `ReadSource::LastApplied`.
    last_applied: AtomicU64,
    /// All-durable never reports below this, even after forced
    /// timestamp moves.
    highest_seen_durable: Mutex<u64>,
    history_window_secs: u32,
}

impl TimestampCoordinator {
    pub fn new(history_window_secs: u32) -> Self {
        Self {
            stable: AtomicU64::new(0),
            oldest: AtomicU64::new(0),
            initial_data: AtomicU64::new(0),
            last_applied: AtomicU64::new(0),
            highest_seen_durable: Mutex::new(0),
            history_window_secs,
        }
    }

    pub fn stable(&self) -> Timestamp {
        Timestamp::from_u64(self.stable.load(Ordering::Acquire))
    }

    pub fn oldest(&self) -> Timestamp {
        Timestamp::from_u64(self.oldest.load(Ordering::Acquire))
    }

    pub fn initial_data(&self) -> Timestamp {
        Timestamp::from_u64(self.initial_data.load(Ordering::Acquire))
    }

    pub fn last_applied(&self) -> Timestamp {
        Timestamp::from_u64(self.last_applied.load(Ordering::Acquire))
    }

    pub fn set_last_applied(&self, ts: Timestamp) {
        self.last_applied.store(ts.as_u64(), Ordering::Release);
    }

    /// Publish a new stable timestamp. Backward moves are ignored unless
    /// forced; a forced move drags oldest along and raises the
    /// all-durable floor, since data after the new point is gone.
    pub fn set_stable(&self, ts: Timestamp, force: bool) -> StableUpdate {
        let prev = self.stable();
        if ts.is_null() || (ts < prev && !force) {
            log::debug!("ignoring backward stable timestamp move to {}", ts);
            return StableUpdate {
                prev,
                applied: false,
            };
        }

        if force {
            self.stable.store(ts.as_u64(), Ordering::Release);
            self.oldest.store(ts.as_u64(), Ordering::Release);
            let mut floor = self
                .highest_seen_durable
                .lock()
                .expect("durable floor lock poisoned");
            *floor = (*floor).max(ts.as_u64());
            log::info!("stable and oldest timestamps force-set to {}", ts);
            return StableUpdate { prev, applied: true };
        }

        self.stable.store(ts.as_u64(), Ordering::Release);
        self.advance_oldest_from_stable();
        StableUpdate { prev, applied: true }
    }

    /// Move the oldest timestamp. Monotonic without force; a forced move
    /// sets it exactly and raises the all-durable floor. Non-forced
    /// moves never pass the stable timestamp.
    pub fn set_oldest(&self, ts: Timestamp, force: bool) {
        if force {
            self.oldest.store(ts.as_u64(), Ordering::Release);
            let mut floor = self
                .highest_seen_durable
                .lock()
                .expect("durable floor lock poisoned");
            *floor = (*floor).max(ts.as_u64());
            log::info!("oldest timestamp force-set to {}", ts);
            return;
        }
        let bounded = ts.min(self.stable());
        self.oldest.fetch_max(bounded.as_u64(), Ordering::AcqRel);
    }

    /// May move backward, but only during startup or rollback.
    pub fn set_initial_data(&self, ts: Timestamp) {
        log::debug!("setting initial data timestamp to {}", ts);
        self.initial_data.store(ts.as_u64(), Ordering::Release);
    }

    /// Derive oldest from stable through the history window. No move
    /// happens until the window has accumulated.
    pub fn advance_oldest_from_stable(&self) {
        let stable = self.stable();
        if let Some(target) = self.history_lag_target(stable) {
            self.set_oldest(target, false);
        }
    }

    fn history_lag_target(&self, stable: Timestamp) -> Option<Timestamp> {
        if stable.secs() < self.history_window_secs {
            // Not enough history accumulated yet.
            return None;
        }
        let target = Timestamp::new(stable.secs() - self.history_window_secs, stable.inc());
        if target.as_u64() <= self.oldest.load(Ordering::Acquire) {
            return None;
        }
        Some(target)
    }

    /// Clamp the engine-derived all-durable value to the stored floor,
    /// and remember the largest value ever returned.
    pub fn all_durable(&self, engine_value: Timestamp) -> Timestamp {
        let mut floor = self
            .highest_seen_durable
            .lock()
            .expect("durable floor lock poisoned");
        if engine_value.as_u64() < *floor {
            Timestamp::from_u64(*floor)
        } else {
            *floor = engine_value.as_u64();
            engine_value
        }
    }
}
