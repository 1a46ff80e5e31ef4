//! Sync counters kept per node

use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

macro_rules! counters {
    ($($name:ident),* $(,)?) => {
        /// Monotonic counters updated by the dispatcher, reconciler and broadcaster
        #[derive(Debug, Default)]
        pub struct SyncStats {
            $(pub $name: AtomicU64,)*
            /// Wall clock (ms) of the last completed sync cycle
            pub last_sync_ms: AtomicI64,
        }

        /// Point-in-time copy of [`SyncStats`]
        #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
        pub struct SyncStatsSnapshot {
            $(pub $name: u64,)*
            pub last_sync_ms: i64,
        }

        impl SyncStats {
            pub fn snapshot(&self) -> SyncStatsSnapshot {
                SyncStatsSnapshot {
                    $($name: self.$name.load(Ordering::Relaxed),)*
                    last_sync_ms: self.last_sync_ms.load(Ordering::Relaxed),
                }
            }
        }

        impl SyncStatsSnapshot {
            /// `(name, value)` for every counter
            pub fn counters(&self) -> Vec<(&'static str, u64)> {
                vec![$((stringify!($name), self.$name),)*]
            }
        }
    };
}

counters!(
    frames_received,
    frames_dropped,
    rate_limited,
    handler_errors,
    requests_sent,
    requests_received,
    digests_received,
    ops_applied,
    moderation_applied,
    fetch_attempts,
    fetch_successes,
    fetch_failures,
    sync_cycles,
    peer_failures,
    broadcasts_sent,
    broadcast_failures,
);

impl SyncStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn mark_synced(&self, now_ms: i64) {
        self.last_sync_ms.store(now_ms, Ordering::Relaxed);
        Self::incr(&self.sync_cycles);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let stats = SyncStats::new();
        SyncStats::incr(&stats.frames_received);
        SyncStats::add(&stats.digests_received, 10);
        stats.mark_synced(1234);

        let snap = stats.snapshot();
        assert_eq!(snap.frames_received, 1);
        assert_eq!(snap.digests_received, 10);
        assert_eq!(snap.sync_cycles, 1);
        assert_eq!(snap.last_sync_ms, 1234);
        assert_eq!(snap.fetch_failures, 0);
        assert!(snap.counters().contains(&("digests_received", 10)));
    }
}
