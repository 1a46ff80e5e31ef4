//! Lamport logical clock with a persisted high-water mark

use crate::error::{Error, Result};
use crate::op::{lamport_key, MAX_LAMPORT};
use concord_storage::{Row, Storage, Table};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

const CLOCK_KEY: &str = "lamport";

/// Monotonic Lamport counter.
///
/// `advance` and `observe` run under one async mutex, and the durable write
/// always lands before the in-memory value moves, so a failed write leaves
/// the clock where it was.
pub struct LogicalClock {
    storage: Arc<dyn Storage>,
    state: Mutex<u64>,
    /// Last committed value, readable without the mutex
    current: AtomicU64,
}

impl LogicalClock {
    /// Load the clock from storage, starting at zero on a fresh replica
    pub async fn open(storage: Arc<dyn Storage>) -> Result<Self> {
        let value = storage
            .get(Table::Clock, CLOCK_KEY)
            .await?
            .map(|row| u64::try_from(row.order))
            .transpose()
            .map_err(|_| Error::validation("stored logical clock is negative"))?
            .unwrap_or(0);

        debug!(lamport = value, "Loaded logical clock");

        Ok(Self {
            storage,
            state: Mutex::new(value),
            current: AtomicU64::new(value),
        })
    }

    /// Next local timestamp, strictly greater than every value handed out
    /// or observed before.
    pub async fn advance(&self) -> Result<u64> {
        let mut state = self.state.lock().await;
        let next = state
            .checked_add(1)
            .filter(|next| *next <= MAX_LAMPORT)
            .ok_or_else(|| Error::validation("logical clock is exhausted"))?;
        self.persist(next).await?;
        *state = next;
        self.current.store(next, Ordering::SeqCst);
        Ok(next)
    }

    /// Merge a remote timestamp: `local = max(local, remote)`.
    /// Values above [`MAX_LAMPORT`] are refused and leave the clock alone.
    pub async fn observe(&self, remote: u64) -> Result<u64> {
        if remote > MAX_LAMPORT {
            return Err(Error::validation(format!(
                "remote lamport {} is out of range",
                remote
            )));
        }
        let mut state = self.state.lock().await;
        if remote > *state {
            self.persist(remote).await?;
            *state = remote;
            self.current.store(remote, Ordering::SeqCst);
        }
        Ok(*state)
    }

    pub fn current(&self) -> u64 {
        self.current.load(Ordering::SeqCst)
    }

    async fn persist(&self, value: u64) -> Result<()> {
        self.storage
            .put(Table::Clock, Row::new(CLOCK_KEY, lamport_key(value)?, Vec::new()))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_storage::MemoryStorage;

    #[tokio::test]
    async fn test_advance_is_strictly_increasing() {
        let clock = LogicalClock::open(Arc::new(MemoryStorage::new())).await.unwrap();

        assert_eq!(clock.advance().await.unwrap(), 1);
        assert_eq!(clock.advance().await.unwrap(), 2);
        assert_eq!(clock.current(), 2);
    }

    #[tokio::test]
    async fn test_observe_takes_max_without_increment() {
        let clock = LogicalClock::open(Arc::new(MemoryStorage::new())).await.unwrap();

        assert_eq!(clock.observe(10).await.unwrap(), 10);
        // Older remote values never move the clock back
        assert_eq!(clock.observe(4).await.unwrap(), 10);
        assert_eq!(clock.advance().await.unwrap(), 11);
    }

    #[tokio::test]
    async fn test_clock_survives_reopen() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        {
            let clock = LogicalClock::open(storage.clone()).await.unwrap();
            clock.advance().await.unwrap();
            clock.observe(41).await.unwrap();
        }

        let clock = LogicalClock::open(storage).await.unwrap();
        assert_eq!(clock.current(), 41);
        assert_eq!(clock.advance().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_failed_persist_does_not_move_clock() {
        let storage = Arc::new(MemoryStorage::new());
        let clock = LogicalClock::open(storage.clone()).await.unwrap();
        clock.advance().await.unwrap();

        storage.set_fail_writes(true);
        assert!(clock.advance().await.is_err());
        assert!(clock.observe(100).await.is_err());
        assert_eq!(clock.current(), 1);

        storage.set_fail_writes(false);
        assert_eq!(clock.advance().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_out_of_range_lamport_is_refused() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        {
            let clock = LogicalClock::open(storage.clone()).await.unwrap();
            clock.observe(7).await.unwrap();
            assert!(clock.observe(u64::MAX).await.is_err());
            assert!(clock.observe(MAX_LAMPORT + 1).await.is_err());
            assert_eq!(clock.current(), 7);
        }

        // Nothing unstorable was written, so a reload never goes backwards
        let clock = LogicalClock::open(storage).await.unwrap();
        assert_eq!(clock.current(), 7);
    }

    #[tokio::test]
    async fn test_advance_at_the_top_errors_instead_of_wrapping() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let clock = LogicalClock::open(storage.clone()).await.unwrap();

        assert_eq!(clock.observe(MAX_LAMPORT).await.unwrap(), MAX_LAMPORT);
        assert!(clock.advance().await.is_err());
        assert_eq!(clock.current(), MAX_LAMPORT);

        let reopened = LogicalClock::open(storage).await.unwrap();
        assert_eq!(reopened.current(), MAX_LAMPORT);
    }

    #[tokio::test]
    async fn test_concurrent_advances_are_unique() {
        let clock = Arc::new(LogicalClock::open(Arc::new(MemoryStorage::new())).await.unwrap());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let clock = clock.clone();
            handles.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                for _ in 0..25 {
                    seen.push(clock.advance().await.unwrap());
                }
                seen
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 200);
        assert_eq!(clock.current(), 200);
    }
}
