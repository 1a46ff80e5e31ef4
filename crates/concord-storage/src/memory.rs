//! In-memory storage backend

use crate::{Batch, Predicate, Row, Storage, StorageError, StorageStats, Table};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

/// In-memory storage backend
///
/// Fast, volatile storage suitable for development, tests and caching.
/// Data is lost when the process exits.
pub struct MemoryStorage {
    /// table -> key -> row
    tables: RwLock<HashMap<Table, BTreeMap<String, Row>>>,
    /// When set, every write fails with `StorageError::Unavailable`
    fail_writes: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Make subsequent writes fail (or succeed again). Used to exercise
    /// persistence-failure paths.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("writes disabled".into()));
        }
        Ok(())
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, table: Table, key: &str) -> Result<Option<Row>, StorageError> {
        let tables = self.tables.read();
        Ok(tables.get(&table).and_then(|rows| rows.get(key)).cloned())
    }

    async fn put(&self, table: Table, row: Row) -> Result<(), StorageError> {
        self.check_writable()?;
        self.tables
            .write()
            .entry(table)
            .or_default()
            .insert(row.key.clone(), row);
        Ok(())
    }

    async fn query(
        &self,
        table: Table,
        predicate: &Predicate,
        limit: Option<usize>,
    ) -> Result<Vec<Row>, StorageError> {
        let tables = self.tables.read();
        let mut rows: Vec<Row> = match tables.get(&table) {
            Some(rows) => rows.values().filter(|r| predicate.matches(r)).cloned().collect(),
            None => Vec::new(),
        };
        rows.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.key.cmp(&b.key)));
        if let Some(limit) = limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn apply(&self, batch: Batch) -> Result<(), StorageError> {
        self.check_writable()?;
        // One write guard for the whole batch: readers see all of it or none.
        let mut tables = self.tables.write();
        for (table, row) in batch.into_writes() {
            tables.entry(table).or_default().insert(row.key.clone(), row);
        }
        Ok(())
    }

    async fn stats(&self) -> Result<StorageStats, StorageError> {
        let tables = self.tables.read();
        let mut stats = StorageStats::default();
        for rows in tables.values() {
            stats.row_count += rows.len();
            stats.total_size_bytes += rows
                .values()
                .map(|r| r.key.len() + r.value.len())
                .sum::<usize>();
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_and_get() {
        let storage = MemoryStorage::new();
        storage
            .put(Table::Content, Row::new("cid-1", 0, b"hello".to_vec()))
            .await
            .unwrap();

        let row = storage.get(Table::Content, "cid-1").await.unwrap().unwrap();
        assert_eq!(row.value, b"hello");
        assert!(storage.get(Table::Ops, "cid-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_query_is_ordered() {
        let storage = MemoryStorage::new();
        for (key, order) in [("c", 3), ("a", 1), ("b", 3), ("d", 2)] {
            storage
                .put(Table::Ops, Row::new(key, order, Vec::new()))
                .await
                .unwrap();
        }

        let rows = storage
            .query(Table::Ops, &Predicate::OrderAbove(1), None)
            .await
            .unwrap();
        let keys: Vec<_> = rows.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["d", "b", "c"]);

        let limited = storage
            .query(Table::Ops, &Predicate::All, Some(2))
            .await
            .unwrap();
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].key, "a");
    }

    #[tokio::test]
    async fn test_prefix_query() {
        let storage = MemoryStorage::new();
        storage.put(Table::Favorites, Row::new("alice|p1", 1, Vec::new())).await.unwrap();
        storage.put(Table::Favorites, Row::new("alice|p2", 2, Vec::new())).await.unwrap();
        storage.put(Table::Favorites, Row::new("bob|p1", 3, Vec::new())).await.unwrap();

        let rows = storage
            .query(Table::Favorites, &Predicate::KeyPrefix("alice|".into()), None)
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_batch_writes_nothing() {
        let storage = MemoryStorage::new();
        storage.set_fail_writes(true);

        let batch = Batch::new()
            .put(Table::Ops, Row::new("op", 1, Vec::new()))
            .put(Table::Entities, Row::new("e", 1, Vec::new()));
        assert!(storage.apply(batch).await.is_err());

        let stats = storage.stats().await.unwrap();
        assert_eq!(stats.row_count, 0);

        storage.set_fail_writes(false);
        let batch = Batch::new().put(Table::Ops, Row::new("op", 1, Vec::new()));
        storage.apply(batch).await.unwrap();
        assert_eq!(storage.stats().await.unwrap().row_count, 1);
    }
}
