//! Concord Storage Backends
//!
//! The replication engine treats storage as an external collaborator with a
//! small relational contract: keyed rows grouped in tables, ordered range
//! queries, and transactional all-or-nothing batches.
//!
//! - Memory (default): Fast, volatile storage
//! - SQLite: Embedded persistence

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Logical tables used by a replica
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Table {
    /// Logical clock high-water marks
    Clock,
    /// Content-addressed blobs
    Content,
    /// Applied operations, keyed by op id
    Ops,
    /// Entity snapshots
    Entities,
    /// Per-(actor, entity) favorite registers
    Favorites,
    /// Moderation reports
    Reports,
    /// Local notifications
    Notifications,
    /// Shadow-ban registers and the governance policy
    Moderation,
}

impl Table {
    pub const ALL: [Table; 8] = [
        Table::Clock,
        Table::Content,
        Table::Ops,
        Table::Entities,
        Table::Favorites,
        Table::Reports,
        Table::Notifications,
        Table::Moderation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Clock => "clock",
            Table::Content => "content",
            Table::Ops => "ops",
            Table::Entities => "entities",
            Table::Favorites => "favorites",
            Table::Reports => "reports",
            Table::Notifications => "notifications",
            Table::Moderation => "moderation",
        }
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored row. Rows within a table are ordered by `(order, key)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub key: String,
    pub order: i64,
    pub value: Vec<u8>,
}

impl Row {
    pub fn new(key: impl Into<String>, order: i64, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            order,
            value: value.into(),
        }
    }
}

/// Row filter for [`Storage::query`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    /// Every row of the table
    All,
    /// Rows whose key starts with the prefix
    KeyPrefix(String),
    /// Rows with `order > n`
    OrderAbove(i64),
}

impl Predicate {
    pub fn matches(&self, row: &Row) -> bool {
        match self {
            Predicate::All => true,
            Predicate::KeyPrefix(prefix) => row.key.starts_with(prefix.as_str()),
            Predicate::OrderAbove(n) => row.order > *n,
        }
    }
}

/// A set of writes applied all-or-nothing
#[derive(Debug, Clone, Default)]
pub struct Batch {
    writes: Vec<(Table, Row)>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(mut self, table: Table, row: Row) -> Self {
        self.writes.push((table, row));
        self
    }

    pub fn push(&mut self, table: Table, row: Row) {
        self.writes.push((table, row));
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn writes(&self) -> &[(Table, Row)] {
        &self.writes
    }

    pub fn into_writes(self) -> Vec<(Table, Row)> {
        self.writes
    }
}

/// Storage backend trait
#[async_trait]
pub trait Storage: Send + Sync {
    /// Load a single row
    async fn get(&self, table: Table, key: &str) -> Result<Option<Row>, StorageError>;

    /// Insert or replace a single row
    async fn put(&self, table: Table, row: Row) -> Result<(), StorageError>;

    /// Rows matching the predicate, ascending by `(order, key)`
    async fn query(
        &self,
        table: Table,
        predicate: &Predicate,
        limit: Option<usize>,
    ) -> Result<Vec<Row>, StorageError>;

    /// Apply every write in the batch, or none of them
    async fn apply(&self, batch: Batch) -> Result<(), StorageError>;

    /// Get storage statistics
    async fn stats(&self) -> Result<StorageStats, StorageError>;
}

/// Storage error types
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Storage is not writable: {0}")]
    Unavailable(String),
}

/// Storage statistics
#[derive(Debug, Clone, Default)]
pub struct StorageStats {
    pub row_count: usize,
    pub total_size_bytes: usize,
}

pub use memory::MemoryStorage;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;
