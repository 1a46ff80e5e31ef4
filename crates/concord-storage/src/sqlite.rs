//! SQLite storage backend

use crate::{Batch, Predicate, Row, Storage, StorageError, StorageStats, Table};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use tracing::debug;

/// SQLite storage backend
///
/// Embedded persistence for a single replica. All tables share one
/// `rows` relation keyed by `(tbl, key)` with an `(tbl, ord, key)` index
/// serving the ordered range queries used by digest paging.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    /// Open (or create) a database at the given path
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(db_err)?;
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.init_schema()?;
        debug!(path = %path.display(), "Opened SQLite storage");
        Ok(storage)
    }

    /// Create an in-memory SQLite database (for testing)
    pub fn in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;

            CREATE TABLE IF NOT EXISTS rows (
                tbl TEXT NOT NULL,
                key TEXT NOT NULL,
                ord INTEGER NOT NULL DEFAULT 0,
                value BLOB NOT NULL,
                PRIMARY KEY (tbl, key)
            );

            CREATE INDEX IF NOT EXISTS idx_rows_order ON rows(tbl, ord, key);
            "#,
        )
        .map_err(db_err)?;

        Ok(())
    }
}

fn db_err(e: rusqlite::Error) -> StorageError {
    StorageError::Database(e.to_string())
}

const UPSERT: &str = r#"
    INSERT INTO rows (tbl, key, ord, value)
    VALUES (?1, ?2, ?3, ?4)
    ON CONFLICT(tbl, key) DO UPDATE SET
        ord = excluded.ord,
        value = excluded.value
"#;

#[async_trait]
impl Storage for SqliteStorage {
    async fn get(&self, table: Table, key: &str) -> Result<Option<Row>, StorageError> {
        let conn = self.conn.lock();

        conn.query_row(
            "SELECT key, ord, value FROM rows WHERE tbl = ?1 AND key = ?2",
            params![table.as_str(), key],
            |row| {
                Ok(Row {
                    key: row.get(0)?,
                    order: row.get(1)?,
                    value: row.get(2)?,
                })
            },
        )
        .optional()
        .map_err(db_err)
    }

    async fn put(&self, table: Table, row: Row) -> Result<(), StorageError> {
        let conn = self.conn.lock();

        conn.execute(UPSERT, params![table.as_str(), row.key, row.order, row.value])
            .map_err(db_err)?;

        Ok(())
    }

    async fn query(
        &self,
        table: Table,
        predicate: &Predicate,
        limit: Option<usize>,
    ) -> Result<Vec<Row>, StorageError> {
        let conn = self.conn.lock();
        // SQLite treats a negative LIMIT as "no limit"
        let limit = limit.map(|l| l as i64).unwrap_or(-1);

        let map_row = |row: &rusqlite::Row<'_>| {
            Ok(Row {
                key: row.get(0)?,
                order: row.get(1)?,
                value: row.get(2)?,
            })
        };

        let rows = match predicate {
            Predicate::All => {
                let mut stmt = conn
                    .prepare(
                        "SELECT key, ord, value FROM rows WHERE tbl = ?1 \
                         ORDER BY ord ASC, key ASC LIMIT ?2",
                    )
                    .map_err(db_err)?;
                let rows = stmt
                    .query_map(params![table.as_str(), limit], map_row)
                    .map_err(db_err)?
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(db_err)?;
                rows
            }
            Predicate::KeyPrefix(prefix) => {
                let pattern = format!("{}%", escape_like(prefix));
                let mut stmt = conn
                    .prepare(
                        "SELECT key, ord, value FROM rows WHERE tbl = ?1 AND key LIKE ?2 ESCAPE '\\' \
                         ORDER BY ord ASC, key ASC LIMIT ?3",
                    )
                    .map_err(db_err)?;
                let rows = stmt
                    .query_map(params![table.as_str(), pattern, limit], map_row)
                    .map_err(db_err)?
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(db_err)?;
                rows
            }
            Predicate::OrderAbove(n) => {
                let mut stmt = conn
                    .prepare(
                        "SELECT key, ord, value FROM rows WHERE tbl = ?1 AND ord > ?2 \
                         ORDER BY ord ASC, key ASC LIMIT ?3",
                    )
                    .map_err(db_err)?;
                let rows = stmt
                    .query_map(params![table.as_str(), n, limit], map_row)
                    .map_err(db_err)?
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(db_err)?;
                rows
            }
        };

        Ok(rows)
    }

    async fn apply(&self, batch: Batch) -> Result<(), StorageError> {
        let mut conn = self.conn.lock();

        let tx = conn.transaction().map_err(db_err)?;
        {
            let mut stmt = tx.prepare_cached(UPSERT).map_err(db_err)?;
            for (table, row) in batch.writes() {
                stmt.execute(params![table.as_str(), row.key, row.order, row.value])
                    .map_err(db_err)?;
            }
        }
        // Dropping an uncommitted transaction rolls it back
        tx.commit().map_err(db_err)?;

        Ok(())
    }

    async fn stats(&self) -> Result<StorageStats, StorageError> {
        let conn = self.conn.lock();

        let (row_count, total_size): (i64, i64) = conn
            .query_row(
                "SELECT COUNT(*), COALESCE(SUM(LENGTH(key) + LENGTH(value)), 0) FROM rows",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(db_err)?;

        Ok(StorageStats {
            row_count: row_count as usize,
            total_size_bytes: total_size as usize,
        })
    }
}

fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}
