//! SQLite key-value backend for the fundingsync record store.
//!
//! Month buckets and day indexes are stored as JSON strings in a single
//! `kv_entries` table. Uses `sqlx` with WAL mode.
//!
//! # Usage
//! ```rust,no_run
//! use fundingsync_storage::sqlite::SqliteKvStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let kv = SqliteKvStore::open("./funding.db").await?;
//!
//! // In-memory with a 5 MB budget (tests / ephemeral)
//! let kv = SqliteKvStore::in_memory().await?.with_capacity_bytes(5 * 1024 * 1024);
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use tracing::{debug, warn};

use fundingsync_core::error::StoreError;
use fundingsync_core::kv::KvStore;

/// Primary result code for `SQLITE_FULL`.
const SQLITE_FULL: &str = "13";

/// SQLite-backed [`KvStore`].
pub struct SqliteKvStore {
    pool: SqlitePool,
    capacity_bytes: Option<usize>,
}

/// Row count and payload size of the `kv_entries` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageUsage {
    pub entries: u64,
    pub bytes: u64,
}

fn backend(e: sqlx::Error) -> StoreError {
    let full = e
        .as_database_error()
        .and_then(|db| db.code())
        .map_or(false, |code| code == SQLITE_FULL);
    if full {
        // the engine does not report sizes; surface it as an unknown quota
        StoreError::QuotaExceeded {
            needed: 0,
            capacity: 0,
        }
    } else {
        StoreError::Backend(e.to_string())
    }
}

impl SqliteKvStore {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./funding.db"`) or a full
    /// SQLite URL (`"sqlite:./funding.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, StoreError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let pool = SqlitePool::connect(&url).await.map_err(backend)?;
        let store = Self {
            pool,
            capacity_bytes: None,
        };
        store.init_schema().await?;
        debug!(path, "sqlite kv store opened");
        Ok(store)
    }

    /// Open an in-memory SQLite database.
    ///
    /// The pool is limited to one connection so every query sees the same
    /// database. All data is lost when the pool is dropped.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(backend)?;
        let store = Self {
            pool,
            capacity_bytes: None,
        };
        store.init_schema().await?;
        Ok(store)
    }

    /// Bound the summed byte length of all keys and values.
    pub fn with_capacity_bytes(mut self, capacity: usize) -> Self {
        self.capacity_bytes = Some(capacity);
        self
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(backend)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS kv_entries (
                key        TEXT    PRIMARY KEY,
                value      TEXT    NOT NULL,
                updated_at INTEGER NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        Ok(())
    }

    /// Entries and bytes currently stored.
    pub async fn usage(&self) -> Result<StorageUsage, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS cnt,
                    COALESCE(SUM(LENGTH(key) + LENGTH(value)), 0) AS bytes
             FROM kv_entries",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(backend)?;

        Ok(StorageUsage {
            entries: row.get::<i64, _>("cnt") as u64,
            bytes: row.get::<i64, _>("bytes") as u64,
        })
    }

    /// Bytes held by every entry except `key`.
    async fn bytes_excluding(&self, key: &str) -> Result<usize, StoreError> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(LENGTH(key) + LENGTH(value)), 0) AS bytes
             FROM kv_entries WHERE key <> ?",
        )
        .bind(key)
        .fetch_one(&self.pool)
        .await
        .map_err(backend)?;

        Ok(row.get::<i64, _>("bytes") as usize)
    }
}

// ─── KvStore impl ────────────────────────────────────────────────────────────

#[async_trait]
impl KvStore for SqliteKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT value FROM kv_entries WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;

        Ok(row.map(|r| r.get::<String, _>("value")))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        if let Some(capacity) = self.capacity_bytes {
            let needed = self.bytes_excluding(key).await? + key.len() + value.len();
            if needed > capacity {
                warn!(key, needed, capacity, "sqlite kv capacity exceeded");
                return Err(StoreError::QuotaExceeded { needed, capacity });
            }
        }

        sqlx::query(
            "INSERT OR REPLACE INTO kv_entries (key, value, updated_at)
             VALUES (?, ?, ?)",
        )
        .bind(key)
        .bind(value)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        debug!(key, bytes = value.len(), "kv entry stored");
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM kv_entries WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(backend)?;

        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        // substr comparison avoids LIKE wildcard escaping
        let rows = sqlx::query(
            "SELECT key FROM kv_entries
             WHERE substr(key, 1, ?) = ?
             ORDER BY key",
        )
        .bind(prefix.chars().count() as i64)
        .bind(prefix)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        Ok(rows.into_iter().map(|r| r.get::<String, _>("key")).collect())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use fundingsync_core::{Coverage, FundingRecord, RecordStore, SyncConfig, YearMonth};

    use super::*;

    #[tokio::test]
    async fn set_get_overwrite() {
        let kv = SqliteKvStore::in_memory().await.unwrap();
        assert!(kv.get("a").await.unwrap().is_none());

        kv.set("a", "1").await.unwrap();
        kv.set("a", "2").await.unwrap();
        assert_eq!(kv.get("a").await.unwrap().as_deref(), Some("2"));

        let usage = kv.usage().await.unwrap();
        assert_eq!(usage.entries, 1);
        assert_eq!(usage.bytes, 2);
    }

    #[tokio::test]
    async fn remove_missing_key_is_ok() {
        let kv = SqliteKvStore::in_memory().await.unwrap();
        kv.remove("nothing").await.unwrap();
        kv.set("k", "v").await.unwrap();
        kv.remove("k").await.unwrap();
        assert!(kv.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn prefix_scan_is_ordered_and_literal() {
        let kv = SqliteKvStore::in_memory().await.unwrap();
        for k in ["x:2", "x:1", "y:1", "x", "x_1", "x%:1"] {
            kv.set(k, "v").await.unwrap();
        }
        assert_eq!(kv.keys_with_prefix("x:").await.unwrap(), vec!["x:1", "x:2"]);
        assert_eq!(kv.keys_with_prefix("x%").await.unwrap(), vec!["x%:1"]);
        assert_eq!(kv.keys_with_prefix("").await.unwrap().len(), 6);
    }

    #[tokio::test]
    async fn capacity_is_enforced() {
        let kv = SqliteKvStore::in_memory().await.unwrap().with_capacity_bytes(10);
        kv.set("k1", "abc").await.unwrap();
        let err = kv.set("k2", "abcd").await.unwrap_err();
        assert!(err.is_quota());
        // overwriting only counts the replacement value
        kv.set("k1", "abcdefgh").await.unwrap();
        assert_eq!(kv.usage().await.unwrap().bytes, 10);
    }

    #[tokio::test]
    async fn record_store_roundtrip() {
        let config = SyncConfig::default();
        let kv = Arc::new(SqliteKvStore::in_memory().await.unwrap());
        let store = RecordStore::new(kv.clone(), &config);

        let month = YearMonth::new(2024, 3).unwrap();
        let record = FundingRecord {
            ts: month.start_ts() + 3_600,
            tx_sig: "tx00001".into(),
            tx_sig_index: 0,
            market_index: 1,
            funding_payment: -1.25,
            base_asset_amount: 2.0,
        };
        let outcome = store
            .write_month("0xabc", month, vec![record.clone()], Coverage::Complete, month.end_ts() + 60)
            .await;
        assert!(outcome.is_stored());

        let bucket = store.read_month("0xabc", month).await.unwrap();
        assert_eq!(bucket.records, vec![record]);
        assert!(bucket.complete);
        assert_eq!(store.cached_months("0xabc").await, vec![month]);
        assert_eq!(kv.usage().await.unwrap().entries, 1);
    }
}
