//! SQLite storage backend for chainpipe.
//!
//! Persists checkpoints and dedup cache entries to a single SQLite file.
//! Uses `sqlx` with WAL mode so the cache and checkpoint writers do not
//! block each other.
//!
//! # Usage
//! ```rust,no_run
//! use chainpipe_storage::sqlite::SqliteStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStorage::open("./chainpipe.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStorage::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use chainpipe_core::{CacheError, Checkpoint, CheckpointError, CheckpointStore, KvCache, Position};

/// SQLite-backed storage for checkpoints and the dedup cache.
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./chainpipe.db"`) or a full
    /// SQLite URL (`"sqlite:./chainpipe.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, CheckpointError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let pool = SqlitePool::connect(&url)
            .await
            .map_err(|e| CheckpointError::Storage(e.to_string()))?;

        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Open an in-memory SQLite database.
    ///
    /// A single connection is used so every query sees the same database.
    pub async fn in_memory() -> Result<Self, CheckpointError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| CheckpointError::Storage(e.to_string()))?;

        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Create tables and enable WAL mode.
    async fn init_schema(&self) -> Result<(), CheckpointError> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(|e| CheckpointError::Storage(e.to_string()))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS checkpoints (
                source_id   TEXT    NOT NULL PRIMARY KEY,
                sequence    INTEGER NOT NULL,
                idx         INTEGER NOT NULL,
                updated_at  INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| CheckpointError::Storage(e.to_string()))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS dedup_cache (
                cache_key   TEXT    NOT NULL PRIMARY KEY,
                value       BLOB    NOT NULL,
                expires_at  INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| CheckpointError::Storage(e.to_string()))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_dedup_expiry ON dedup_cache (expires_at)")
            .execute(&self.pool)
            .await
            .map_err(|e| CheckpointError::Storage(e.to_string()))?;

        Ok(())
    }

    /// Delete expired cache rows. Returns how many were removed.
    pub async fn purge_expired(&self) -> Result<u64, CacheError> {
        let now = Utc::now().timestamp_millis();
        let res = sqlx::query("DELETE FROM dedup_cache WHERE expires_at <= ?")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))?;
        Ok(res.rows_affected())
    }
}

#[async_trait]
impl CheckpointStore for SqliteStorage {
    async fn load(&self, source_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        let row = sqlx::query(
            "SELECT sequence, idx, updated_at FROM checkpoints WHERE source_id = ?",
        )
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CheckpointError::Storage(e.to_string()))?;

        let Some(r) = row else {
            return Ok(None);
        };
        let sequence = r.get::<i64, _>("sequence") as u64;
        let index = u32::try_from(r.get::<i64, _>("idx")).map_err(|_| CheckpointError::Corrupt {
            source_id: source_id.to_string(),
            reason: "index out of range".into(),
        })?;
        let updated_at = DateTime::from_timestamp_millis(r.get::<i64, _>("updated_at"))
            .unwrap_or_else(Utc::now);

        Ok(Some(Checkpoint {
            source_id: source_id.to_string(),
            position: Position::new(sequence, index),
            updated_at,
        }))
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        sqlx::query(
            "INSERT OR REPLACE INTO checkpoints (source_id, sequence, idx, updated_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(&checkpoint.source_id)
        .bind(checkpoint.position.sequence as i64)
        .bind(checkpoint.position.index as i64)
        .bind(checkpoint.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(|e| CheckpointError::Storage(e.to_string()))?;

        debug!(
            source_id = %checkpoint.source_id,
            position = %checkpoint.position,
            "checkpoint saved to SQLite"
        );
        Ok(())
    }

    async fn delete(&self, source_id: &str) -> Result<(), CheckpointError> {
        sqlx::query("DELETE FROM checkpoints WHERE source_id = ?")
            .bind(source_id)
            .execute(&self.pool)
            .await
            .map_err(|e| CheckpointError::Storage(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl KvCache for SqliteStorage {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let row = sqlx::query("SELECT value FROM dedup_cache WHERE cache_key = ? AND expires_at > ?")
            .bind(key)
            .bind(Utc::now().timestamp_millis())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))?;
        Ok(row.map(|r| r.get::<Vec<u8>, _>("value")))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError> {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let expires_at = Utc::now().timestamp_millis().saturating_add(ttl_ms);
        sqlx::query(
            "INSERT OR REPLACE INTO dedup_cache (cache_key, value, expires_at) VALUES (?, ?, ?)",
        )
        .bind(key)
        .bind(value)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(|e| CacheError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), CacheError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| CacheError::Unavailable(e.to_string()))?;
        Ok(())
    }
}
