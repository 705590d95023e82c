//! # Key-Value Slot Repository
//!
//! Stores opaque string values under string keys. The change queue writes
//! its whole serialized snapshot into one slot on every mutation.

use chrono::Utc;
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::DbResult;

/// Repository for the `kv_slots` table.
#[derive(Debug, Clone)]
pub struct KvSlotRepository {
    pool: SqlitePool,
}

impl KvSlotRepository {
    /// Creates a new KvSlotRepository.
    pub fn new(pool: SqlitePool) -> Self {
        KvSlotRepository { pool }
    }

    /// Reads a slot. `None` if it was never written.
    pub async fn load(&self, key: &str) -> DbResult<Option<String>> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM kv_slots WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    /// Writes a slot, replacing any previous value.
    pub async fn save(&self, key: &str, value: &str) -> DbResult<()> {
        debug!(key = %key, bytes = value.len(), "Saving slot");

        sqlx::query(
            r#"
            INSERT INTO kv_slots (key, value, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Removes a slot. Returns whether it existed.
    pub async fn delete(&self, key: &str) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM kv_slots WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
