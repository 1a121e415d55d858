//! # Idempotency Key Repository
//!
//! Durable storage for event locks and processed markers.
//!
//! ## Key States
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │   (absent) ──try_acquire──► locked ──mark_processed──► processed        │
//! │       ▲                       │                            │            │
//! │       └──────release──────────┘                            │            │
//! │       ▲                                                    │            │
//! │       └─────────── expires_at passes (either state) ───────┘            │
//! │                                                                         │
//! │  try_acquire is one INSERT ... ON CONFLICT DO UPDATE ... WHERE expired │
//! │  statement: of two concurrent callers exactly one changes a row.       │
//! │  A lock carries its owner's token; release only matches that owner.    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::time::Duration;
use tracing::debug;

use crate::error::DbResult;

fn expiry(now: DateTime<Utc>, ttl: Duration) -> i64 {
    now.timestamp_millis().saturating_add(ttl.as_millis() as i64)
}

#[derive(Debug, Clone)]
pub struct IdempotencyRepository {
    pool: SqlitePool,
}

impl IdempotencyRepository {
    pub fn new(pool: SqlitePool) -> Self {
        IdempotencyRepository { pool }
    }

    /// Takes the lock for `key` on behalf of `owner` unless a live lock or
    /// marker exists.
    pub async fn try_acquire(&self, key: &str, owner: &str, ttl: Duration, now: DateTime<Utc>) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO idempotency_keys (key, state, expires_at, owner) VALUES (?, 'locked', ?, ?)
            ON CONFLICT (key) DO UPDATE SET
                state = 'locked', expires_at = excluded.expires_at, owner = excluded.owner
             WHERE idempotency_keys.expires_at <= ?
            "#,
        )
        .bind(key)
        .bind(expiry(now, ttl))
        .bind(owner)
        .bind(now.timestamp_millis())
        .execute(&self.pool)
        .await?;

        let acquired = result.rows_affected() == 1;
        debug!(key = %key, acquired, "Idempotency lock");
        Ok(acquired)
    }

    /// Replaces the lock (or nothing) with a processed marker.
    pub async fn mark_processed(&self, key: &str, ttl: Duration, now: DateTime<Utc>) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO idempotency_keys (key, state, expires_at) VALUES (?, 'processed', ?)
            ON CONFLICT (key) DO UPDATE SET state = 'processed', expires_at = excluded.expires_at, owner = NULL
            "#,
        )
        .bind(key)
        .bind(expiry(now, ttl))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn is_processed(&self, key: &str, now: DateTime<Utc>) -> DbResult<bool> {
        let found: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM idempotency_keys WHERE key = ? AND state = 'processed' AND expires_at > ?",
        )
        .bind(key)
        .bind(now.timestamp_millis())
        .fetch_optional(&self.pool)
        .await?;
        Ok(found.is_some())
    }

    /// Drops a lock held by `owner`. Processed markers and locks taken over
    /// by another owner are kept. Returns whether a lock was removed.
    pub async fn release(&self, key: &str, owner: &str) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM idempotency_keys WHERE key = ? AND state = 'locked' AND owner = ?")
            .bind(key)
            .bind(owner)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Deletes every expired key and returns how many were removed.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> DbResult<u64> {
        let result = sqlx::query("DELETE FROM idempotency_keys WHERE expires_at <= ?")
            .bind(now.timestamp_millis())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
