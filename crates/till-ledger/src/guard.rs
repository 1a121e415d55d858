//! # Idempotency Guard
//!
//! At-most-once processing of sale events delivered at-least-once.
//!
//! ## Protocol
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Event Processing Protocol                            │
//! │                                                                         │
//! │  try_acquire(key) ──None───► skip, report Duplicate (success)          │
//! │        │                                                                │
//! │   Some(token)                                                           │
//! │        ▼                                                                │
//! │  apply cash movement ──ok──► mark_processed(key)   (long TTL, 24h)     │
//! │        │                           │                                    │
//! │       err                          ▼                                    │
//! │        └──────────────────────► release(key, token) (always)           │
//! │                                                                         │
//! │  A crashed worker's lock expires after the short TTL (60s), so the     │
//! │  event can be delivered again and retried. A late release from that    │
//! │  worker carries its old token and leaves the new holder's lock alone.  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Backends
//! - [`MemoryIdempotencyGuard`] - single process, lost on restart
//! - [`SqliteIdempotencyGuard`] - the ledger database, survives restarts
//! - `RedisIdempotencyGuard` - shared across processes (feature `redis-guard`)

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::config::{GuardBackend, IdempotencySettings};
use crate::error::{ServiceError, ServiceResult};
use till_db::{Database, IdempotencyRepository};

/// Proof of holding a lock, handed back on release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken(String);

impl LockToken {
    fn generate() -> Self {
        LockToken(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[async_trait]
pub trait IdempotencyGuard: Send + Sync {
    /// Marks `key` as in flight. None if it is already locked or processed.
    async fn try_acquire(&self, key: &str) -> ServiceResult<Option<LockToken>>;

    /// Records that `key` was fully processed.
    async fn mark_processed(&self, key: &str) -> ServiceResult<()>;

    async fn is_processed(&self, key: &str) -> ServiceResult<bool>;

    /// Drops the in-flight lock if `token` still owns it. A processed
    /// marker stays.
    async fn release(&self, key: &str, token: &LockToken) -> ServiceResult<()>;
}

/// Builds the guard selected in the configuration.
pub async fn from_settings(
    settings: &IdempotencySettings,
    db: &Database,
) -> ServiceResult<Arc<dyn IdempotencyGuard>> {
    let lock_ttl = settings.lock_ttl();
    let processed_ttl = settings.processed_ttl();

    match settings.backend {
        GuardBackend::Memory => Ok(Arc::new(MemoryIdempotencyGuard::new(lock_ttl, processed_ttl))),
        GuardBackend::Sqlite => Ok(Arc::new(SqliteIdempotencyGuard::new(
            db.idempotency(),
            lock_ttl,
            processed_ttl,
        ))),
        #[cfg(feature = "redis-guard")]
        GuardBackend::Redis => {
            let url = settings
                .redis_url
                .as_deref()
                .ok_or_else(|| ServiceError::InvalidConfig("idempotency.redis_url is not set".into()))?;
            let guard = redis_guard::RedisIdempotencyGuard::connect(url, lock_ttl, processed_ttl).await?;
            Ok(Arc::new(guard))
        }
        #[cfg(not(feature = "redis-guard"))]
        GuardBackend::Redis => Err(ServiceError::InvalidConfig(
            "redis idempotency backend requires the `redis-guard` feature".into(),
        )),
    }
}

// =============================================================================
// In-Memory Guard
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyState {
    Locked,
    Processed,
}

#[derive(Debug, Clone)]
struct Entry {
    state: KeyState,
    owner: Option<LockToken>,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Process-local guard. Expired entries are swept on every acquisition.
#[derive(Debug)]
pub struct MemoryIdempotencyGuard {
    entries: Mutex<HashMap<String, Entry>>,
    lock_ttl: Duration,
    processed_ttl: Duration,
}

impl MemoryIdempotencyGuard {
    pub fn new(lock_ttl: Duration, processed_ttl: Duration) -> Self {
        MemoryIdempotencyGuard {
            entries: Mutex::new(HashMap::new()),
            lock_ttl,
            processed_ttl,
        }
    }

    /// Number of live entries.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.lock().await.values().filter(|e| e.is_live(now)).count()
    }
}

impl Default for MemoryIdempotencyGuard {
    fn default() -> Self {
        MemoryIdempotencyGuard::new(
            Duration::from_secs(till_core::DEFAULT_LOCK_TTL_SECS),
            Duration::from_secs(till_core::DEFAULT_PROCESSED_TTL_SECS),
        )
    }
}

#[async_trait]
impl IdempotencyGuard for MemoryIdempotencyGuard {
    async fn try_acquire(&self, key: &str) -> ServiceResult<Option<LockToken>> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        entries.retain(|_, e| e.is_live(now));

        if entries.contains_key(key) {
            debug!(key = %key, "Idempotency key busy");
            return Ok(None);
        }

        let token = LockToken::generate();
        entries.insert(
            key.to_string(),
            Entry {
                state: KeyState::Locked,
                owner: Some(token.clone()),
                expires_at: now + self.lock_ttl,
            },
        );
        Ok(Some(token))
    }

    async fn mark_processed(&self, key: &str) -> ServiceResult<()> {
        let expires_at = Instant::now() + self.processed_ttl;
        self.entries.lock().await.insert(
            key.to_string(),
            Entry {
                state: KeyState::Processed,
                owner: None,
                expires_at,
            },
        );
        Ok(())
    }

    async fn is_processed(&self, key: &str) -> ServiceResult<bool> {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        Ok(entries
            .get(key)
            .is_some_and(|e| e.state == KeyState::Processed && e.is_live(now)))
    }

    async fn release(&self, key: &str, token: &LockToken) -> ServiceResult<()> {
        let mut entries = self.entries.lock().await;
        let owned = entries
            .get(key)
            .is_some_and(|e| e.state == KeyState::Locked && e.owner.as_ref() == Some(token));
        if owned {
            entries.remove(key);
        } else {
            debug!(key = %key, "Lock no longer held, release skipped");
        }
        Ok(())
    }
}

// =============================================================================
// SQLite Guard
// =============================================================================

/// Guard stored in the `idempotency_keys` table of the ledger database.
#[derive(Debug, Clone)]
pub struct SqliteIdempotencyGuard {
    keys: IdempotencyRepository,
    lock_ttl: Duration,
    processed_ttl: Duration,
}

impl SqliteIdempotencyGuard {
    pub fn new(keys: IdempotencyRepository, lock_ttl: Duration, processed_ttl: Duration) -> Self {
        SqliteIdempotencyGuard {
            keys,
            lock_ttl,
            processed_ttl,
        }
    }

    /// Deletes expired keys. Called by the scheduler.
    pub async fn purge_expired(&self) -> ServiceResult<u64> {
        Ok(self.keys.purge_expired(Utc::now()).await?)
    }
}

#[async_trait]
impl IdempotencyGuard for SqliteIdempotencyGuard {
    async fn try_acquire(&self, key: &str) -> ServiceResult<Option<LockToken>> {
        let token = LockToken::generate();
        let acquired = self
            .keys
            .try_acquire(key, token.as_str(), self.lock_ttl, Utc::now())
            .await?;
        Ok(acquired.then_some(token))
    }

    async fn mark_processed(&self, key: &str) -> ServiceResult<()> {
        Ok(self.keys.mark_processed(key, self.processed_ttl, Utc::now()).await?)
    }

    async fn is_processed(&self, key: &str) -> ServiceResult<bool> {
        Ok(self.keys.is_processed(key, Utc::now()).await?)
    }

    async fn release(&self, key: &str, token: &LockToken) -> ServiceResult<()> {
        if !self.keys.release(key, token.as_str()).await? {
            debug!(key = %key, "Lock no longer held, release skipped");
        }
        Ok(())
    }
}

// =============================================================================
// Redis Guard
// =============================================================================

#[cfg(feature = "redis-guard")]
pub use redis_guard::RedisIdempotencyGuard;

#[cfg(feature = "redis-guard")]
mod redis_guard {
    use super::*;
    use redis::aio::ConnectionManager;

    const LOCKED: &str = "locked";
    const PROCESSED: &str = "processed";

    /// Guard shared by every process pointing at the same Redis.
    ///
    /// The lock is `SET key locked:<token> NX EX ttl`. The marker overwrites
    /// it with `SET key processed EX ttl`.
    #[derive(Clone)]
    pub struct RedisIdempotencyGuard {
        conn: ConnectionManager,
        lock_ttl: Duration,
        processed_ttl: Duration,
    }

    impl RedisIdempotencyGuard {
        pub async fn connect(url: &str, lock_ttl: Duration, processed_ttl: Duration) -> ServiceResult<Self> {
            let client = redis::Client::open(url)?;
            let conn = client.get_connection_manager().await?;
            Ok(RedisIdempotencyGuard {
                conn,
                lock_ttl,
                processed_ttl,
            })
        }

        fn key(key: &str) -> String {
            format!("till:idem:{}", key)
        }

        fn lock_value(token: &LockToken) -> String {
            format!("{}:{}", LOCKED, token.as_str())
        }
    }

    #[async_trait]
    impl IdempotencyGuard for RedisIdempotencyGuard {
        async fn try_acquire(&self, key: &str) -> ServiceResult<Option<LockToken>> {
            let mut conn = self.conn.clone();
            let token = LockToken::generate();
            let reply: Option<String> = redis::cmd("SET")
                .arg(Self::key(key))
                .arg(Self::lock_value(&token))
                .arg("NX")
                .arg("EX")
                .arg(self.lock_ttl.as_secs().max(1))
                .query_async(&mut conn)
                .await?;
            Ok(reply.map(|_| token))
        }

        async fn mark_processed(&self, key: &str) -> ServiceResult<()> {
            let mut conn = self.conn.clone();
            let _: () = redis::cmd("SET")
                .arg(Self::key(key))
                .arg(PROCESSED)
                .arg("EX")
                .arg(self.processed_ttl.as_secs().max(1))
                .query_async(&mut conn)
                .await?;
            Ok(())
        }

        async fn is_processed(&self, key: &str) -> ServiceResult<bool> {
            let mut conn = self.conn.clone();
            let value: Option<String> = redis::cmd("GET")
                .arg(Self::key(key))
                .query_async(&mut conn)
                .await?;
            Ok(value.as_deref() == Some(PROCESSED))
        }

        async fn release(&self, key: &str, token: &LockToken) -> ServiceResult<()> {
            let mut conn = self.conn.clone();
            // Only delete our own lock, never a processed marker
            let script = redis::Script::new(
                r#"
                if redis.call('GET', KEYS[1]) == ARGV[1] then
                    return redis.call('DEL', KEYS[1])
                end
                return 0
                "#,
            );
            let _: i64 = script
                .key(Self::key(key))
                .arg(Self::lock_value(token))
                .invoke_async(&mut conn)
                .await?;
            Ok(())
        }
    }
}
