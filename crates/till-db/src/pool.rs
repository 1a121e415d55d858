//! # Database Pool Management
//!
//! Connection pool creation and configuration for SQLite.
//!
//! ## Write Concurrency
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  SQLite allows one writer at a time. Every ledger mutation is a short  │
//! │  transaction that starts with its write statement, so a second writer  │
//! │  waits on busy_timeout instead of working from a stale snapshot.       │
//! │                                                                         │
//! │  sale A ──► BEGIN; UPDATE ... RETURNING; INSERT history; COMMIT        │
//! │  sale B ──►        (waits) ──────────────► BEGIN; UPDATE ...; COMMIT   │
//! │                                                                         │
//! │  Readers never block thanks to WAL.                                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{DbError, DbResult};
use crate::migrations;
use crate::repository::exchange_rate::ExchangeRateRepository;
use crate::repository::history::CashHistoryRepository;
use crate::repository::idempotency::IdempotencyRepository;
use crate::repository::inventory::ProductBatchRepository;
use crate::repository::register::CashRegisterRepository;
use crate::repository::sale::SaleRepository;
use crate::repository::store::StoreRepository;
use crate::repository::summary::FinancialSummaryRepository;

const IN_MEMORY_PATH: &str = ":memory:";

// =============================================================================
// Configuration
// =============================================================================

/// Database configuration.
///
/// ## Example
/// ```rust,ignore
/// let config = DbConfig::new("/var/lib/till/ledger.db")
///     .max_connections(8)
///     .busy_timeout(Duration::from_secs(10));
/// ```
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Path to the SQLite database file, or `:memory:`.
    pub database_path: PathBuf,

    /// Default: 5
    pub max_connections: u32,

    /// Default: 1
    pub min_connections: u32,

    /// How long to wait for a pooled connection. Default: 30 seconds
    pub connect_timeout: Duration,

    /// How long a writer waits for the database lock. Default: 5 seconds
    pub busy_timeout: Duration,

    /// Default: 10 minutes
    pub idle_timeout: Duration,

    /// Default: true
    pub run_migrations: bool,
}

impl DbConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DbConfig {
            database_path: path.into(),
            max_connections: 5,
            min_connections: 1,
            connect_timeout: Duration::from_secs(30),
            busy_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(600),
            run_migrations: true,
        }
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    pub fn min_connections(mut self, min: u32) -> Self {
        self.min_connections = min;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    pub fn run_migrations(mut self, run: bool) -> Self {
        self.run_migrations = run;
        self
    }

    /// An isolated in-memory database, for tests.
    ///
    /// Uses a single connection that is never recycled, since every SQLite
    /// in-memory connection is its own database.
    pub fn in_memory() -> Self {
        DbConfig {
            database_path: PathBuf::from(IN_MEMORY_PATH),
            max_connections: 1,
            min_connections: 1,
            connect_timeout: Duration::from_secs(5),
            busy_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(60),
            run_migrations: true,
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.database_path.as_os_str() == IN_MEMORY_PATH
    }
}

// =============================================================================
// Database
// =============================================================================

/// Ledger store handle. Cheap to clone; repositories share the pool.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens the pool and applies migrations when enabled.
    ///
    /// ## SQLite Settings
    /// - WAL journal (file databases)
    /// - NORMAL synchronous
    /// - Foreign keys on
    /// - `busy_timeout` from config
    pub async fn new(config: DbConfig) -> DbResult<Self> {
        info!(
            path = %config.database_path.display(),
            "Initializing ledger database"
        );

        let in_memory = config.is_in_memory();
        let connect_options = if in_memory {
            SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| DbError::ConnectionFailed(e.to_string()))?
        } else {
            let connect_url = format!("sqlite://{}?mode=rwc", config.database_path.display());
            SqliteConnectOptions::from_str(&connect_url)
                .map_err(|e| DbError::ConnectionFailed(e.to_string()))?
                .journal_mode(SqliteJournalMode::Wal)
                .create_if_missing(true)
        }
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .busy_timeout(config.busy_timeout);

        debug!(in_memory, "Connection options configured");

        let mut pool_options = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout);

        pool_options = if in_memory {
            pool_options.idle_timeout(None).max_lifetime(None)
        } else {
            pool_options.idle_timeout(Some(config.idle_timeout))
        };

        let pool = pool_options
            .connect_with(connect_options)
            .await
            .map_err(|e| DbError::ConnectionFailed(e.to_string()))?;

        info!(max_connections = config.max_connections, "Database pool created");

        let db = Database { pool };

        if config.run_migrations {
            db.run_migrations().await?;
        }

        Ok(db)
    }

    /// Applies pending migrations. Safe to call repeatedly.
    pub async fn run_migrations(&self) -> DbResult<()> {
        info!("Running database migrations");
        migrations::run_migrations(&self.pool).await?;
        Ok(())
    }

    /// Raw pool access for queries not covered by repositories.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn stores(&self) -> StoreRepository {
        StoreRepository::new(self.pool.clone())
    }

    pub fn registers(&self) -> CashRegisterRepository {
        CashRegisterRepository::new(self.pool.clone())
    }

    pub fn history(&self) -> CashHistoryRepository {
        CashHistoryRepository::new(self.pool.clone())
    }

    pub fn summaries(&self) -> FinancialSummaryRepository {
        FinancialSummaryRepository::new(self.pool.clone())
    }

    pub fn sales(&self) -> SaleRepository {
        SaleRepository::new(self.pool.clone())
    }

    pub fn batches(&self) -> ProductBatchRepository {
        ProductBatchRepository::new(self.pool.clone())
    }

    pub fn exchange_rates(&self) -> ExchangeRateRepository {
        ExchangeRateRepository::new(self.pool.clone())
    }

    pub fn idempotency(&self) -> IdempotencyRepository {
        IdempotencyRepository::new(self.pool.clone())
    }

    /// Closes the pool. Repository calls fail afterwards.
    pub async fn close(&self) {
        info!("Closing database connection pool");
        self.pool.close().await;
    }

    /// True if the database answers a trivial query.
    pub async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}
