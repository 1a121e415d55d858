//! # till-db: Ledger Store
//!
//! SQLite persistence for the cash ledger, using sqlx for async access.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Till Data Flow                                 │
//! │                                                                         │
//! │  ShiftManager / SaleReconciler / DailySummaryAggregator (till-ledger)  │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     till-db (THIS CRATE)                        │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌────────────────────┐  ┌────────────┐  │   │
//! │  │   │   Database    │    │   Repositories     │  │ Migrations │  │   │
//! │  │   │   (pool.rs)   │    │                    │  │ (embedded) │  │   │
//! │  │   │               │◄───│ CashRegisterRepo   │  │            │  │   │
//! │  │   │ SqlitePool    │    │ CashHistoryRepo    │  │ 001_cash   │  │   │
//! │  │   │ WAL, FKs,     │    │ FinancialSummary   │  │ 002_sales  │  │   │
//! │  │   │ busy_timeout  │    │ Sale, Batch, Rate  │  │            │  │   │
//! │  │   │               │    │ Idempotency keys   │  │            │  │   │
//! │  │   └───────────────┘    └────────────────────┘  └────────────┘  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SQLite database file (or `:memory:` in tests)                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use till_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("ledger.db")).await?;
//! let register = db.registers().find_open("store-1", today).await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};

pub use repository::exchange_rate::ExchangeRateRepository;
pub use repository::history::CashHistoryRepository;
pub use repository::idempotency::IdempotencyRepository;
pub use repository::inventory::ProductBatchRepository;
pub use repository::register::{CashRegisterRepository, CloseShift, Movement};
pub use repository::sale::SaleRepository;
pub use repository::store::StoreRepository;
pub use repository::summary::FinancialSummaryRepository;

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::NaiveDate;

    use crate::{Database, DbConfig};

    pub const STORE: &str = "store-1";

    pub fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
    }

    /// Fresh in-memory database with migrations applied and one store.
    pub async fn test_db() -> Database {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.stores().create(STORE, "Main Street").await.unwrap();
        db
    }
}
