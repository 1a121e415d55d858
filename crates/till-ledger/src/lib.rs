//! # till-ledger: Ledger Services
//!
//! The orchestration layer of Till. Sale events come in, cash moves through
//! shifts, daily summaries are recomputed.
//!
//! ## Module Organization
//! ```text
//! till_ledger/
//! ├── lib.rs          ◄─── You are here (re-exports)
//! ├── config.rs       ◄─── LedgerConfig (TOML + TILL_* env overrides)
//! ├── error.rs        ◄─── ServiceError + status code mapping
//! ├── guard.rs        ◄─── IdempotencyGuard: memory, sqlite, redis
//! ├── shift.rs        ◄─── ShiftManager: open / add / withdraw / close
//! ├── reconciler.rs   ◄─── SaleReconciler: sale event → cash movement
//! ├── aggregator.rs   ◄─── DailySummaryAggregator: daily statistics
//! ├── scheduler.rs    ◄─── ReconciliationScheduler: periodic recompute
//! └── service.rs      ◄─── LedgerService: wires it all from config
//! ```
//!
//! ## Event Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   Sales subsystem ──SaleEvent──► SaleReconciler                        │
//! │                                      │                                  │
//! │                     ┌────────────────┼─────────────────┐               │
//! │                     ▼                ▼                 ▼                │
//! │              IdempotencyGuard   ShiftManager   DailySummaryAggregator  │
//! │                                      │                 │                │
//! │                                      └──────┬──────────┘                │
//! │                                             ▼                           │
//! │                                      till-db (SQLite)                   │
//! │                                                                         │
//! │   ReconciliationScheduler ──(hourly)──► DailySummaryAggregator         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod aggregator;
pub mod config;
pub mod error;
pub mod guard;
pub mod reconciler;
pub mod scheduler;
pub mod service;
pub mod shift;

pub use aggregator::{DailySummaryAggregator, Recomputed, StoreRun};
pub use config::{AutoOpenPolicy, GuardBackend, LedgerConfig};
pub use error::{ServiceError, ServiceResult};
pub use guard::{IdempotencyGuard, LockToken, MemoryIdempotencyGuard, SqliteIdempotencyGuard};
pub use reconciler::{Outcome, SaleReconciler};
pub use scheduler::{ReconciliationScheduler, RunReport, SchedulerHandle};
pub use service::LedgerService;
pub use shift::ShiftManager;

#[cfg(feature = "redis-guard")]
pub use guard::RedisIdempotencyGuard;

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::NaiveDate;
    use till_db::{Database, DbConfig};

    pub const STORE: &str = "store-1";

    pub fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
    }

    pub async fn test_db() -> Database {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.stores().create(STORE, "Main Street").await.unwrap();
        db
    }
}
