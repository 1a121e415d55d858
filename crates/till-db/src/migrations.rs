//! # Database Migrations
//!
//! Embedded SQL migrations for the ledger store.
//!
//! ## Schema
//! ```text
//! migrations/sqlite/
//! ├── 001_cash_ledger.sql       stores, cash_registers, cash_history,
//! │                             financial_summaries
//! ├── 002_sales_projection.sql  sales, sale_items, product_batches,
//! │                             exchange_rates, idempotency_keys
//! └── 003_idempotency_owner.sql idempotency_keys.owner
//! ```
//!
//! ## Adding New Migrations
//!
//! 1. Create `migrations/sqlite/NNN_description.sql` with the next number
//! 2. Use `IF NOT EXISTS` where possible
//! 3. **NEVER** modify an applied migration, add a new one

use sqlx::SqlitePool;
use tracing::info;

use crate::error::DbResult;

/// Embedded at compile time from `migrations/sqlite`.
static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations/sqlite");

/// Runs all pending migrations in filename order, each in its own
/// transaction. Idempotent.
pub async fn run_migrations(pool: &SqlitePool) -> DbResult<()> {
    info!("Checking for pending migrations");

    MIGRATOR.run(pool).await?;

    info!("All migrations applied successfully");
    Ok(())
}

/// Returns `(embedded_migrations, applied_migrations)` for diagnostics.
pub async fn migration_status(pool: &SqlitePool) -> DbResult<(usize, usize)> {
    let total = MIGRATOR.migrations.len();

    let applied: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM _sqlx_migrations WHERE success = 1")
        .fetch_one(pool)
        .await?;

    Ok((total, applied as usize))
}
