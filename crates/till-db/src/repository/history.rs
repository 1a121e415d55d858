//! # Cash History Repository
//!
//! Append-only audit trail. Rows are written only inside the register
//! transactions in [`super::register`] and never updated.
//!
//! ## Ordering
//! ```text
//! cash_register_id = r1
//!   seq 1  OPEN_SHIFT   ─┐
//!   seq 2  ADD_CASH      │  seq = MAX(seq) + 1, computed inside the same
//!   seq 3  WITHDRAW      │  write transaction that moved the balance, so
//!   seq 4  CLOSE_SHIFT  ─┘  it is gap-free and totally ordered
//! ```

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use crate::error::{DbError, DbResult};
use till_core::ledger::BalanceMovement;
use till_core::{CashHistory, LedgerError};

const HISTORY_COLUMNS: &str = "id, cash_register_id, store_id, seq, operation_type, amount_minor, \
     actor_id, timestamp, notes, reference, balance_before_minor, balance_after_minor";

/// Everything needed to append one row.
#[derive(Debug, Clone)]
pub(crate) struct HistoryEntry<'a> {
    pub register_id: &'a str,
    pub store_id: &'a str,
    pub movement: BalanceMovement,
    pub actor_id: Option<&'a str>,
    pub notes: &'a str,
    pub reference: Option<&'a str>,
    pub timestamp: DateTime<Utc>,
}

/// Appends a row on an open transaction.
///
/// A reference already used in the store is reported as
/// `LedgerError::DuplicateEvent`; the caller's transaction must then be
/// rolled back.
pub(crate) async fn append(conn: &mut SqliteConnection, entry: HistoryEntry<'_>) -> DbResult<CashHistory> {
    let seq: i64 = sqlx::query_scalar(
        "SELECT COALESCE(MAX(seq), 0) + 1 FROM cash_history WHERE cash_register_id = ?",
    )
    .bind(entry.register_id)
    .fetch_one(&mut *conn)
    .await?;

    let sql = format!(
        r#"
        INSERT INTO cash_history (
            id, cash_register_id, store_id, seq, operation_type, amount_minor,
            actor_id, timestamp, notes, reference, balance_before_minor, balance_after_minor
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        RETURNING {}
        "#,
        HISTORY_COLUMNS
    );

    let row = sqlx::query_as::<_, CashHistory>(&sql)
        .bind(Uuid::new_v4().to_string())
        .bind(entry.register_id)
        .bind(entry.store_id)
        .bind(seq)
        .bind(entry.movement.operation.as_str())
        .bind(entry.movement.amount.minor())
        .bind(entry.actor_id)
        .bind(entry.timestamp)
        .bind(entry.notes)
        .bind(entry.reference)
        .bind(entry.movement.balance_before.minor())
        .bind(entry.movement.balance_after.minor())
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| match DbError::from(e) {
            err if err.is_unique_violation_on("cash_history.reference") => {
                DbError::Ledger(LedgerError::DuplicateEvent {
                    event_id: entry.reference.unwrap_or_default().to_string(),
                })
            }
            other => other,
        })?;

    debug!(
        register_id = %entry.register_id,
        seq,
        operation = entry.movement.operation.as_str(),
        amount = %entry.movement.amount,
        "Appended cash history row"
    );

    Ok(row)
}

#[derive(Debug, Clone)]
pub struct CashHistoryRepository {
    pool: SqlitePool,
}

impl CashHistoryRepository {
    pub fn new(pool: SqlitePool) -> Self {
        CashHistoryRepository { pool }
    }

    /// Newest rows first.
    pub async fn recent(&self, register_id: &str, limit: u32) -> DbResult<Vec<CashHistory>> {
        let sql = format!(
            "SELECT {} FROM cash_history WHERE cash_register_id = ? ORDER BY seq DESC LIMIT ?",
            HISTORY_COLUMNS
        );
        let rows = sqlx::query_as::<_, CashHistory>(&sql)
            .bind(register_id)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// The full trail in `seq` order, for chain verification.
    pub async fn chain(&self, register_id: &str) -> DbResult<Vec<CashHistory>> {
        let sql = format!(
            "SELECT {} FROM cash_history WHERE cash_register_id = ? ORDER BY seq ASC",
            HISTORY_COLUMNS
        );
        let rows = sqlx::query_as::<_, CashHistory>(&sql)
            .bind(register_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// The row written for a sale or refund reference, if any.
    pub async fn find_by_reference(&self, store_id: &str, reference: &str) -> DbResult<Option<CashHistory>> {
        let sql = format!(
            "SELECT {} FROM cash_history WHERE store_id = ? AND reference = ?",
            HISTORY_COLUMNS
        );
        let row = sqlx::query_as::<_, CashHistory>(&sql)
            .bind(store_id)
            .bind(reference)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn count(&self, register_id: &str) -> DbResult<i64> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM cash_history WHERE cash_register_id = ?")
            .bind(register_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use crate::repository::register::Movement;
    use crate::test_support::{day, test_db, STORE};
    use till_core::{CashOperation, Money};

    #[tokio::test]
    async fn test_recent_is_newest_first_and_limited() {
        let db = test_db().await;
        let reg = db.registers().open(STORE, day(), Money::zero(), None).await.unwrap();
        for i in 1..=4 {
            db.registers()
                .apply_movement(Movement::add_cash(&reg.id, Money::from_minor(i * 100)))
                .await
                .unwrap();
        }

        let recent = db.history().recent(&reg.id, 3).await.unwrap();
        assert_eq!(recent.iter().map(|r| r.seq).collect::<Vec<_>>(), vec![5, 4, 3]);

        let chain = db.history().chain(&reg.id).await.unwrap();
        assert_eq!(chain.len(), 5);
        assert_eq!(chain[0].operation_type, CashOperation::OpenShift);
        assert_eq!(db.history().count(&reg.id).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_find_by_reference() {
        let db = test_db().await;
        let reg = db.registers().open(STORE, day(), Money::zero(), None).await.unwrap();
        db.registers()
            .apply_movement(Movement::add_cash(&reg.id, Money::from_minor(700)).reference("sale:9"))
            .await
            .unwrap();

        let row = db.history().find_by_reference(STORE, "sale:9").await.unwrap().unwrap();
        assert_eq!(row.amount_minor, 700);
        assert!(db.history().find_by_reference(STORE, "sale:10").await.unwrap().is_none());
    }
}
