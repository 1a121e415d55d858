//! # Cash Register Repository
//!
//! Shift lifecycle and atomic balance updates.
//!
//! ## Balance Update Transaction
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  BEGIN                                                                  │
//! │    UPDATE cash_registers                                                │
//! │       SET current_balance = current_balance + delta                     │
//! │     WHERE id = ? AND is_open = 1 AND current_balance + delta >= 0       │
//! │    RETURNING store_id, current_balance, financial_summary_id            │
//! │       │                                                                 │
//! │       ├── 0 rows ──► read register in the same tx:                      │
//! │       │                missing      → RegisterNotFound                  │
//! │       │                not open     → ShiftClosed                       │
//! │       │                too little   → InsufficientFunds                 │
//! │       │              ROLLBACK                                           │
//! │       ▼                                                                 │
//! │    INSERT cash_history (seq = max + 1, before = after - delta)          │
//! │    UPDATE financial_summaries SET cash_total += delta  (if linked)      │
//! │  COMMIT                                                                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The balance read and the write are one statement, so two concurrent
//! sales can never both start from the same stale balance.

use chrono::{NaiveDate, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{DbError, DbResult};
use crate::repository::history::{self, HistoryEntry};
use till_core::ledger::{self, plan_correction, plan_withdraw, BalanceMovement};
use till_core::validation::{validate_amount, validate_balance};
use till_core::{CashHistory, CashOperation, CashRegister, LedgerError, Money, ShiftCloseReport};

const REGISTER_COLUMNS: &str = "id, store_id, business_date, date_opened, current_balance_minor, \
     target_balance_minor, is_open, closed_balance_minor, closed_at, discrepancy_minor, \
     financial_summary_id, opened_by, closed_by, last_updated";

// =============================================================================
// Requests
// =============================================================================

/// A deposit or withdrawal against one register.
#[derive(Debug, Clone, Copy)]
pub struct Movement<'a> {
    pub register_id: &'a str,
    pub operation: CashOperation,
    pub amount: Money,
    pub actor_id: Option<&'a str>,
    pub notes: &'a str,
    pub reference: Option<&'a str>,
}

impl<'a> Movement<'a> {
    pub fn add_cash(register_id: &'a str, amount: Money) -> Self {
        Movement {
            register_id,
            operation: CashOperation::AddCash,
            amount,
            actor_id: None,
            notes: "",
            reference: None,
        }
    }

    pub fn withdraw(register_id: &'a str, amount: Money) -> Self {
        Movement {
            operation: CashOperation::Withdraw,
            ..Movement::add_cash(register_id, amount)
        }
    }

    pub fn actor(mut self, actor_id: Option<&'a str>) -> Self {
        self.actor_id = actor_id;
        self
    }

    pub fn notes(mut self, notes: &'a str) -> Self {
        self.notes = notes;
        self
    }

    pub fn reference(mut self, reference: &'a str) -> Self {
        self.reference = Some(reference);
        self
    }
}

/// Parameters of a shift close.
#[derive(Debug, Clone, Copy)]
pub struct CloseShift<'a> {
    pub register_id: &'a str,
    pub actual_balance: Money,
    pub actor_id: Option<&'a str>,
    pub notes: Option<&'a str>,
}

// =============================================================================
// Repository
// =============================================================================

#[derive(Debug, Clone)]
pub struct CashRegisterRepository {
    pool: SqlitePool,
}

impl CashRegisterRepository {
    pub fn new(pool: SqlitePool) -> Self {
        CashRegisterRepository { pool }
    }

    pub async fn get(&self, id: &str) -> DbResult<Option<CashRegister>> {
        let sql = format!("SELECT {} FROM cash_registers WHERE id = ?", REGISTER_COLUMNS);
        let register = sqlx::query_as::<_, CashRegister>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(register)
    }

    /// The open shift of a store for a business day.
    pub async fn find_open(&self, store_id: &str, business_date: NaiveDate) -> DbResult<Option<CashRegister>> {
        let sql = format!(
            "SELECT {} FROM cash_registers WHERE store_id = ? AND business_date = ? AND is_open = 1",
            REGISTER_COLUMNS
        );
        let register = sqlx::query_as::<_, CashRegister>(&sql)
            .bind(store_id)
            .bind(business_date)
            .fetch_optional(&self.pool)
            .await?;
        Ok(register)
    }

    /// The most recently opened shift of a store that is still open, any day.
    pub async fn latest_open(&self, store_id: &str) -> DbResult<Option<CashRegister>> {
        let sql = format!(
            "SELECT {} FROM cash_registers WHERE store_id = ? AND is_open = 1 \
             ORDER BY date_opened DESC LIMIT 1",
            REGISTER_COLUMNS
        );
        let register = sqlx::query_as::<_, CashRegister>(&sql)
            .bind(store_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(register)
    }

    /// Every shift of a store for a day, oldest first.
    pub async fn list_for_day(&self, store_id: &str, business_date: NaiveDate) -> DbResult<Vec<CashRegister>> {
        let sql = format!(
            "SELECT {} FROM cash_registers WHERE store_id = ? AND business_date = ? ORDER BY date_opened",
            REGISTER_COLUMNS
        );
        let registers = sqlx::query_as::<_, CashRegister>(&sql)
            .bind(store_id)
            .bind(business_date)
            .fetch_all(&self.pool)
            .await?;
        Ok(registers)
    }

    /// Opens a shift with `target_balance` as the opening float and writes
    /// the OPEN_SHIFT row.
    ///
    /// ## Errors
    /// - `AlreadyOpen` when the store has an open shift for the day (unique index)
    /// - `StoreNotFound` for an unknown store
    pub async fn open(
        &self,
        store_id: &str,
        business_date: NaiveDate,
        target_balance: Money,
        actor_id: Option<&str>,
    ) -> DbResult<CashRegister> {
        validate_balance("target_balance", target_balance).map_err(LedgerError::from)?;

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        debug!(register_id = %id, store_id = %store_id, %business_date, "Opening shift");

        let mut tx = self.pool.begin().await?;

        let sql = format!(
            r#"
            INSERT INTO cash_registers (
                id, store_id, business_date, date_opened,
                current_balance_minor, target_balance_minor, is_open,
                financial_summary_id, opened_by, last_updated
            ) VALUES (
                ?, ?, ?, ?, ?, ?, 1,
                (SELECT id FROM financial_summaries WHERE store_id = ? AND date = ?),
                ?, ?
            )
            RETURNING {}
            "#,
            REGISTER_COLUMNS
        );

        let register = sqlx::query_as::<_, CashRegister>(&sql)
            .bind(&id)
            .bind(store_id)
            .bind(business_date)
            .bind(now)
            .bind(target_balance.minor())
            .bind(target_balance.minor())
            .bind(store_id)
            .bind(business_date)
            .bind(actor_id)
            .bind(now)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| match DbError::from(e) {
                err if err.is_unique_violation_on("cash_registers.store_id") => {
                    DbError::Ledger(LedgerError::AlreadyOpen {
                        store_id: store_id.to_string(),
                        business_date: business_date.to_string(),
                    })
                }
                DbError::ForeignKeyViolation { .. } => {
                    DbError::Ledger(LedgerError::StoreNotFound(store_id.to_string()))
                }
                other => other,
            })?;

        history::append(
            &mut tx,
            HistoryEntry {
                register_id: &register.id,
                store_id,
                movement: BalanceMovement {
                    operation: CashOperation::OpenShift,
                    amount: target_balance,
                    balance_before: Money::zero(),
                    balance_after: target_balance,
                },
                actor_id,
                notes: "Shift opened",
                reference: None,
                timestamp: now,
            },
        )
        .await?;

        tx.commit().await?;

        info!(
            register_id = %register.id,
            store_id = %store_id,
            %business_date,
            target_balance = %target_balance,
            "Shift opened"
        );
        Ok(register)
    }

    /// Applies a deposit or withdrawal atomically and returns the history row.
    pub async fn apply_movement(&self, movement: Movement<'_>) -> DbResult<CashHistory> {
        validate_amount(movement.amount)?;
        if !matches!(movement.operation, CashOperation::AddCash | CashOperation::Withdraw) {
            return Err(DbError::Internal(format!(
                "{} is not a balance movement",
                movement.operation.as_str()
            )));
        }

        let delta = movement.operation.signed_delta(movement.amount);
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let updated: Option<(String, i64, Option<String>)> = sqlx::query_as(
            r#"
            UPDATE cash_registers
               SET current_balance_minor = current_balance_minor + ?,
                   last_updated = ?
             WHERE id = ? AND is_open = 1 AND current_balance_minor + ? >= 0
            RETURNING store_id, current_balance_minor, financial_summary_id
            "#,
        )
        .bind(delta.minor())
        .bind(now)
        .bind(movement.register_id)
        .bind(delta.minor())
        .fetch_optional(&mut *tx)
        .await?;

        let Some((store_id, balance_after, summary_id)) = updated else {
            return Err(rejection(&mut tx, &movement).await);
        };

        let row = history::append(
            &mut tx,
            HistoryEntry {
                register_id: movement.register_id,
                store_id: &store_id,
                movement: BalanceMovement::ending_at(
                    movement.operation,
                    movement.amount,
                    Money::from_minor(balance_after),
                ),
                actor_id: movement.actor_id,
                notes: movement.notes,
                reference: movement.reference,
                timestamp: now,
            },
        )
        .await?;

        if let Some(summary_id) = summary_id.as_deref() {
            sqlx::query(
                "UPDATE financial_summaries SET cash_total_minor = cash_total_minor + ?, updated_at = ? WHERE id = ?",
            )
            .bind(delta.minor())
            .bind(now)
            .bind(summary_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        debug!(
            register_id = %movement.register_id,
            operation = movement.operation.as_str(),
            amount = %movement.amount,
            balance = %row.balance_after(),
            "Balance updated"
        );
        Ok(row)
    }

    /// Sets the balance to a counted value, recording a CORRECTION row with
    /// the signed difference.
    pub async fn correct(
        &self,
        register_id: &str,
        counted_balance: Money,
        actor_id: Option<&str>,
        notes: &str,
    ) -> DbResult<CashHistory> {
        validate_balance("counted_balance", counted_balance).map_err(LedgerError::from)?;

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        // Touch first so the transaction holds the write lock before reading.
        let sql = format!(
            "UPDATE cash_registers SET last_updated = ? WHERE id = ? RETURNING {}",
            REGISTER_COLUMNS
        );
        let register = sqlx::query_as::<_, CashRegister>(&sql)
            .bind(now)
            .bind(register_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| LedgerError::RegisterNotFound(register_id.to_string()))?;
        register.ensure_open()?;

        let movement = plan_correction(register.current_balance(), counted_balance)?;

        sqlx::query("UPDATE cash_registers SET current_balance_minor = ? WHERE id = ?")
            .bind(counted_balance.minor())
            .bind(register_id)
            .execute(&mut *tx)
            .await?;

        let row = history::append(
            &mut tx,
            HistoryEntry {
                register_id,
                store_id: &register.store_id,
                movement,
                actor_id,
                notes,
                reference: None,
                timestamp: now,
            },
        )
        .await?;

        tx.commit().await?;

        info!(
            register_id = %register_id,
            delta = %movement.amount,
            balance = %counted_balance,
            "Balance corrected"
        );
        Ok(row)
    }

    /// Closes an open shift, records the CLOSE_SHIFT row and writes the close
    /// fields onto the day's summary, creating it if needed.
    ///
    /// A newly created summary starts with `grand_total = actual_balance`;
    /// an existing one keeps its computed figures.
    pub async fn close(&self, request: CloseShift<'_>) -> DbResult<ShiftCloseReport> {
        validate_balance("actual_balance", request.actual_balance).map_err(LedgerError::from)?;

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            r#"
            UPDATE cash_registers
               SET is_open = 0,
                   closed_balance_minor = ?,
                   closed_at = ?,
                   discrepancy_minor = ? - target_balance_minor,
                   closed_by = ?,
                   last_updated = ?
             WHERE id = ? AND is_open = 1
            RETURNING {}
            "#,
            REGISTER_COLUMNS
        );
        let closed = sqlx::query_as::<_, CashRegister>(&sql)
            .bind(request.actual_balance.minor())
            .bind(now)
            .bind(request.actual_balance.minor())
            .bind(request.actor_id)
            .bind(now)
            .bind(request.register_id)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(register) = closed else {
            let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM cash_registers WHERE id = ?")
                .bind(request.register_id)
                .fetch_optional(&mut *tx)
                .await?;
            let err = match exists {
                Some(_) => LedgerError::AlreadyClosed {
                    register_id: request.register_id.to_string(),
                },
                None => LedgerError::RegisterNotFound(request.register_id.to_string()),
            };
            return Err(err.into());
        };

        let discrepancy = ledger::discrepancy(request.actual_balance, register.target_balance());

        history::append(
            &mut tx,
            HistoryEntry {
                register_id: &register.id,
                store_id: &register.store_id,
                movement: BalanceMovement {
                    operation: CashOperation::CloseShift,
                    amount: request.actual_balance,
                    balance_before: register.current_balance(),
                    balance_after: register.current_balance(),
                },
                actor_id: request.actor_id,
                notes: request.notes.unwrap_or("Shift closed"),
                reference: None,
                timestamp: now,
            },
        )
        .await?;

        let summary_id: String = sqlx::query_scalar(
            r#"
            INSERT INTO financial_summaries (
                id, store_id, date, grand_total_minor,
                cash_opened_minor, cash_closed_minor, discrepancy_minor,
                closed_by, notes, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (store_id, date) DO UPDATE SET
                cash_opened_minor = excluded.cash_opened_minor,
                cash_closed_minor = excluded.cash_closed_minor,
                discrepancy_minor = excluded.discrepancy_minor,
                closed_by = excluded.closed_by,
                notes = COALESCE(excluded.notes, financial_summaries.notes),
                updated_at = excluded.updated_at
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&register.store_id)
        .bind(register.business_date)
        .bind(request.actual_balance.minor())
        .bind(register.target_balance_minor)
        .bind(request.actual_balance.minor())
        .bind(discrepancy.minor())
        .bind(request.actor_id)
        .bind(request.notes)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("UPDATE cash_registers SET financial_summary_id = ? WHERE id = ?")
            .bind(&summary_id)
            .bind(&register.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        let expected_balance = register.current_balance();
        info!(
            register_id = %register.id,
            store_id = %register.store_id,
            expected = %expected_balance,
            actual = %request.actual_balance,
            discrepancy = %discrepancy,
            "Shift closed"
        );

        Ok(ShiftCloseReport {
            register_id: register.id,
            expected_balance,
            closed_balance: request.actual_balance,
            discrepancy,
            summary_id,
            closed_at: now,
        })
    }
}

/// Works out why the conditional balance update matched no row.
async fn rejection(conn: &mut SqliteConnection, movement: &Movement<'_>) -> DbError {
    let sql = format!("SELECT {} FROM cash_registers WHERE id = ?", REGISTER_COLUMNS);
    let register = match sqlx::query_as::<_, CashRegister>(&sql)
        .bind(movement.register_id)
        .fetch_optional(&mut *conn)
        .await
    {
        Ok(register) => register,
        Err(e) => return e.into(),
    };

    let Some(register) = register else {
        return LedgerError::RegisterNotFound(movement.register_id.to_string()).into();
    };
    if let Err(e) = register.ensure_open() {
        return e.into();
    }
    if movement.operation == CashOperation::Withdraw {
        if let Err(e) = plan_withdraw(register.current_balance(), movement.amount) {
            return e.into();
        }
    }
    DbError::Internal(format!(
        "balance update on register {} matched no row",
        movement.register_id
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{day, test_db, STORE};
    use till_core::ledger::verify_chain;

    fn m(minor: i64) -> Money {
        Money::from_minor(minor)
    }

    fn ledger_err(err: DbError) -> LedgerError {
        match err {
            DbError::Ledger(e) => e,
            other => panic!("expected ledger error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_open_writes_opening_row() {
        let db = test_db().await;
        let reg = db.registers().open(STORE, day(), m(5_000), Some("u1")).await.unwrap();

        assert!(reg.is_open);
        assert_eq!(reg.current_balance(), m(5_000));
        assert_eq!(reg.target_balance(), m(5_000));
        assert_eq!(reg.opened_by.as_deref(), Some("u1"));

        let chain = db.history().chain(&reg.id).await.unwrap();
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].operation_type, CashOperation::OpenShift);
        assert_eq!(chain[0].balance_before_minor, 0);
        assert_eq!(chain[0].balance_after_minor, 5_000);
    }

    #[tokio::test]
    async fn test_second_open_same_day_is_rejected() {
        let db = test_db().await;
        db.registers().open(STORE, day(), m(0), None).await.unwrap();

        let err = db.registers().open(STORE, day(), m(0), None).await.unwrap_err();
        assert!(matches!(ledger_err(err), LedgerError::AlreadyOpen { .. }));

        let next_day = day().succ_opt().unwrap();
        assert!(db.registers().open(STORE, next_day, m(0), None).await.is_ok());
    }

    #[tokio::test]
    async fn test_open_unknown_store() {
        let db = test_db().await;
        let err = db.registers().open("nowhere", day(), m(0), None).await.unwrap_err();
        assert_eq!(ledger_err(err), LedgerError::StoreNotFound("nowhere".into()));
    }

    #[tokio::test]
    async fn test_reopen_after_close_same_day() {
        let db = test_db().await;
        let reg = db.registers().open(STORE, day(), m(0), None).await.unwrap();
        db.registers()
            .close(CloseShift {
                register_id: &reg.id,
                actual_balance: m(0),
                actor_id: None,
                notes: None,
            })
            .await
            .unwrap();

        let second = db.registers().open(STORE, day(), m(0), None).await.unwrap();
        assert_ne!(second.id, reg.id);
        assert_eq!(second.financial_summary_id, reg_summary(&db, &reg.id).await);
    }

    async fn reg_summary(db: &crate::Database, id: &str) -> Option<String> {
        db.registers().get(id).await.unwrap().unwrap().financial_summary_id
    }

    #[tokio::test]
    async fn test_movements_keep_chain_intact() {
        let db = test_db().await;
        let reg = db.registers().open(STORE, day(), m(0), None).await.unwrap();
        let repo = db.registers();

        repo.apply_movement(Movement::add_cash(&reg.id, m(100_000)).actor(Some("a")))
            .await
            .unwrap();
        repo.apply_movement(Movement::add_cash(&reg.id, m(50_000)).actor(Some("a")))
            .await
            .unwrap();
        let row = repo
            .apply_movement(Movement::withdraw(&reg.id, m(30_000)).actor(Some("a")))
            .await
            .unwrap();

        assert_eq!(row.operation_type, CashOperation::Withdraw);
        assert_eq!(row.balance_before(), m(150_000));
        assert_eq!(row.balance_after(), m(120_000));
        assert_eq!(row.seq, 4);

        let reg = repo.get(&reg.id).await.unwrap().unwrap();
        assert_eq!(reg.current_balance(), m(120_000));

        let chain = db.history().chain(&reg.id).await.unwrap();
        assert!(verify_chain(&chain, reg.current_balance()).is_intact());
    }

    #[tokio::test]
    async fn test_insufficient_funds_leaves_no_trace() {
        let db = test_db().await;
        let reg = db.registers().open(STORE, day(), m(9_000), None).await.unwrap();

        let err = db
            .registers()
            .apply_movement(Movement::withdraw(&reg.id, m(15_000)))
            .await
            .unwrap_err();
        assert_eq!(
            ledger_err(err),
            LedgerError::InsufficientFunds {
                requested: m(15_000),
                available: m(9_000)
            }
        );

        let reg = db.registers().get(&reg.id).await.unwrap().unwrap();
        assert_eq!(reg.current_balance(), m(9_000));
        assert_eq!(db.history().count(&reg.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rejections() {
        let db = test_db().await;
        let repo = db.registers();

        let err = repo.apply_movement(Movement::add_cash("missing", m(1))).await.unwrap_err();
        assert_eq!(ledger_err(err), LedgerError::RegisterNotFound("missing".into()));

        let reg = repo.open(STORE, day(), m(0), None).await.unwrap();
        let err = repo.apply_movement(Movement::add_cash(&reg.id, m(0))).await.unwrap_err();
        assert!(matches!(ledger_err(err), LedgerError::InvalidAmount { .. }));

        repo.close(CloseShift {
            register_id: &reg.id,
            actual_balance: m(0),
            actor_id: None,
            notes: None,
        })
        .await
        .unwrap();
        let err = repo.apply_movement(Movement::add_cash(&reg.id, m(10))).await.unwrap_err();
        assert_eq!(ledger_err(err), LedgerError::shift_closed(&reg.id));
    }

    #[tokio::test]
    async fn test_reference_applies_once() {
        let db = test_db().await;
        let reg = db.registers().open(STORE, day(), m(0), None).await.unwrap();
        let repo = db.registers();

        repo.apply_movement(Movement::add_cash(&reg.id, m(500)).reference("sale:1"))
            .await
            .unwrap();
        let err = repo
            .apply_movement(Movement::add_cash(&reg.id, m(500)).reference("sale:1"))
            .await
            .unwrap_err();
        assert!(ledger_err(err).is_duplicate());

        let reg = repo.get(&reg.id).await.unwrap().unwrap();
        assert_eq!(reg.current_balance(), m(500));
    }

    #[tokio::test]
    async fn test_linked_summary_tracks_cash() {
        let db = test_db().await;
        let summary = db.summaries().get_or_create(STORE, day()).await.unwrap();
        let reg = db.registers().open(STORE, day(), m(0), None).await.unwrap();
        assert_eq!(reg.financial_summary_id.as_deref(), Some(summary.id.as_str()));

        db.registers()
            .apply_movement(Movement::add_cash(&reg.id, m(2_000)))
            .await
            .unwrap();
        db.registers()
            .apply_movement(Movement::withdraw(&reg.id, m(500)))
            .await
            .unwrap();

        let summary = db.summaries().get(STORE, day()).await.unwrap().unwrap();
        assert_eq!(summary.cash_total_minor, 1_500);
    }

    #[tokio::test]
    async fn test_close_report_carries_expected_balance() {
        let db = test_db().await;
        let repo = db.registers();
        let reg = repo.open(STORE, day(), m(10_000), None).await.unwrap();
        repo.apply_movement(Movement::add_cash(&reg.id, m(4_500))).await.unwrap();

        let report = repo
            .close(CloseShift {
                register_id: &reg.id,
                actual_balance: m(4_000),
                actor_id: None,
                notes: None,
            })
            .await
            .unwrap();
        assert_eq!(report.register_id, reg.id);
        assert_eq!(report.expected_balance, m(4_500));
        assert_eq!(report.closed_balance, m(4_000));
        assert_eq!(report.discrepancy, m(-6_000));
    }

    #[tokio::test]
    async fn test_close_creates_summary_and_is_terminal() {
        let db = test_db().await;
        let repo = db.registers();
        let reg = repo.open(STORE, day(), m(0), None).await.unwrap();
        repo.apply_movement(Movement::add_cash(&reg.id, m(120_000))).await.unwrap();

        let report = repo
            .close(CloseShift {
                register_id: &reg.id,
                actual_balance: m(120_000),
                actor_id: Some("mgr"),
                notes: Some("end of day"),
            })
            .await
            .unwrap();
        assert_eq!(report.expected_balance, m(120_000));
        assert_eq!(report.discrepancy, m(120_000));

        let summary = db.summaries().get(STORE, day()).await.unwrap().unwrap();
        assert_eq!(summary.id, report.summary_id);
        assert_eq!(summary.grand_total_minor, 120_000);
        assert_eq!(summary.cash_closed_minor, Some(120_000));
        assert_eq!(summary.cash_opened_minor, Some(0));
        assert_eq!(summary.closed_by.as_deref(), Some("mgr"));

        let err = repo
            .close(CloseShift {
                register_id: &reg.id,
                actual_balance: m(1),
                actor_id: None,
                notes: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(ledger_err(err), LedgerError::AlreadyClosed { .. }));

        let closed = repo.get(&reg.id).await.unwrap().unwrap();
        assert!(!closed.is_open);
        assert_eq!(closed.discrepancy(), Some(m(120_000)));
        assert_eq!(closed.closed_balance_minor, Some(120_000));
        assert_eq!(closed.financial_summary_id.as_deref(), Some(report.summary_id.as_str()));

        let chain = db.history().chain(&reg.id).await.unwrap();
        assert_eq!(chain.last().unwrap().operation_type, CashOperation::CloseShift);
        assert!(verify_chain(&chain, closed.current_balance()).is_intact());
    }

    #[tokio::test]
    async fn test_close_keeps_existing_summary_figures() {
        let db = test_db().await;
        let mut summary = db.summaries().get_or_create(STORE, day()).await.unwrap();
        summary.grand_total_minor = 80_000;
        summary.total_transactions = 4;
        db.summaries().save_recomputed(&summary).await.unwrap();

        let reg = db.registers().open(STORE, day(), m(10_000), None).await.unwrap();
        let report = db
            .registers()
            .close(CloseShift {
                register_id: &reg.id,
                actual_balance: m(9_500),
                actor_id: None,
                notes: None,
            })
            .await
            .unwrap();
        assert_eq!(report.discrepancy, m(-500));

        let summary = db.summaries().get(STORE, day()).await.unwrap().unwrap();
        assert_eq!(summary.grand_total_minor, 80_000);
        assert_eq!(summary.avg_transaction_minor, 20_000);
        assert_eq!(summary.discrepancy_minor, Some(-500));
    }

    #[tokio::test]
    async fn test_close_missing_register() {
        let db = test_db().await;
        let err = db
            .registers()
            .close(CloseShift {
                register_id: "ghost",
                actual_balance: m(0),
                actor_id: None,
                notes: None,
            })
            .await
            .unwrap_err();
        assert_eq!(ledger_err(err), LedgerError::RegisterNotFound("ghost".into()));
    }

    #[tokio::test]
    async fn test_correction_records_signed_delta() {
        let db = test_db().await;
        let reg = db.registers().open(STORE, day(), m(1_000), None).await.unwrap();

        let row = db.registers().correct(&reg.id, m(940), Some("mgr"), "recount").await.unwrap();
        assert_eq!(row.operation_type, CashOperation::Correction);
        assert_eq!(row.amount_minor, -60);

        let reg = db.registers().get(&reg.id).await.unwrap().unwrap();
        assert_eq!(reg.current_balance(), m(940));
        let chain = db.history().chain(&reg.id).await.unwrap();
        assert!(verify_chain(&chain, reg.current_balance()).is_intact());
    }

    #[tokio::test]
    async fn test_concurrent_deposits_are_serialized() {
        let db = test_db().await;
        let reg = db.registers().open(STORE, day(), m(1_000), None).await.unwrap();

        let mut handles = Vec::new();
        for i in 1..=20 {
            let repo = db.registers();
            let id = reg.id.clone();
            handles.push(tokio::spawn(async move {
                repo.apply_movement(Movement::add_cash(&id, m(i * 10))).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let reg = db.registers().get(&reg.id).await.unwrap().unwrap();
        let expected: i64 = 1_000 + (1..=20).map(|i| i * 10).sum::<i64>();
        assert_eq!(reg.current_balance(), m(expected));

        let chain = db.history().chain(&reg.id).await.unwrap();
        assert_eq!(chain.len(), 21);
        assert!(verify_chain(&chain, reg.current_balance()).is_intact());
    }

    #[tokio::test]
    async fn test_find_open_and_latest() {
        let db = test_db().await;
        assert!(db.registers().find_open(STORE, day()).await.unwrap().is_none());

        let reg = db.registers().open(STORE, day(), m(0), None).await.unwrap();
        let found = db.registers().find_open(STORE, day()).await.unwrap().unwrap();
        assert_eq!(found.id, reg.id);
        assert_eq!(db.registers().latest_open(STORE).await.unwrap().unwrap().id, reg.id);
        assert_eq!(db.registers().list_for_day(STORE, day()).await.unwrap().len(), 1);
    }
}
