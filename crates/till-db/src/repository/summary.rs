//! # Financial Summary Repository
//!
//! One row per (store, date). Two writers touch it:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  close_shift       → cash_opened, cash_closed, discrepancy, closed_by,  │
//! │                      notes            (register.rs)                     │
//! │  add_cash/withdraw → cash_total += delta  (register.rs, when linked)    │
//! │  recompute         → every computed figure, full overwrite (this file)  │
//! │                                                                         │
//! │  A recompute never touches the close fields, and a close never touches │
//! │  the computed figures of an existing row. Last recompute wins.         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{NaiveDate, Utc};
use sqlx::SqlitePool;
use tracing::debug;
use uuid::Uuid;

use crate::error::{DbError, DbResult};
use till_core::{FinancialSummary, LedgerError};

const SUMMARY_COLUMNS: &str = "id, store_id, date, \
     cash_total_minor, transfer_total_minor, card_total_minor, debt_total_minor, \
     total_transactions, grand_total_minor, avg_transaction_minor, \
     unique_customers, repeat_customers, customer_retention_bps, \
     total_revenue_minor, total_margin_minor, margin_bps, \
     top_cashier_id, top_cashier_sales_minor, cash_share_bps, card_share_bps, \
     usd_rate_minor, grand_total_usd_cents, total_margin_usd_cents, \
     cash_opened_minor, cash_closed_minor, discrepancy_minor, closed_by, notes, \
     created_at, updated_at";

fn store_fk(store_id: &str) -> impl Fn(sqlx::Error) -> DbError + '_ {
    move |e| match DbError::from(e) {
        DbError::ForeignKeyViolation { .. } => LedgerError::StoreNotFound(store_id.to_string()).into(),
        other => other,
    }
}

#[derive(Debug, Clone)]
pub struct FinancialSummaryRepository {
    pool: SqlitePool,
}

impl FinancialSummaryRepository {
    pub fn new(pool: SqlitePool) -> Self {
        FinancialSummaryRepository { pool }
    }

    pub async fn get(&self, store_id: &str, date: NaiveDate) -> DbResult<Option<FinancialSummary>> {
        let sql = format!(
            "SELECT {} FROM financial_summaries WHERE store_id = ? AND date = ?",
            SUMMARY_COLUMNS
        );
        let summary = sqlx::query_as::<_, FinancialSummary>(&sql)
            .bind(store_id)
            .bind(date)
            .fetch_optional(&self.pool)
            .await?;
        Ok(summary)
    }

    pub async fn get_by_id(&self, id: &str) -> DbResult<Option<FinancialSummary>> {
        let sql = format!("SELECT {} FROM financial_summaries WHERE id = ?", SUMMARY_COLUMNS);
        let summary = sqlx::query_as::<_, FinancialSummary>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(summary)
    }

    /// Returns the day's summary, inserting an all-zero row first if needed.
    pub async fn get_or_create(&self, store_id: &str, date: NaiveDate) -> DbResult<FinancialSummary> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO financial_summaries (id, store_id, date, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (store_id, date) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(store_id)
        .bind(date)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(store_fk(store_id))?;

        self.get(store_id, date)
            .await?
            .ok_or_else(|| DbError::not_found("FinancialSummary", format!("{store_id}/{date}")))
    }

    /// Writes recomputed figures for `(summary.store_id, summary.date)`.
    ///
    /// Inserts the row if absent. On an existing row every computed field is
    /// overwritten and the shift-close fields are left alone. Open registers
    /// of the day that are not linked yet get linked.
    pub async fn save_recomputed(&self, summary: &FinancialSummary) -> DbResult<FinancialSummary> {
        let mut summary = summary.clone();
        summary.normalize();
        let now = Utc::now();

        debug!(
            store_id = %summary.store_id,
            date = %summary.date,
            grand_total = %summary.grand_total(),
            "Saving recomputed summary"
        );

        let mut tx = self.pool.begin().await?;

        let sql = format!(
            r#"
            INSERT INTO financial_summaries (
                id, store_id, date,
                cash_total_minor, transfer_total_minor, card_total_minor, debt_total_minor,
                total_transactions, grand_total_minor, avg_transaction_minor,
                unique_customers, repeat_customers, customer_retention_bps,
                total_revenue_minor, total_margin_minor, margin_bps,
                top_cashier_id, top_cashier_sales_minor, cash_share_bps, card_share_bps,
                usd_rate_minor, grand_total_usd_cents, total_margin_usd_cents,
                created_at, updated_at
            ) VALUES (
                ?, ?, ?,
                ?, ?, ?, ?,
                ?, ?, ?,
                ?, ?, ?,
                ?, ?, ?,
                ?, ?, ?, ?,
                ?, ?, ?,
                ?, ?
            )
            ON CONFLICT (store_id, date) DO UPDATE SET
                cash_total_minor = excluded.cash_total_minor,
                transfer_total_minor = excluded.transfer_total_minor,
                card_total_minor = excluded.card_total_minor,
                debt_total_minor = excluded.debt_total_minor,
                total_transactions = excluded.total_transactions,
                grand_total_minor = excluded.grand_total_minor,
                avg_transaction_minor = excluded.avg_transaction_minor,
                unique_customers = excluded.unique_customers,
                repeat_customers = excluded.repeat_customers,
                customer_retention_bps = excluded.customer_retention_bps,
                total_revenue_minor = excluded.total_revenue_minor,
                total_margin_minor = excluded.total_margin_minor,
                margin_bps = excluded.margin_bps,
                top_cashier_id = excluded.top_cashier_id,
                top_cashier_sales_minor = excluded.top_cashier_sales_minor,
                cash_share_bps = excluded.cash_share_bps,
                card_share_bps = excluded.card_share_bps,
                usd_rate_minor = excluded.usd_rate_minor,
                grand_total_usd_cents = excluded.grand_total_usd_cents,
                total_margin_usd_cents = excluded.total_margin_usd_cents,
                updated_at = excluded.updated_at
            RETURNING {}
            "#,
            SUMMARY_COLUMNS
        );

        let saved = sqlx::query_as::<_, FinancialSummary>(&sql)
            .bind(&summary.id)
            .bind(&summary.store_id)
            .bind(summary.date)
            .bind(summary.cash_total_minor)
            .bind(summary.transfer_total_minor)
            .bind(summary.card_total_minor)
            .bind(summary.debt_total_minor)
            .bind(summary.total_transactions)
            .bind(summary.grand_total_minor)
            .bind(summary.avg_transaction_minor)
            .bind(summary.unique_customers)
            .bind(summary.repeat_customers)
            .bind(summary.customer_retention_bps)
            .bind(summary.total_revenue_minor)
            .bind(summary.total_margin_minor)
            .bind(summary.margin_bps)
            .bind(&summary.top_cashier_id)
            .bind(summary.top_cashier_sales_minor)
            .bind(summary.cash_share_bps)
            .bind(summary.card_share_bps)
            .bind(summary.usd_rate_minor)
            .bind(summary.grand_total_usd_cents)
            .bind(summary.total_margin_usd_cents)
            .bind(summary.created_at)
            .bind(now)
            .fetch_one(&mut *tx)
            .await
            .map_err(store_fk(&summary.store_id))?;

        sqlx::query(
            r#"
            UPDATE cash_registers SET financial_summary_id = ?
             WHERE store_id = ? AND business_date = ? AND financial_summary_id IS NULL
            "#,
        )
        .bind(&saved.id)
        .bind(&saved.store_id)
        .bind(saved.date)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(saved)
    }

    /// Summaries of a store between two dates, inclusive, oldest first.
    pub async fn list_range(
        &self,
        store_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> DbResult<Vec<FinancialSummary>> {
        let sql = format!(
            "SELECT {} FROM financial_summaries WHERE store_id = ? AND date >= ? AND date <= ? ORDER BY date",
            SUMMARY_COLUMNS
        );
        let summaries = sqlx::query_as::<_, FinancialSummary>(&sql)
            .bind(store_id)
            .bind(from)
            .bind(to)
            .fetch_all(&self.pool)
            .await?;
        Ok(summaries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{day, test_db, STORE};
    use till_core::Money;

    #[tokio::test]
    async fn test_get_or_create_is_stable() {
        let db = test_db().await;
        let first = db.summaries().get_or_create(STORE, day()).await.unwrap();
        let second = db.summaries().get_or_create(STORE, day()).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.grand_total_minor, 0);
        assert_eq!(db.summaries().get_by_id(&first.id).await.unwrap().unwrap().date, day());
    }

    #[tokio::test]
    async fn test_unknown_store() {
        let db = test_db().await;
        let err = db.summaries().get_or_create("ghost", day()).await.unwrap_err();
        assert!(matches!(err, DbError::Ledger(LedgerError::StoreNotFound(_))));
    }

    #[tokio::test]
    async fn test_recompute_overwrites_figures_and_keeps_close_fields() {
        let db = test_db().await;
        let reg = db.registers().open(STORE, day(), Money::zero(), None).await.unwrap();
        db.registers()
            .close(crate::CloseShift {
                register_id: &reg.id,
                actual_balance: Money::from_minor(4_000),
                actor_id: Some("mgr"),
                notes: Some("counted twice"),
            })
            .await
            .unwrap();

        let existing = db.summaries().get(STORE, day()).await.unwrap().unwrap();
        let mut recomputed = FinancialSummary::empty("ignored".into(), STORE, day(), Utc::now());
        recomputed.grand_total_minor = 9_000;
        recomputed.cash_total_minor = 3_000;
        recomputed.total_transactions = 3;

        let saved = db.summaries().save_recomputed(&recomputed).await.unwrap();
        assert_eq!(saved.id, existing.id);
        assert_eq!(saved.grand_total_minor, 9_000);
        assert_eq!(saved.avg_transaction_minor, 3_000);
        assert_eq!(saved.cash_share_bps, 3_333);
        assert_eq!(saved.cash_closed_minor, Some(4_000));
        assert_eq!(saved.closed_by.as_deref(), Some("mgr"));
        assert_eq!(saved.notes.as_deref(), Some("counted twice"));
    }

    #[tokio::test]
    async fn test_recompute_links_open_registers() {
        let db = test_db().await;
        let reg = db.registers().open(STORE, day(), Money::zero(), None).await.unwrap();
        assert!(reg.financial_summary_id.is_none());

        let summary = FinancialSummary::empty(Uuid::new_v4().to_string(), STORE, day(), Utc::now());
        let saved = db.summaries().save_recomputed(&summary).await.unwrap();

        let reg = db.registers().get(&reg.id).await.unwrap().unwrap();
        assert_eq!(reg.financial_summary_id, Some(saved.id));
    }

    #[tokio::test]
    async fn test_list_range() {
        let db = test_db().await;
        let d1 = day();
        let d2 = d1.succ_opt().unwrap();
        let d3 = d2.succ_opt().unwrap();
        for d in [d3, d1, d2] {
            db.summaries().get_or_create(STORE, d).await.unwrap();
        }

        let range = db.summaries().list_range(STORE, d1, d2).await.unwrap();
        assert_eq!(range.iter().map(|s| s.date).collect::<Vec<_>>(), vec![d1, d2]);
    }
}
