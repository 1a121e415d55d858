//! # Sale Repository
//!
//! The ledger's projection of sale events it has consumed. The aggregator
//! reads only this table, never the Sales subsystem's own store.
//!
//! ## Projection Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  "completed" event ──► upsert() → status = completed, items replaced   │
//! │                        (a refunded row stays refunded)                 │
//! │                                                                         │
//! │  "refunded" event  ──► mark_refunded() → status = refunded             │
//! │                        (drops out of completed_for_day scans)          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{NaiveDate, Utc};
use sqlx::SqlitePool;
use std::collections::HashSet;
use tracing::debug;

use crate::error::{DbError, DbResult};
use till_core::{LedgerError, SaleItemRecord, SaleRecord};

const SALE_COLUMNS: &str = "id, store_id, status, payment_method, total_minor, cash_minor, \
     transfer_minor, card_minor, debt_minor, customer_id, cashier_id, business_date, \
     created_at, updated_at";

#[derive(Debug, Clone)]
pub struct SaleRepository {
    pool: SqlitePool,
}

impl SaleRepository {
    pub fn new(pool: SqlitePool) -> Self {
        SaleRepository { pool }
    }

    pub async fn get(&self, id: &str) -> DbResult<Option<SaleRecord>> {
        let sql = format!("SELECT {} FROM sales WHERE id = ?", SALE_COLUMNS);
        let sale = sqlx::query_as::<_, SaleRecord>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(sale)
    }

    /// Inserts or replaces a sale and its line items in one transaction.
    /// A row already flagged refunded keeps that status.
    pub async fn upsert(&self, sale: &SaleRecord, items: &[SaleItemRecord]) -> DbResult<()> {
        debug!(sale_id = %sale.id, store_id = %sale.store_id, items = items.len(), "Upserting sale");

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO sales (
                id, store_id, status, payment_method,
                total_minor, cash_minor, transfer_minor, card_minor, debt_minor,
                customer_id, cashier_id, business_date, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                status = CASE WHEN sales.status = 'refunded' THEN sales.status ELSE excluded.status END,
                payment_method = excluded.payment_method,
                total_minor = excluded.total_minor,
                cash_minor = excluded.cash_minor,
                transfer_minor = excluded.transfer_minor,
                card_minor = excluded.card_minor,
                debt_minor = excluded.debt_minor,
                customer_id = excluded.customer_id,
                cashier_id = excluded.cashier_id,
                business_date = excluded.business_date,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&sale.id)
        .bind(&sale.store_id)
        .bind(sale.status)
        .bind(sale.payment_method)
        .bind(sale.total_minor)
        .bind(sale.cash_minor)
        .bind(sale.transfer_minor)
        .bind(sale.card_minor)
        .bind(sale.debt_minor)
        .bind(&sale.customer_id)
        .bind(&sale.cashier_id)
        .bind(sale.business_date)
        .bind(sale.created_at)
        .bind(sale.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| match DbError::from(e) {
            DbError::ForeignKeyViolation { .. } => LedgerError::StoreNotFound(sale.store_id.clone()).into(),
            other => other,
        })?;

        sqlx::query("DELETE FROM sale_items WHERE sale_id = ?")
            .bind(&sale.id)
            .execute(&mut *tx)
            .await?;

        for item in items {
            sqlx::query(
                "INSERT INTO sale_items (sale_id, product_id, quantity_milli, unit_price_minor) VALUES (?, ?, ?, ?)",
            )
            .bind(&sale.id)
            .bind(&item.product_id)
            .bind(item.quantity_milli)
            .bind(item.unit_price_minor)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Flags a sale as refunded and returns the updated row, or `None` if the
    /// ledger never saw the sale. Amounts are left as they were.
    pub async fn mark_refunded(&self, id: &str) -> DbResult<Option<SaleRecord>> {
        let sql = format!(
            "UPDATE sales SET status = 'refunded', updated_at = ? WHERE id = ? RETURNING {}",
            SALE_COLUMNS
        );
        let refunded = sqlx::query_as::<_, SaleRecord>(&sql)
            .bind(Utc::now())
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        if refunded.is_some() {
            debug!(sale_id = %id, "Sale marked refunded");
        }
        Ok(refunded)
    }

    /// Completed sales of a store on a business day.
    pub async fn completed_for_day(&self, store_id: &str, date: NaiveDate) -> DbResult<Vec<SaleRecord>> {
        let sql = format!(
            "SELECT {} FROM sales WHERE store_id = ? AND business_date = ? AND status = 'completed' ORDER BY created_at, id",
            SALE_COLUMNS
        );
        let sales = sqlx::query_as::<_, SaleRecord>(&sql)
            .bind(store_id)
            .bind(date)
            .fetch_all(&self.pool)
            .await?;
        Ok(sales)
    }

    /// Line items of the completed sales of a store on a business day.
    pub async fn items_for_day(&self, store_id: &str, date: NaiveDate) -> DbResult<Vec<SaleItemRecord>> {
        let items = sqlx::query_as::<_, SaleItemRecord>(
            r#"
            SELECT i.sale_id, i.product_id, i.quantity_milli, i.unit_price_minor
              FROM sale_items i
              JOIN sales s ON s.id = i.sale_id
             WHERE s.store_id = ? AND s.business_date = ? AND s.status = 'completed'
             ORDER BY i.id
            "#,
        )
        .bind(store_id)
        .bind(date)
        .fetch_all(&self.pool)
        .await?;
        Ok(items)
    }

    pub async fn items_for_sale(&self, sale_id: &str) -> DbResult<Vec<SaleItemRecord>> {
        let items = sqlx::query_as::<_, SaleItemRecord>(
            "SELECT sale_id, product_id, quantity_milli, unit_price_minor FROM sale_items WHERE sale_id = ? ORDER BY id",
        )
        .bind(sale_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(items)
    }

    /// Customers buying on `date` who already had a completed purchase in
    /// the same store on an earlier day.
    pub async fn returning_customers(&self, store_id: &str, date: NaiveDate) -> DbResult<HashSet<String>> {
        let customers = sqlx::query_scalar::<_, String>(
            r#"
            SELECT DISTINCT earlier.customer_id
              FROM sales earlier
             WHERE earlier.store_id = ?
               AND earlier.status = 'completed'
               AND earlier.business_date < ?
               AND earlier.customer_id IN (
                   SELECT today.customer_id
                     FROM sales today
                    WHERE today.store_id = ?
                      AND today.business_date = ?
                      AND today.status = 'completed'
                      AND today.customer_id IS NOT NULL
               )
            "#,
        )
        .bind(store_id)
        .bind(date)
        .bind(store_id)
        .bind(date)
        .fetch_all(&self.pool)
        .await?;
        Ok(customers.into_iter().collect())
    }

    /// Distinct business days with completed sales, for backfills.
    pub async fn days_with_sales(&self, store_id: &str) -> DbResult<Vec<NaiveDate>> {
        let days = sqlx::query_scalar::<_, NaiveDate>(
            "SELECT DISTINCT business_date FROM sales WHERE store_id = ? AND status = 'completed' ORDER BY business_date",
        )
        .bind(store_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(days)
    }
}
