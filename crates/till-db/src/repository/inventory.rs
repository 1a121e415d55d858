//! # Product Batch Repository
//!
//! Purchase prices owned by the inventory side. The ledger only reads them
//! for margin; `insert` exists for seeding and tests.

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::SqlitePool;
use std::collections::HashMap;

use crate::error::DbResult;
use till_core::ProductBatch;

const BATCH_COLUMNS: &str = "id, store_id, product_id, purchase_price_minor, quantity_milli, created_at";

#[derive(Debug, Clone)]
pub struct ProductBatchRepository {
    pool: SqlitePool,
}

impl ProductBatchRepository {
    pub fn new(pool: SqlitePool) -> Self {
        ProductBatchRepository { pool }
    }

    pub async fn insert(&self, batch: &ProductBatch) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO product_batches (id, store_id, product_id, purchase_price_minor, quantity_milli, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&batch.id)
        .bind(&batch.store_id)
        .bind(&batch.product_id)
        .bind(batch.purchase_price_minor)
        .bind(batch.quantity_milli)
        .bind(batch.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn for_product(&self, store_id: &str, product_id: &str) -> DbResult<Vec<ProductBatch>> {
        let sql = format!(
            "SELECT {} FROM product_batches WHERE store_id = ? AND product_id = ? ORDER BY created_at, id",
            BATCH_COLUMNS
        );
        let batches = sqlx::query_as::<_, ProductBatch>(&sql)
            .bind(store_id)
            .bind(product_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(batches)
    }

    /// Batches of every product sold in completed sales of the day, keyed
    /// by product id. Only batches received before `until` count, so an old
    /// day is never priced with stock that arrived after it.
    pub async fn for_day(
        &self,
        store_id: &str,
        date: NaiveDate,
        until: DateTime<Utc>,
    ) -> DbResult<HashMap<String, Vec<ProductBatch>>> {
        let sql = format!(
            r#"
            SELECT {} FROM product_batches
             WHERE store_id = ?
               AND created_at < ?
               AND product_id IN (
                   SELECT DISTINCT i.product_id
                     FROM sale_items i
                     JOIN sales s ON s.id = i.sale_id
                    WHERE s.store_id = ? AND s.business_date = ? AND s.status = 'completed'
               )
             ORDER BY product_id, created_at, id
            "#,
            BATCH_COLUMNS
        );
        let batches = sqlx::query_as::<_, ProductBatch>(&sql)
            .bind(store_id)
            .bind(until)
            .bind(store_id)
            .bind(date)
            .fetch_all(&self.pool)
            .await?;

        let mut by_product: HashMap<String, Vec<ProductBatch>> = HashMap::new();
        for batch in batches {
            by_product.entry(batch.product_id.clone()).or_default().push(batch);
        }
        Ok(by_product)
    }
}
