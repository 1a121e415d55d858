//! # Store Repository
//!
//! Tenants. Every ledger row references one.

use chrono::Utc;
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::{DbError, DbResult};
use till_core::Store;

#[derive(Debug, Clone)]
pub struct StoreRepository {
    pool: SqlitePool,
}

impl StoreRepository {
    pub fn new(pool: SqlitePool) -> Self {
        StoreRepository { pool }
    }

    /// Inserts a store. Fails with `UniqueViolation` if the id exists.
    pub async fn create(&self, id: &str, name: &str) -> DbResult<Store> {
        debug!(store_id = %id, "Creating store");

        let store = sqlx::query_as::<_, Store>(
            r#"
            INSERT INTO stores (id, name, created_at)
            VALUES (?, ?, ?)
            RETURNING id, name, created_at
            "#,
        )
        .bind(id)
        .bind(name)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match DbError::from(e) {
            DbError::UniqueViolation { field, .. } => DbError::duplicate(field, id),
            other => other,
        })?;

        Ok(store)
    }

    /// Inserts the store unless it already exists.
    pub async fn ensure(&self, id: &str, name: &str) -> DbResult<()> {
        sqlx::query("INSERT INTO stores (id, name, created_at) VALUES (?, ?, ?) ON CONFLICT(id) DO NOTHING")
            .bind(id)
            .bind(name)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> DbResult<Option<Store>> {
        let store = sqlx::query_as::<_, Store>("SELECT id, name, created_at FROM stores WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(store)
    }

    /// All store ids in ascending order.
    pub async fn list_ids(&self) -> DbResult<Vec<String>> {
        let ids = sqlx::query_scalar::<_, String>("SELECT id FROM stores ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use crate::test_support::{test_db, STORE};

    #[tokio::test]
    async fn test_create_and_list() {
        let db = test_db().await;
        db.stores().create("store-0", "Depot").await.unwrap();

        let store = db.stores().get(STORE).await.unwrap().unwrap();
        assert_eq!(store.name, "Main Street");
        assert_eq!(db.stores().list_ids().await.unwrap(), vec!["store-0", "store-1"]);
    }

    #[tokio::test]
    async fn test_duplicate_store() {
        let db = test_db().await;
        let err = db.stores().create(STORE, "Again").await.unwrap_err();
        assert!(err.is_unique_violation_on("stores.id"));

        db.stores().ensure(STORE, "Again").await.unwrap();
        assert_eq!(db.stores().get(STORE).await.unwrap().unwrap().name, "Main Street");
    }
}
