//! # Exchange Rate Repository
//!
//! `date → local price of 1 USD`. A day without its own rate uses the most
//! recent earlier one.

use chrono::NaiveDate;
use sqlx::SqlitePool;

use crate::error::DbResult;
use till_core::{ExchangeRate, LedgerError, Money, ValidationError};

#[derive(Debug, Clone)]
pub struct ExchangeRateRepository {
    pool: SqlitePool,
}

impl ExchangeRateRepository {
    pub fn new(pool: SqlitePool) -> Self {
        ExchangeRateRepository { pool }
    }

    /// Rate for `date`, else the latest rate before it.
    pub async fn rate_on_or_before(&self, date: NaiveDate) -> DbResult<Option<ExchangeRate>> {
        let rate = sqlx::query_as::<_, ExchangeRate>(
            "SELECT date, usd_rate_minor FROM exchange_rates WHERE date <= ? ORDER BY date DESC LIMIT 1",
        )
        .bind(date)
        .fetch_optional(&self.pool)
        .await?;
        Ok(rate)
    }

    pub async fn upsert(&self, date: NaiveDate, usd_rate: Money) -> DbResult<()> {
        if !usd_rate.is_positive() {
            return Err(LedgerError::from(ValidationError::MustBePositive {
                field: "usd_rate".to_string(),
            })
            .into());
        }

        sqlx::query(
            r#"
            INSERT INTO exchange_rates (date, usd_rate_minor) VALUES (?, ?)
            ON CONFLICT (date) DO UPDATE SET usd_rate_minor = excluded.usd_rate_minor
            "#,
        )
        .bind(date)
        .bind(usd_rate.minor())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::test_support::{day, test_db};
    use chrono::Duration;
    use till_core::Money;

    #[tokio::test]
    async fn test_falls_back_to_earlier_rate() {
        let db = test_db().await;
        let rates = db.exchange_rates();
        assert!(rates.rate_on_or_before(day()).await.unwrap().is_none());

        rates.upsert(day() - Duration::days(2), Money::from_minor(1_250_000)).await.unwrap();
        let rate = rates.rate_on_or_before(day()).await.unwrap().unwrap();
        assert_eq!(rate.usd_rate_minor, 1_250_000);

        rates.upsert(day(), Money::from_minor(1_260_000)).await.unwrap();
        rates.upsert(day(), Money::from_minor(1_270_000)).await.unwrap();
        let rate = rates.rate_on_or_before(day()).await.unwrap().unwrap();
        assert_eq!(rate.usd_rate(), Money::from_minor(1_270_000));

        assert!(rates.upsert(day(), Money::zero()).await.is_err());
    }
}
