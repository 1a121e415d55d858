//! # Daily Summary Aggregator
//!
//! Recomputes a store's [`FinancialSummary`] for one business day from the
//! sales projection, batch costs and exchange rates.
//!
//! ## Recompute Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  sales.completed_for_day ─┐                                             │
//! │  sales.items_for_day ─────┤                                             │
//! │  batches.for_day ─────────┼──► summary::compute ──► DailyFigures        │
//! │   (received by day end)   │                             │               │
//! │  returning_customers ─────┤                             │               │
//! │  exchange_rates ──────────┘                             ▼               │
//! │                                    summaries.get_or_create + apply_to   │
//! │                                                         │               │
//! │                                                         ▼               │
//! │                              save_recomputed (full overwrite of the    │
//! │                              computed fields, close fields kept)       │
//! │                                                         │               │
//! │                                                         ▼               │
//! │                              detect_anomalies ──► warn! per anomaly     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Recomputing is idempotent. A later run supersedes an earlier one, so it
//! is safe to run while sales keep arriving.

use chrono::{Duration, NaiveDate};
use tracing::{debug, error, info, warn};

use crate::config::AnalyticsSettings;
use crate::error::{ServiceError, ServiceResult};
use till_core::ledger;
use till_core::summary::{self, DailyFigures, SummaryAnomaly, SummaryInputs};
use till_core::FinancialSummary;
use till_db::Database;

/// A saved summary with the figures and anomalies of its recompute.
#[derive(Debug, Clone)]
pub struct Recomputed {
    pub summary: FinancialSummary,
    pub figures: DailyFigures,
    pub anomalies: Vec<SummaryAnomaly>,
}

/// Outcome of a multi-store run.
#[derive(Debug, Default)]
pub struct StoreRun {
    pub recomputed: Vec<String>,
    pub failed: Vec<(String, ServiceError)>,
}

#[derive(Debug, Clone)]
pub struct DailySummaryAggregator {
    db: Database,
    settings: AnalyticsSettings,
    business_utc_offset_minutes: i32,
}

impl DailySummaryAggregator {
    pub fn new(db: Database, settings: AnalyticsSettings) -> Self {
        DailySummaryAggregator {
            db,
            settings,
            business_utc_offset_minutes: 0,
        }
    }

    /// Sets the business timezone used to find where a day ends.
    pub fn with_business_offset(mut self, utc_offset_minutes: i32) -> Self {
        self.business_utc_offset_minutes = utc_offset_minutes;
        self
    }

    /// Recomputes and saves the summary of `store_id` for `date`.
    pub async fn recompute(&self, store_id: &str, date: NaiveDate) -> ServiceResult<FinancialSummary> {
        Ok(self.recompute_detailed(store_id, date).await?.summary)
    }

    /// Like [`recompute`](Self::recompute), also returning figures and anomalies.
    pub async fn recompute_detailed(&self, store_id: &str, date: NaiveDate) -> ServiceResult<Recomputed> {
        debug!(store_id = %store_id, %date, "Recomputing daily summary");

        let sales = self.db.sales().completed_for_day(store_id, date).await?;
        let items = self.db.sales().items_for_day(store_id, date).await?;
        let day_end = ledger::business_day_end(date, self.business_utc_offset_minutes);
        let batches = self.db.batches().for_day(store_id, date, day_end).await?;
        let returning = self.db.sales().returning_customers(store_id, date).await?;
        let usd_rate = self
            .db
            .exchange_rates()
            .rate_on_or_before(date)
            .await?
            .map(|r| r.usd_rate());

        let figures = summary::compute(SummaryInputs {
            sales: &sales,
            items: &items,
            batches: &batches,
            returning_customers: &returning,
            usd_rate,
            cost_basis: self.settings.cost_basis_policy,
        });

        let mut current = self.db.summaries().get_or_create(store_id, date).await?;
        figures.apply_to(&mut current);
        let saved = self.db.summaries().save_recomputed(&current).await?;

        let anomalies = summary::detect_anomalies(&saved, &figures, &self.settings.thresholds());
        for anomaly in &anomalies {
            warn!(store_id = %store_id, %date, anomaly = %anomaly, "Summary anomaly");
        }

        info!(
            store_id = %store_id,
            %date,
            transactions = saved.total_transactions,
            grand_total = %saved.grand_total(),
            margin = %saved.margin_percentage(),
            "Daily summary recomputed"
        );

        Ok(Recomputed {
            summary: saved,
            figures,
            anomalies,
        })
    }

    /// Recomputes every day from `from` to `to`, inclusive.
    pub async fn recompute_range(
        &self,
        store_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> ServiceResult<Vec<FinancialSummary>> {
        if from > to {
            return Err(ServiceError::from(till_core::ValidationError::InvalidFormat {
                field: "date range".to_string(),
                reason: format!("{from} is after {to}"),
            }));
        }

        let mut summaries = Vec::new();
        let mut date = from;
        while date <= to {
            summaries.push(self.recompute(store_id, date).await?);
            date += Duration::days(1);
        }
        Ok(summaries)
    }

    /// Recomputes `date` for every store. A failing store is logged and
    /// skipped.
    pub async fn recompute_all_stores(&self, date: NaiveDate) -> ServiceResult<StoreRun> {
        let mut run = StoreRun::default();
        for store_id in self.db.stores().list_ids().await? {
            match self.recompute(&store_id, date).await {
                Ok(_) => run.recomputed.push(store_id),
                Err(e) => {
                    error!(?e, store_id = %store_id, %date, "Failed to recompute daily summary");
                    run.failed.push((store_id, e));
                }
            }
        }
        Ok(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{day, test_db, STORE};
    use chrono::{TimeZone, Utc};
    use till_core::summary::CostBasisPolicy;
    use till_core::{Money, PaymentMethod, ProductBatch, SaleItemRecord, SaleRecord, SaleStatus};

    fn sale(id: &str, date: NaiveDate, method: PaymentMethod, total: i64, cashier: &str, customer: Option<&str>) -> SaleRecord {
        let at = Utc.from_utc_datetime(&date.and_hms_opt(12, 0, 0).unwrap());
        let split = till_core::PaymentSplit::attribute(
            method,
            Money::from_minor(total),
            Money::zero(),
            Money::zero(),
            Money::zero(),
        );
        SaleRecord {
            id: id.into(),
            store_id: STORE.into(),
            status: SaleStatus::Completed,
            payment_method: method,
            total_minor: total,
            cash_minor: split.cash.minor(),
            transfer_minor: split.transfer.minor(),
            card_minor: split.card.minor(),
            debt_minor: split.debt.minor(),
            customer_id: customer.map(str::to_string),
            cashier_id: Some(cashier.into()),
            business_date: date,
            created_at: at,
            updated_at: at,
        }
    }

    fn item(sale_id: &str, product: &str, qty_units: i64, price: i64) -> SaleItemRecord {
        SaleItemRecord {
            sale_id: sale_id.into(),
            product_id: product.into(),
            quantity_milli: qty_units * 1_000,
            unit_price_minor: price,
        }
    }

    fn batch(id: &str, product: &str, price: i64, days_ago: i64) -> ProductBatch {
        ProductBatch {
            id: id.into(),
            store_id: STORE.into(),
            product_id: product.into(),
            purchase_price_minor: Some(price),
            quantity_milli: 10_000,
            created_at: Utc.from_utc_datetime(&day().and_hms_opt(9, 0, 0).unwrap()) - Duration::days(days_ago),
        }
    }

    async fn seeded() -> (Database, DailySummaryAggregator) {
        let db = test_db().await;
        db.batches().insert(&batch("b1", "tea", 600, 10)).await.unwrap();
        db.batches().insert(&batch("b2", "tea", 700, 1)).await.unwrap();

        let yesterday = day() - Duration::days(1);
        db.sales()
            .upsert(&sale("0", yesterday, PaymentMethod::Cash, 500, "u1", Some("alice")), &[])
            .await
            .unwrap();

        db.sales()
            .upsert(&sale("1", day(), PaymentMethod::Cash, 3_000, "u1", Some("alice")), &[item("1", "tea", 3, 1_000)])
            .await
            .unwrap();
        db.sales()
            .upsert(&sale("2", day(), PaymentMethod::Card, 2_000, "u2", Some("bob")), &[item("2", "tea", 2, 1_000)])
            .await
            .unwrap();
        db.sales()
            .upsert(&sale("3", day(), PaymentMethod::Debt, 1_000, "u2", None), &[item("3", "cake", 1, 1_000)])
            .await
            .unwrap();

        let aggregator = DailySummaryAggregator::new(db.clone(), AnalyticsSettings::default());
        (db, aggregator)
    }

    #[tokio::test]
    async fn test_recompute_figures() {
        let (_db, aggregator) = seeded().await;
        let result = aggregator.recompute_detailed(STORE, day()).await.unwrap();
        let s = &result.summary;

        assert_eq!(s.total_transactions, 3);
        assert_eq!(s.grand_total_minor, 6_000);
        assert_eq!(s.cash_total_minor, 3_000);
        assert_eq!(s.card_total_minor, 2_000);
        assert_eq!(s.debt_total_minor, 1_000);
        assert_eq!(s.avg_transaction_minor, 2_000);
        assert_eq!(s.cash_share_bps, 5_000);

        assert_eq!(s.unique_customers, 2);
        assert_eq!(s.repeat_customers, 1);
        assert_eq!(s.customer_retention_bps, 5_000);

        // u1 and u2 both sold 3000; the smaller id wins the tie
        assert_eq!(s.top_cashier_id.as_deref(), Some("u1"));

        // Latest tea batch costs 700: (1000 - 700) * 5 = 1500, cake costed at 0 = 1000
        assert_eq!(s.total_revenue_minor, 6_000);
        assert_eq!(s.total_margin_minor, 2_500);
        assert_eq!(s.margin_bps, 4_167);

        assert!(result
            .anomalies
            .iter()
            .any(|a| matches!(a, SummaryAnomaly::MissingCostBasis { product_ids } if product_ids == &vec!["cake".to_string()])));
    }

    #[tokio::test]
    async fn test_later_batches_do_not_reprice_old_day() {
        let (db, aggregator) = seeded().await;
        let before = aggregator.recompute(STORE, day()).await.unwrap();

        // Stock received two days later at a higher price
        db.batches().insert(&batch("b3", "tea", 950, -2)).await.unwrap();
        let after = aggregator.recompute(STORE, day()).await.unwrap();
        assert_eq!(after.total_margin_minor, before.total_margin_minor);
        assert_eq!(after.total_margin_minor, 2_500);

        let next = day() + Duration::days(2);
        db.sales()
            .upsert(&sale("9", next, PaymentMethod::Cash, 1_000, "u1", None), &[item("9", "tea", 1, 1_000)])
            .await
            .unwrap();
        let s = aggregator.recompute(STORE, next).await.unwrap();
        assert_eq!(s.total_margin_minor, 50);
    }

    #[tokio::test]
    async fn test_weighted_average_policy() {
        let (db, _) = seeded().await;
        let settings = AnalyticsSettings {
            cost_basis_policy: CostBasisPolicy::WeightedAverage,
            ..AnalyticsSettings::default()
        };
        let aggregator = DailySummaryAggregator::new(db, settings);
        let s = aggregator.recompute(STORE, day()).await.unwrap();
        // Average tea cost 650: (1000 - 650) * 5 + 1000
        assert_eq!(s.total_margin_minor, 2_750);
    }

    #[tokio::test]
    async fn test_recompute_is_idempotent() {
        let (_db, aggregator) = seeded().await;
        let first = aggregator.recompute(STORE, day()).await.unwrap();
        let second = aggregator.recompute(STORE, day()).await.unwrap();

        let strip = |s: &FinancialSummary| FinancialSummary {
            updated_at: s.created_at,
            ..s.clone()
        };
        assert_eq!(strip(&first), strip(&second));
    }

    #[tokio::test]
    async fn test_usd_fields_use_latest_rate() {
        let (db, aggregator) = seeded().await;
        db.exchange_rates()
            .upsert(day() - Duration::days(3), Money::from_minor(1_200))
            .await
            .unwrap();

        let s = aggregator.recompute(STORE, day()).await.unwrap();
        assert_eq!(s.usd_rate_minor, Some(1_200));
        assert_eq!(s.grand_total_usd_cents, 500);
        assert_eq!(s.total_margin_usd_cents, 208);
    }

    #[tokio::test]
    async fn test_recompute_keeps_shift_close_fields() {
        let (db, aggregator) = seeded().await;
        let reg = db.registers().open(STORE, day(), Money::zero(), None).await.unwrap();
        db.registers()
            .close(till_db::CloseShift {
                register_id: &reg.id,
                actual_balance: Money::from_minor(2_900),
                actor_id: Some("mgr"),
                notes: None,
            })
            .await
            .unwrap();

        let s = aggregator.recompute(STORE, day()).await.unwrap();
        assert_eq!(s.grand_total_minor, 6_000);
        assert_eq!(s.cash_closed_minor, Some(2_900));
        assert_eq!(s.closed_by.as_deref(), Some("mgr"));
    }

    #[tokio::test]
    async fn test_range_and_all_stores() {
        let (db, aggregator) = seeded().await;
        db.stores().create("store-2", "Harbor").await.unwrap();

        let range = aggregator
            .recompute_range(STORE, day() - Duration::days(1), day())
            .await
            .unwrap();
        assert_eq!(range.len(), 2);
        assert_eq!(range[0].grand_total_minor, 500);
        assert!(aggregator.recompute_range(STORE, day(), day() - Duration::days(1)).await.is_err());

        let run = aggregator.recompute_all_stores(day()).await.unwrap();
        assert_eq!(run.recomputed.len(), 2);
        assert!(run.failed.is_empty());
        let empty = db.summaries().get("store-2", day()).await.unwrap().unwrap();
        assert_eq!(empty.total_transactions, 0);
    }
}
