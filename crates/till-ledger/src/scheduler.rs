//! # Reconciliation Scheduler
//!
//! Background task that recomputes recent daily summaries for every store
//! and purges expired idempotency keys.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Reconciliation Scheduler                             │
//! │                                                                         │
//! │   every interval_secs (default 1h):                                    │
//! │                                                                         │
//! │     for day in [today - lookback_days, today - 1]:                     │
//! │         aggregator.recompute_all_stores(day)                           │
//! │                                                                         │
//! │     sqlite guard (if any): purge_expired()                             │
//! │                                                                         │
//! │   A failed store or day is logged; the run continues.                  │
//! │   Shutdown: SchedulerHandle::shutdown()                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::time::Duration;

use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::aggregator::DailySummaryAggregator;
use crate::config::SchedulerSettings;
use crate::error::{ServiceError, ServiceResult};
use crate::guard::SqliteIdempotencyGuard;
use till_core::ledger;

/// Totals from one scheduler pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub days: Vec<NaiveDate>,
    pub recomputed: usize,
    pub failed: usize,
    pub purged_keys: u64,
}

pub struct ReconciliationScheduler {
    aggregator: DailySummaryAggregator,
    settings: SchedulerSettings,
    business_utc_offset_minutes: i32,
    guard: Option<SqliteIdempotencyGuard>,
    shutdown_rx: mpsc::Receiver<()>,
}

/// Handle for stopping a running scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    shutdown_tx: mpsc::Sender<()>,
}

impl SchedulerHandle {
    /// Triggers graceful shutdown.
    pub async fn shutdown(&self) -> ServiceResult<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| ServiceError::ChannelError("Scheduler shutdown channel closed".into()))
    }
}

impl ReconciliationScheduler {
    pub fn new(
        aggregator: DailySummaryAggregator,
        settings: SchedulerSettings,
        business_utc_offset_minutes: i32,
        guard: Option<SqliteIdempotencyGuard>,
    ) -> (Self, SchedulerHandle) {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let scheduler = ReconciliationScheduler {
            aggregator,
            settings,
            business_utc_offset_minutes,
            guard,
            shutdown_rx,
        };

        (scheduler, SchedulerHandle { shutdown_tx })
    }

    /// Runs until shutdown. Spawn this as a background task.
    pub async fn run(mut self) {
        info!(
            interval_secs = self.settings.interval_secs,
            lookback_days = self.settings.lookback_days,
            "Reconciliation scheduler starting"
        );

        let mut interval = tokio::time::interval(Duration::from_secs(self.settings.interval_secs.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let today = ledger::business_date(Utc::now(), self.business_utc_offset_minutes);
                    let report = self.run_once(today).await;
                    info!(
                        recomputed = report.recomputed,
                        failed = report.failed,
                        purged_keys = report.purged_keys,
                        "Reconciliation pass finished"
                    );
                }

                _ = self.shutdown_rx.recv() => {
                    info!("Reconciliation scheduler shutting down");
                    break;
                }
            }
        }

        info!("Reconciliation scheduler stopped");
    }

    /// The business days a pass covers when `today` is the current day.
    pub fn days_for(&self, today: NaiveDate) -> Vec<NaiveDate> {
        (1..=i64::from(self.settings.lookback_days))
            .rev()
            .map(|back| today - ChronoDuration::days(back))
            .collect()
    }

    /// One pass. Never fails; problems are logged and counted.
    pub async fn run_once(&self, today: NaiveDate) -> RunReport {
        let mut report = RunReport {
            days: self.days_for(today),
            ..Default::default()
        };

        for day in report.days.clone() {
            match self.aggregator.recompute_all_stores(day).await {
                Ok(run) => {
                    debug!(%day, stores = run.recomputed.len(), "Day recomputed");
                    report.recomputed += run.recomputed.len();
                    report.failed += run.failed.len();
                }
                Err(e) => {
                    error!(?e, %day, "Failed to recompute day");
                    report.failed += 1;
                }
            }
        }

        if let Some(guard) = &self.guard {
            match guard.purge_expired().await {
                Ok(purged) => report.purged_keys = purged,
                Err(e) => warn!(?e, "Failed to purge expired idempotency keys"),
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AnalyticsSettings;
    use crate::test_support::{day, test_db, STORE};
    use till_core::{Money, PaymentMethod, SaleRecord, SaleStatus};
    use till_db::Database;

    fn scheduler(db: &Database, lookback_days: u32) -> (ReconciliationScheduler, SchedulerHandle) {
        let settings = SchedulerSettings {
            enabled: true,
            interval_secs: 3_600,
            lookback_days,
        };
        let guard = SqliteIdempotencyGuard::new(
            db.idempotency(),
            Duration::from_secs(60),
            Duration::from_secs(60),
        );
        ReconciliationScheduler::new(
            DailySummaryAggregator::new(db.clone(), AnalyticsSettings::default()),
            settings,
            0,
            Some(guard),
        )
    }

    async fn seed_sale(db: &Database, id: &str, date: NaiveDate, total: i64) {
        let at = date.and_hms_opt(12, 0, 0).unwrap().and_utc();
        let record = SaleRecord {
            id: id.into(),
            store_id: STORE.into(),
            status: SaleStatus::Completed,
            payment_method: PaymentMethod::Cash,
            total_minor: total,
            cash_minor: total,
            transfer_minor: 0,
            card_minor: 0,
            debt_minor: 0,
            customer_id: None,
            cashier_id: None,
            business_date: date,
            created_at: at,
            updated_at: at,
        };
        db.sales().upsert(&record, &[]).await.unwrap();
    }

    #[tokio::test]
    async fn test_days_for_counts_back_from_yesterday() {
        let db = test_db().await;
        let (scheduler, _handle) = scheduler(&db, 2);
        let today = day();
        assert_eq!(
            scheduler.days_for(today),
            vec![today - ChronoDuration::days(2), today - ChronoDuration::days(1)]
        );
    }

    #[tokio::test]
    async fn test_run_once_recomputes_lookback_window() {
        let db = test_db().await;
        let yesterday = day() - ChronoDuration::days(1);
        seed_sale(&db, "s1", yesterday, 4_000).await;
        seed_sale(&db, "s2", day(), 9_000).await;

        let (scheduler, _handle) = scheduler(&db, 2);
        let report = scheduler.run_once(day()).await;
        assert_eq!(report.failed, 0);
        assert_eq!(report.recomputed, 2);

        let summary = db.summaries().get(STORE, yesterday).await.unwrap().unwrap();
        assert_eq!(summary.grand_total(), Money::from_minor(4_000));
        // Today is outside the window
        assert!(db.summaries().get(STORE, day()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_run_once_purges_expired_keys() {
        let db = test_db().await;
        let keys = db.idempotency();
        let past = Utc::now() - ChronoDuration::hours(2);
        assert!(keys.try_acquire("stale", "w1", Duration::from_secs(1), past).await.unwrap());

        let (scheduler, _handle) = scheduler(&db, 1);
        let report = scheduler.run_once(day()).await;
        assert_eq!(report.purged_keys, 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_run_loop() {
        let db = test_db().await;
        let (scheduler, handle) = scheduler(&db, 1);
        let task = tokio::spawn(scheduler.run());
        handle.shutdown().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(handle.shutdown().await.is_err());
    }
}
