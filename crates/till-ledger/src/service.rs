//! # Ledger Service
//!
//! Wires the ledger components together from a [`LedgerConfig`].
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          LedgerService                                  │
//! │                                                                         │
//! │   LedgerConfig ──► Database (till-db) ──► guard::from_settings         │
//! │                                                                         │
//! │   ┌──────────────┐  ┌──────────────────┐  ┌─────────────────────────┐  │
//! │   │ ShiftManager │  │ SaleReconciler   │  │ DailySummaryAggregator  │  │
//! │   └──────────────┘  └──────────────────┘  └─────────────────────────┘  │
//! │                                                                         │
//! │   start_scheduler() ──► tokio::spawn(ReconciliationScheduler::run)     │
//! │   shutdown()        ──► SchedulerHandle::shutdown + pool close         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use backoff::backoff::Backoff;
use tracing::{info, warn};

use crate::aggregator::DailySummaryAggregator;
use crate::config::{GuardBackend, LedgerConfig};
use crate::error::ServiceResult;
use crate::guard::{self, IdempotencyGuard, SqliteIdempotencyGuard};
use crate::reconciler::{Outcome, SaleReconciler};
use crate::scheduler::{ReconciliationScheduler, SchedulerHandle};
use crate::shift::ShiftManager;
use till_core::SaleEvent;
use till_db::{Database, DbConfig};

pub struct LedgerService {
    config: LedgerConfig,
    db: Database,
    shifts: ShiftManager,
    aggregator: DailySummaryAggregator,
    reconciler: Arc<SaleReconciler>,
    scheduler: Option<SchedulerHandle>,
}

impl LedgerService {
    /// Opens the configured database and builds every component.
    pub async fn connect(config: LedgerConfig) -> ServiceResult<Self> {
        let db_config = if config.database.path.as_os_str() == ":memory:" {
            DbConfig::in_memory()
        } else {
            DbConfig::new(&config.database.path).max_connections(config.database.max_connections)
        };
        let db = Database::new(db_config).await?;
        info!(path = ?config.database.path, "Ledger database ready");

        Self::with_database(db, config).await
    }

    pub async fn with_database(db: Database, config: LedgerConfig) -> ServiceResult<Self> {
        let guard: Arc<dyn IdempotencyGuard> = guard::from_settings(&config.idempotency, &db).await?;
        let shifts = ShiftManager::new(db.clone(), config.ledger.clone());
        let aggregator = DailySummaryAggregator::new(db.clone(), config.analytics.clone())
            .with_business_offset(config.ledger.business_utc_offset_minutes);
        let reconciler = SaleReconciler::new(db.clone(), shifts.clone(), aggregator.clone(), guard, &config);

        info!(
            guard = %config.idempotency.backend,
            auto_open = %config.ledger.auto_open_policy,
            "Ledger service initialized"
        );

        Ok(LedgerService {
            config,
            db,
            shifts,
            aggregator,
            reconciler: Arc::new(reconciler),
            scheduler: None,
        })
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn shifts(&self) -> &ShiftManager {
        &self.shifts
    }

    pub fn aggregator(&self) -> &DailySummaryAggregator {
        &self.aggregator
    }

    pub fn reconciler(&self) -> Arc<SaleReconciler> {
        self.reconciler.clone()
    }

    /// Processes an event, retrying infrastructure failures with
    /// exponential backoff. Business rejections return immediately.
    pub async fn process_with_retry(&self, event: &SaleEvent) -> ServiceResult<Outcome> {
        let mut backoff = self.config.retry.backoff();
        backoff.reset();

        loop {
            match self.reconciler.process_sale(event).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_retryable() => match backoff.next_backoff() {
                    Some(delay) => {
                        warn!(?e, sale_id = %event.sale_id, ?delay, "Transient failure, retrying sale event");
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(e),
                },
                Err(e) => return Err(e),
            }
        }
    }

    /// Spawns the reconciliation scheduler if enabled. Idempotent.
    pub fn start_scheduler(&mut self) {
        if self.scheduler.is_some() {
            return;
        }
        if !self.config.scheduler.enabled {
            info!("Reconciliation scheduler is disabled");
            return;
        }

        let purge_guard = (self.config.idempotency.backend == GuardBackend::Sqlite).then(|| {
            SqliteIdempotencyGuard::new(
                self.db.idempotency(),
                self.config.idempotency.lock_ttl(),
                self.config.idempotency.processed_ttl(),
            )
        });

        let (scheduler, handle) = ReconciliationScheduler::new(
            self.aggregator.clone(),
            self.config.scheduler.clone(),
            self.config.ledger.business_utc_offset_minutes,
            purge_guard,
        );
        tokio::spawn(scheduler.run());
        self.scheduler = Some(handle);
    }

    /// Stops background tasks and closes the pool.
    pub async fn shutdown(&mut self) {
        info!("Shutting down ledger service");

        if let Some(handle) = self.scheduler.take() {
            if let Err(e) = handle.shutdown().await {
                warn!(?e, "Scheduler already stopped");
            }
        }

        self.db.close().await;
        info!("Ledger service stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{test_db, STORE};
    use chrono::Utc;
    use till_core::{Money, PaymentMethod, SaleEventKind};

    fn event(id: &str) -> SaleEvent {
        SaleEvent {
            event_id: None,
            kind: SaleEventKind::Completed,
            sale_id: id.into(),
            store_id: STORE.into(),
            total_amount: Money::from_minor(2_500),
            payment_method: PaymentMethod::Cash,
            cash_amount: Money::zero(),
            transfer_amount: Money::zero(),
            card_amount: Money::zero(),
            customer_id: None,
            cashier_id: None,
            line_items: Vec::new(),
            created_at: Utc::now(),
            occurred_at: None,
        }
    }

    #[tokio::test]
    async fn test_service_processes_through_sqlite_guard() {
        let db = test_db().await;
        let mut config = LedgerConfig::default();
        config.idempotency.backend = GuardBackend::Sqlite;
        let service = LedgerService::with_database(db, config).await.unwrap();

        let first = service.process_with_retry(&event("s1")).await.unwrap();
        assert!(matches!(first, Outcome::Applied { .. }));
        assert_eq!(service.process_with_retry(&event("s1")).await.unwrap(), Outcome::Duplicate);
        assert!(service.database().idempotency().is_processed("sale:s1:completed", Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn test_business_rejection_is_not_retried() {
        let db = test_db().await;
        let service = LedgerService::with_database(db, LedgerConfig::default()).await.unwrap();

        let mut unknown_store = event("s2");
        unknown_store.store_id = "nowhere".into();
        let started = std::time::Instant::now();
        let err = service.process_with_retry(&unknown_store).await.unwrap_err();
        assert_eq!(err.status_code(), 404);
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_scheduler_start_and_shutdown() {
        let db = test_db().await;
        let mut service = LedgerService::with_database(db, LedgerConfig::default()).await.unwrap();
        service.start_scheduler();
        service.start_scheduler();
        assert!(service.scheduler.is_some());
        service.shutdown().await;
        assert!(service.scheduler.is_none());
    }

    #[tokio::test]
    async fn test_connect_in_memory() {
        let mut config = LedgerConfig::default();
        config.database.path = ":memory:".into();
        let service = LedgerService::connect(config).await.unwrap();
        assert!(service.database().health_check().await);
    }
}
