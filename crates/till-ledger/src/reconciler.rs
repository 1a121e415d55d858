//! # Sale Reconciler
//!
//! Turns sale events from the Sales subsystem into cash movements.
//!
//! ## Completed Sale
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  SaleEvent (completed)                                                  │
//! │      │                                                                  │
//! │      ▼                                                                  │
//! │  guard.try_acquire(key) ──None───► Outcome::Duplicate                  │
//! │      │                                                                  │
//! │      ▼                                                                  │
//! │  split by payment method ──► sales projection upsert                   │
//! │      │                                                                  │
//! │      ├── cash == 0 ──► Outcome::NoCashMovement                         │
//! │      ▼                                                                  │
//! │  open shift for the sale's business day                                │
//! │  (none: auto-open with target 0, or ShiftClosed under `reject`)        │
//! │      │                                                                  │
//! │      ▼                                                                  │
//! │  ADD_CASH  reference "sale:<id>"  ──► Outcome::Applied                 │
//! │      │                                                                  │
//! │      ▼                                                                  │
//! │  mark_processed ─► release ─► recompute day (failure only logged)      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Refund
//! The original sale's cash portion is withdrawn from the open shift with
//! reference `refund:<id>`. Only after the withdrawal succeeds is the
//! projection row flagged refunded, so a refund that fails (no open shift,
//! insufficient funds) leaves balance and projection untouched and can be
//! retried. If the withdrawal is already in the history (a crash between the
//! two writes), the retry only flags the projection.
//!
//! A refunded projection row is never set back to completed by a late
//! redelivery of the completed event.

use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::aggregator::DailySummaryAggregator;
use crate::config::{AutoOpenPolicy, LedgerConfig};
use crate::error::{ServiceError, ServiceResult};
use crate::guard::IdempotencyGuard;
use crate::shift::ShiftManager;
use till_core::validation::{validate_hybrid_split, validate_sale_event};
use till_core::{
    CashRegister, LedgerError, Money, PaymentMethod, SaleEvent, SaleEventKind, SaleItemRecord, SaleRecord,
    SaleStatus,
};
use till_db::{Database, Movement};

/// What processing an event did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    /// Cash moved. Negative for refunds.
    Applied { cash_delta: Money, register_id: String },
    /// The event had no cash portion. Statistics only.
    NoCashMovement,
    /// Already processed or being processed elsewhere.
    Duplicate,
}

pub struct SaleReconciler {
    db: Database,
    shifts: ShiftManager,
    aggregator: DailySummaryAggregator,
    guard: Arc<dyn IdempotencyGuard>,
    auto_open: AutoOpenPolicy,
    recompute_on_event: bool,
}

impl SaleReconciler {
    pub fn new(
        db: Database,
        shifts: ShiftManager,
        aggregator: DailySummaryAggregator,
        guard: Arc<dyn IdempotencyGuard>,
        config: &LedgerConfig,
    ) -> Self {
        SaleReconciler {
            db,
            shifts,
            aggregator,
            guard,
            auto_open: config.ledger.auto_open_policy,
            recompute_on_event: config.analytics.recompute_on_event,
        }
    }

    /// Processes one delivery of a sale event, at most once per key.
    ///
    /// A duplicate delivery is a success. The idempotency lock is released
    /// whatever happens, so a failed attempt can be redelivered.
    pub async fn process_sale(&self, event: &SaleEvent) -> ServiceResult<Outcome> {
        validate_sale_event(event)?;

        let key = event.idempotency_key();
        let Some(token) = self.guard.try_acquire(&key).await? else {
            debug!(key = %key, sale_id = %event.sale_id, "Duplicate sale event skipped");
            return Ok(Outcome::Duplicate);
        };

        let result = match event.kind {
            SaleEventKind::Completed => self.apply_completed(event).await,
            SaleEventKind::Refunded => self.apply_refund(event).await,
        };

        // The history reference index caught a redelivery the guard missed
        let result = match result {
            Err(e) if e.is_duplicate() => {
                info!(key = %key, "Cash movement already recorded for event");
                Ok((Outcome::Duplicate, None))
            }
            other => other,
        };

        if result.is_ok() {
            if let Err(e) = self.guard.mark_processed(&key).await {
                error!(?e, key = %key, "Failed to mark event processed");
            }
        }
        if let Err(e) = self.guard.release(&key, &token).await {
            error!(?e, key = %key, "Failed to release idempotency lock");
        }

        let (outcome, recompute_date) = result?;

        if let Some(date) = recompute_date.filter(|_| self.recompute_on_event) {
            // Analytics never fail the cash path
            if let Err(e) = self.aggregator.recompute(&event.store_id, date).await {
                error!(?e, store_id = %event.store_id, %date, "Summary recompute after sale failed");
            }
        }

        Ok(outcome)
    }

    // =========================================================================
    // Completed
    // =========================================================================

    async fn apply_completed(&self, event: &SaleEvent) -> ServiceResult<(Outcome, Option<NaiveDate>)> {
        let split = event.split();
        if event.payment_method == PaymentMethod::Hybrid {
            if let Err(e) = validate_hybrid_split(event.total_amount, split.cash, split.transfer, split.card) {
                warn!(sale_id = %event.sale_id, error = %e, "Hybrid split does not match sale total");
            }
        }

        let business_date = self.shifts.business_date(event.created_at);
        let now = Utc::now();
        let record = SaleRecord {
            id: event.sale_id.clone(),
            store_id: event.store_id.clone(),
            status: SaleStatus::Completed,
            payment_method: event.payment_method,
            total_minor: event.total_amount.minor(),
            cash_minor: split.cash.minor(),
            transfer_minor: split.transfer.minor(),
            card_minor: split.card.minor(),
            debt_minor: split.debt.minor(),
            customer_id: event.customer_id.clone(),
            cashier_id: event.cashier_id.clone(),
            business_date,
            created_at: event.created_at,
            updated_at: now,
        };
        let items: Vec<SaleItemRecord> = event
            .line_items
            .iter()
            .map(|item| SaleItemRecord {
                sale_id: event.sale_id.clone(),
                product_id: item.product_id.clone(),
                quantity_milli: item.quantity.milli(),
                unit_price_minor: item.unit_price.minor(),
            })
            .collect();
        self.db.sales().upsert(&record, &items).await?;

        if !split.cash.is_positive() {
            debug!(sale_id = %event.sale_id, method = ?event.payment_method, "Sale has no cash portion");
            return Ok((Outcome::NoCashMovement, Some(business_date)));
        }

        let cash_date = self.shifts.business_date(event.occurred_at());
        let register = self.shift_for_sale(&event.store_id, cash_date).await?;

        let reference = event.cash_reference();
        let note = event.cash_note();
        let row = self
            .shifts
            .record(
                Movement::add_cash(&register.id, split.cash)
                    .actor(event.cashier_id.as_deref())
                    .notes(&note)
                    .reference(&reference),
            )
            .await?;

        info!(
            sale_id = %event.sale_id,
            register_id = %register.id,
            cash = %split.cash,
            balance = %row.balance_after(),
            "Sale cash applied"
        );

        Ok((
            Outcome::Applied {
                cash_delta: split.cash,
                register_id: register.id,
            },
            Some(business_date),
        ))
    }

    /// The open shift of the day, opening one if the policy allows.
    async fn shift_for_sale(&self, store_id: &str, date: NaiveDate) -> ServiceResult<CashRegister> {
        if let Some(register) = self.shifts.current_shift(store_id, date).await? {
            return Ok(register);
        }

        match self.auto_open {
            AutoOpenPolicy::Reject => {
                Err(LedgerError::shift_closed(format!("{store_id}@{date}")).into())
            }
            AutoOpenPolicy::Open => {
                warn!(store_id = %store_id, %date, "No open shift for cash sale, opening one with target 0");
                match self
                    .shifts
                    .open_shift_on(store_id, date, Money::zero(), None)
                    .await
                {
                    Ok(register) => Ok(register),
                    // Another event opened it first
                    Err(ServiceError::Ledger(LedgerError::AlreadyOpen { .. })) => self
                        .shifts
                        .current_shift(store_id, date)
                        .await?
                        .ok_or_else(|| LedgerError::shift_closed(format!("{store_id}@{date}")).into()),
                    Err(e) => Err(e),
                }
            }
        }
    }

    // =========================================================================
    // Refund
    // =========================================================================

    async fn apply_refund(&self, event: &SaleEvent) -> ServiceResult<(Outcome, Option<NaiveDate>)> {
        let original = self.db.sales().get(&event.sale_id).await?;
        let (cash, sale_date) = match &original {
            Some(sale) => (sale.cash(), sale.business_date),
            None => {
                warn!(sale_id = %event.sale_id, "Refund for a sale the ledger never saw, using event amounts");
                (event.split().cash, self.shifts.business_date(event.created_at))
            }
        };

        if original.as_ref().is_some_and(|s| s.status == SaleStatus::Refunded) {
            info!(sale_id = %event.sale_id, "Sale already refunded");
            return Ok((Outcome::Duplicate, None));
        }

        let outcome = if cash.is_positive() {
            let refund_date = self.shifts.business_date(event.occurred_at());
            let register = match self.shifts.current_shift(&event.store_id, refund_date).await? {
                Some(register) => register,
                None => self
                    .db
                    .registers()
                    .latest_open(&event.store_id)
                    .await?
                    .ok_or_else(|| LedgerError::shift_closed(format!("{}@{}", event.store_id, refund_date)))?,
            };

            let reference = event.cash_reference();
            let note = event.cash_note();
            let recorded = self
                .shifts
                .record(
                    Movement::withdraw(&register.id, cash)
                        .actor(event.cashier_id.as_deref())
                        .notes(&note)
                        .reference(&reference),
                )
                .await;
            match recorded {
                Ok(_) => {}
                Err(e) if e.is_duplicate() => {
                    info!(sale_id = %event.sale_id, "Refund cash already withdrawn, flagging sale refunded");
                    self.db.sales().mark_refunded(&event.sale_id).await?;
                    return Ok((Outcome::Duplicate, Some(sale_date)));
                }
                Err(e) => return Err(e),
            }

            info!(sale_id = %event.sale_id, register_id = %register.id, cash = %cash, "Refund cash withdrawn");
            Outcome::Applied {
                cash_delta: -cash,
                register_id: register.id,
            }
        } else {
            Outcome::NoCashMovement
        };

        self.db.sales().mark_refunded(&event.sale_id).await?;
        Ok((outcome, Some(sale_date)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::MemoryIdempotencyGuard;
    use crate::test_support::{test_db, STORE};
    use till_core::{CashOperation, Quantity, SaleLineItem};

    fn m(minor: i64) -> Money {
        Money::from_minor(minor)
    }

    struct Fixture {
        db: Database,
        shifts: ShiftManager,
        reconciler: SaleReconciler,
    }

    async fn fixture_with(config: LedgerConfig) -> Fixture {
        let db = test_db().await;
        let shifts = ShiftManager::new(db.clone(), config.ledger.clone());
        let aggregator = DailySummaryAggregator::new(db.clone(), config.analytics.clone());
        let guard: Arc<dyn IdempotencyGuard> = Arc::new(MemoryIdempotencyGuard::default());
        let reconciler = SaleReconciler::new(db.clone(), shifts.clone(), aggregator, guard, &config);
        Fixture { db, shifts, reconciler }
    }

    async fn fixture() -> Fixture {
        fixture_with(LedgerConfig::default()).await
    }

    fn cash_sale(id: &str, total: i64) -> SaleEvent {
        SaleEvent {
            event_id: None,
            kind: SaleEventKind::Completed,
            sale_id: id.into(),
            store_id: STORE.into(),
            total_amount: m(total),
            payment_method: PaymentMethod::Cash,
            cash_amount: Money::zero(),
            transfer_amount: Money::zero(),
            card_amount: Money::zero(),
            customer_id: Some("c-1".into()),
            cashier_id: Some("u-1".into()),
            line_items: vec![SaleLineItem {
                product_id: "p-1".into(),
                quantity: Quantity::from_units(1),
                unit_price: m(total),
            }],
            created_at: Utc::now(),
            occurred_at: None,
        }
    }

    fn refund_of(sale: &SaleEvent) -> SaleEvent {
        SaleEvent {
            kind: SaleEventKind::Refunded,
            occurred_at: Some(Utc::now()),
            ..sale.clone()
        }
    }

    #[tokio::test]
    async fn test_hybrid_sale_applies_only_cash() {
        let f = fixture().await;
        let reg = f.shifts.open_shift(STORE, Money::zero(), None).await.unwrap();

        let mut event = cash_sale("h1", 50_000);
        event.payment_method = PaymentMethod::Hybrid;
        event.cash_amount = m(30_000);
        event.transfer_amount = m(20_000);

        let outcome = f.reconciler.process_sale(&event).await.unwrap();
        assert_eq!(
            outcome,
            Outcome::Applied {
                cash_delta: m(30_000),
                register_id: reg.id.clone()
            }
        );
        assert_eq!(f.shifts.get_register(&reg.id).await.unwrap().current_balance(), m(30_000));

        let summary = f.db.summaries().get(STORE, f.shifts.today()).await.unwrap().unwrap();
        assert_eq!(summary.grand_total_minor, 50_000);
        assert_eq!(summary.cash_total_minor, 30_000);
        assert_eq!(summary.transfer_total_minor, 20_000);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_applies_once() {
        let f = fixture().await;
        let event = cash_sale("d1", 12_500);

        let first = f.reconciler.process_sale(&event).await.unwrap();
        let second = f.reconciler.process_sale(&event).await.unwrap();
        assert!(matches!(first, Outcome::Applied { .. }));
        assert_eq!(second, Outcome::Duplicate);

        let reg = f.shifts.current_shift(STORE, f.shifts.today()).await.unwrap().unwrap();
        assert_eq!(reg.current_balance(), m(12_500));
        let history = f.shifts.history(&reg.id, None).await.unwrap();
        let adds: Vec<_> = history
            .iter()
            .filter(|h| h.operation_type == CashOperation::AddCash)
            .collect();
        assert_eq!(adds.len(), 1);
        assert_eq!(adds[0].reference.as_deref(), Some("sale:d1"));
        assert_eq!(adds[0].notes, "Sale #d1");
    }

    #[tokio::test]
    async fn test_history_reference_catches_guard_loss() {
        let f = fixture().await;
        let event = cash_sale("g1", 1_000);
        f.reconciler.process_sale(&event).await.unwrap();

        // A fresh guard knows nothing about the first delivery
        let config = LedgerConfig::default();
        let other = SaleReconciler::new(
            f.db.clone(),
            f.shifts.clone(),
            DailySummaryAggregator::new(f.db.clone(), config.analytics.clone()),
            Arc::new(MemoryIdempotencyGuard::default()),
            &config,
        );
        assert_eq!(other.process_sale(&event).await.unwrap(), Outcome::Duplicate);

        let reg = f.shifts.current_shift(STORE, f.shifts.today()).await.unwrap().unwrap();
        assert_eq!(reg.current_balance(), m(1_000));
    }

    #[tokio::test]
    async fn test_concurrent_deliveries_apply_once() {
        let f = fixture().await;
        let reconciler = Arc::new(f.reconciler);
        let event = cash_sale("c1", 4_000);

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let reconciler = reconciler.clone();
            let event = event.clone();
            tasks.push(tokio::spawn(async move { reconciler.process_sale(&event).await.unwrap() }));
        }
        let mut applied = 0;
        for task in tasks {
            if matches!(task.await.unwrap(), Outcome::Applied { .. }) {
                applied += 1;
            }
        }
        assert_eq!(applied, 1);

        let reg = f.shifts.current_shift(STORE, f.shifts.today()).await.unwrap().unwrap();
        assert_eq!(reg.current_balance(), m(4_000));
    }

    #[tokio::test]
    async fn test_refund_withdraws_original_cash() {
        let f = fixture().await;
        let sale = cash_sale("r1", 15_000);
        f.reconciler.process_sale(&sale).await.unwrap();
        let reg = f.shifts.current_shift(STORE, f.shifts.today()).await.unwrap().unwrap();
        f.shifts.add_cash(&reg.id, m(5_000), None, "float").await.unwrap();

        let outcome = f.reconciler.process_sale(&refund_of(&sale)).await.unwrap();
        assert_eq!(
            outcome,
            Outcome::Applied {
                cash_delta: m(-15_000),
                register_id: reg.id.clone()
            }
        );
        assert_eq!(f.shifts.get_register(&reg.id).await.unwrap().current_balance(), m(5_000));

        let latest = &f.shifts.history(&reg.id, Some(1)).await.unwrap()[0];
        assert_eq!(latest.operation_type, CashOperation::Withdraw);
        assert_eq!(latest.amount_minor, 15_000);
        assert_eq!(latest.reference.as_deref(), Some("refund:r1"));
        assert_eq!(latest.notes, "Refund of sale #r1");

        let sale = f.db.sales().get("r1").await.unwrap().unwrap();
        assert_eq!(sale.status, SaleStatus::Refunded);
        let summary = f.db.summaries().get(STORE, f.shifts.today()).await.unwrap().unwrap();
        assert_eq!(summary.total_transactions, 0);

        assert_eq!(
            f.reconciler.process_sale(&refund_of(&cash_sale("r1", 15_000))).await.unwrap(),
            Outcome::Duplicate
        );
    }

    #[tokio::test]
    async fn test_late_completed_delivery_keeps_refund() {
        let f = fixture().await;
        let sale = cash_sale("z1", 3_000);
        f.reconciler.process_sale(&sale).await.unwrap();
        f.reconciler.process_sale(&refund_of(&sale)).await.unwrap();

        // The completed event comes back after its lock marker is gone
        let config = LedgerConfig::default();
        let other = SaleReconciler::new(
            f.db.clone(),
            f.shifts.clone(),
            DailySummaryAggregator::new(f.db.clone(), config.analytics.clone()),
            Arc::new(MemoryIdempotencyGuard::default()),
            &config,
        );
        assert_eq!(other.process_sale(&sale).await.unwrap(), Outcome::Duplicate);

        assert_eq!(f.db.sales().get("z1").await.unwrap().unwrap().status, SaleStatus::Refunded);
        let reg = f.shifts.current_shift(STORE, f.shifts.today()).await.unwrap().unwrap();
        assert_eq!(reg.current_balance(), Money::zero());

        f.reconciler.aggregator.recompute(STORE, f.shifts.today()).await.unwrap();
        let summary = f.db.summaries().get(STORE, f.shifts.today()).await.unwrap().unwrap();
        assert_eq!(summary.total_transactions, 0);
        assert_eq!(summary.grand_total_minor, 0);
    }

    #[tokio::test]
    async fn test_refund_retry_after_withdrawal_flags_sale() {
        let f = fixture().await;
        let sale = cash_sale("w1", 6_000);
        f.reconciler.process_sale(&sale).await.unwrap();
        let reg = f.shifts.current_shift(STORE, f.shifts.today()).await.unwrap().unwrap();

        // Withdrawal landed, the process died before the projection update
        f.shifts
            .record(
                Movement::withdraw(&reg.id, m(6_000))
                    .notes("Refund of sale #w1")
                    .reference("refund:w1"),
            )
            .await
            .unwrap();
        assert_eq!(f.db.sales().get("w1").await.unwrap().unwrap().status, SaleStatus::Completed);

        let outcome = f.reconciler.process_sale(&refund_of(&sale)).await.unwrap();
        assert_eq!(outcome, Outcome::Duplicate);
        assert_eq!(f.db.sales().get("w1").await.unwrap().unwrap().status, SaleStatus::Refunded);
        assert_eq!(f.shifts.get_register(&reg.id).await.unwrap().current_balance(), Money::zero());

        let summary = f.db.summaries().get(STORE, f.shifts.today()).await.unwrap().unwrap();
        assert_eq!(summary.total_transactions, 0);
    }

    #[tokio::test]
    async fn test_refund_with_insufficient_funds_changes_nothing() {
        let f = fixture().await;
        let sale = cash_sale("r2", 15_000);
        f.reconciler.process_sale(&sale).await.unwrap();
        let reg = f.shifts.current_shift(STORE, f.shifts.today()).await.unwrap().unwrap();
        f.shifts.withdraw(&reg.id, m(10_000), None, "bank drop").await.unwrap();

        let err = f.reconciler.process_sale(&refund_of(&sale)).await.unwrap_err();
        assert!(matches!(err, ServiceError::Ledger(LedgerError::InsufficientFunds { .. })));
        assert_eq!(f.shifts.get_register(&reg.id).await.unwrap().current_balance(), m(5_000));
        assert_eq!(f.db.sales().get("r2").await.unwrap().unwrap().status, SaleStatus::Completed);

        // The lock was released, so the refund can be retried once cash is back
        f.shifts.add_cash(&reg.id, m(10_000), None, "").await.unwrap();
        let outcome = f.reconciler.process_sale(&refund_of(&sale)).await.unwrap();
        assert!(matches!(outcome, Outcome::Applied { .. }));
        assert_eq!(f.shifts.get_register(&reg.id).await.unwrap().current_balance(), Money::zero());
    }

    #[tokio::test]
    async fn test_refund_without_open_shift() {
        let f = fixture().await;
        let sale = cash_sale("r3", 2_000);
        f.reconciler.process_sale(&sale).await.unwrap();
        let reg = f.shifts.current_shift(STORE, f.shifts.today()).await.unwrap().unwrap();
        f.shifts.close_shift(&reg.id, m(2_000), None, None).await.unwrap();

        let err = f.reconciler.process_sale(&refund_of(&sale)).await.unwrap_err();
        assert!(matches!(err, ServiceError::Ledger(LedgerError::ShiftClosed { .. })));
        assert_eq!(err.status_code(), 403);
    }

    #[tokio::test]
    async fn test_auto_open_policies() {
        let f = fixture().await;
        let outcome = f.reconciler.process_sale(&cash_sale("a1", 700)).await.unwrap();
        let Outcome::Applied { register_id, .. } = outcome else {
            panic!("expected cash to be applied");
        };
        let reg = f.shifts.get_register(&register_id).await.unwrap();
        assert_eq!(reg.target_balance(), Money::zero());
        assert_eq!(reg.current_balance(), m(700));

        let mut config = LedgerConfig::default();
        config.ledger.auto_open_policy = AutoOpenPolicy::Reject;
        let strict = fixture_with(config).await;
        let err = strict.reconciler.process_sale(&cash_sale("a2", 700)).await.unwrap_err();
        assert!(matches!(err, ServiceError::Ledger(LedgerError::ShiftClosed { .. })));
        assert!(strict.shifts.current_shift(STORE, strict.shifts.today()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_non_cash_sale_only_updates_statistics() {
        let f = fixture().await;
        let mut event = cash_sale("k1", 8_000);
        event.payment_method = PaymentMethod::Card;

        assert_eq!(f.reconciler.process_sale(&event).await.unwrap(), Outcome::NoCashMovement);
        assert!(f.shifts.current_shift(STORE, f.shifts.today()).await.unwrap().is_none());

        let summary = f.db.summaries().get(STORE, f.shifts.today()).await.unwrap().unwrap();
        assert_eq!(summary.card_total_minor, 8_000);
        assert_eq!(summary.card_share_bps, 10_000);
    }

    #[tokio::test]
    async fn test_invalid_event_is_rejected_before_locking() {
        let f = fixture().await;
        let mut event = cash_sale("", 100);
        event.sale_id = "  ".into();
        let err = f.reconciler.process_sale(&event).await.unwrap_err();
        assert_eq!(err.status_code(), 400);
    }
}
