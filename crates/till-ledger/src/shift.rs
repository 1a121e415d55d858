//! # Shift Manager
//!
//! Lifecycle of a cash register shift and every operator-facing cash
//! operation.
//!
//! ## State Machine
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   NoShift ──open_shift──► Open ──close_shift──► Closed (terminal)      │
//! │                            │ ▲                                          │
//! │                            │ │ add_cash / withdraw / correct_balance    │
//! │                            └─┘                                          │
//! │                                                                         │
//! │   Only Open accepts balance mutations. There is no reopen.             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Serialization per register comes from the store: each mutation is one
//! transaction that starts with a conditional atomic UPDATE of the register
//! row (see `till_db::CashRegisterRepository`).

use chrono::{DateTime, NaiveDate, Utc};
use tracing::{info, warn};

use crate::config::LedgerSettings;
use crate::error::ServiceResult;
use till_core::ledger::{self, ChainReport};
use till_core::{CashHistory, CashRegister, LedgerError, Money, ShiftCloseReport};
use till_db::{CloseShift, Database, Movement};

#[derive(Debug, Clone)]
pub struct ShiftManager {
    db: Database,
    settings: LedgerSettings,
}

impl ShiftManager {
    pub fn new(db: Database, settings: LedgerSettings) -> Self {
        ShiftManager { db, settings }
    }

    /// Business day containing `at`.
    pub fn business_date(&self, at: DateTime<Utc>) -> NaiveDate {
        ledger::business_date(at, self.settings.business_utc_offset_minutes)
    }

    /// Current business day.
    pub fn today(&self) -> NaiveDate {
        self.business_date(Utc::now())
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Opens today's shift for `store_id` with `target_balance` in the drawer.
    ///
    /// Fails with `AlreadyOpen` if the store already has an open shift today.
    pub async fn open_shift(
        &self,
        store_id: &str,
        target_balance: Money,
        actor_id: Option<&str>,
    ) -> ServiceResult<CashRegister> {
        self.open_shift_on(store_id, self.today(), target_balance, actor_id).await
    }

    /// Opens a shift for an explicit business day.
    pub async fn open_shift_on(
        &self,
        store_id: &str,
        business_date: NaiveDate,
        target_balance: Money,
        actor_id: Option<&str>,
    ) -> ServiceResult<CashRegister> {
        let register = self
            .db
            .registers()
            .open(store_id, business_date, target_balance, actor_id)
            .await?;
        Ok(register)
    }

    /// Closes an open shift and reports the discrepancy.
    ///
    /// A non-zero discrepancy is not an error. Closing twice fails with
    /// `AlreadyClosed` and changes nothing.
    pub async fn close_shift(
        &self,
        register_id: &str,
        actual_balance: Money,
        actor_id: Option<&str>,
        notes: Option<&str>,
    ) -> ServiceResult<ShiftCloseReport> {
        let report = self
            .db
            .registers()
            .close(CloseShift {
                register_id,
                actual_balance,
                actor_id,
                notes,
            })
            .await?;

        info!(
            register_id = %report.register_id,
            expected = %report.expected_balance,
            closed = %report.closed_balance,
            discrepancy = %report.discrepancy,
            summary_id = %report.summary_id,
            "Shift closed"
        );
        Ok(report)
    }

    // =========================================================================
    // Cash Movements
    // =========================================================================

    /// Deposits `amount` and returns the new balance.
    pub async fn add_cash(
        &self,
        register_id: &str,
        amount: Money,
        actor_id: Option<&str>,
        note: &str,
    ) -> ServiceResult<Money> {
        let row = self
            .record(Movement::add_cash(register_id, amount).actor(actor_id).notes(note))
            .await?;
        Ok(row.balance_after())
    }

    /// Withdraws `amount` and returns it.
    ///
    /// Fails with `InsufficientFunds` when the drawer holds less.
    pub async fn withdraw(
        &self,
        register_id: &str,
        amount: Money,
        actor_id: Option<&str>,
        note: &str,
    ) -> ServiceResult<Money> {
        let row = self
            .record(Movement::withdraw(register_id, amount).actor(actor_id).notes(note))
            .await?;
        Ok(row.amount())
    }

    /// Applies any deposit or withdrawal and returns its history row.
    pub async fn record(&self, movement: Movement<'_>) -> ServiceResult<CashHistory> {
        Ok(self.db.registers().apply_movement(movement).await?)
    }

    /// Sets the balance to a counted amount, recording the signed difference.
    pub async fn correct_balance(
        &self,
        register_id: &str,
        counted_balance: Money,
        actor_id: Option<&str>,
        note: &str,
    ) -> ServiceResult<CashHistory> {
        let row = self
            .db
            .registers()
            .correct(register_id, counted_balance, actor_id, note)
            .await?;
        Ok(row)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn current_shift(&self, store_id: &str, business_date: NaiveDate) -> ServiceResult<Option<CashRegister>> {
        Ok(self.db.registers().find_open(store_id, business_date).await?)
    }

    pub async fn get_register(&self, register_id: &str) -> ServiceResult<CashRegister> {
        self.db
            .registers()
            .get(register_id)
            .await?
            .ok_or_else(|| LedgerError::RegisterNotFound(register_id.to_string()).into())
    }

    /// Newest rows first. `None` uses the configured default limit.
    pub async fn history(&self, register_id: &str, limit: Option<u32>) -> ServiceResult<Vec<CashHistory>> {
        self.get_register(register_id).await?;
        let limit = limit.unwrap_or(self.settings.history_limit);
        Ok(self.db.history().recent(register_id, limit).await?)
    }

    /// Checks that the register's audit trail chains and ends at its balance.
    pub async fn verify_chain(&self, register_id: &str) -> ServiceResult<ChainReport> {
        let register = self.get_register(register_id).await?;
        let rows = self.db.history().chain(register_id).await?;
        let report = ledger::verify_chain(&rows, register.current_balance());

        if !report.is_intact() {
            warn!(
                register_id = %register_id,
                breaks = report.breaks.len(),
                first = ?report.breaks.first(),
                "Cash history chain is broken"
            );
        }
        Ok(report)
    }
}
