//! # Ledger Rules
//!
//! Pure rules for moving cash in and out of a register and for checking
//! that a register's audit trail is intact.
//!
//! ## Audit Chain
//! ```text
//! seq  op           amount    before    after
//! ───  ───────────  ────────  ────────  ────────
//!  1   OPEN_SHIFT        0.00      0.00      0.00
//!  2   ADD_CASH       1000.00      0.00   1000.00   after - before == +amount
//!  3   ADD_CASH        500.00   1000.00   1500.00   before == previous after
//!  4   WITHDRAW        300.00   1500.00   1200.00   after - before == -amount
//!  5   CLOSE_SHIFT    1200.00   1200.00   1200.00   no balance change
//!                                         ───────
//!                          last after == register.current_balance
//! ```

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreResult, LedgerError};
use crate::money::Money;
use crate::types::{CashHistory, CashOperation};
use crate::validation::validate_amount;

// =============================================================================
// Balance Movements
// =============================================================================

/// Before/after snapshot of one balance-affecting operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceMovement {
    pub operation: CashOperation,

    /// Unsigned for add/withdraw, signed for corrections.
    pub amount: Money,
    pub balance_before: Money,
    pub balance_after: Money,
}

impl BalanceMovement {
    /// Reconstructs the snapshot from the balance an atomic update returned.
    pub fn ending_at(operation: CashOperation, amount: Money, balance_after: Money) -> Self {
        BalanceMovement {
            operation,
            amount,
            balance_before: balance_after - operation.signed_delta(amount),
            balance_after,
        }
    }
}

/// Deposit into an open drawer.
pub fn plan_add_cash(current: Money, amount: Money) -> CoreResult<BalanceMovement> {
    validate_amount(amount)?;
    Ok(BalanceMovement {
        operation: CashOperation::AddCash,
        amount,
        balance_before: current,
        balance_after: current + amount,
    })
}

/// Withdrawal from an open drawer. Never lets the balance go negative.
///
/// ```rust
/// use till_core::money::Money;
/// use till_core::ledger::plan_withdraw;
/// use till_core::LedgerError;
///
/// let err = plan_withdraw(Money::from_minor(9_000), Money::from_minor(15_000)).unwrap_err();
/// assert!(matches!(err, LedgerError::InsufficientFunds { .. }));
/// ```
pub fn plan_withdraw(current: Money, amount: Money) -> CoreResult<BalanceMovement> {
    validate_amount(amount)?;
    if amount > current {
        return Err(LedgerError::InsufficientFunds {
            requested: amount,
            available: current,
        });
    }
    Ok(BalanceMovement {
        operation: CashOperation::Withdraw,
        amount,
        balance_before: current,
        balance_after: current - amount,
    })
}

/// Sets the balance to a counted value. The recorded amount is the signed delta.
pub fn plan_correction(current: Money, counted: Money) -> CoreResult<BalanceMovement> {
    if counted.is_negative() {
        return Err(LedgerError::invalid_amount(counted));
    }
    Ok(BalanceMovement {
        operation: CashOperation::Correction,
        amount: counted - current,
        balance_before: current,
        balance_after: counted,
    })
}

/// Counted cash minus expected cash. Positive means a surplus.
pub fn discrepancy(actual_balance: Money, target_balance: Money) -> Money {
    actual_balance - target_balance
}

/// Calendar day of `now` in a business timezone given as a UTC offset.
///
/// ```rust
/// use chrono::{TimeZone, Utc, NaiveDate};
/// use till_core::ledger::business_date;
///
/// let late_evening_utc = Utc.with_ymd_and_hms(2024, 3, 1, 21, 30, 0).unwrap();
/// // UTC+5 is already the next day
/// assert_eq!(business_date(late_evening_utc, 300), NaiveDate::from_ymd_opt(2024, 3, 2).unwrap());
/// ```
pub fn business_date(now: DateTime<Utc>, utc_offset_minutes: i32) -> NaiveDate {
    (now + Duration::minutes(utc_offset_minutes as i64)).date_naive()
}

/// First UTC instant after the business day `date` ends.
pub fn business_day_end(date: NaiveDate, utc_offset_minutes: i32) -> DateTime<Utc> {
    let next_midnight = (date + Duration::days(1)).and_time(NaiveTime::MIN).and_utc();
    next_midnight - Duration::minutes(utc_offset_minutes as i64)
}

// =============================================================================
// Chain Verification
// =============================================================================

/// A single integrity violation in a register's trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChainBreak {
    /// `after - before` disagrees with the operation's signed amount.
    RowDelta {
        seq: i64,
        expected_delta: Money,
        recorded_delta: Money,
    },
    /// `before` of a row differs from `after` of the previous row.
    Gap {
        seq: i64,
        previous_after: Money,
        balance_before: Money,
    },
    /// Sequence numbers are not strictly increasing.
    OutOfOrder { seq: i64, previous_seq: i64 },
    /// The trail ends at a different balance than the register holds.
    FinalBalance { trail_after: Money, register_balance: Money },
}

/// Outcome of [`verify_chain`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainReport {
    pub rows_checked: usize,
    pub breaks: Vec<ChainBreak>,
}

impl ChainReport {
    pub fn is_intact(&self) -> bool {
        self.breaks.is_empty()
    }
}

/// Walks `rows` (ascending `seq`) and reports every integrity violation.
///
/// An empty trail is intact only if the register balance is zero.
pub fn verify_chain(rows: &[CashHistory], register_balance: Money) -> ChainReport {
    let mut breaks = Vec::new();
    let mut previous: Option<&CashHistory> = None;

    for row in rows {
        let expected_delta = row.operation_type.signed_delta(row.amount());
        let recorded_delta = row.balance_after() - row.balance_before();
        if expected_delta != recorded_delta {
            breaks.push(ChainBreak::RowDelta {
                seq: row.seq,
                expected_delta,
                recorded_delta,
            });
        }

        if let Some(prev) = previous {
            if row.seq <= prev.seq {
                breaks.push(ChainBreak::OutOfOrder {
                    seq: row.seq,
                    previous_seq: prev.seq,
                });
            }
            if row.balance_before() != prev.balance_after() {
                breaks.push(ChainBreak::Gap {
                    seq: row.seq,
                    previous_after: prev.balance_after(),
                    balance_before: row.balance_before(),
                });
            }
        }

        previous = Some(row);
    }

    let trail_after = previous.map(|r| r.balance_after()).unwrap_or_default();
    if trail_after != register_balance {
        breaks.push(ChainBreak::FinalBalance {
            trail_after,
            register_balance,
        });
    }

    ChainReport {
        rows_checked: rows.len(),
        breaks,
    }
}
