//! # Validation Module
//!
//! Input checks run before any ledger mutation.
//!
//! ## Where Each Check Runs
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  validate_amount        ShiftManager (add_cash / withdraw / open)       │
//! │  validate_hybrid_split  Sales side, at sale creation                    │
//! │  validate_sale_event    SaleReconciler, before touching the guard       │
//! │  parse_business_date    Binary and config input                         │
//! │  parse_amount           Binary input ("1200", "1200.5", "1200.50")      │
//! │                                                                         │
//! │  The database adds the last layer: CHECK constraints, partial unique    │
//! │  index on open shifts, unique history references.                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::NaiveDate;

use crate::error::{CoreResult, LedgerError, ValidationError};
use crate::money::{Money, MINOR_PER_MAJOR};
use crate::types::{PaymentMethod, SaleEvent};
use crate::HYBRID_SPLIT_TOLERANCE_MINOR;

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Rejects zero and negative movement amounts.
///
/// ```rust
/// use till_core::money::Money;
/// use till_core::validation::validate_amount;
///
/// assert!(validate_amount(Money::from_minor(1)).is_ok());
/// assert!(validate_amount(Money::zero()).is_err());
/// ```
pub fn validate_amount(amount: Money) -> CoreResult<()> {
    if !amount.is_positive() {
        return Err(LedgerError::invalid_amount(amount));
    }
    Ok(())
}

/// Rejects negative balances (targets, counted cash).
pub fn validate_balance(field: &str, amount: Money) -> ValidationResult<()> {
    if amount.is_negative() {
        return Err(ValidationError::MustNotBeNegative {
            field: field.to_string(),
        });
    }
    Ok(())
}

/// Validates an identifier (store, register, sale).
pub fn validate_id(field: &str, value: &str) -> ValidationResult<()> {
    if value.trim().is_empty() {
        return Err(ValidationError::required(field));
    }
    Ok(())
}

/// Checks that a hybrid payment's parts add up to the total.
///
/// ## Rules
/// - No part may be negative
/// - At least one part must be non-zero
/// - `|cash + transfer + card - total| <= 0.01`
///
/// ```rust
/// use till_core::money::Money;
/// use till_core::validation::validate_hybrid_split;
///
/// let total = Money::from_minor(50_000);
/// assert!(validate_hybrid_split(total, Money::from_minor(30_000), Money::from_minor(20_000), Money::zero()).is_ok());
/// assert!(validate_hybrid_split(total, Money::from_minor(30_000), Money::from_minor(19_999), Money::zero()).is_ok());
/// assert!(validate_hybrid_split(total, Money::from_minor(30_000), Money::from_minor(19_000), Money::zero()).is_err());
/// ```
pub fn validate_hybrid_split(
    total: Money,
    cash: Money,
    transfer: Money,
    card: Money,
) -> ValidationResult<()> {
    for (field, part) in [("cash_amount", cash), ("transfer_amount", transfer), ("card_amount", card)] {
        if part.is_negative() {
            return Err(ValidationError::MustNotBeNegative {
                field: field.to_string(),
            });
        }
    }

    let split = cash + transfer + card;
    if split.is_zero() {
        return Err(ValidationError::MustBePositive {
            field: "hybrid split".to_string(),
        });
    }

    if (split - total).abs().minor() > HYBRID_SPLIT_TOLERANCE_MINOR {
        return Err(ValidationError::SplitMismatch { split, total });
    }

    Ok(())
}

/// Structural checks on an incoming sale event.
///
/// Hybrid sub-amounts are not checked against the total here: they were
/// validated when the sale was created and are trusted as given.
pub fn validate_sale_event(event: &SaleEvent) -> ValidationResult<()> {
    validate_id("sale_id", &event.sale_id)?;
    validate_id("store_id", &event.store_id)?;

    if event.total_amount.is_negative() {
        return Err(ValidationError::MustNotBeNegative {
            field: "total_amount".to_string(),
        });
    }

    if event.payment_method == PaymentMethod::Hybrid {
        for (field, part) in [
            ("cash_amount", event.cash_amount),
            ("transfer_amount", event.transfer_amount),
            ("card_amount", event.card_amount),
        ] {
            if part.is_negative() {
                return Err(ValidationError::MustNotBeNegative {
                    field: field.to_string(),
                });
            }
        }
    }

    for item in &event.line_items {
        validate_id("product_id", &item.product_id)?;
        if !item.quantity.is_positive() {
            return Err(ValidationError::MustBePositive {
                field: "quantity".to_string(),
            });
        }
    }

    Ok(())
}

/// Parses a `YYYY-MM-DD` date.
pub fn parse_business_date(value: &str) -> ValidationResult<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").map_err(|e| ValidationError::InvalidFormat {
        field: "date".to_string(),
        reason: e.to_string(),
    })
}

/// Parses a non-negative decimal amount with at most two fraction digits.
pub fn parse_amount(value: &str) -> ValidationResult<Money> {
    let invalid = |reason: &str| ValidationError::InvalidFormat {
        field: "amount".to_string(),
        reason: reason.to_string(),
    };

    let value = value.trim();
    let (major, fraction) = value.split_once('.').unwrap_or((value, ""));
    if major.is_empty() || !major.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid("expected digits before the decimal point"));
    }
    if fraction.len() > 2 || !fraction.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid("at most two decimal places"));
    }

    let major: i64 = major.parse().map_err(|_| invalid("amount too large"))?;
    let minor = match fraction.len() {
        0 => 0,
        1 => fraction.parse::<i64>().map_err(|_| invalid("bad fraction"))? * 10,
        _ => fraction.parse::<i64>().map_err(|_| invalid("bad fraction"))?,
    };

    major
        .checked_mul(MINOR_PER_MAJOR)
        .and_then(|m| m.checked_add(minor))
        .map(Money::from_minor)
        .ok_or_else(|| invalid("amount too large"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money::Quantity;
    use crate::types::{SaleEventKind, SaleLineItem};
    use chrono::Utc;

    fn m(minor: i64) -> Money {
        Money::from_minor(minor)
    }

    #[test]
    fn test_validate_amount() {
        assert!(validate_amount(m(100)).is_ok());
        assert_eq!(
            validate_amount(m(-5)),
            Err(LedgerError::InvalidAmount { amount: m(-5) })
        );
        assert!(validate_amount(m(0)).is_err());
    }

    #[test]
    fn test_hybrid_tolerance() {
        assert!(validate_hybrid_split(m(50_000), m(30_000), m(20_001), m(0)).is_ok());
        assert!(matches!(
            validate_hybrid_split(m(50_000), m(30_000), m(20_002), m(0)),
            Err(ValidationError::SplitMismatch { .. })
        ));
    }

    #[test]
    fn test_hybrid_rejects_negative_and_empty() {
        assert!(matches!(
            validate_hybrid_split(m(100), m(-1), m(101), m(0)),
            Err(ValidationError::MustNotBeNegative { .. })
        ));
        assert!(matches!(
            validate_hybrid_split(m(0), m(0), m(0), m(0)),
            Err(ValidationError::MustBePositive { .. })
        ));
    }

    #[test]
    fn test_sale_event_validation() {
        let mut event = SaleEvent {
            event_id: None,
            kind: SaleEventKind::Completed,
            sale_id: "1".into(),
            store_id: "s1".into(),
            total_amount: m(1_000),
            payment_method: PaymentMethod::Cash,
            cash_amount: m(0),
            transfer_amount: m(0),
            card_amount: m(0),
            customer_id: None,
            cashier_id: None,
            line_items: vec![SaleLineItem {
                product_id: "p1".into(),
                quantity: Quantity::from_units(1),
                unit_price: m(1_000),
            }],
            created_at: Utc::now(),
            occurred_at: None,
        };
        assert!(validate_sale_event(&event).is_ok());

        event.line_items[0].quantity = Quantity::from_milli(0);
        assert!(validate_sale_event(&event).is_err());

        event.line_items.clear();
        event.store_id = "  ".into();
        assert_eq!(
            validate_sale_event(&event),
            Err(ValidationError::required("store_id"))
        );
    }

    #[test]
    fn test_parse_business_date() {
        assert_eq!(
            parse_business_date("2024-03-01").unwrap(),
            NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
        );
        assert!(parse_business_date("01/03/2024").is_err());
    }

    #[test]
    fn test_parse_amount() {
        assert_eq!(parse_amount("1200").unwrap(), m(120_000));
        assert_eq!(parse_amount(" 1200.5 ").unwrap(), m(120_050));
        assert_eq!(parse_amount("0.07").unwrap(), m(7));
        assert!(parse_amount("-5").is_err());
        assert!(parse_amount("1.234").is_err());
        assert!(parse_amount(".50").is_err());
        assert!(parse_amount("12a").is_err());
        assert!(parse_amount("99999999999999999999").is_err());
    }
}
