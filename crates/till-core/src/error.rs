//! # Error Types
//!
//! Domain errors raised by ledger rules.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  till-core (this file)                                                  │
//! │  ├── LedgerError      - Rule violations (amount, lifecycle, funds)     │
//! │  └── ValidationError  - Malformed input                                │
//! │                                                                         │
//! │  till-db                                                                │
//! │  └── DbError          - Storage failures, wraps LedgerError            │
//! │                                                                         │
//! │  till-ledger                                                            │
//! │  └── ServiceError     - What callers see, with a status code           │
//! │                                                                         │
//! │  Flow: ValidationError → LedgerError → DbError → ServiceError          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

use crate::money::Money;

// =============================================================================
// Ledger Error
// =============================================================================

/// Violations of cash ledger rules.
///
/// None of these are retried automatically. They are reported to the
/// operator as-is.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    /// Amount was zero or negative.
    #[error("Invalid amount {amount}: must be greater than zero")]
    InvalidAmount { amount: Money },

    /// Mutation attempted on a closed or non-existent shift.
    ///
    /// ## When This Occurs
    /// - `add_cash` / `withdraw` after `close_shift`
    /// - A refund arrives while no shift is open for the store
    /// - Auto-open is disabled and a cash sale arrives before `open_shift`
    #[error("Shift is closed for register {register_id}")]
    ShiftClosed { register_id: String },

    /// An open shift already exists for the store and business date.
    #[error("A shift is already open for store {store_id} on {business_date}")]
    AlreadyOpen {
        store_id: String,
        business_date: String,
    },

    /// `close_shift` called on a register that is not open.
    #[error("Register {register_id} is already closed")]
    AlreadyClosed { register_id: String },

    /// Withdrawal larger than the drawer balance.
    ///
    /// ## User Workflow
    /// ```text
    /// withdraw(15000) with balance 9000
    ///      │
    ///      ▼
    /// InsufficientFunds { requested: 150.00, available: 90.00 }
    ///      │
    ///      ▼
    /// Balance untouched, no history row written
    /// ```
    #[error("Insufficient funds: requested {requested}, available {available}")]
    InsufficientFunds { requested: Money, available: Money },

    /// The event was already processed or is being processed elsewhere.
    /// Callers treat this as success.
    #[error("Event {event_id} already processed")]
    DuplicateEvent { event_id: String },

    /// No register with this id.
    #[error("Cash register not found: {0}")]
    RegisterNotFound(String),

    /// No store with this id.
    #[error("Store not found: {0}")]
    StoreNotFound(String),

    /// Input failed validation.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl LedgerError {
    /// Shorthand for `InvalidAmount`.
    pub fn invalid_amount(amount: Money) -> Self {
        LedgerError::InvalidAmount { amount }
    }

    /// Shorthand for `ShiftClosed`.
    pub fn shift_closed(register_id: impl Into<String>) -> Self {
        LedgerError::ShiftClosed {
            register_id: register_id.into(),
        }
    }

    /// Returns true if the caller should report success instead of failure.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, LedgerError::DuplicateEvent { .. })
    }
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Value must be greater than zero.
    #[error("{field} must be positive")]
    MustBePositive { field: String },

    /// Value must be zero or greater.
    #[error("{field} must not be negative")]
    MustNotBeNegative { field: String },

    /// Invalid format (bad date, unknown enum value).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },

    /// Hybrid payment parts do not add up to the sale total.
    #[error("Payment split {split} does not match total {total}")]
    SplitMismatch { split: Money, total: Money },
}

impl ValidationError {
    pub fn required(field: impl Into<String>) -> Self {
        ValidationError::Required {
            field: field.into(),
        }
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with LedgerError.
pub type CoreResult<T> = Result<T, LedgerError>;
