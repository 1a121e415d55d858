//! # till-core: Pure Ledger Logic
//!
//! Everything in this crate is deterministic and free of I/O. The database
//! layer (`till-db`) and the services (`till-ledger`) call into it for every
//! rule that decides whether a cash movement is allowed and what a daily
//! summary looks like.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Till Data Flow                                 │
//! │                                                                         │
//! │  Sale event ──► till-ledger (guard, reconciler, shift manager)         │
//! │                      │                                                  │
//! │                      ▼                                                  │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │               ★ till-core (THIS CRATE) ★                        │   │
//! │  │                                                                 │   │
//! │  │   ┌──────────┐  ┌──────────┐  ┌──────────┐  ┌──────────────┐   │   │
//! │  │   │  money   │  │  types   │  │  ledger  │  │   summary    │   │   │
//! │  │   │ Money    │  │ Register │  │ movement │  │ margin, mix, │   │   │
//! │  │   │ Quantity │  │ History  │  │ chain    │  │ retention,   │   │   │
//! │  │   │ Percent  │  │ Summary  │  │ check    │  │ anomalies    │   │   │
//! │  │   └──────────┘  └──────────┘  └──────────┘  └──────────────┘   │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                      │                                                  │
//! │                      ▼                                                  │
//! │  till-db (SQLite: cash_registers, cash_history, financial_summaries)   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`money`] - `Money`, `Quantity` and `Percentage` integer types
//! - [`types`] - Entities and the sale event contract
//! - [`ledger`] - Cash movement rules and audit-chain verification
//! - [`summary`] - Daily financial summary computation
//! - [`validation`] - Input validation (amounts, hybrid splits, events)
//! - [`error`] - Domain errors
//!
//! ## Example
//!
//! ```rust
//! use till_core::money::Money;
//! use till_core::ledger::plan_withdraw;
//!
//! let movement = plan_withdraw(Money::from_minor(120_000), Money::from_minor(30_000)).unwrap();
//! assert_eq!(movement.balance_after.minor(), 90_000);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod ledger;
pub mod money;
pub mod summary;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{CoreResult, LedgerError, ValidationError};
pub use money::{Money, Percentage, Quantity};
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// How long an in-flight event lock lives before another worker may retry it.
pub const DEFAULT_LOCK_TTL_SECS: u64 = 60;

/// How long a processed-event marker is remembered.
pub const DEFAULT_PROCESSED_TTL_SECS: u64 = 86_400;

/// Allowed difference between a hybrid split and the sale total (0.01).
pub const HYBRID_SPLIT_TOLERANCE_MINOR: i64 = 1;

/// Number of history rows returned when the caller does not ask for a limit.
pub const DEFAULT_HISTORY_LIMIT: u32 = 50;
