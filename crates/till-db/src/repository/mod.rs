//! # Repository Module
//!
//! One repository per table group. Each holds a clone of the pool and is
//! obtained from [`crate::Database`] accessors.
//!
//! ## Repository Map
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  db.registers()      open / apply_movement / correct / close            │
//! │  db.history()        newest-first listing, full chain, by reference     │
//! │  db.summaries()      get, upsert recomputed figures, list range         │
//! │  db.sales()          sale-event projection, day scans, customers        │
//! │  db.batches()        purchase prices for margin                         │
//! │  db.exchange_rates() USD rate on or before a date                       │
//! │  db.idempotency()    durable locks and processed markers                │
//! │  db.stores()         tenants                                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Repositories that change more than one row do so in a single
//! transaction whose first statement is a write.

pub mod exchange_rate;
pub mod history;
pub mod idempotency;
pub mod inventory;
pub mod register;
pub mod sale;
pub mod store;
pub mod summary;
