//! # Domain Types
//!
//! Entities persisted by the ledger store and the sale event contract
//! consumed from the Sales subsystem.
//!
//! ## Type Map
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌──────────────────────┐  │
//! │  │  CashRegister   │   │  CashHistory    │   │  FinancialSummary    │  │
//! │  │  ─────────────  │1 *│  ─────────────  │   │  ──────────────────  │  │
//! │  │  store_id       │──►│  seq            │   │  (store_id, date)    │  │
//! │  │  business_date  │   │  operation_type │   │  per-method totals   │  │
//! │  │  current_bal.   │   │  amount         │   │  margin, retention   │  │
//! │  │  is_open        │   │  before / after │   │  shift close fields  │  │
//! │  └───────┬─────────┘   └─────────────────┘   └──────────▲───────────┘  │
//! │          └──────────── financial_summary_id ────────────┘              │
//! │                                                                         │
//! │  SaleEvent ──► SaleRecord + SaleItemRecord (projection)                │
//! │  ProductBatch, ExchangeRate (read-only inputs)                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Monetary columns are stored as `*_minor: i64`; accessor methods return
//! [`Money`].

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreResult, LedgerError};
use crate::money::{Money, Percentage, Quantity};

// =============================================================================
// Enums
// =============================================================================

/// Kind of row in the cash audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "SCREAMING_SNAKE_CASE"))]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CashOperation {
    OpenShift,
    AddCash,
    Withdraw,
    CloseShift,
    Correction,
}

impl CashOperation {
    /// The balance change a row of this kind must record for `amount`.
    ///
    /// `CloseShift` stores the counted cash in `amount` but does not move the
    /// balance. `Correction` amounts are already signed.
    pub fn signed_delta(&self, amount: Money) -> Money {
        match self {
            CashOperation::OpenShift | CashOperation::AddCash | CashOperation::Correction => {
                amount
            }
            CashOperation::Withdraw => -amount,
            CashOperation::CloseShift => Money::zero(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CashOperation::OpenShift => "OPEN_SHIFT",
            CashOperation::AddCash => "ADD_CASH",
            CashOperation::Withdraw => "WITHDRAW",
            CashOperation::CloseShift => "CLOSE_SHIFT",
            CashOperation::Correction => "CORRECTION",
        }
    }
}

/// How a sale was paid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    Cash,
    Transfer,
    Card,
    Debt,
    /// Split across cash, transfer and card.
    Hybrid,
}

/// Sale status as seen by the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[serde(rename_all = "lowercase")]
pub enum SaleStatus {
    Completed,
    Pending,
    Refunded,
    Failed,
}

/// What happened to the sale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaleEventKind {
    #[default]
    Completed,
    Refunded,
}

impl SaleEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SaleEventKind::Completed => "completed",
            SaleEventKind::Refunded => "refunded",
        }
    }
}

/// Lifecycle state of a register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftState {
    Open,
    Closed,
}

// =============================================================================
// Store
// =============================================================================

/// Tenant boundary. Every other row belongs to exactly one store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct Store {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Cash Register
// =============================================================================

/// One shift of one store's cash drawer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct CashRegister {
    pub id: String,
    pub store_id: String,

    /// Calendar day of the shift in the business timezone.
    pub business_date: NaiveDate,
    pub date_opened: DateTime<Utc>,

    pub current_balance_minor: i64,

    /// Expected balance at close. Also the opening float.
    pub target_balance_minor: i64,
    pub is_open: bool,

    pub closed_balance_minor: Option<i64>,
    pub closed_at: Option<DateTime<Utc>>,

    /// `closed_balance - target_balance`, set at close.
    pub discrepancy_minor: Option<i64>,

    pub financial_summary_id: Option<String>,
    pub opened_by: Option<String>,
    pub closed_by: Option<String>,
    pub last_updated: DateTime<Utc>,
}

impl CashRegister {
    pub fn current_balance(&self) -> Money {
        Money::from_minor(self.current_balance_minor)
    }

    pub fn target_balance(&self) -> Money {
        Money::from_minor(self.target_balance_minor)
    }

    pub fn discrepancy(&self) -> Option<Money> {
        self.discrepancy_minor.map(Money::from_minor)
    }

    pub fn state(&self) -> ShiftState {
        if self.is_open {
            ShiftState::Open
        } else {
            ShiftState::Closed
        }
    }

    /// Errors with `ShiftClosed` unless the register accepts mutations.
    pub fn ensure_open(&self) -> CoreResult<()> {
        match self.state() {
            ShiftState::Open => Ok(()),
            ShiftState::Closed => Err(LedgerError::shift_closed(&self.id)),
        }
    }
}

// =============================================================================
// Cash History
// =============================================================================

/// One immutable row of a register's audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct CashHistory {
    pub id: String,
    pub cash_register_id: String,
    pub store_id: String,

    /// Position in the register's trail, starting at 1.
    pub seq: i64,
    pub operation_type: CashOperation,
    pub amount_minor: i64,
    pub actor_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub notes: String,

    /// Machine-readable link to the event that caused the row.
    pub reference: Option<String>,
    pub balance_before_minor: i64,
    pub balance_after_minor: i64,
}

impl CashHistory {
    pub fn amount(&self) -> Money {
        Money::from_minor(self.amount_minor)
    }

    pub fn balance_before(&self) -> Money {
        Money::from_minor(self.balance_before_minor)
    }

    pub fn balance_after(&self) -> Money {
        Money::from_minor(self.balance_after_minor)
    }
}

// =============================================================================
// Financial Summary
// =============================================================================

/// Per-store, per-day rollup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct FinancialSummary {
    pub id: String,
    pub store_id: String,
    pub date: NaiveDate,

    // Payment mix
    pub cash_total_minor: i64,
    pub transfer_total_minor: i64,
    pub card_total_minor: i64,
    pub debt_total_minor: i64,

    pub total_transactions: i64,
    pub grand_total_minor: i64,
    pub avg_transaction_minor: i64,

    // Customers
    pub unique_customers: i64,
    pub repeat_customers: i64,
    pub customer_retention_bps: i64,

    // Margin
    pub total_revenue_minor: i64,
    pub total_margin_minor: i64,
    pub margin_bps: i64,

    pub top_cashier_id: Option<String>,
    pub top_cashier_sales_minor: i64,

    pub cash_share_bps: i64,
    pub card_share_bps: i64,

    // USD equivalents
    pub usd_rate_minor: Option<i64>,
    pub grand_total_usd_cents: i64,
    pub total_margin_usd_cents: i64,

    // Shift close
    pub cash_opened_minor: Option<i64>,
    pub cash_closed_minor: Option<i64>,
    pub discrepancy_minor: Option<i64>,
    pub closed_by: Option<String>,
    pub notes: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FinancialSummary {
    /// A summary with every figure at zero.
    pub fn empty(id: String, store_id: &str, date: NaiveDate, now: DateTime<Utc>) -> Self {
        FinancialSummary {
            id,
            store_id: store_id.to_string(),
            date,
            cash_total_minor: 0,
            transfer_total_minor: 0,
            card_total_minor: 0,
            debt_total_minor: 0,
            total_transactions: 0,
            grand_total_minor: 0,
            avg_transaction_minor: 0,
            unique_customers: 0,
            repeat_customers: 0,
            customer_retention_bps: 0,
            total_revenue_minor: 0,
            total_margin_minor: 0,
            margin_bps: 0,
            top_cashier_id: None,
            top_cashier_sales_minor: 0,
            cash_share_bps: 0,
            card_share_bps: 0,
            usd_rate_minor: None,
            grand_total_usd_cents: 0,
            total_margin_usd_cents: 0,
            cash_opened_minor: None,
            cash_closed_minor: None,
            discrepancy_minor: None,
            closed_by: None,
            notes: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Re-derives the average ticket and payment shares from the totals.
    /// Called before every write.
    pub fn normalize(&mut self) {
        let grand_total = self.grand_total();
        self.avg_transaction_minor = if self.total_transactions > 0 {
            grand_total.div_count(self.total_transactions).minor()
        } else {
            0
        };
        self.cash_share_bps = Percentage::ratio(self.cash_total_minor, self.grand_total_minor).bps();
        self.card_share_bps = Percentage::ratio(self.card_total_minor, self.grand_total_minor).bps();
    }

    pub fn grand_total(&self) -> Money {
        Money::from_minor(self.grand_total_minor)
    }

    pub fn cash_total(&self) -> Money {
        Money::from_minor(self.cash_total_minor)
    }

    pub fn avg_transaction(&self) -> Money {
        Money::from_minor(self.avg_transaction_minor)
    }

    pub fn total_margin(&self) -> Money {
        Money::from_minor(self.total_margin_minor)
    }

    pub fn margin_percentage(&self) -> Percentage {
        Percentage::from_bps(self.margin_bps)
    }
}

// =============================================================================
// Sale Event (input contract)
// =============================================================================

/// One sold line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaleLineItem {
    pub product_id: String,
    pub quantity: Quantity,
    pub unit_price: Money,
}

impl SaleLineItem {
    pub fn revenue(&self) -> Money {
        self.unit_price.mul_quantity(self.quantity)
    }
}

/// "Transaction completed" / "transaction refunded" event emitted by the
/// Sales subsystem after it commits.
///
/// ## JSON
/// ```json
/// {
///   "kind": "completed",
///   "sale_id": "1042",
///   "store_id": "store-1",
///   "total_amount": 5000000,
///   "payment_method": "hybrid",
///   "cash_amount": 3000000,
///   "transfer_amount": 2000000,
///   "card_amount": 0,
///   "cashier_id": "u-7",
///   "line_items": [{"product_id": "p-1", "quantity": 2000, "unit_price": 2500000}],
///   "created_at": "2024-03-01T09:15:00Z"
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaleEvent {
    /// Delivery id. Derived from sale id and kind when absent.
    #[serde(default)]
    pub event_id: Option<String>,

    #[serde(default)]
    pub kind: SaleEventKind,

    pub sale_id: String,
    pub store_id: String,
    pub total_amount: Money,
    pub payment_method: PaymentMethod,

    #[serde(default)]
    pub cash_amount: Money,
    #[serde(default)]
    pub transfer_amount: Money,
    #[serde(default)]
    pub card_amount: Money,

    #[serde(default)]
    pub customer_id: Option<String>,
    #[serde(default)]
    pub cashier_id: Option<String>,

    #[serde(default)]
    pub line_items: Vec<SaleLineItem>,

    /// When the sale was made. Decides which day's summary it belongs to.
    pub created_at: DateTime<Utc>,

    /// When this event happened (the refund time for refunds).
    #[serde(default)]
    pub occurred_at: Option<DateTime<Utc>>,
}

impl SaleEvent {
    /// Key used by the idempotency guard.
    pub fn idempotency_key(&self) -> String {
        match &self.event_id {
            Some(id) => id.clone(),
            None => format!("sale:{}:{}", self.sale_id, self.kind.as_str()),
        }
    }

    /// Reference stored on the resulting history row.
    pub fn cash_reference(&self) -> String {
        match self.kind {
            SaleEventKind::Completed => format!("sale:{}", self.sale_id),
            SaleEventKind::Refunded => format!("refund:{}", self.sale_id),
        }
    }

    /// Human-readable note for the history row.
    pub fn cash_note(&self) -> String {
        match self.kind {
            SaleEventKind::Completed => format!("Sale #{}", self.sale_id),
            SaleEventKind::Refunded => format!("Refund of sale #{}", self.sale_id),
        }
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at.unwrap_or(self.created_at)
    }

    /// Payment attribution per method.
    pub fn split(&self) -> PaymentSplit {
        PaymentSplit::attribute(
            self.payment_method,
            self.total_amount,
            self.cash_amount,
            self.transfer_amount,
            self.card_amount,
        )
    }
}

/// Amount attributed to each payment method for one sale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PaymentSplit {
    pub cash: Money,
    pub transfer: Money,
    pub card: Money,
    pub debt: Money,
}

impl PaymentSplit {
    /// Single methods take the whole total and ignore sub-amounts. Hybrid
    /// trusts the sub-amounts as given.
    ///
    /// ```rust
    /// use till_core::{Money, PaymentMethod, PaymentSplit};
    ///
    /// let split = PaymentSplit::attribute(
    ///     PaymentMethod::Hybrid,
    ///     Money::from_minor(50_000),
    ///     Money::from_minor(30_000),
    ///     Money::from_minor(20_000),
    ///     Money::zero(),
    /// );
    /// assert_eq!(split.cash.minor(), 30_000);
    /// ```
    pub fn attribute(
        method: PaymentMethod,
        total: Money,
        cash: Money,
        transfer: Money,
        card: Money,
    ) -> Self {
        let zero = Money::zero();
        match method {
            PaymentMethod::Cash => PaymentSplit { cash: total, ..Default::default() },
            PaymentMethod::Transfer => PaymentSplit { transfer: total, ..Default::default() },
            PaymentMethod::Card => PaymentSplit { card: total, ..Default::default() },
            PaymentMethod::Debt => PaymentSplit { debt: total, ..Default::default() },
            PaymentMethod::Hybrid => PaymentSplit {
                cash,
                transfer,
                card,
                debt: zero,
            },
        }
    }

    /// Cash + transfer + card.
    pub fn paid(&self) -> Money {
        self.cash + self.transfer + self.card
    }
}

// =============================================================================
// Projection Records
// =============================================================================

/// The ledger's own copy of a consumed sale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct SaleRecord {
    pub id: String,
    pub store_id: String,
    pub status: SaleStatus,
    pub payment_method: PaymentMethod,
    pub total_minor: i64,
    pub cash_minor: i64,
    pub transfer_minor: i64,
    pub card_minor: i64,
    pub debt_minor: i64,
    pub customer_id: Option<String>,
    pub cashier_id: Option<String>,
    pub business_date: NaiveDate,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SaleRecord {
    pub fn total(&self) -> Money {
        Money::from_minor(self.total_minor)
    }

    pub fn cash(&self) -> Money {
        Money::from_minor(self.cash_minor)
    }
}

/// A line of a projected sale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct SaleItemRecord {
    pub sale_id: String,
    pub product_id: String,
    pub quantity_milli: i64,
    pub unit_price_minor: i64,
}

impl SaleItemRecord {
    pub fn quantity(&self) -> Quantity {
        Quantity::from_milli(self.quantity_milli)
    }

    pub fn unit_price(&self) -> Money {
        Money::from_minor(self.unit_price_minor)
    }

    pub fn revenue(&self) -> Money {
        self.unit_price().mul_quantity(self.quantity())
    }
}

// =============================================================================
// Inventory & Rates (read-only inputs)
// =============================================================================

/// A purchase batch of a product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct ProductBatch {
    pub id: String,
    pub store_id: String,
    pub product_id: String,
    pub purchase_price_minor: Option<i64>,

    /// Stock left in the batch.
    pub quantity_milli: i64,
    pub created_at: DateTime<Utc>,
}

impl ProductBatch {
    pub fn purchase_price(&self) -> Option<Money> {
        self.purchase_price_minor.map(Money::from_minor)
    }

    pub fn quantity(&self) -> Quantity {
        Quantity::from_milli(self.quantity_milli)
    }
}

/// Local price of one USD on a date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct ExchangeRate {
    pub date: NaiveDate,
    pub usd_rate_minor: i64,
}

impl ExchangeRate {
    pub fn usd_rate(&self) -> Money {
        Money::from_minor(self.usd_rate_minor)
    }
}

// =============================================================================
// Results
// =============================================================================

/// Returned by `close_shift`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShiftCloseReport {
    pub register_id: String,

    /// Balance the ledger expected in the drawer.
    pub expected_balance: Money,
    pub closed_balance: Money,

    /// `closed_balance - target_balance`. Not an error when non-zero.
    pub discrepancy: Money,
    pub summary_id: String,
    pub closed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(method: PaymentMethod) -> SaleEvent {
        SaleEvent {
            event_id: None,
            kind: SaleEventKind::Completed,
            sale_id: "42".into(),
            store_id: "s1".into(),
            total_amount: Money::from_minor(50_000),
            payment_method: method,
            cash_amount: Money::from_minor(30_000),
            transfer_amount: Money::from_minor(20_000),
            card_amount: Money::zero(),
            customer_id: None,
            cashier_id: None,
            line_items: vec![],
            created_at: Utc::now(),
            occurred_at: None,
        }
    }

    #[test]
    fn test_single_method_takes_whole_total() {
        let split = event(PaymentMethod::Card).split();
        assert_eq!(split.card.minor(), 50_000);
        assert!(split.cash.is_zero());
        assert!(split.transfer.is_zero());

        let split = event(PaymentMethod::Debt).split();
        assert_eq!(split.debt.minor(), 50_000);
        assert!(split.paid().is_zero());
    }

    #[test]
    fn test_hybrid_uses_sub_amounts() {
        let split = event(PaymentMethod::Hybrid).split();
        assert_eq!(split.cash.minor(), 30_000);
        assert_eq!(split.transfer.minor(), 20_000);
        assert_eq!(split.paid().minor(), 50_000);
    }

    #[test]
    fn test_idempotency_key_and_reference() {
        let mut e = event(PaymentMethod::Cash);
        assert_eq!(e.idempotency_key(), "sale:42:completed");
        assert_eq!(e.cash_reference(), "sale:42");
        assert_eq!(e.cash_note(), "Sale #42");

        e.kind = SaleEventKind::Refunded;
        assert_eq!(e.idempotency_key(), "sale:42:refunded");
        assert_eq!(e.cash_reference(), "refund:42");

        e.event_id = Some("delivery-9".into());
        assert_eq!(e.idempotency_key(), "delivery-9");
    }

    #[test]
    fn test_event_deserializes_with_defaults() {
        let json = r#"{
            "sale_id": "7",
            "store_id": "s1",
            "total_amount": 15000,
            "payment_method": "cash",
            "created_at": "2024-03-01T09:15:00Z"
        }"#;
        let e: SaleEvent = serde_json::from_str(json).unwrap();
        assert_eq!(e.kind, SaleEventKind::Completed);
        assert_eq!(e.split().cash.minor(), 15_000);
        assert!(e.line_items.is_empty());
        assert_eq!(e.occurred_at(), e.created_at);
    }

    #[test]
    fn test_signed_delta() {
        let amount = Money::from_minor(500);
        assert_eq!(CashOperation::AddCash.signed_delta(amount).minor(), 500);
        assert_eq!(CashOperation::Withdraw.signed_delta(amount).minor(), -500);
        assert_eq!(CashOperation::CloseShift.signed_delta(amount).minor(), 0);
        assert_eq!(
            CashOperation::Correction.signed_delta(Money::from_minor(-200)).minor(),
            -200
        );
    }

    #[test]
    fn test_summary_normalize() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let mut s = FinancialSummary::empty("f1".into(), "s1", date, Utc::now());
        s.grand_total_minor = 100_000;
        s.cash_total_minor = 25_000;
        s.card_total_minor = 75_000;
        s.total_transactions = 3;
        s.normalize();
        assert_eq!(s.avg_transaction_minor, 33_333);
        assert_eq!(s.cash_share_bps, 2_500);
        assert_eq!(s.card_share_bps, 7_500);

        s.total_transactions = 0;
        s.normalize();
        assert_eq!(s.avg_transaction_minor, 0);
    }
}
