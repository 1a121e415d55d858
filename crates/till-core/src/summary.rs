//! # Daily Summary Computation
//!
//! Turns one day of completed sales into the figures stored on a
//! [`FinancialSummary`]. The function is a full recomputation: the same
//! inputs always produce the same figures, so running it twice is harmless.
//!
//! ## Pipeline
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  completed sales ──► count, grand total, cash/transfer/card/debt       │
//! │        │                                                                │
//! │        ├──► customers ──► unique, returning ──► retention %            │
//! │        ├──► cashiers  ──► top cashier by summed totals                 │
//! │        └──► line items + batch costs ──► revenue, margin, margin %     │
//! │                                                                         │
//! │  exchange rate ──► USD equivalents                                     │
//! │                                                                         │
//! │  DailyFigures::apply_to(summary) overwrites computed fields only;      │
//! │  shift-close fields (cash_opened, cash_closed, ...) are kept.          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::money::{div_round, Money, Percentage};
use crate::types::{FinancialSummary, ProductBatch, SaleItemRecord, SaleRecord};

// =============================================================================
// Cost Basis
// =============================================================================

/// Which purchase price wins when both are available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostBasisPolicy {
    /// Most recent batch with a price, else the weighted average.
    #[default]
    LatestBatch,
    /// Quantity-weighted average over batches in stock, else the latest price.
    WeightedAverage,
}

impl std::fmt::Display for CostBasisPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CostBasisPolicy::LatestBatch => write!(f, "latest_batch"),
            CostBasisPolicy::WeightedAverage => write!(f, "weighted_average"),
        }
    }
}

impl std::str::FromStr for CostBasisPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "latest_batch" | "latest" => Ok(CostBasisPolicy::LatestBatch),
            "weighted_average" | "weighted" => Ok(CostBasisPolicy::WeightedAverage),
            other => Err(format!(
                "Unknown cost basis policy: '{}'. Valid options: latest_batch, weighted_average",
                other
            )),
        }
    }
}

fn latest_price(batches: &[ProductBatch]) -> Option<Money> {
    batches
        .iter()
        .filter(|b| b.purchase_price_minor.is_some())
        .max_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)))
        .and_then(ProductBatch::purchase_price)
}

fn weighted_average_price(batches: &[ProductBatch]) -> Option<Money> {
    let mut cost: i128 = 0;
    let mut quantity: i128 = 0;
    for batch in batches {
        if let (Some(price), true) = (batch.purchase_price_minor, batch.quantity().is_positive()) {
            cost += price as i128 * batch.quantity_milli as i128;
            quantity += batch.quantity_milli as i128;
        }
    }
    if quantity == 0 {
        return None;
    }
    Some(Money::from_minor(div_round(cost, quantity) as i64))
}

/// Unit purchase price of a product under `policy`, if any batch carries one.
pub fn unit_cost(batches: &[ProductBatch], policy: CostBasisPolicy) -> Option<Money> {
    match policy {
        CostBasisPolicy::LatestBatch => latest_price(batches).or_else(|| weighted_average_price(batches)),
        CostBasisPolicy::WeightedAverage => {
            weighted_average_price(batches).or_else(|| latest_price(batches))
        }
    }
}

// =============================================================================
// Figures
// =============================================================================

/// Everything a recompute needs, already loaded.
#[derive(Debug, Clone, Copy)]
pub struct SummaryInputs<'a> {
    /// Completed sales of the day.
    pub sales: &'a [SaleRecord],
    pub items: &'a [SaleItemRecord],

    /// Batches keyed by product id.
    pub batches: &'a HashMap<String, Vec<ProductBatch>>,

    /// Customers with a completed purchase in this store before the day.
    pub returning_customers: &'a HashSet<String>,
    pub usd_rate: Option<Money>,
    pub cost_basis: CostBasisPolicy,
}

/// Computed fields of a daily summary.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DailyFigures {
    pub total_transactions: i64,
    pub grand_total: Money,
    pub cash_total: Money,
    pub transfer_total: Money,
    pub card_total: Money,
    pub debt_total: Money,
    pub avg_transaction: Money,

    pub unique_customers: i64,
    pub repeat_customers: i64,
    pub retention: Percentage,

    pub top_cashier_id: Option<String>,
    pub top_cashier_sales: Money,

    pub total_revenue: Money,
    pub total_margin: Money,
    pub margin: Percentage,

    pub usd_rate: Option<Money>,
    pub grand_total_usd_cents: i64,
    pub total_margin_usd_cents: i64,

    /// Products sold with no purchase price on any batch (costed at zero).
    pub products_without_cost: Vec<String>,
}

/// Computes the day's figures.
pub fn compute(inputs: SummaryInputs<'_>) -> DailyFigures {
    let mut figures = DailyFigures {
        total_transactions: inputs.sales.len() as i64,
        ..Default::default()
    };

    let mut customers: BTreeSet<&str> = BTreeSet::new();
    let mut per_cashier: BTreeMap<&str, Money> = BTreeMap::new();

    for sale in inputs.sales {
        figures.grand_total += sale.total();
        figures.cash_total += Money::from_minor(sale.cash_minor);
        figures.transfer_total += Money::from_minor(sale.transfer_minor);
        figures.card_total += Money::from_minor(sale.card_minor);

        if let Some(customer) = sale.customer_id.as_deref() {
            customers.insert(customer);
        }
        if let Some(cashier) = sale.cashier_id.as_deref() {
            *per_cashier.entry(cashier).or_default() += sale.total();
        }
    }

    let paid = figures.cash_total + figures.transfer_total + figures.card_total;
    figures.debt_total = (figures.grand_total - paid).floor_zero();
    figures.avg_transaction = figures.grand_total.div_count(figures.total_transactions);

    // Customers
    figures.unique_customers = customers.len() as i64;
    figures.repeat_customers = customers
        .iter()
        .filter(|c| inputs.returning_customers.contains(**c))
        .count() as i64;
    figures.retention = Percentage::ratio(figures.repeat_customers, figures.unique_customers);

    // Top cashier: ascending id order, strict comparison keeps the smallest id on ties
    for (cashier, total) in &per_cashier {
        if figures.top_cashier_id.is_none() || *total > figures.top_cashier_sales {
            figures.top_cashier_id = Some(cashier.to_string());
            figures.top_cashier_sales = *total;
        }
    }

    // Margin
    let sale_ids: HashSet<&str> = inputs.sales.iter().map(|s| s.id.as_str()).collect();
    let mut costs: HashMap<&str, Option<Money>> = HashMap::new();
    let mut missing: BTreeSet<String> = BTreeSet::new();
    let no_batches: Vec<ProductBatch> = Vec::new();

    for item in inputs.items.iter().filter(|i| sale_ids.contains(i.sale_id.as_str())) {
        let cost = *costs.entry(item.product_id.as_str()).or_insert_with(|| {
            let batches = inputs.batches.get(&item.product_id).unwrap_or(&no_batches);
            unit_cost(batches, inputs.cost_basis)
        });
        let cost = cost.unwrap_or_else(|| {
            missing.insert(item.product_id.clone());
            Money::zero()
        });

        figures.total_revenue += item.revenue();
        figures.total_margin += (item.unit_price() - cost).mul_quantity(item.quantity());
    }

    figures.margin = Percentage::ratio(figures.total_margin.minor(), figures.total_revenue.minor());
    figures.products_without_cost = missing.into_iter().collect();

    // USD
    if let Some(rate) = inputs.usd_rate.filter(|r| r.is_positive()) {
        figures.usd_rate = Some(rate);
        figures.grand_total_usd_cents = figures.grand_total.convert_at(rate);
        figures.total_margin_usd_cents = figures.total_margin.convert_at(rate);
    }

    figures
}

impl DailyFigures {
    /// Overwrites the computed fields of `summary` and re-normalizes it.
    pub fn apply_to(&self, summary: &mut FinancialSummary) {
        summary.total_transactions = self.total_transactions;
        summary.grand_total_minor = self.grand_total.minor();
        summary.cash_total_minor = self.cash_total.minor();
        summary.transfer_total_minor = self.transfer_total.minor();
        summary.card_total_minor = self.card_total.minor();
        summary.debt_total_minor = self.debt_total.minor();
        summary.unique_customers = self.unique_customers;
        summary.repeat_customers = self.repeat_customers;
        summary.customer_retention_bps = self.retention.bps();
        summary.top_cashier_id = self.top_cashier_id.clone();
        summary.top_cashier_sales_minor = self.top_cashier_sales.minor();
        summary.total_revenue_minor = self.total_revenue.minor();
        summary.total_margin_minor = self.total_margin.minor();
        summary.margin_bps = self.margin.bps();
        summary.usd_rate_minor = self.usd_rate.map(|r| r.minor());
        summary.grand_total_usd_cents = self.grand_total_usd_cents;
        summary.total_margin_usd_cents = self.total_margin_usd_cents;
        summary.normalize();
    }
}

// =============================================================================
// Anomalies
// =============================================================================

/// Limits used by [`detect_anomalies`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnomalyThresholds {
    pub low_margin: Percentage,
    pub payment_mismatch: Money,
    pub high_avg_transaction: Money,
}

impl Default for AnomalyThresholds {
    fn default() -> Self {
        AnomalyThresholds {
            low_margin: Percentage::from_bps(500),
            payment_mismatch: Money::from_major(1),
            high_avg_transaction: Money::from_major(500_000),
        }
    }
}

/// Something in a summary that deserves a human look.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SummaryAnomaly {
    ZeroMarginWithRevenue { revenue: Money },
    NegativeMargin { margin: Money },
    LowMargin { margin: Percentage },
    PaymentMismatch { breakdown: Money, grand_total: Money },
    HighAverageTransaction { average: Money, threshold: Money },
    MissingCostBasis { product_ids: Vec<String> },
}

impl std::fmt::Display for SummaryAnomaly {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SummaryAnomaly::ZeroMarginWithRevenue { revenue } => {
                write!(f, "zero margin with revenue {}", revenue)
            }
            SummaryAnomaly::NegativeMargin { margin } => write!(f, "negative margin {}", margin),
            SummaryAnomaly::LowMargin { margin } => write!(f, "low margin {}", margin),
            SummaryAnomaly::PaymentMismatch {
                breakdown,
                grand_total,
            } => write!(
                f,
                "payment breakdown {} does not match grand total {}",
                breakdown, grand_total
            ),
            SummaryAnomaly::HighAverageTransaction { average, threshold } => write!(
                f,
                "average transaction {} above {}",
                average, threshold
            ),
            SummaryAnomaly::MissingCostBasis { product_ids } => {
                write!(f, "no purchase price for products {:?}", product_ids)
            }
        }
    }
}

/// Flags suspicious figures. Never fails.
pub fn detect_anomalies(
    summary: &FinancialSummary,
    figures: &DailyFigures,
    thresholds: &AnomalyThresholds,
) -> Vec<SummaryAnomaly> {
    let mut found = Vec::new();
    let revenue = Money::from_minor(summary.total_revenue_minor);
    let margin = summary.total_margin();

    if revenue.is_positive() {
        if margin.is_zero() {
            found.push(SummaryAnomaly::ZeroMarginWithRevenue { revenue });
        } else if margin.is_negative() {
            found.push(SummaryAnomaly::NegativeMargin { margin });
        } else if summary.margin_percentage() < thresholds.low_margin {
            found.push(SummaryAnomaly::LowMargin {
                margin: summary.margin_percentage(),
            });
        }
    }

    let breakdown = Money::from_minor(
        summary.cash_total_minor
            + summary.transfer_total_minor
            + summary.card_total_minor
            + summary.debt_total_minor,
    );
    if (breakdown - summary.grand_total()).abs() > thresholds.payment_mismatch {
        found.push(SummaryAnomaly::PaymentMismatch {
            breakdown,
            grand_total: summary.grand_total(),
        });
    }

    if summary.avg_transaction() > thresholds.high_avg_transaction {
        found.push(SummaryAnomaly::HighAverageTransaction {
            average: summary.avg_transaction(),
            threshold: thresholds.high_avg_transaction,
        });
    }

    if !figures.products_without_cost.is_empty() {
        found.push(SummaryAnomaly::MissingCostBasis {
            product_ids: figures.products_without_cost.clone(),
        });
    }

    found
}
