//! # Money Module
//!
//! Integer value types for everything the ledger counts.
//!
//! ## Representation
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  TYPE          UNIT                    EXAMPLE                          │
//! │  ───────────   ─────────────────────   ──────────────────────────────   │
//! │  Money         minor currency unit     Money(150_000)   = 1500.00       │
//! │  Quantity      thousandths of a unit   Quantity(2_500)  = 2.500 pcs/kg  │
//! │  Percentage    basis points            Percentage(1250) = 12.50%        │
//! │                                                                         │
//! │  All division rounds half away from zero through i128.                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use till_core::money::{Money, Quantity};
//!
//! let price = Money::from_minor(1_999);          // 19.99
//! let line = price.mul_quantity(Quantity::from_milli(1_500)); // 1.5 units
//! assert_eq!(line.minor(), 2_999);               // 29.985 → 29.99
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Mul, Neg, Sub, SubAssign};

/// Minor units per major unit (two decimal places).
pub const MINOR_PER_MAJOR: i64 = 100;

/// Thousandths per whole quantity unit.
pub const MILLI_PER_UNIT: i64 = 1_000;

/// Basis points in 100%.
pub const BPS_PER_WHOLE: i64 = 10_000;

/// Divides `numerator` by `denominator`, rounding half away from zero.
///
/// Returns 0 when the denominator is 0 so callers can feed raw aggregates in.
pub(crate) fn div_round(numerator: i128, denominator: i128) -> i128 {
    if denominator == 0 {
        return 0;
    }
    let quotient = numerator / denominator;
    let remainder = numerator % denominator;
    if remainder.abs() * 2 >= denominator.abs() {
        if (numerator < 0) != (denominator < 0) {
            quotient - 1
        } else {
            quotient + 1
        }
    } else {
        quotient
    }
}

// =============================================================================
// Money
// =============================================================================

/// A monetary value in the smallest currency unit.
///
/// Signed so that corrections and discrepancies can be negative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    /// Creates a value from minor units.
    ///
    /// ```rust
    /// use till_core::money::Money;
    ///
    /// assert_eq!(Money::from_minor(1099).to_string(), "10.99");
    /// ```
    #[inline]
    pub const fn from_minor(minor: i64) -> Self {
        Money(minor)
    }

    /// Creates a value from whole major units.
    #[inline]
    pub const fn from_major(major: i64) -> Self {
        Money(major * MINOR_PER_MAJOR)
    }

    /// Returns the raw minor-unit value.
    #[inline]
    pub const fn minor(&self) -> i64 {
        self.0
    }

    /// Whole major units, truncated toward zero.
    #[inline]
    pub const fn major(&self) -> i64 {
        self.0 / MINOR_PER_MAJOR
    }

    /// The minor portion (always 0-99).
    #[inline]
    pub const fn minor_part(&self) -> i64 {
        (self.0 % MINOR_PER_MAJOR).abs()
    }

    #[inline]
    pub const fn zero() -> Self {
        Money(0)
    }

    #[inline]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn is_positive(&self) -> bool {
        self.0 > 0
    }

    #[inline]
    pub const fn is_negative(&self) -> bool {
        self.0 < 0
    }

    #[inline]
    pub const fn abs(&self) -> Self {
        Money(self.0.abs())
    }

    /// Clamps negative values to zero.
    #[inline]
    pub fn floor_zero(self) -> Self {
        self.max(Money::zero())
    }

    /// Price × quantity, where quantity carries three decimals.
    ///
    /// ```rust
    /// use till_core::money::{Money, Quantity};
    ///
    /// let unit = Money::from_minor(1_000);
    /// assert_eq!(unit.mul_quantity(Quantity::from_units(3)).minor(), 3_000);
    /// assert_eq!(unit.mul_quantity(Quantity::from_milli(333)).minor(), 333);
    /// ```
    pub fn mul_quantity(&self, qty: Quantity) -> Money {
        let scaled = self.0 as i128 * qty.milli() as i128;
        Money(div_round(scaled, MILLI_PER_UNIT as i128) as i64)
    }

    /// Divides by a count, rounding half away from zero. Zero count yields zero.
    pub fn div_count(&self, count: i64) -> Money {
        Money(div_round(self.0 as i128, count as i128) as i64)
    }

    /// Converts this amount into foreign-currency cents at `rate`, where
    /// `rate` is the local price of one foreign unit.
    ///
    /// ```rust
    /// use till_core::money::Money;
    ///
    /// // 1 USD = 12 500.00 local
    /// let rate = Money::from_minor(1_250_000);
    /// let total = Money::from_minor(25_000_000); // 250 000.00 local
    /// assert_eq!(total.convert_at(rate), 2_000); // 20.00 USD
    /// ```
    pub fn convert_at(&self, rate: Money) -> i64 {
        if rate.0 <= 0 {
            return 0;
        }
        div_round(self.0 as i128 * MINOR_PER_MAJOR as i128, rate.0 as i128) as i64
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        write!(f, "{}{}.{:02}", sign, self.major().abs(), self.minor_part())
    }
}

impl Default for Money {
    fn default() -> Self {
        Money::zero()
    }
}

impl Add for Money {
    type Output = Self;

    #[inline]
    fn add(self, other: Self) -> Self {
        Money(self.0 + other.0)
    }
}

impl AddAssign for Money {
    #[inline]
    fn add_assign(&mut self, other: Self) {
        self.0 += other.0;
    }
}

impl Sub for Money {
    type Output = Self;

    #[inline]
    fn sub(self, other: Self) -> Self {
        Money(self.0 - other.0)
    }
}

impl SubAssign for Money {
    #[inline]
    fn sub_assign(&mut self, other: Self) {
        self.0 -= other.0;
    }
}

impl Neg for Money {
    type Output = Self;

    #[inline]
    fn neg(self) -> Self {
        Money(-self.0)
    }
}

impl Mul<i64> for Money {
    type Output = Self;

    #[inline]
    fn mul(self, factor: i64) -> Self {
        Money(self.0 * factor)
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Self {
        iter.fold(Money::zero(), |acc, m| acc + m)
    }
}

impl<'a> Sum<&'a Money> for Money {
    fn sum<I: Iterator<Item = &'a Money>>(iter: I) -> Self {
        iter.fold(Money::zero(), |acc, m| acc + *m)
    }
}

// =============================================================================
// Quantity
// =============================================================================

/// A quantity with three decimal places (pieces, kilograms, metres).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Quantity(i64);

impl Quantity {
    #[inline]
    pub const fn from_milli(milli: i64) -> Self {
        Quantity(milli)
    }

    #[inline]
    pub const fn from_units(units: i64) -> Self {
        Quantity(units * MILLI_PER_UNIT)
    }

    #[inline]
    pub const fn milli(&self) -> i64 {
        self.0
    }

    #[inline]
    pub const fn is_positive(&self) -> bool {
        self.0 > 0
    }
}

impl Add for Quantity {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Quantity(self.0 + other.0)
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.abs();
        write!(f, "{}{}.{:03}", sign, abs / MILLI_PER_UNIT, abs % MILLI_PER_UNIT)
    }
}

// =============================================================================
// Percentage
// =============================================================================

/// A percentage in basis points (1 bps = 0.01%).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Percentage(i64);

impl Percentage {
    #[inline]
    pub const fn from_bps(bps: i64) -> Self {
        Percentage(bps)
    }

    #[inline]
    pub const fn bps(&self) -> i64 {
        self.0
    }

    #[inline]
    pub const fn zero() -> Self {
        Percentage(0)
    }

    /// `part / whole × 100%`, rounded to the nearest basis point.
    /// A zero `whole` yields 0%.
    ///
    /// ```rust
    /// use till_core::money::Percentage;
    ///
    /// assert_eq!(Percentage::ratio(1, 3).bps(), 3_333);
    /// assert_eq!(Percentage::ratio(5, 0).bps(), 0);
    /// ```
    pub fn ratio(part: i64, whole: i64) -> Self {
        Percentage(div_round(part as i128 * BPS_PER_WHOLE as i128, whole as i128) as i64)
    }
}

impl fmt::Display for Percentage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.abs();
        write!(f, "{}{}.{:02}%", sign, abs / 100, abs % 100)
    }
}
