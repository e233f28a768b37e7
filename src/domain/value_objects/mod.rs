//! Value Objects for the fulfillment core

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Sub, SubAssign};

/// Coupon code value object. Codes compare case-insensitively, so they are
/// normalised to upper case on construction.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CouponCode(String);

impl CouponCode {
    pub fn new(value: impl Into<String>) -> Result<Self, CouponCodeError> {
        let value = value.into().trim().to_uppercase();
        if value.is_empty() { return Err(CouponCodeError::Empty); }
        if value.len() > 32 { return Err(CouponCodeError::TooLong); }
        if !value.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return Err(CouponCodeError::InvalidCharacter);
        }
        Ok(Self(value))
    }
    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for CouponCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}

impl TryFrom<String> for CouponCode {
    type Error = CouponCodeError;
    fn try_from(value: String) -> Result<Self, Self::Error> { Self::new(value) }
}

impl From<CouponCode> for String {
    fn from(code: CouponCode) -> Self { code.0 }
}

#[derive(Debug, Clone, PartialEq, Eq)] pub enum CouponCodeError { Empty, TooLong, InvalidCharacter }
impl std::error::Error for CouponCodeError {}
impl fmt::Display for CouponCodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "coupon code is empty"),
            Self::TooLong => write!(f, "coupon code is longer than 32 characters"),
            Self::InvalidCharacter => write!(f, "coupon code may only contain letters, digits, '-' and '_'"),
        }
    }
}

/// Monetary amount in the store currency.
///
/// Arithmetic keeps full decimal precision; `round2` is applied where a value is
/// presented or settled (totals, refunds, ledger postings).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(Decimal);

impl Money {
    pub const ZERO: Money = Money(Decimal::ZERO);

    pub fn new(amount: Decimal) -> Self { Self(amount) }
    pub fn amount(&self) -> Decimal { self.0 }
    pub fn is_zero(&self) -> bool { self.0.is_zero() }
    pub fn is_negative(&self) -> bool { self.0.is_sign_negative() && !self.0.is_zero() }
    pub fn is_positive(&self) -> bool { self.0.is_sign_positive() && !self.0.is_zero() }

    /// Rounds to two decimal places, half away from zero.
    pub fn round2(&self) -> Money {
        Money(self.0.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero))
    }

    pub fn times(&self, qty: u32) -> Money { Money(self.0 * Decimal::from(qty)) }

    /// `self × percent / 100`, unrounded.
    pub fn percent_of(&self, percent: Percent) -> Money { Money(self.0 * percent.value() / Decimal::ONE_HUNDRED) }

    /// Never below zero.
    pub fn floor_zero(&self) -> Money { if self.is_negative() { Money::ZERO } else { *self } }

    pub fn min(self, other: Money) -> Money { if self <= other { self } else { other } }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{:.2}", self.0) }
}

impl From<Decimal> for Money { fn from(d: Decimal) -> Self { Money(d) } }

impl Add for Money { type Output = Money; fn add(self, rhs: Money) -> Money { Money(self.0 + rhs.0) } }
impl Sub for Money { type Output = Money; fn sub(self, rhs: Money) -> Money { Money(self.0 - rhs.0) } }
impl AddAssign for Money { fn add_assign(&mut self, rhs: Money) { self.0 += rhs.0; } }
impl SubAssign for Money { fn sub_assign(&mut self, rhs: Money) { self.0 -= rhs.0; } }
impl Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Money { iter.fold(Money::ZERO, |acc, m| acc + m) }
}
impl<'a> Sum<&'a Money> for Money {
    fn sum<I: Iterator<Item = &'a Money>>(iter: I) -> Money { iter.fold(Money::ZERO, |acc, m| acc + *m) }
}

/// A non-negative percentage. Sums of percentages are unbounded; use `clamped`
/// before applying one to a price.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Percent(Decimal);

impl Percent {
    pub const ZERO: Percent = Percent(Decimal::ZERO);
    pub const HUNDRED: Percent = Percent(Decimal::ONE_HUNDRED);

    pub fn new(value: Decimal) -> Result<Self, PercentError> {
        if value.is_sign_negative() && !value.is_zero() { return Err(PercentError::Negative); }
        Ok(Self(value))
    }
    pub fn value(&self) -> Decimal { self.0 }
    pub fn is_zero(&self) -> bool { self.0.is_zero() }
    pub fn clamped(&self) -> Percent { if self.0 > Decimal::ONE_HUNDRED { Percent::HUNDRED } else { *self } }
}

impl Add for Percent { type Output = Percent; fn add(self, rhs: Percent) -> Percent { Percent(self.0 + rhs.0) } }

impl fmt::Display for Percent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}%", self.0.normalize()) }
}

impl TryFrom<Decimal> for Percent {
    type Error = PercentError;
    fn try_from(value: Decimal) -> Result<Self, Self::Error> { Self::new(value) }
}

impl From<Percent> for Decimal { fn from(p: Percent) -> Self { p.0 } }

#[derive(Debug, Clone, PartialEq, Eq)] pub enum PercentError { Negative }
impl std::error::Error for PercentError {}
impl fmt::Display for PercentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "percentage must not be negative") }
}
