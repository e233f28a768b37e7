//! Coupon Aggregate

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use crate::domain::value_objects::{CouponCode, Money, Percent};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CouponKind {
    Flat { amount: Money },
    Percent { percent: Percent, max_discount: Option<Money> },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Coupon {
    pub id: Uuid,
    pub code: CouponCode,
    pub kind: CouponKind,
    pub min_order_value: Money,
    pub expires_at: DateTime<Utc>,
    pub usage_limit: u32,
    pub used_count: u32,
    pub active: bool,
}

/// The single coupon a user has staged for the next checkout.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserActiveCoupon { pub user_id: Uuid, pub coupon_id: Uuid, pub applied_at: DateTime<Utc> }

impl UserActiveCoupon {
    pub fn new(user_id: Uuid, coupon_id: Uuid) -> Self { Self { user_id, coupon_id, applied_at: Utc::now() } }
}

impl Coupon {
    pub fn new(code: CouponCode, kind: CouponKind, min_order_value: Money, expires_at: DateTime<Utc>, usage_limit: u32) -> Self {
        Self { id: Uuid::new_v4(), code, kind, min_order_value, expires_at, usage_limit, used_count: 0, active: true }
    }

    pub fn is_exhausted(&self) -> bool { self.used_count >= self.usage_limit }

    /// Checks are ordered: inactive, expired, exhausted, below minimum.
    pub fn check_eligibility(&self, subtotal: Money, at: DateTime<Utc>) -> Result<(), CouponError> {
        if !self.active { return Err(CouponError::Inactive); }
        if at > self.expires_at { return Err(CouponError::Expired); }
        if self.is_exhausted() { return Err(CouponError::UsageLimitReached); }
        if subtotal < self.min_order_value {
            return Err(CouponError::BelowMinimumOrder { minimum: self.min_order_value, subtotal });
        }
        Ok(())
    }

    /// Discount against the undiscounted subtotal, rounded to cents and never
    /// more than the subtotal itself.
    pub fn discount_for(&self, subtotal: Money) -> Money {
        let raw = match &self.kind {
            CouponKind::Flat { amount } => *amount,
            CouponKind::Percent { percent, max_discount } => {
                let d = subtotal.percent_of(*percent);
                match max_discount { Some(cap) => d.min(*cap), None => d }
            }
        };
        raw.round2().min(subtotal).floor_zero()
    }

    pub fn redeem(&mut self) -> Result<(), CouponError> {
        if self.is_exhausted() { return Err(CouponError::UsageLimitReached); }
        self.used_count += 1;
        Ok(())
    }

    pub fn release(&mut self) { self.used_count = self.used_count.saturating_sub(1); }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CouponError { Inactive, Expired, UsageLimitReached, BelowMinimumOrder { minimum: Money, subtotal: Money }, AlreadyActive }
impl std::error::Error for CouponError {}
impl std::fmt::Display for CouponError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inactive => write!(f, "Coupon is not active"),
            Self::Expired => write!(f, "Coupon has expired"),
            Self::UsageLimitReached => write!(f, "Coupon usage limit reached"),
            Self::BelowMinimumOrder { minimum, subtotal } => write!(f, "Order subtotal {subtotal} is below the coupon minimum of {minimum}"),
            Self::AlreadyActive => write!(f, "A coupon is already applied; remove it first"),
        }
    }
}
