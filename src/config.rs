//! Environment configuration.
//!
//! `main` loads `.env` with dotenvy and then reads the process environment;
//! policy switches have defaults so tests can build [`Policies`] directly.

use chrono::Duration;
use rust_decimal::Decimal;
use std::str::FromStr;

use crate::domain::aggregates::Charges;
use crate::domain::pricing::OfferStacking;
use crate::domain::value_objects::{Money, Percent};
use crate::{CommerceError, Result};

/// What whole-order cancellation does to a redeemed coupon's usage count.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CouponOnCancel {
    /// Usage stays consumed.
    #[default]
    Keep,
    /// Usage is released so the coupon has headroom again.
    Restore,
}

impl FromStr for CouponOnCancel {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "keep" => Ok(Self::Keep),
            "restore" => Ok(Self::Restore),
            other => Err(format!("unknown coupon cancellation policy '{other}'")),
        }
    }
}

/// Placement behaviour when cart lines point at books that no longer resolve.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MissingBookPolicy {
    #[default]
    Skip,
    Reject,
}

impl FromStr for MissingBookPolicy {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "skip" => Ok(Self::Skip),
            "reject" => Ok(Self::Reject),
            other => Err(format!("unknown missing book policy '{other}'")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Policies {
    pub offer_stacking: OfferStacking,
    pub coupon_on_cancel: CouponOnCancel,
    pub missing_books: MissingBookPolicy,
    pub return_window: Duration,
    pub charges: Charges,
}

impl Default for Policies {
    fn default() -> Self {
        Self {
            offer_stacking: OfferStacking::default(),
            coupon_on_cancel: CouponOnCancel::default(),
            missing_books: MissingBookPolicy::default(),
            return_window: Duration::days(7),
            charges: Charges::default(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub nats_url: Option<String>,
    pub port: u16,
    pub max_connections: u32,
    pub policies: Policies,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let database_url = std::env::var("DATABASE_URL").map_err(|_| CommerceError::InvalidInput("DATABASE_URL must be set".into()))?;
        Ok(Self {
            database_url,
            nats_url: std::env::var("NATS_URL").ok().filter(|v| !v.is_empty()),
            port: parse_var("PORT", 8083)?,
            max_connections: parse_var("DB_MAX_CONNECTIONS", 10)?,
            policies: Policies::from_env()?,
        })
    }
}

impl Policies {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let tax_percent = Percent::new(parse_var("TAX_PERCENT", Decimal::ZERO)?)
            .map_err(|e| CommerceError::InvalidInput(format!("TAX_PERCENT: {e}")))?;
        let delivery: Decimal = parse_var("DELIVERY_CHARGE", Decimal::ZERO)?;
        if delivery.is_sign_negative() && !delivery.is_zero() {
            return Err(CommerceError::InvalidInput("DELIVERY_CHARGE must not be negative".into()));
        }
        Ok(Self {
            offer_stacking: parse_var("OFFER_STACKING", defaults.offer_stacking)?,
            coupon_on_cancel: parse_var("COUPON_ON_CANCEL", defaults.coupon_on_cancel)?,
            missing_books: parse_var("MISSING_BOOK_POLICY", defaults.missing_books)?,
            return_window: return_window(parse_var("RETURN_WINDOW_DAYS", 7i64)?)?,
            charges: Charges { delivery: Money::new(delivery), tax_percent },
        })
    }
}

/// Days after delivery during which a return may be requested.
pub fn return_window(days: i64) -> Result<Duration> {
    if days < 0 {
        return Err(CommerceError::InvalidInput(format!("RETURN_WINDOW_DAYS must not be negative, got {days}")));
    }
    Duration::try_days(days).ok_or_else(|| CommerceError::InvalidInput(format!("RETURN_WINDOW_DAYS {days} is out of range")))
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw.trim().parse().map_err(|e| CommerceError::InvalidInput(format!("{name}: {e}"))),
        _ => Ok(default),
    }
}
