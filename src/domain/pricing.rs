//! Offer resolution and checkout pricing.
//!
//! Everything here is pure: callers load books, offers and the staged coupon,
//! and the functions below turn them into the priced projection that is shown
//! at checkout and persisted when an order is placed.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;
use crate::domain::aggregates::{Book, Coupon, Offer};
use crate::domain::value_objects::{CouponCode, Money, Percent};

/// How a product offer and a category offer on the same book combine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferStacking {
    #[default]
    Additive,
    Larger,
}

impl FromStr for OfferStacking {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "additive" => Ok(Self::Additive),
            "larger" => Ok(Self::Larger),
            other => Err(format!("unknown offer stacking policy '{other}'")),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppliedOfferType {
    #[default]
    None,
    Product,
    Category,
    Stacked,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferBreakdown {
    pub product_percent: Percent,
    pub category_percent: Percent,
    /// Unclamped; may exceed 100 when offers stack.
    pub applied_percent: Percent,
    pub applied_type: AppliedOfferType,
}

impl OfferBreakdown {
    /// Offers that are not live at `at` count as 0%.
    pub fn resolve(product: Option<&Offer>, category: Option<&Offer>, at: DateTime<Utc>, stacking: OfferStacking) -> Self {
        let live = |o: Option<&Offer>| o.filter(|o| o.is_live(at)).map(|o| o.percent).unwrap_or(Percent::ZERO);
        let (product_percent, category_percent) = (live(product), live(category));

        let (applied_percent, applied_type) = match (product_percent.is_zero(), category_percent.is_zero(), stacking) {
            (true, true, _) => (Percent::ZERO, AppliedOfferType::None),
            (false, true, _) => (product_percent, AppliedOfferType::Product),
            (true, false, _) => (category_percent, AppliedOfferType::Category),
            (false, false, OfferStacking::Additive) => (product_percent + category_percent, AppliedOfferType::Stacked),
            (false, false, OfferStacking::Larger) if product_percent >= category_percent => (product_percent, AppliedOfferType::Product),
            (false, false, OfferStacking::Larger) => (category_percent, AppliedOfferType::Category),
        };
        Self { product_percent, category_percent, applied_percent, applied_type }
    }

    /// Per-axis percentages actually charged against a line. Their sum never
    /// exceeds 100: a stacked total above 100 is scaled down proportionally.
    pub fn effective(&self) -> (Percent, Percent) {
        match self.applied_type {
            AppliedOfferType::None => (Percent::ZERO, Percent::ZERO),
            AppliedOfferType::Product => (self.product_percent.clamped(), Percent::ZERO),
            AppliedOfferType::Category => (Percent::ZERO, self.category_percent.clamped()),
            AppliedOfferType::Stacked => {
                let total = self.applied_percent.value();
                if total <= Decimal::ONE_HUNDRED {
                    return (self.product_percent, self.category_percent);
                }
                let product = self.product_percent.value() * Decimal::ONE_HUNDRED / total;
                (Percent::new(product).unwrap_or(Percent::ZERO), Percent::new(Decimal::ONE_HUNDRED - product).unwrap_or(Percent::ZERO))
            }
        }
    }
}

/// `original × (1 − percent/100)` with the percent clamped to `[0, 100]`.
pub fn apply_offer_to_price(original: Money, percent: Percent) -> Money {
    original - original.percent_of(percent.clamped())
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PricedLine {
    pub book_id: Uuid,
    pub title: String,
    pub quantity: u32,
    pub unit_price: Money,
    pub offers: OfferBreakdown,
    pub line_original: Money,
    pub product_discount: Money,
    pub category_discount: Money,
    pub line_total: Money,
    /// This line's share of the order's coupon discount.
    pub coupon_share: Money,
}

impl PricedLine {
    pub fn price(book: &Book, quantity: u32, offers: OfferBreakdown) -> Self {
        let (product_pct, category_pct) = offers.effective();
        let line_original = book.price.times(quantity);
        // Discounts are settled in cents per line so lines, coupon shares and
        // refunds all add up on the same grid.
        let total_discount = line_original.percent_of(product_pct + category_pct).round2();
        let product_discount = line_original.percent_of(product_pct).round2().min(total_discount);
        let category_discount = (total_discount - product_discount).floor_zero();
        let line_total = (line_original - total_discount).floor_zero();
        Self {
            book_id: book.id, title: book.title.clone(), quantity, unit_price: book.price, offers,
            line_original, product_discount, category_discount, line_total, coupon_share: Money::ZERO,
        }
    }

    pub fn discount(&self) -> Money { self.product_discount + self.category_discount }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason { BookNotFound }

/// A cart line left out of the projection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DroppedLine { pub book_id: Uuid, pub quantity: u32, pub reason: DropReason }

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CouponApplication { pub coupon_id: Uuid, pub code: CouponCode, pub discount: Money }

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CheckoutSummary {
    pub items: Vec<PricedLine>,
    pub dropped: Vec<DroppedLine>,
    pub subtotal: Money,
    pub product_discount: Money,
    pub category_discount: Money,
    pub coupon: Option<CouponApplication>,
    /// Why a staged coupon was left out, if it was.
    pub coupon_rejection: Option<String>,
    pub coupon_discount: Money,
    pub final_total: Money,
}

impl CheckoutSummary {
    pub fn coupon_code(&self) -> Option<&CouponCode> { self.coupon.as_ref().map(|c| &c.code) }
    pub fn is_partial(&self) -> bool { !self.dropped.is_empty() }
}

/// Aggregates priced lines and the staged coupon into the checkout summary.
///
/// The coupon is measured against the undiscounted subtotal, rounded to cents
/// and capped at the offer-discounted total, so `final_total` is never negative.
pub fn summarize(mut items: Vec<PricedLine>, dropped: Vec<DroppedLine>, coupon: Option<&Coupon>, at: DateTime<Utc>) -> CheckoutSummary {
    let subtotal: Money = items.iter().map(|l| l.line_original).sum();
    let product_discount: Money = items.iter().map(|l| l.product_discount).sum();
    let category_discount: Money = items.iter().map(|l| l.category_discount).sum();
    let after_offers = (subtotal - product_discount - category_discount).floor_zero();

    let (coupon, coupon_rejection) = match coupon {
        None => (None, None),
        Some(c) => match c.check_eligibility(subtotal, at) {
            Ok(()) => {
                let discount = c.discount_for(subtotal).round2().min(after_offers);
                (Some(CouponApplication { coupon_id: c.id, code: c.code.clone(), discount }), None)
            }
            Err(e) => (None, Some(e.to_string())),
        },
    };
    let coupon_discount = coupon.as_ref().map(|c| c.discount).unwrap_or(Money::ZERO);
    allocate_coupon(&mut items, coupon_discount);

    let final_total = (subtotal - product_discount - category_discount - coupon_discount).round2().floor_zero();
    CheckoutSummary { items, dropped, subtotal, product_discount, category_discount, coupon, coupon_rejection, coupon_discount, final_total }
}

/// Splits the coupon discount across lines in proportion to what each line
/// costs after offers. Shares are in cents, never exceed their line, and add
/// up to the rounded coupon discount.
fn allocate_coupon(items: &mut [PricedLine], coupon_discount: Money) {
    let after_offers: Money = items.iter().map(|l| l.line_total).sum();
    let total = coupon_discount.round2().min(after_offers);
    if !total.is_positive() { return; }
    let mut allocated = Money::ZERO;
    for line in items.iter_mut() {
        let share = Money::new(total.amount() * line.line_total.amount() / after_offers.amount()).round2();
        line.coupon_share = share.min(line.line_total).min(total - allocated);
        allocated += line.coupon_share;
    }
    // Rounding leaves a few cents at most; lines with room take them in order.
    for line in items.iter_mut() {
        let left = total - allocated;
        if !left.is_positive() { break; }
        let extra = (line.line_total - line.coupon_share).min(left);
        line.coupon_share += extra;
        allocated += extra;
    }
}
