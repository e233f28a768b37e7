//! Product and category offers
//!
//! Offers are created by the admin surface and are read-only here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use crate::domain::value_objects::Percent;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum OfferScope { Product(Uuid), Category(Uuid) }

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub id: Uuid,
    pub scope: OfferScope,
    pub percent: Percent,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub active: bool,
}

impl Offer {
    pub fn for_product(book_id: Uuid, percent: Percent, starts_at: DateTime<Utc>, ends_at: DateTime<Utc>) -> Self {
        Self { id: Uuid::new_v4(), scope: OfferScope::Product(book_id), percent, starts_at, ends_at, active: true }
    }

    pub fn for_category(category_id: Uuid, percent: Percent, starts_at: DateTime<Utc>, ends_at: DateTime<Utc>) -> Self {
        Self { id: Uuid::new_v4(), scope: OfferScope::Category(category_id), percent, starts_at, ends_at, active: true }
    }

    /// Active and `starts_at <= at <= ends_at`.
    pub fn is_live(&self, at: DateTime<Utc>) -> bool {
        self.active && self.starts_at <= at && at <= self.ends_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal::Decimal;

    #[test]
    fn test_validity_window_is_inclusive() {
        let now = Utc::now();
        let mut offer = Offer::for_product(Uuid::new_v4(), Percent::new(Decimal::TEN).unwrap(), now, now + Duration::days(1));
        assert!(offer.is_live(now));
        assert!(offer.is_live(now + Duration::days(1)));
        assert!(!offer.is_live(now - Duration::seconds(1)));
        offer.active = false;
        assert!(!offer.is_live(now));
    }
}
