use chrono::{DateTime, Utc};
use tracing::instrument;
use uuid::Uuid;

use super::Engine;
use crate::domain::pricing::{OfferBreakdown, OfferStacking};
use crate::store::{Store, UnitOfWork};
use crate::Result;

impl<S: Store> Engine<S> {
    /// Offers live on a book right now.
    pub async fn compute_offer_breakdown(&self, book_id: Uuid, category_id: Uuid) -> Result<OfferBreakdown> {
        self.compute_offer_breakdown_at(book_id, category_id, Utc::now()).await
    }

    #[instrument(skip(self))]
    pub async fn compute_offer_breakdown_at(&self, book_id: Uuid, category_id: Uuid, at: DateTime<Utc>) -> Result<OfferBreakdown> {
        let mut tx = self.store.begin().await?;
        offers_in(&mut tx, self.policies.offer_stacking, book_id, category_id, at).await
    }
}

pub(super) async fn offers_in<U: UnitOfWork>(
    tx: &mut U,
    stacking: OfferStacking,
    book_id: Uuid,
    category_id: Uuid,
    at: DateTime<Utc>,
) -> Result<OfferBreakdown> {
    let product = tx.live_product_offer(book_id, at).await?;
    let category = tx.live_category_offer(category_id, at).await?;
    Ok(OfferBreakdown::resolve(product.as_ref(), category.as_ref(), at, stacking))
}
