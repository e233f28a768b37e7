use chrono::{DateTime, Utc};
use tracing::{instrument, warn};
use uuid::Uuid;

use super::discounts::offers_in;
use super::Engine;
use crate::domain::aggregates::Coupon;
use crate::domain::pricing::{summarize, CheckoutSummary, DropReason, DroppedLine, PricedLine};
use crate::store::{Store, UnitOfWork};
use crate::Result;

impl<S: Store> Engine<S> {
    /// Prices the user's cart with live offers and the staged coupon.
    ///
    /// Lines whose book no longer resolves are left out and listed in
    /// `dropped`; a staged coupon that is no longer eligible is left out and its
    /// reason reported in `coupon_rejection`.
    #[instrument(skip(self))]
    pub async fn compute_cart(&self, user_id: Uuid) -> Result<CheckoutSummary> {
        let mut tx = self.store.begin().await?;
        let (summary, _) = self.price_cart_in(&mut tx, user_id, Utc::now()).await?;
        Ok(summary)
    }

    /// Returns the summary plus the staged coupon record, if any.
    pub(super) async fn price_cart_in(&self, tx: &mut S::Tx, user_id: Uuid, at: DateTime<Utc>) -> Result<(CheckoutSummary, Option<Coupon>)> {
        let mut items = Vec::new();
        let mut dropped = Vec::new();
        for line in tx.cart_lines(user_id).await? {
            let Some(book) = tx.book(line.book_id).await? else {
                warn!(%user_id, book_id = %line.book_id, "cart line references a missing book");
                dropped.push(DroppedLine { book_id: line.book_id, quantity: line.quantity, reason: DropReason::BookNotFound });
                continue;
            };
            let offers = offers_in(tx, self.policies.offer_stacking, book.id, book.category_id, at).await?;
            items.push(PricedLine::price(&book, line.quantity, offers));
        }

        let coupon = match tx.active_coupon(user_id).await? {
            Some(active) => tx.coupon(active.coupon_id).await?,
            None => None,
        };
        let summary = summarize(items, dropped, coupon.as_ref(), at);
        if let Some(reason) = &summary.coupon_rejection {
            warn!(%user_id, reason = %reason, "staged coupon not applicable");
        }
        Ok((summary, coupon))
    }
}
