use chrono::Utc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::wallet::Posting;
use super::Engine;
use crate::config::{CouponOnCancel, MissingBookPolicy};
use crate::domain::aggregates::{
    Decision, Order, OrderError, OrderStatus, Overdraft, PaymentMethod, Refund, RefundScope, Settlement, TransactionKind,
};
use crate::domain::events::DomainEvent;
use crate::store::{Store, UnitOfWork};
use crate::{CommerceError, Result};

/// Ledger posting for a refund. The reference is unique per wallet, so a
/// retried settlement can never post the same refund twice.
fn refund_posting(order_id: Uuid, refund: &Refund) -> Posting {
    let (reference, description) = match refund.scope {
        RefundScope::Item(item_id) => (format!("REFUND-ITEM-{item_id}"), format!("Refund for item {item_id} of order {order_id}")),
        RefundScope::Order => (format!("REFUND-CANCEL-{order_id}"), format!("Refund for cancellation of order {order_id}")),
    };
    Posting { kind: TransactionKind::Credit, amount: refund.amount, description, order_id: Some(order_id), reference }
}

fn rejected(order_id: Uuid, e: OrderError) -> CommerceError {
    warn!(%order_id, error = %e, "order transition rejected");
    e.into()
}

impl<S: Store> Engine<S> {
    /// Turns the user's cart into an order in one unit of work: stock for every
    /// line, coupon redemption, the order rows, the wallet debit for wallet
    /// payments and clearing the cart all commit together or not at all.
    #[instrument(skip(self))]
    pub async fn place_order(&self, user_id: Uuid, address_id: Uuid, payment_method: PaymentMethod) -> Result<Order> {
        let mut tx = self.store.begin().await?;
        let (summary, staged) = self.price_cart_in(&mut tx, user_id, Utc::now()).await?;

        if summary.is_partial() && self.policies.missing_books == MissingBookPolicy::Reject {
            let missing: Vec<String> = summary.dropped.iter().map(|d| d.book_id.to_string()).collect();
            return Err(CommerceError::InvalidInput(format!("cart references missing books: {}", missing.join(", "))));
        }
        if summary.items.is_empty() {
            return Err(CommerceError::InvalidInput("cart is empty".into()));
        }
        if let (Some(coupon), Some(reason)) = (&staged, &summary.coupon_rejection) {
            return Err(CommerceError::InvalidInput(format!("coupon {} cannot be applied: {reason}", coupon.code)));
        }

        // Fixed lock order across concurrent placements.
        let mut lines: Vec<(Uuid, u32)> = summary.items.iter().map(|l| (l.book_id, l.quantity)).collect();
        lines.sort_by_key(|(book_id, _)| *book_id);
        for (book_id, quantity) in lines {
            let left = tx.adjust_stock(book_id, -i64::from(quantity)).await?;
            info!(%book_id, quantity, left, "stock reserved");
        }

        if let Some(applied) = &summary.coupon {
            self.redeem_coupon_in(&mut tx, user_id, applied.coupon_id).await?;
        }

        let mut order = Order::place(user_id, address_id, payment_method, &summary, self.policies.charges)?;
        tx.insert_order(&order).await?;
        let mut events = order.take_events();

        if payment_method == PaymentMethod::Wallet && order.final_total().is_positive() {
            let posting = Posting {
                kind: TransactionKind::Debit,
                amount: order.final_total(),
                description: format!("Payment for order {}", order.id()),
                order_id: Some(order.id()),
                reference: format!("ORDER-{}", order.id()),
            };
            let (_, event) = self.post_in(&mut tx, user_id, posting, Overdraft::Reject).await?;
            events.push(event);
        }

        tx.clear_cart(user_id).await?;
        tx.commit().await?;
        info!(order_id = %order.id(), total = %order.final_total(), items = order.items().len(), "order placed");
        self.publish(events).await;
        Ok(order)
    }

    #[instrument(skip(self))]
    pub async fn get_order(&self, order_id: Uuid) -> Result<Order> {
        let mut tx = self.store.begin().await?;
        tx.order(order_id).await?.ok_or_else(|| CommerceError::not_found("order", order_id))
    }

    /// Admin: one step along `placed → processing → shipped → delivered`.
    /// Delivering a cash-on-delivery order captures it.
    #[instrument(skip(self))]
    pub async fn advance_order(&self, order_id: Uuid, to: OrderStatus) -> Result<Order> {
        let (tx, mut order) = self.lock_order(order_id).await?;
        let settlement = order.advance(to).map_err(|e| rejected(order_id, e))?;
        self.finish(tx, order, settlement).await
    }

    /// Marks an online payment as captured. Lines settled while the payment
    /// was pending are refunded in the same unit of work.
    #[instrument(skip(self))]
    pub async fn confirm_payment(&self, order_id: Uuid, reference: &str) -> Result<Order> {
        let reference = reference.trim();
        if reference.is_empty() { return Err(CommerceError::InvalidInput("a payment reference is required".into())); }
        let (tx, mut order) = self.lock_order(order_id).await?;
        let settlement = order.confirm_payment(reference).map_err(|e| rejected(order_id, e))?;
        self.finish(tx, order, settlement).await
    }

    /// Cancels the whole order before shipment.
    #[instrument(skip(self))]
    pub async fn cancel_order(&self, order_id: Uuid, reason: Option<String>) -> Result<Order> {
        let (mut tx, mut order) = self.lock_order(order_id).await?;
        let settlement = order.cancel(reason).map_err(|e| rejected(order_id, e))?;
        if let (CouponOnCancel::Restore, Some(coupon_id)) = (self.policies.coupon_on_cancel, order.coupon_id()) {
            tx.release_coupon(coupon_id).await?;
            info!(%order_id, %coupon_id, "coupon usage released");
        }
        self.finish(tx, order, settlement).await
    }

    /// Customer request to cancel one item; awaits admin review.
    #[instrument(skip(self))]
    pub async fn cancel_order_item(&self, order_id: Uuid, item_id: Uuid, reason: Option<String>) -> Result<Order> {
        let (tx, mut order) = self.lock_order(order_id).await?;
        order.request_item_cancellation(item_id, reason).map_err(|e| rejected(order_id, e))?;
        self.finish(tx, order, Settlement::default()).await
    }

    /// Admin verdict on an item cancellation. Approval restocks and refunds once.
    #[instrument(skip(self))]
    pub async fn review_item_cancellation(&self, order_id: Uuid, item_id: Uuid, decision: Decision, rejection_reason: Option<String>) -> Result<Order> {
        let (tx, mut order) = self.lock_order(order_id).await?;
        let settlement = order.review_item_cancellation(item_id, decision, rejection_reason).map_err(|e| rejected(order_id, e))?;
        self.finish(tx, order, settlement).await
    }

    /// Customer return of every eligible item of a delivered order.
    #[instrument(skip(self))]
    pub async fn return_order(&self, order_id: Uuid, reason: &str) -> Result<Order> {
        let (tx, mut order) = self.lock_order(order_id).await?;
        order.request_return(reason, self.policies.return_window, Utc::now()).map_err(|e| rejected(order_id, e))?;
        self.finish(tx, order, Settlement::default()).await
    }

    #[instrument(skip(self))]
    pub async fn return_order_item(&self, order_id: Uuid, item_id: Uuid, reason: &str) -> Result<Order> {
        let (tx, mut order) = self.lock_order(order_id).await?;
        order.request_item_return(item_id, reason, self.policies.return_window, Utc::now()).map_err(|e| rejected(order_id, e))?;
        self.finish(tx, order, Settlement::default()).await
    }

    /// Admin verdict on one item's return.
    #[instrument(skip(self))]
    pub async fn review_return_item(&self, order_id: Uuid, item_id: Uuid, decision: Decision, rejection_reason: Option<String>) -> Result<Order> {
        let (tx, mut order) = self.lock_order(order_id).await?;
        let settlement = order.review_item_return(item_id, decision, rejection_reason).map_err(|e| rejected(order_id, e))?;
        self.finish(tx, order, settlement).await
    }

    /// Admin approval of a whole-order return.
    #[instrument(skip(self))]
    pub async fn approve_return(&self, order_id: Uuid) -> Result<Order> {
        let (tx, mut order) = self.lock_order(order_id).await?;
        let settlement = order.approve_return().map_err(|e| rejected(order_id, e))?;
        self.finish(tx, order, settlement).await
    }

    /// Admin rejection of a whole-order return. Terminal.
    #[instrument(skip(self))]
    pub async fn reject_return(&self, order_id: Uuid, reason: &str) -> Result<Order> {
        let (tx, mut order) = self.lock_order(order_id).await?;
        order.reject_return(reason).map_err(|e| rejected(order_id, e))?;
        self.finish(tx, order, Settlement::default()).await
    }

    async fn lock_order(&self, order_id: Uuid) -> Result<(S::Tx, Order)> {
        let mut tx = self.store.begin().await?;
        let order = tx.order_for_update(order_id).await?.ok_or_else(|| CommerceError::not_found("order", order_id))?;
        Ok((tx, order))
    }

    /// Applies a settlement, saves the order and commits, then publishes.
    async fn finish(&self, mut tx: S::Tx, mut order: Order, settlement: Settlement) -> Result<Order> {
        let order_id = order.id();
        let mut events: Vec<DomainEvent> = order.take_events();

        for restock in &settlement.restock {
            let stock = tx.adjust_stock(restock.book_id, i64::from(restock.quantity)).await?;
            info!(%order_id, book_id = %restock.book_id, quantity = restock.quantity, stock, "stock restored");
        }
        for refund in &settlement.refunds {
            let (_, event) = self.post_in(&mut tx, order.user_id(), refund_posting(order_id, refund), Overdraft::Reject).await?;
            events.push(event);
        }

        tx.update_order(&order).await?;
        tx.commit().await?;
        info!(%order_id, status = order.status().as_str(), refund = %settlement.refund(), "order updated");
        self.publish(events).await;
        Ok(order)
    }
}
