//! In-process store.
//!
//! One async mutex guards the whole dataset, so units of work are fully
//! serialized: a unit takes the lock, works on a private copy and swaps it in on
//! commit. Dropping the unit discards the copy. Intended for tests, demos and
//! single-node tooling.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::{Store, UnitOfWork};
use crate::domain::aggregates::{
    book::apply_stock_delta, ledger_balance, Book, CartLine, Coupon, Offer, OfferScope, Order, UserActiveCoupon, Wallet,
    WalletTransaction,
};
use crate::domain::value_objects::{CouponCode, Money};
use crate::{CommerceError, Result};

#[derive(Clone, Debug, Default)]
struct Dataset {
    books: HashMap<Uuid, Book>,
    offers: Vec<Offer>,
    coupons: HashMap<Uuid, Coupon>,
    active_coupons: HashMap<Uuid, UserActiveCoupon>,
    carts: HashMap<Uuid, Vec<CartLine>>,
    orders: HashMap<Uuid, Order>,
    wallets: HashMap<Uuid, Wallet>,
    transactions: Vec<WalletTransaction>,
}

#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    data: Arc<Mutex<Dataset>>,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    pub async fn put_book(&self, book: Book) { self.data.lock().await.books.insert(book.id, book); }

    pub async fn remove_book(&self, id: Uuid) { self.data.lock().await.books.remove(&id); }

    pub async fn put_offer(&self, offer: Offer) {
        let mut data = self.data.lock().await;
        data.offers.retain(|o| o.id != offer.id);
        data.offers.push(offer);
    }

    pub async fn put_coupon(&self, coupon: Coupon) { self.data.lock().await.coupons.insert(coupon.id, coupon); }

    /// Adds to the user's cart, merging quantities for the same book.
    pub async fn add_to_cart(&self, user_id: Uuid, book_id: Uuid, quantity: u32) {
        let mut data = self.data.lock().await;
        let cart = data.carts.entry(user_id).or_default();
        match cart.iter_mut().find(|l| l.book_id == book_id) {
            Some(line) => line.quantity += quantity,
            None => cart.push(CartLine { book_id, quantity }),
        }
    }

    pub async fn book_snapshot(&self, id: Uuid) -> Option<Book> { self.data.lock().await.books.get(&id).cloned() }

    pub async fn coupon_snapshot(&self, id: Uuid) -> Option<Coupon> { self.data.lock().await.coupons.get(&id).cloned() }

    /// Every ledger row for a user's wallet, oldest first.
    pub async fn ledger_snapshot(&self, user_id: Uuid) -> Vec<WalletTransaction> {
        let data = self.data.lock().await;
        match data.wallets.get(&user_id) {
            Some(w) => data.transactions.iter().filter(|t| t.wallet_id == w.id).cloned().collect(),
            None => vec![],
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    type Tx = MemoryTx;

    async fn begin(&self) -> Result<MemoryTx> {
        let guard = self.data.clone().lock_owned().await;
        let work = guard.clone();
        Ok(MemoryTx { guard, work })
    }
}

pub struct MemoryTx {
    guard: OwnedMutexGuard<Dataset>,
    work: Dataset,
}

impl MemoryTx {
    fn wallet_by_id(&self, wallet_id: Uuid) -> Option<&Wallet> { self.work.wallets.values().find(|w| w.id == wallet_id) }
}

fn live_offer(offers: &[Offer], scope: OfferScope, at: DateTime<Utc>) -> Option<Offer> {
    // Several live offers on one scope is an admin error; the newest window wins.
    offers.iter().filter(|o| o.scope == scope && o.is_live(at)).max_by_key(|o| o.starts_at).cloned()
}

#[async_trait]
impl UnitOfWork for MemoryTx {
    async fn book(&mut self, id: Uuid) -> Result<Option<Book>> { Ok(self.work.books.get(&id).cloned()) }

    async fn adjust_stock(&mut self, book_id: Uuid, delta: i64) -> Result<u32> {
        let book = self.work.books.get_mut(&book_id).ok_or_else(|| CommerceError::not_found("book", book_id))?;
        apply_stock_delta(book, delta).map_err(|e| CommerceError::from_book(book_id, e))?;
        Ok(book.stock)
    }

    async fn live_product_offer(&mut self, book_id: Uuid, at: DateTime<Utc>) -> Result<Option<Offer>> {
        Ok(live_offer(&self.work.offers, OfferScope::Product(book_id), at))
    }

    async fn live_category_offer(&mut self, category_id: Uuid, at: DateTime<Utc>) -> Result<Option<Offer>> {
        Ok(live_offer(&self.work.offers, OfferScope::Category(category_id), at))
    }

    async fn cart_lines(&mut self, user_id: Uuid) -> Result<Vec<CartLine>> {
        Ok(self.work.carts.get(&user_id).cloned().unwrap_or_default())
    }

    async fn clear_cart(&mut self, user_id: Uuid) -> Result<()> {
        self.work.carts.remove(&user_id);
        Ok(())
    }

    async fn coupon(&mut self, id: Uuid) -> Result<Option<Coupon>> { Ok(self.work.coupons.get(&id).cloned()) }

    async fn coupon_by_code(&mut self, code: &CouponCode) -> Result<Option<Coupon>> {
        Ok(self.work.coupons.values().find(|c| &c.code == code).cloned())
    }

    async fn redeem_coupon(&mut self, id: Uuid) -> Result<Coupon> {
        let coupon = self.work.coupons.get_mut(&id).ok_or_else(|| CommerceError::not_found("coupon", id))?;
        coupon.redeem()?;
        Ok(coupon.clone())
    }

    async fn release_coupon(&mut self, id: Uuid) -> Result<()> {
        if let Some(coupon) = self.work.coupons.get_mut(&id) { coupon.release(); }
        Ok(())
    }

    async fn active_coupon(&mut self, user_id: Uuid) -> Result<Option<UserActiveCoupon>> {
        Ok(self.work.active_coupons.get(&user_id).cloned())
    }

    async fn insert_active_coupon(&mut self, row: &UserActiveCoupon) -> Result<()> {
        if self.work.active_coupons.contains_key(&row.user_id) {
            return Err(CommerceError::Conflict(format!("user {} already has an active coupon", row.user_id)));
        }
        self.work.active_coupons.insert(row.user_id, row.clone());
        Ok(())
    }

    async fn delete_active_coupon(&mut self, user_id: Uuid) -> Result<bool> {
        Ok(self.work.active_coupons.remove(&user_id).is_some())
    }

    async fn insert_order(&mut self, order: &Order) -> Result<()> {
        if self.work.orders.contains_key(&order.id()) {
            return Err(CommerceError::Conflict(format!("order {} already exists", order.id())));
        }
        let mut stored = order.clone();
        stored.events.clear();
        self.work.orders.insert(order.id(), stored);
        Ok(())
    }

    async fn order(&mut self, id: Uuid) -> Result<Option<Order>> { Ok(self.work.orders.get(&id).cloned()) }

    async fn order_for_update(&mut self, id: Uuid) -> Result<Option<Order>> { self.order(id).await }

    async fn update_order(&mut self, order: &Order) -> Result<()> {
        let slot = self.work.orders.get_mut(&order.id()).ok_or_else(|| CommerceError::not_found("order", order.id()))?;
        *slot = order.clone();
        slot.events.clear();
        Ok(())
    }

    async fn wallet(&mut self, user_id: Uuid) -> Result<Option<Wallet>> { Ok(self.work.wallets.get(&user_id).cloned()) }

    async fn wallet_for_update(&mut self, user_id: Uuid) -> Result<Wallet> {
        Ok(self.work.wallets.entry(user_id).or_insert_with(|| Wallet::open(user_id)).clone())
    }

    async fn update_wallet_balance(&mut self, wallet: &Wallet) -> Result<()> {
        let slot = self.work.wallets.get_mut(&wallet.user_id).ok_or_else(|| CommerceError::not_found("wallet", wallet.id))?;
        slot.balance = wallet.balance;
        slot.updated_at = wallet.updated_at;
        Ok(())
    }

    async fn insert_wallet_transaction(&mut self, tx: &WalletTransaction) -> Result<()> {
        if self.wallet_by_id(tx.wallet_id).is_none() { return Err(CommerceError::not_found("wallet", tx.wallet_id)); }
        if self.work.transactions.iter().any(|t| t.wallet_id == tx.wallet_id && t.reference == tx.reference) {
            return Err(CommerceError::Conflict(format!("ledger reference {} already posted", tx.reference)));
        }
        self.work.transactions.push(tx.clone());
        Ok(())
    }

    async fn wallet_transaction(&mut self, id: Uuid) -> Result<Option<WalletTransaction>> {
        Ok(self.work.transactions.iter().find(|t| t.id == id).cloned())
    }

    async fn wallet_transaction_by_reference(&mut self, wallet_id: Uuid, reference: &str) -> Result<Option<WalletTransaction>> {
        Ok(self.work.transactions.iter().find(|t| t.wallet_id == wallet_id && t.reference == reference).cloned())
    }

    async fn update_wallet_transaction_status(&mut self, tx: &WalletTransaction) -> Result<()> {
        let slot = self.work.transactions.iter_mut().find(|t| t.id == tx.id).ok_or_else(|| CommerceError::not_found("wallet transaction", tx.id))?;
        slot.status = tx.status;
        slot.settled_at = tx.settled_at;
        Ok(())
    }

    async fn wallet_transactions(&mut self, wallet_id: Uuid, offset: u64, limit: u64) -> Result<(Vec<WalletTransaction>, u64)> {
        let mut rows: Vec<&WalletTransaction> = self.work.transactions.iter().filter(|t| t.wallet_id == wallet_id).collect();
        let total = rows.len() as u64;
        // Insertion order breaks ties between rows created in the same instant.
        rows.reverse();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let page = rows.into_iter().skip(offset as usize).take(limit as usize).cloned().collect();
        Ok((page, total))
    }

    async fn completed_ledger_sum(&mut self, wallet_id: Uuid) -> Result<Money> {
        Ok(ledger_balance(self.work.transactions.iter().filter(|t| t.wallet_id == wallet_id)))
    }

    async fn commit(mut self) -> Result<()> {
        *self.guard = std::mem::take(&mut self.work);
        Ok(())
    }
}
