//! Persistence boundary.
//!
//! A [`Store`] is handed to the engine at startup and opens one
//! [`UnitOfWork`] per operation. Everything read or written through a unit is
//! part of a single transaction: rows fetched with the `_for_update` methods are
//! locked until the unit commits or is dropped, and the counter updates
//! (`adjust_stock`, `redeem_coupon`) are atomic conditional updates. Dropping a
//! unit without calling [`UnitOfWork::commit`] rolls it back.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::aggregates::{Book, CartLine, Coupon, Offer, Order, UserActiveCoupon, Wallet, WalletTransaction};
use crate::domain::value_objects::{CouponCode, Money};
use crate::Result;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[async_trait]
pub trait Store: Clone + Send + Sync + 'static {
    type Tx: UnitOfWork;

    async fn begin(&self) -> Result<Self::Tx>;
}

#[async_trait]
pub trait UnitOfWork: Send {
    // Catalog
    async fn book(&mut self, id: Uuid) -> Result<Option<Book>>;
    /// Moves stock by `delta`; fails with `InsufficientStock` rather than going negative.
    /// Returns the new stock count.
    async fn adjust_stock(&mut self, book_id: Uuid, delta: i64) -> Result<u32>;
    async fn live_product_offer(&mut self, book_id: Uuid, at: DateTime<Utc>) -> Result<Option<Offer>>;
    async fn live_category_offer(&mut self, category_id: Uuid, at: DateTime<Utc>) -> Result<Option<Offer>>;
    async fn cart_lines(&mut self, user_id: Uuid) -> Result<Vec<CartLine>>;
    async fn clear_cart(&mut self, user_id: Uuid) -> Result<()>;

    // Coupons
    async fn coupon(&mut self, id: Uuid) -> Result<Option<Coupon>>;
    async fn coupon_by_code(&mut self, code: &CouponCode) -> Result<Option<Coupon>>;
    /// Increments `used_count` only while it is below `usage_limit`; `Conflict` otherwise.
    async fn redeem_coupon(&mut self, id: Uuid) -> Result<Coupon>;
    /// Decrements `used_count`, never below zero.
    async fn release_coupon(&mut self, id: Uuid) -> Result<()>;
    async fn active_coupon(&mut self, user_id: Uuid) -> Result<Option<UserActiveCoupon>>;
    /// Unique per user; a second row is a `Conflict`.
    async fn insert_active_coupon(&mut self, row: &UserActiveCoupon) -> Result<()>;
    async fn delete_active_coupon(&mut self, user_id: Uuid) -> Result<bool>;

    // Orders
    async fn insert_order(&mut self, order: &Order) -> Result<()>;
    async fn order(&mut self, id: Uuid) -> Result<Option<Order>>;
    async fn order_for_update(&mut self, id: Uuid) -> Result<Option<Order>>;
    async fn update_order(&mut self, order: &Order) -> Result<()>;

    // Wallet
    async fn wallet(&mut self, user_id: Uuid) -> Result<Option<Wallet>>;
    /// Creates the wallet if missing (safe under concurrent first access) and locks it.
    async fn wallet_for_update(&mut self, user_id: Uuid) -> Result<Wallet>;
    async fn update_wallet_balance(&mut self, wallet: &Wallet) -> Result<()>;
    async fn insert_wallet_transaction(&mut self, tx: &WalletTransaction) -> Result<()>;
    async fn wallet_transaction(&mut self, id: Uuid) -> Result<Option<WalletTransaction>>;
    async fn wallet_transaction_by_reference(&mut self, wallet_id: Uuid, reference: &str) -> Result<Option<WalletTransaction>>;
    async fn update_wallet_transaction_status(&mut self, tx: &WalletTransaction) -> Result<()>;
    /// Newest first, with the total row count.
    async fn wallet_transactions(&mut self, wallet_id: Uuid, offset: u64, limit: u64) -> Result<(Vec<WalletTransaction>, u64)>;
    /// Sum of completed postings, credits positive.
    async fn completed_ledger_sum(&mut self, wallet_id: Uuid) -> Result<Money>;

    async fn commit(self) -> Result<()>;
}
