#![allow(dead_code)]

use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use bookstore_commerce::domain::aggregates::{Book, Coupon, CouponKind, Offer, Order, OrderStatus, PaymentMethod, TransactionStatus};
use bookstore_commerce::domain::value_objects::{CouponCode, Money, Percent};
use bookstore_commerce::events::EventPublisher;
use bookstore_commerce::store::MemoryStore;
use bookstore_commerce::{Engine, Policies};

pub fn money(v: Decimal) -> Money { Money::new(v) }

pub fn pct(v: Decimal) -> Percent { Percent::new(v).expect("non-negative percent") }

pub struct TestApp {
    pub engine: Engine<MemoryStore>,
    pub store: MemoryStore,
}

impl TestApp {
    pub fn new() -> Self { Self::with_policies(Policies::default()) }

    pub fn with_policies(policies: Policies) -> Self {
        let store = MemoryStore::new();
        let engine = Engine::new(store.clone(), policies, EventPublisher::disabled());
        Self { engine, store }
    }

    pub async fn seed_book(&self, price: Decimal, stock: u32) -> Book {
        self.seed_book_in(Uuid::new_v4(), price, stock).await
    }

    pub async fn seed_book_in(&self, category_id: Uuid, price: Decimal, stock: u32) -> Book {
        let book = Book::new("The Rust Programming Language", category_id, money(price), stock);
        self.store.put_book(book.clone()).await;
        book
    }

    pub async fn seed_product_offer(&self, book_id: Uuid, percent: Decimal) -> Offer {
        let now = Utc::now();
        let offer = Offer::for_product(book_id, pct(percent), now - Duration::days(1), now + Duration::days(1));
        self.store.put_offer(offer.clone()).await;
        offer
    }

    pub async fn seed_category_offer(&self, category_id: Uuid, percent: Decimal) -> Offer {
        let now = Utc::now();
        let offer = Offer::for_category(category_id, pct(percent), now - Duration::days(1), now + Duration::days(1));
        self.store.put_offer(offer.clone()).await;
        offer
    }

    pub async fn seed_coupon(&self, code: &str, kind: CouponKind, min_order: Decimal, usage_limit: u32) -> Coupon {
        let coupon = Coupon::new(
            CouponCode::new(code).expect("valid code"),
            kind,
            money(min_order),
            Utc::now() + Duration::days(30),
            usage_limit,
        );
        self.store.put_coupon(coupon.clone()).await;
        coupon
    }

    pub async fn seed_flat_coupon(&self, code: &str, amount: Decimal, usage_limit: u32) -> Coupon {
        self.seed_coupon(code, CouponKind::Flat { amount: money(amount) }, Decimal::ZERO, usage_limit).await
    }

    pub async fn stock_of(&self, book_id: Uuid) -> u32 {
        self.store.book_snapshot(book_id).await.expect("book exists").stock
    }

    pub async fn used_count(&self, coupon_id: Uuid) -> u32 {
        self.store.coupon_snapshot(coupon_id).await.expect("coupon exists").used_count
    }

    /// Tops the wallet up through the pending/verify flow.
    pub async fn fund_wallet(&self, user_id: Uuid, amount: Decimal) {
        let pending = self.engine.top_up(user_id, money(amount)).await.expect("top-up");
        self.engine.verify_top_up(user_id, &pending.reference, TransactionStatus::Completed).await.expect("verify");
    }

    pub async fn balance(&self, user_id: Uuid) -> Money { self.engine.wallet_balance(user_id).await.expect("balance") }

    /// Three lines: 100 × 1, 200 × 2, 50 × 3, each book stocked at 10. Total 650.
    pub async fn seed_three_line_cart(&self, user_id: Uuid) -> Vec<Book> {
        let mut books = Vec::new();
        for (price, qty) in [(100, 1), (200, 2), (50, 3)] {
            let book = self.seed_book(Decimal::new(price, 0), 10).await;
            self.store.add_to_cart(user_id, book.id, qty).await;
            books.push(book);
        }
        books
    }

    pub async fn place_three_line_order(&self, user_id: Uuid, method: PaymentMethod) -> (Order, Vec<Book>) {
        let books = self.seed_three_line_cart(user_id).await;
        let order = self.engine.place_order(user_id, Uuid::new_v4(), method).await.expect("order placed");
        (order, books)
    }

    pub async fn deliver(&self, order_id: Uuid) -> Order {
        let mut order = None;
        for status in [OrderStatus::Processing, OrderStatus::Shipped, OrderStatus::Delivered] {
            order = Some(self.engine.advance_order(order_id, status).await.expect("advance"));
        }
        order.expect("delivered")
    }
}
