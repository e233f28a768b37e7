//! Aggregates module
pub mod book;
pub mod offer;
pub mod coupon;
pub mod order;
pub mod wallet;

pub use book::{Book, BookError, CartLine};
pub use offer::{Offer, OfferScope};
pub use coupon::{Coupon, CouponError, CouponKind, UserActiveCoupon};
pub use order::{
    Charges, Decision, Order, OrderError, OrderItem, OrderStatus, PaymentMethod, PaymentStatus,
    Refund, RefundScope, RefundState, RequestState, Restock, Settlement, StockState,
};
pub use wallet::{ledger_balance, Overdraft, TransactionKind, TransactionStatus, Wallet, WalletError, WalletTransaction};
