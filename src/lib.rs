//! Bookstore Commerce Core
//!
//! Order fulfillment and financial consistency engine for a bookstore backend.
//!
//! ## Features
//! - Offer resolution (product + category offers, stacked or larger-wins)
//! - Cart pricing with coupons
//! - Coupon staging and redemption with usage limits
//! - Order lifecycle with per-item cancellation and returns
//! - Wallet ledger for refunds and top-ups
//!
//! Every operation runs inside one [`store::UnitOfWork`]; stock, coupon usage,
//! wallet balance and order status either move together or not at all.

pub mod api;
pub mod config;
pub mod domain;
pub mod events;
pub mod services;
pub mod store;

use thiserror::Error;
use uuid::Uuid;

use crate::domain::aggregates::{BookError, CouponError, OrderError, WalletError};
use crate::domain::value_objects::{CouponCodeError, Money};

pub use crate::config::{Config, Policies};
pub use crate::services::Engine;

// =============================================================================
// Error Types
// =============================================================================

#[derive(Error, Debug)]
pub enum CommerceError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Insufficient stock for book {book_id}: requested {requested}, available {available}")]
    InsufficientStock { book_id: Uuid, requested: u32, available: u32 },

    #[error("Insufficient funds: balance {balance}, requested {requested}")]
    InsufficientFunds { balance: Money, requested: Money },

    #[error("Storage error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, CommerceError>;

impl CommerceError {
    pub fn not_found(what: &str, id: impl std::fmt::Display) -> Self { Self::NotFound(format!("{what} {id}")) }

    /// Lifts a book stock failure into the taxonomy, naming the book.
    pub fn from_book(book_id: Uuid, e: BookError) -> Self {
        match e {
            BookError::InsufficientStock { requested, available } => Self::InsufficientStock { book_id, requested, available },
            BookError::QuantityOverflow => Self::InvalidInput(e.to_string()),
        }
    }
}

impl From<OrderError> for CommerceError {
    fn from(e: OrderError) -> Self {
        match e {
            OrderError::ItemNotFound(_) => Self::NotFound(e.to_string()),
            OrderError::EmptyOrder | OrderError::ReasonRequired => Self::InvalidInput(e.to_string()),
            OrderError::UnknownValue(_) => Self::Internal(e.to_string()),
            _ => Self::Conflict(e.to_string()),
        }
    }
}

impl From<CouponError> for CommerceError {
    fn from(e: CouponError) -> Self {
        match e {
            CouponError::AlreadyActive | CouponError::UsageLimitReached => Self::Conflict(e.to_string()),
            _ => Self::InvalidInput(e.to_string()),
        }
    }
}

impl From<WalletError> for CommerceError {
    fn from(e: WalletError) -> Self {
        match e {
            WalletError::InsufficientFunds { balance, requested } => Self::InsufficientFunds { balance, requested },
            WalletError::NonPositiveAmount | WalletError::InvalidOutcome => Self::InvalidInput(e.to_string()),
            WalletError::NotPending(_) => Self::Conflict(e.to_string()),
            WalletError::UnknownValue(_) => Self::Internal(e.to_string()),
        }
    }
}

impl From<CouponCodeError> for CommerceError {
    fn from(e: CouponCodeError) -> Self { Self::InvalidInput(e.to_string()) }
}

impl From<sqlx::Error> for CommerceError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => Self::NotFound(e.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}
