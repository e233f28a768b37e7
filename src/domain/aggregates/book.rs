//! Book Aggregate
//!
//! The catalog owns books; the fulfillment core only reads price and category
//! and moves stock.

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use crate::domain::value_objects::Money;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Book {
    pub id: Uuid,
    pub title: String,
    pub category_id: Uuid,
    pub price: Money,
    pub stock: u32,
}

impl Book {
    pub fn new(title: impl Into<String>, category_id: Uuid, price: Money, stock: u32) -> Self {
        Self { id: Uuid::new_v4(), title: title.into(), category_id, price, stock }
    }

    pub fn is_in_stock(&self) -> bool { self.stock > 0 }

    pub fn add_stock(&mut self, qty: u32) { self.stock = self.stock.saturating_add(qty); }

    pub fn remove_stock(&mut self, qty: u32) -> Result<(), BookError> {
        self.stock = self.stock.checked_sub(qty).ok_or(BookError::InsufficientStock { requested: qty, available: self.stock })?;
        Ok(())
    }
}

/// Stock movement relative to the current count.
pub fn apply_stock_delta(book: &mut Book, delta: i64) -> Result<(), BookError> {
    let qty = u32::try_from(delta.unsigned_abs()).map_err(|_| BookError::QuantityOverflow)?;
    if delta >= 0 { book.add_stock(qty); Ok(()) } else { book.remove_stock(qty) }
}

/// A cart row owned by the (external) cart surface.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartLine { pub book_id: Uuid, pub quantity: u32 }

#[derive(Debug, Clone, PartialEq, Eq)] pub enum BookError { InsufficientStock { requested: u32, available: u32 }, QuantityOverflow }
impl std::error::Error for BookError {}
impl std::fmt::Display for BookError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InsufficientStock { requested, available } => write!(f, "Insufficient stock: requested {requested}, available {available}"),
            Self::QuantityOverflow => write!(f, "Stock movement out of range"),
        }
    }
}
