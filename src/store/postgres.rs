//! Postgres store on a sqlx pool.
//!
//! Locking: orders and wallets are read `FOR UPDATE`; stock and coupon usage
//! move through single conditional `UPDATE … RETURNING` statements; the wallet
//! row is created with `INSERT … ON CONFLICT DO NOTHING` before it is locked.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use uuid::Uuid;

use super::{Store, UnitOfWork};
use crate::domain::aggregates::{
    Book, CartLine, Coupon, CouponKind, Offer, OfferScope, Order, OrderItem, RefundState, RequestState, StockState,
    UserActiveCoupon, Wallet, WalletTransaction,
};
use crate::domain::value_objects::{CouponCode, Money, Percent};
use crate::{CommerceError, Result};

type PgQuery<'q> = sqlx::query::Query<'q, Postgres, PgArguments>;

#[derive(Clone, Debug)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self { Self { pool } }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new().max_connections(max_connections).connect(database_url).await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await.map_err(|e| CommerceError::Internal(e.to_string()))
    }

    pub fn pool(&self) -> &PgPool { &self.pool }
}

#[async_trait]
impl Store for PgStore {
    type Tx = PgTx;

    async fn begin(&self) -> Result<PgTx> { Ok(PgTx { tx: self.pool.begin().await? }) }
}

pub struct PgTx {
    tx: Transaction<'static, Postgres>,
}

const ORDER_COLUMNS: &str = "id, user_id, address_id, subtotal, product_discount, category_discount, coupon_id, coupon_code, \
    coupon_discount, delivery_charge, tax, final_total, payment_method, payment_status, payment_reference, status, \
    cancellation_reason, return_reason, return_rejection_reason, refund_status, refund_amount, refunded_at, \
    has_item_cancellation_requests, has_item_return_requests, placed_at, delivered_at, updated_at";

const ITEM_COLUMNS: &str = "id, book_id, title, quantity, unit_price, discount, line_total, coupon_share, \
    cancel_status, cancel_reason, cancel_requested_at, cancel_decided_at, cancel_rejection_reason, \
    return_status, return_reason, return_requested_at, return_decided_at, return_rejection_reason, \
    stock_restored, stock_restored_at, refund_status, refund_amount, refunded_at";

const COUPON_COLUMNS: &str = "id, code, coupon_type, value, min_order_value, max_discount, expires_at, usage_limit, used_count, active";

const TRANSACTION_COLUMNS: &str = "id, wallet_id, kind, amount, status, description, order_id, reference, created_at, settled_at";

fn corrupt(what: &str, detail: impl std::fmt::Display) -> CommerceError {
    CommerceError::Internal(format!("corrupt {what} row: {detail}"))
}

fn to_u32(v: i32, column: &str) -> Result<u32> { u32::try_from(v).map_err(|_| corrupt(column, v)) }

fn to_i32(v: u32) -> Result<i32> { i32::try_from(v).map_err(|_| CommerceError::InvalidInput(format!("{v} is out of range"))) }

fn money(row: &PgRow, column: &str) -> Result<Money> { Ok(Money::new(row.try_get::<Decimal, _>(column)?)) }

fn book_from_row(row: &PgRow) -> Result<Book> {
    Ok(Book {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        category_id: row.try_get("category_id")?,
        price: money(row, "price")?,
        stock: to_u32(row.try_get("stock")?, "books.stock")?,
    })
}

fn offer_from_row(row: &PgRow, scope: OfferScope) -> Result<Offer> {
    Ok(Offer {
        id: row.try_get("id")?,
        scope,
        percent: Percent::new(row.try_get("discount_percent")?).map_err(|e| corrupt("offer", e))?,
        starts_at: row.try_get("start_date")?,
        ends_at: row.try_get("end_date")?,
        active: row.try_get("active")?,
    })
}

fn coupon_from_row(row: &PgRow) -> Result<Coupon> {
    let value: Decimal = row.try_get("value")?;
    let kind = match row.try_get::<String, _>("coupon_type")?.as_str() {
        "flat" => CouponKind::Flat { amount: Money::new(value) },
        "percent" => CouponKind::Percent {
            percent: Percent::new(value).map_err(|e| corrupt("coupon", e))?,
            max_discount: row.try_get::<Option<Decimal>, _>("max_discount")?.map(Money::new),
        },
        other => return Err(corrupt("coupon", other)),
    };
    Ok(Coupon {
        id: row.try_get("id")?,
        code: CouponCode::new(row.try_get::<String, _>("code")?).map_err(|e| corrupt("coupon", e))?,
        kind,
        min_order_value: money(row, "min_order_value")?,
        expires_at: row.try_get("expires_at")?,
        usage_limit: to_u32(row.try_get("usage_limit")?, "coupons.usage_limit")?,
        used_count: to_u32(row.try_get("used_count")?, "coupons.used_count")?,
        active: row.try_get("active")?,
    })
}

fn wallet_from_row(row: &PgRow) -> Result<Wallet> {
    Ok(Wallet {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        balance: money(row, "balance")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn transaction_from_row(row: &PgRow) -> Result<WalletTransaction> {
    Ok(WalletTransaction {
        id: row.try_get("id")?,
        wallet_id: row.try_get("wallet_id")?,
        kind: row.try_get::<String, _>("kind")?.parse()?,
        amount: money(row, "amount")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        description: row.try_get("description")?,
        order_id: row.try_get("order_id")?,
        reference: row.try_get("reference")?,
        created_at: row.try_get("created_at")?,
        settled_at: row.try_get("settled_at")?,
    })
}

/// Flattened columns of a [`RequestState`].
struct RequestColumns<'a> {
    status: &'static str,
    reason: Option<&'a str>,
    requested_at: Option<DateTime<Utc>>,
    decided_at: Option<DateTime<Utc>>,
    rejection_reason: Option<&'a str>,
}

fn request_columns(state: &RequestState) -> RequestColumns<'_> {
    let mut cols = RequestColumns { status: state.label(), reason: state.reason(), requested_at: None, decided_at: None, rejection_reason: None };
    match state {
        RequestState::None => {}
        RequestState::Pending { requested_at, .. } => cols.requested_at = Some(*requested_at),
        RequestState::Approved { requested_at, decided_at, .. } => {
            cols.requested_at = Some(*requested_at);
            cols.decided_at = Some(*decided_at);
        }
        RequestState::Rejected { requested_at, decided_at, rejection_reason, .. } => {
            cols.requested_at = Some(*requested_at);
            cols.decided_at = Some(*decided_at);
            cols.rejection_reason = rejection_reason.as_deref();
        }
    }
    cols
}

fn request_from_row(row: &PgRow, prefix: &str) -> Result<RequestState> {
    let status: String = row.try_get(format!("{prefix}_status").as_str())?;
    let reason: Option<String> = row.try_get(format!("{prefix}_reason").as_str())?;
    let requested_at: Option<DateTime<Utc>> = row.try_get(format!("{prefix}_requested_at").as_str())?;
    let decided_at: Option<DateTime<Utc>> = row.try_get(format!("{prefix}_decided_at").as_str())?;
    let rejection_reason: Option<String> = row.try_get(format!("{prefix}_rejection_reason").as_str())?;
    let missing = || corrupt("order_items", format!("{prefix} timestamps missing for status {status}"));
    Ok(match status.as_str() {
        "none" => RequestState::None,
        "pending" => RequestState::Pending { reason, requested_at: requested_at.ok_or_else(missing)? },
        "approved" => RequestState::Approved { reason, requested_at: requested_at.ok_or_else(missing)?, decided_at: decided_at.ok_or_else(missing)? },
        "rejected" => RequestState::Rejected {
            reason,
            requested_at: requested_at.ok_or_else(missing)?,
            decided_at: decided_at.ok_or_else(missing)?,
            rejection_reason,
        },
        other => return Err(corrupt("order_items", other)),
    })
}

fn refund_from_row(row: &PgRow) -> Result<RefundState> {
    match row.try_get::<String, _>("refund_status")?.as_str() {
        "none" => Ok(RefundState::None),
        "completed" => Ok(RefundState::Completed {
            amount: Money::new(row.try_get::<Option<Decimal>, _>("refund_amount")?.ok_or_else(|| corrupt("refund", "amount missing"))?),
            at: row.try_get::<Option<DateTime<Utc>>, _>("refunded_at")?.ok_or_else(|| corrupt("refund", "timestamp missing"))?,
        }),
        other => Err(corrupt("refund", other)),
    }
}

fn refund_columns(state: &RefundState) -> (&'static str, Option<Decimal>, Option<DateTime<Utc>>) {
    match state {
        RefundState::None => ("none", None, None),
        RefundState::Completed { amount, at } => ("completed", Some(amount.amount()), Some(*at)),
    }
}

fn item_from_row(row: &PgRow) -> Result<OrderItem> {
    let stock = match row.try_get::<Option<DateTime<Utc>>, _>("stock_restored_at")? {
        Some(at) if row.try_get::<bool, _>("stock_restored")? => StockState::Restored { at },
        _ => StockState::Reserved,
    };
    Ok(OrderItem {
        id: row.try_get("id")?,
        book_id: row.try_get("book_id")?,
        title: row.try_get("title")?,
        quantity: to_u32(row.try_get("quantity")?, "order_items.quantity")?,
        unit_price: money(row, "unit_price")?,
        discount: money(row, "discount")?,
        line_total: money(row, "line_total")?,
        coupon_share: money(row, "coupon_share")?,
        cancellation: request_from_row(row, "cancel")?,
        return_request: request_from_row(row, "return")?,
        stock,
        refund: refund_from_row(row)?,
    })
}

fn order_from_row(row: &PgRow, items: Vec<OrderItem>) -> Result<Order> {
    Ok(Order {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        address_id: row.try_get("address_id")?,
        items,
        subtotal: money(row, "subtotal")?,
        product_discount: money(row, "product_discount")?,
        category_discount: money(row, "category_discount")?,
        coupon_id: row.try_get("coupon_id")?,
        coupon_code: row.try_get::<Option<String>, _>("coupon_code")?.map(CouponCode::new).transpose().map_err(|e| corrupt("orders", e))?,
        coupon_discount: money(row, "coupon_discount")?,
        delivery_charge: money(row, "delivery_charge")?,
        tax: money(row, "tax")?,
        final_total: money(row, "final_total")?,
        payment_method: row.try_get::<String, _>("payment_method")?.parse()?,
        payment_status: row.try_get::<String, _>("payment_status")?.parse()?,
        payment_reference: row.try_get("payment_reference")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        cancellation_reason: row.try_get("cancellation_reason")?,
        return_reason: row.try_get("return_reason")?,
        return_rejection_reason: row.try_get("return_rejection_reason")?,
        refund: refund_from_row(row)?,
        has_item_cancellation_requests: row.try_get("has_item_cancellation_requests")?,
        has_item_return_requests: row.try_get("has_item_return_requests")?,
        placed_at: row.try_get("placed_at")?,
        delivered_at: row.try_get("delivered_at")?,
        updated_at: row.try_get("updated_at")?,
        events: vec![],
    })
}

impl PgTx {
    async fn load_order(&mut self, id: Uuid, lock: bool) -> Result<Option<Order>> {
        let sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1{}", if lock { " FOR UPDATE" } else { "" });
        let Some(row) = sqlx::query(&sql).bind(id).fetch_optional(&mut *self.tx).await? else { return Ok(None) };
        let item_rows = sqlx::query(&format!("SELECT {ITEM_COLUMNS} FROM order_items WHERE order_id = $1 ORDER BY position"))
            .bind(id)
            .fetch_all(&mut *self.tx)
            .await?;
        let items = item_rows.iter().map(item_from_row).collect::<Result<Vec<_>>>()?;
        order_from_row(&row, items).map(Some)
    }

    async fn insert_items(&mut self, order: &Order) -> Result<()> {
        for (position, item) in order.items().iter().enumerate() {
            let query = sqlx::query(
                "INSERT INTO order_items (id, order_id, position, book_id, title, quantity, unit_price, discount, line_total, coupon_share, \
                 cancel_status, cancel_reason, cancel_requested_at, cancel_decided_at, cancel_rejection_reason, \
                 return_status, return_reason, return_requested_at, return_decided_at, return_rejection_reason, \
                 stock_restored, stock_restored_at, refund_status, refund_amount, refunded_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, $25)",
            )
            .bind(item.id)
            .bind(order.id())
            .bind(i32::try_from(position).map_err(|_| CommerceError::InvalidInput("too many order items".into()))?)
            .bind(item.book_id)
            .bind(&item.title)
            .bind(to_i32(item.quantity)?)
            .bind(item.unit_price.amount())
            .bind(item.discount.amount())
            .bind(item.line_total.amount())
            .bind(item.coupon_share.amount());
            bind_guards(query, item).execute(&mut *self.tx).await?;
        }
        Ok(())
    }

    async fn update_items(&mut self, order: &Order) -> Result<()> {
        for item in order.items() {
            let query = sqlx::query(
                "UPDATE order_items SET \
                 cancel_status = $3, cancel_reason = $4, cancel_requested_at = $5, cancel_decided_at = $6, cancel_rejection_reason = $7, \
                 return_status = $8, return_reason = $9, return_requested_at = $10, return_decided_at = $11, return_rejection_reason = $12, \
                 stock_restored = $13, stock_restored_at = $14, refund_status = $15, refund_amount = $16, refunded_at = $17 \
                 WHERE id = $1 AND order_id = $2",
            )
            .bind(item.id)
            .bind(order.id());
            let result = bind_guards(query, item).execute(&mut *self.tx).await?;
            if result.rows_affected() != 1 {
                return Err(CommerceError::not_found("order item", item.id));
            }
        }
        Ok(())
    }
}

/// Binds the request, stock and refund guard columns of an item, in column order.
fn bind_guards<'q>(query: PgQuery<'q>, item: &'q OrderItem) -> PgQuery<'q> {
    let cancel = request_columns(&item.cancellation);
    let ret = request_columns(&item.return_request);
    let (refund_status, refund_amount, refunded_at) = refund_columns(&item.refund);
    let restored_at = match item.stock {
        StockState::Restored { at } => Some(at),
        StockState::Reserved => None,
    };
    query
        .bind(cancel.status)
        .bind(cancel.reason)
        .bind(cancel.requested_at)
        .bind(cancel.decided_at)
        .bind(cancel.rejection_reason)
        .bind(ret.status)
        .bind(ret.reason)
        .bind(ret.requested_at)
        .bind(ret.decided_at)
        .bind(ret.rejection_reason)
        .bind(item.stock.is_restored())
        .bind(restored_at)
        .bind(refund_status)
        .bind(refund_amount)
        .bind(refunded_at)
}

#[async_trait]
impl UnitOfWork for PgTx {
    async fn book(&mut self, id: Uuid) -> Result<Option<Book>> {
        let row = sqlx::query("SELECT id, title, category_id, price, stock FROM books WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?;
        row.as_ref().map(book_from_row).transpose()
    }

    async fn adjust_stock(&mut self, book_id: Uuid, delta: i64) -> Result<u32> {
        let updated: Option<i32> = sqlx::query_scalar("UPDATE books SET stock = stock + $2 WHERE id = $1 AND stock + $2 >= 0 RETURNING stock")
            .bind(book_id)
            .bind(delta)
            .fetch_optional(&mut *self.tx)
            .await?;
        if let Some(stock) = updated {
            return to_u32(stock, "books.stock");
        }
        let available: Option<i32> = sqlx::query_scalar("SELECT stock FROM books WHERE id = $1").bind(book_id).fetch_optional(&mut *self.tx).await?;
        match available {
            None => Err(CommerceError::not_found("book", book_id)),
            Some(available) => Err(CommerceError::InsufficientStock {
                book_id,
                requested: u32::try_from(delta.unsigned_abs()).unwrap_or(u32::MAX),
                available: to_u32(available, "books.stock")?,
            }),
        }
    }

    async fn live_product_offer(&mut self, book_id: Uuid, at: DateTime<Utc>) -> Result<Option<Offer>> {
        let row = sqlx::query(
            "SELECT id, discount_percent, start_date, end_date, active FROM product_offers \
             WHERE book_id = $1 AND active AND start_date <= $2 AND end_date >= $2 ORDER BY start_date DESC LIMIT 1",
        )
        .bind(book_id)
        .bind(at)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.map(|r| offer_from_row(&r, OfferScope::Product(book_id))).transpose()
    }

    async fn live_category_offer(&mut self, category_id: Uuid, at: DateTime<Utc>) -> Result<Option<Offer>> {
        let row = sqlx::query(
            "SELECT id, discount_percent, start_date, end_date, active FROM category_offers \
             WHERE category_id = $1 AND active AND start_date <= $2 AND end_date >= $2 ORDER BY start_date DESC LIMIT 1",
        )
        .bind(category_id)
        .bind(at)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.map(|r| offer_from_row(&r, OfferScope::Category(category_id))).transpose()
    }

    async fn cart_lines(&mut self, user_id: Uuid) -> Result<Vec<CartLine>> {
        let rows = sqlx::query("SELECT book_id, quantity FROM cart_items WHERE user_id = $1 ORDER BY added_at, book_id")
            .bind(user_id)
            .fetch_all(&mut *self.tx)
            .await?;
        rows.iter()
            .map(|r| Ok(CartLine { book_id: r.try_get("book_id")?, quantity: to_u32(r.try_get("quantity")?, "cart_items.quantity")? }))
            .collect()
    }

    async fn clear_cart(&mut self, user_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM cart_items WHERE user_id = $1").bind(user_id).execute(&mut *self.tx).await?;
        Ok(())
    }

    async fn coupon(&mut self, id: Uuid) -> Result<Option<Coupon>> {
        let row = sqlx::query(&format!("SELECT {COUPON_COLUMNS} FROM coupons WHERE id = $1")).bind(id).fetch_optional(&mut *self.tx).await?;
        row.as_ref().map(coupon_from_row).transpose()
    }

    async fn coupon_by_code(&mut self, code: &CouponCode) -> Result<Option<Coupon>> {
        let row = sqlx::query(&format!("SELECT {COUPON_COLUMNS} FROM coupons WHERE UPPER(code) = $1"))
            .bind(code.as_str())
            .fetch_optional(&mut *self.tx)
            .await?;
        row.as_ref().map(coupon_from_row).transpose()
    }

    async fn redeem_coupon(&mut self, id: Uuid) -> Result<Coupon> {
        let row = sqlx::query(&format!(
            "UPDATE coupons SET used_count = used_count + 1 WHERE id = $1 AND used_count < usage_limit RETURNING {COUPON_COLUMNS}"
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;
        match row {
            Some(row) => coupon_from_row(&row),
            None if self.coupon(id).await?.is_some() => Err(CommerceError::Conflict("Coupon usage limit reached".into())),
            None => Err(CommerceError::not_found("coupon", id)),
        }
    }

    async fn release_coupon(&mut self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE coupons SET used_count = used_count - 1 WHERE id = $1 AND used_count > 0").bind(id).execute(&mut *self.tx).await?;
        Ok(())
    }

    async fn active_coupon(&mut self, user_id: Uuid) -> Result<Option<UserActiveCoupon>> {
        let row = sqlx::query("SELECT user_id, coupon_id, applied_at FROM user_active_coupons WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&mut *self.tx)
            .await?;
        row.map(|r| Ok(UserActiveCoupon { user_id: r.try_get("user_id")?, coupon_id: r.try_get("coupon_id")?, applied_at: r.try_get("applied_at")? }))
            .transpose()
    }

    async fn insert_active_coupon(&mut self, row: &UserActiveCoupon) -> Result<()> {
        let result = sqlx::query("INSERT INTO user_active_coupons (user_id, coupon_id, applied_at) VALUES ($1, $2, $3)")
            .bind(row.user_id)
            .bind(row.coupon_id)
            .bind(row.applied_at)
            .execute(&mut *self.tx)
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(CommerceError::Conflict(format!("user {} already has an active coupon", row.user_id)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_active_coupon(&mut self, user_id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM user_active_coupons WHERE user_id = $1").bind(user_id).execute(&mut *self.tx).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_order(&mut self, order: &Order) -> Result<()> {
        let (refund_status, refund_amount, refunded_at) = refund_columns(order.refund());
        sqlx::query(&format!(
            "INSERT INTO orders ({ORDER_COLUMNS}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, $27)"
        ))
        .bind(order.id())
        .bind(order.user_id())
        .bind(order.address_id())
        .bind(order.subtotal().amount())
        .bind(order.product_discount().amount())
        .bind(order.category_discount().amount())
        .bind(order.coupon_id())
        .bind(order.coupon_code().map(CouponCode::as_str))
        .bind(order.coupon_discount().amount())
        .bind(order.delivery_charge().amount())
        .bind(order.tax().amount())
        .bind(order.final_total().amount())
        .bind(order.payment_method().as_str())
        .bind(order.payment_status().as_str())
        .bind(order.payment_reference())
        .bind(order.status().as_str())
        .bind(order.cancellation_reason())
        .bind(order.return_reason())
        .bind(order.return_rejection_reason())
        .bind(refund_status)
        .bind(refund_amount)
        .bind(refunded_at)
        .bind(order.has_item_cancellation_requests())
        .bind(order.has_item_return_requests())
        .bind(order.placed_at())
        .bind(order.delivered_at())
        .bind(order.updated_at)
        .execute(&mut *self.tx)
        .await?;
        self.insert_items(order).await
    }

    async fn order(&mut self, id: Uuid) -> Result<Option<Order>> { self.load_order(id, false).await }

    async fn order_for_update(&mut self, id: Uuid) -> Result<Option<Order>> { self.load_order(id, true).await }

    async fn update_order(&mut self, order: &Order) -> Result<()> {
        let (refund_status, refund_amount, refunded_at) = refund_columns(order.refund());
        let result = sqlx::query(
            "UPDATE orders SET payment_status = $2, payment_reference = $3, status = $4, cancellation_reason = $5, \
             return_reason = $6, return_rejection_reason = $7, refund_status = $8, refund_amount = $9, refunded_at = $10, \
             has_item_cancellation_requests = $11, has_item_return_requests = $12, delivered_at = $13, updated_at = $14 \
             WHERE id = $1",
        )
        .bind(order.id())
        .bind(order.payment_status().as_str())
        .bind(order.payment_reference())
        .bind(order.status().as_str())
        .bind(order.cancellation_reason())
        .bind(order.return_reason())
        .bind(order.return_rejection_reason())
        .bind(refund_status)
        .bind(refund_amount)
        .bind(refunded_at)
        .bind(order.has_item_cancellation_requests())
        .bind(order.has_item_return_requests())
        .bind(order.delivered_at())
        .bind(order.updated_at)
        .execute(&mut *self.tx)
        .await?;
        if result.rows_affected() != 1 { return Err(CommerceError::not_found("order", order.id())); }
        self.update_items(order).await
    }

    async fn wallet(&mut self, user_id: Uuid) -> Result<Option<Wallet>> {
        let row = sqlx::query("SELECT id, user_id, balance, created_at, updated_at FROM wallets WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&mut *self.tx)
            .await?;
        row.as_ref().map(wallet_from_row).transpose()
    }

    async fn wallet_for_update(&mut self, user_id: Uuid) -> Result<Wallet> {
        let fresh = Wallet::open(user_id);
        sqlx::query("INSERT INTO wallets (id, user_id, balance, created_at, updated_at) VALUES ($1, $2, 0, $3, $3) ON CONFLICT (user_id) DO NOTHING")
            .bind(fresh.id)
            .bind(user_id)
            .bind(fresh.created_at)
            .execute(&mut *self.tx)
            .await?;
        let row = sqlx::query("SELECT id, user_id, balance, created_at, updated_at FROM wallets WHERE user_id = $1 FOR UPDATE")
            .bind(user_id)
            .fetch_one(&mut *self.tx)
            .await?;
        wallet_from_row(&row)
    }

    async fn update_wallet_balance(&mut self, wallet: &Wallet) -> Result<()> {
        sqlx::query("UPDATE wallets SET balance = $2, updated_at = $3 WHERE id = $1")
            .bind(wallet.id)
            .bind(wallet.balance.amount())
            .bind(wallet.updated_at)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn insert_wallet_transaction(&mut self, tx: &WalletTransaction) -> Result<()> {
        let result = sqlx::query(&format!("INSERT INTO wallet_transactions ({TRANSACTION_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"))
            .bind(tx.id)
            .bind(tx.wallet_id)
            .bind(tx.kind.as_str())
            .bind(tx.amount.amount())
            .bind(tx.status.as_str())
            .bind(&tx.description)
            .bind(tx.order_id)
            .bind(&tx.reference)
            .bind(tx.created_at)
            .bind(tx.settled_at)
            .execute(&mut *self.tx)
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(CommerceError::Conflict(format!("ledger reference {} already posted", tx.reference)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn wallet_transaction(&mut self, id: Uuid) -> Result<Option<WalletTransaction>> {
        let row = sqlx::query(&format!("SELECT {TRANSACTION_COLUMNS} FROM wallet_transactions WHERE id = $1"))
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?;
        row.as_ref().map(transaction_from_row).transpose()
    }

    async fn wallet_transaction_by_reference(&mut self, wallet_id: Uuid, reference: &str) -> Result<Option<WalletTransaction>> {
        let row = sqlx::query(&format!("SELECT {TRANSACTION_COLUMNS} FROM wallet_transactions WHERE wallet_id = $1 AND reference = $2 FOR UPDATE"))
            .bind(wallet_id)
            .bind(reference)
            .fetch_optional(&mut *self.tx)
            .await?;
        row.as_ref().map(transaction_from_row).transpose()
    }

    async fn update_wallet_transaction_status(&mut self, tx: &WalletTransaction) -> Result<()> {
        // Completed rows are immutable; only pending rows may be settled.
        let result = sqlx::query("UPDATE wallet_transactions SET status = $2, settled_at = $3 WHERE id = $1 AND status = 'pending'")
            .bind(tx.id)
            .bind(tx.status.as_str())
            .bind(tx.settled_at)
            .execute(&mut *self.tx)
            .await?;
        if result.rows_affected() != 1 {
            return Err(CommerceError::Conflict(format!("wallet transaction {} is already settled", tx.id)));
        }
        Ok(())
    }

    async fn wallet_transactions(&mut self, wallet_id: Uuid, offset: u64, limit: u64) -> Result<(Vec<WalletTransaction>, u64)> {
        let as_i64 = |v: u64| i64::try_from(v).map_err(|_| CommerceError::InvalidInput(format!("{v} is out of range")));
        let rows = sqlx::query(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM wallet_transactions WHERE wallet_id = $1 ORDER BY created_at DESC, id DESC LIMIT $2 OFFSET $3"
        ))
        .bind(wallet_id)
        .bind(as_i64(limit)?)
        .bind(as_i64(offset)?)
        .fetch_all(&mut *self.tx)
        .await?;
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM wallet_transactions WHERE wallet_id = $1")
            .bind(wallet_id)
            .fetch_one(&mut *self.tx)
            .await?;
        let data = rows.iter().map(transaction_from_row).collect::<Result<Vec<_>>>()?;
        Ok((data, u64::try_from(total).unwrap_or_default()))
    }

    async fn completed_ledger_sum(&mut self, wallet_id: Uuid) -> Result<Money> {
        let sum: Decimal = sqlx::query_scalar(
            "SELECT COALESCE(SUM(CASE WHEN kind = 'credit' THEN amount ELSE -amount END), 0) \
             FROM wallet_transactions WHERE wallet_id = $1 AND status = 'completed'",
        )
        .bind(wallet_id)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(Money::new(sum))
    }

    async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }
}
