//! HTTP routing over the engine.
//!
//! The caller's identity arrives in the `x-user-id` header, set by the gateway
//! in front of this service.

use axum::{
    async_trait,
    extract::{FromRequestParts, Path, Query, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use rust_decimal::Decimal;
use serde::Deserialize;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use uuid::Uuid;
use validator::Validate;

use crate::domain::aggregates::{Decision, Order, OrderStatus, PaymentMethod, TransactionStatus, WalletTransaction};
use crate::domain::pricing::{CheckoutSummary, OfferBreakdown};
use crate::domain::value_objects::Money;
use crate::services::{Page, Reconciliation};
use crate::store::Store;
use crate::{CommerceError, Engine};

type ApiResult<T> = Result<Json<T>, CommerceError>;

impl IntoResponse for CommerceError {
    fn into_response(self) -> Response {
        let (status, kind) = match &self {
            CommerceError::InvalidInput(_) => (StatusCode::BAD_REQUEST, "invalid_input"),
            CommerceError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            CommerceError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            CommerceError::InsufficientStock { .. } => (StatusCode::UNPROCESSABLE_ENTITY, "insufficient_stock"),
            CommerceError::InsufficientFunds { .. } => (StatusCode::UNPROCESSABLE_ENTITY, "insufficient_funds"),
            CommerceError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (status, Json(serde_json::json!({ "error": kind, "message": self.to_string() }))).into_response()
    }
}

/// Authenticated caller.
#[derive(Clone, Copy, Debug)]
pub struct UserId(pub Uuid);

#[async_trait]
impl<St: Send + Sync> FromRequestParts<St> for UserId {
    type Rejection = CommerceError;

    async fn from_request_parts(parts: &mut Parts, _state: &St) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get("x-user-id")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| CommerceError::InvalidInput("missing x-user-id header".into()))?;
        Uuid::parse_str(raw.trim()).map(UserId).map_err(|_| CommerceError::InvalidInput("x-user-id is not a valid id".into()))
    }
}

fn validated<T: Validate>(body: T) -> Result<T, CommerceError> {
    body.validate().map_err(|e| CommerceError::InvalidInput(e.to_string()))?;
    Ok(body)
}

pub fn router<S: Store>(engine: Engine<S>) -> Router {
    Router::new()
        .route("/health", get(|| async { Json(serde_json::json!({"status": "healthy", "service": "bookstore-commerce"})) }))
        .route("/api/v1/offers/breakdown", get(offer_breakdown::<S>))
        .route("/api/v1/cart/summary", get(cart_summary::<S>))
        .route("/api/v1/cart/coupon", post(apply_coupon::<S>).delete(remove_coupon::<S>))
        .route("/api/v1/orders", post(place_order::<S>))
        .route("/api/v1/orders/:id", get(get_order::<S>))
        .route("/api/v1/orders/:id/cancel", post(cancel_order::<S>))
        .route("/api/v1/orders/:id/payment", post(confirm_payment::<S>))
        .route("/api/v1/orders/:id/return", post(return_order::<S>))
        .route("/api/v1/orders/:id/items/:item_id/cancel", post(cancel_order_item::<S>))
        .route("/api/v1/orders/:id/items/:item_id/return", post(return_order_item::<S>))
        .route("/api/v1/admin/orders/:id/advance", post(advance_order::<S>))
        .route("/api/v1/admin/orders/:id/items/:item_id/cancellation", post(review_item_cancellation::<S>))
        .route("/api/v1/admin/orders/:id/items/:item_id/return", post(review_return_item::<S>))
        .route("/api/v1/admin/orders/:id/return/approve", post(approve_return::<S>))
        .route("/api/v1/admin/orders/:id/return/reject", post(reject_return::<S>))
        .route("/api/v1/wallet", get(wallet_balance::<S>))
        .route("/api/v1/wallet/transactions", get(wallet_transactions::<S>))
        .route("/api/v1/wallet/topup", post(top_up::<S>))
        .route("/api/v1/wallet/topup/verify", post(verify_top_up::<S>))
        .route("/api/v1/wallet/debit", post(debit_wallet::<S>))
        .route("/api/v1/admin/wallets/:user_id/transactions/:tx_id/reverse", post(reverse_transaction::<S>))
        .route("/api/v1/admin/wallets/:user_id/reconcile", get(reconcile_wallet::<S>))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(CorsLayer::permissive()))
        .with_state(engine)
}

// -----------------------------------------------------------------------------
// Pricing and coupons
// -----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct BreakdownParams { pub book_id: Uuid, pub category_id: Uuid }

async fn offer_breakdown<S: Store>(State(engine): State<Engine<S>>, Query(p): Query<BreakdownParams>) -> ApiResult<OfferBreakdown> {
    Ok(Json(engine.compute_offer_breakdown(p.book_id, p.category_id).await?))
}

async fn cart_summary<S: Store>(State(engine): State<Engine<S>>, UserId(user): UserId) -> ApiResult<CheckoutSummary> {
    Ok(Json(engine.compute_cart(user).await?))
}

#[derive(Debug, Deserialize, Validate)]
pub struct ApplyCouponRequest {
    #[validate(length(min = 1, max = 32))]
    pub code: String,
}

async fn apply_coupon<S: Store>(State(engine): State<Engine<S>>, UserId(user): UserId, Json(r): Json<ApplyCouponRequest>) -> Result<impl IntoResponse, CommerceError> {
    let r = validated(r)?;
    let coupon = engine.apply_coupon(user, &r.code).await?;
    Ok((StatusCode::CREATED, Json(serde_json::json!({ "couponId": coupon.id, "code": coupon.code }))))
}

async fn remove_coupon<S: Store>(State(engine): State<Engine<S>>, UserId(user): UserId) -> Result<StatusCode, CommerceError> {
    engine.remove_coupon(user).await?;
    Ok(StatusCode::NO_CONTENT)
}

// -----------------------------------------------------------------------------
// Orders
// -----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct PlaceOrderRequest { pub address_id: Uuid, pub payment_method: PaymentMethod }

async fn place_order<S: Store>(State(engine): State<Engine<S>>, UserId(user): UserId, Json(r): Json<PlaceOrderRequest>) -> Result<(StatusCode, Json<Order>), CommerceError> {
    let order = engine.place_order(user, r.address_id, r.payment_method).await?;
    Ok((StatusCode::CREATED, Json(order)))
}

/// Loads an order the caller owns; someone else's order is reported as missing.
async fn owned_order<S: Store>(engine: &Engine<S>, user: Uuid, order_id: Uuid) -> Result<Order, CommerceError> {
    let order = engine.get_order(order_id).await?;
    if order.user_id() != user { return Err(CommerceError::not_found("order", order_id)); }
    Ok(order)
}

async fn get_order<S: Store>(State(engine): State<Engine<S>>, UserId(user): UserId, Path(id): Path<Uuid>) -> ApiResult<Order> {
    Ok(Json(owned_order(&engine, user, id).await?))
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct OptionalReason {
    #[validate(length(max = 500))]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct RequiredReason {
    #[validate(length(min = 1, max = 500))]
    pub reason: String,
}

async fn cancel_order<S: Store>(State(engine): State<Engine<S>>, UserId(user): UserId, Path(id): Path<Uuid>, Json(r): Json<OptionalReason>) -> ApiResult<Order> {
    let r = validated(r)?;
    owned_order(&engine, user, id).await?;
    Ok(Json(engine.cancel_order(id, r.reason).await?))
}

#[derive(Debug, Deserialize, Validate)]
pub struct ConfirmPaymentRequest {
    #[validate(length(min = 1, max = 128))]
    pub reference: String,
}

async fn confirm_payment<S: Store>(State(engine): State<Engine<S>>, UserId(user): UserId, Path(id): Path<Uuid>, Json(r): Json<ConfirmPaymentRequest>) -> ApiResult<Order> {
    let r = validated(r)?;
    owned_order(&engine, user, id).await?;
    Ok(Json(engine.confirm_payment(id, &r.reference).await?))
}

async fn return_order<S: Store>(State(engine): State<Engine<S>>, UserId(user): UserId, Path(id): Path<Uuid>, Json(r): Json<RequiredReason>) -> ApiResult<Order> {
    let r = validated(r)?;
    owned_order(&engine, user, id).await?;
    Ok(Json(engine.return_order(id, &r.reason).await?))
}

async fn cancel_order_item<S: Store>(
    State(engine): State<Engine<S>>,
    UserId(user): UserId,
    Path((id, item_id)): Path<(Uuid, Uuid)>,
    Json(r): Json<OptionalReason>,
) -> ApiResult<Order> {
    let r = validated(r)?;
    owned_order(&engine, user, id).await?;
    Ok(Json(engine.cancel_order_item(id, item_id, r.reason).await?))
}

async fn return_order_item<S: Store>(
    State(engine): State<Engine<S>>,
    UserId(user): UserId,
    Path((id, item_id)): Path<(Uuid, Uuid)>,
    Json(r): Json<RequiredReason>,
) -> ApiResult<Order> {
    let r = validated(r)?;
    owned_order(&engine, user, id).await?;
    Ok(Json(engine.return_order_item(id, item_id, &r.reason).await?))
}

#[derive(Debug, Deserialize)]
pub struct AdvanceRequest { pub status: OrderStatus }

async fn advance_order<S: Store>(State(engine): State<Engine<S>>, Path(id): Path<Uuid>, Json(r): Json<AdvanceRequest>) -> ApiResult<Order> {
    Ok(Json(engine.advance_order(id, r.status).await?))
}

#[derive(Debug, Deserialize, Validate)]
pub struct ReviewRequest {
    pub decision: Decision,
    #[validate(length(max = 500))]
    pub reason: Option<String>,
}

async fn review_item_cancellation<S: Store>(State(engine): State<Engine<S>>, Path((id, item_id)): Path<(Uuid, Uuid)>, Json(r): Json<ReviewRequest>) -> ApiResult<Order> {
    let r = validated(r)?;
    Ok(Json(engine.review_item_cancellation(id, item_id, r.decision, r.reason).await?))
}

async fn review_return_item<S: Store>(State(engine): State<Engine<S>>, Path((id, item_id)): Path<(Uuid, Uuid)>, Json(r): Json<ReviewRequest>) -> ApiResult<Order> {
    let r = validated(r)?;
    Ok(Json(engine.review_return_item(id, item_id, r.decision, r.reason).await?))
}

async fn approve_return<S: Store>(State(engine): State<Engine<S>>, Path(id): Path<Uuid>) -> ApiResult<Order> {
    Ok(Json(engine.approve_return(id).await?))
}

async fn reject_return<S: Store>(State(engine): State<Engine<S>>, Path(id): Path<Uuid>, Json(r): Json<RequiredReason>) -> ApiResult<Order> {
    let r = validated(r)?;
    Ok(Json(engine.reject_return(id, &r.reason).await?))
}

// -----------------------------------------------------------------------------
// Wallet
// -----------------------------------------------------------------------------

async fn wallet_balance<S: Store>(State(engine): State<Engine<S>>, UserId(user): UserId) -> ApiResult<serde_json::Value> {
    let balance = engine.wallet_balance(user).await?;
    Ok(Json(serde_json::json!({ "userId": user, "balance": balance })))
}

#[derive(Debug, Deserialize)]
pub struct ListParams { pub page: Option<u32>, pub limit: Option<u32> }

async fn wallet_transactions<S: Store>(State(engine): State<Engine<S>>, UserId(user): UserId, Query(p): Query<ListParams>) -> ApiResult<Page<WalletTransaction>> {
    Ok(Json(engine.wallet_transactions(user, p.page.unwrap_or(1), p.limit.unwrap_or(20)).await?))
}

#[derive(Debug, Deserialize)]
pub struct AmountRequest { pub amount: Decimal }

async fn top_up<S: Store>(State(engine): State<Engine<S>>, UserId(user): UserId, Json(r): Json<AmountRequest>) -> Result<(StatusCode, Json<WalletTransaction>), CommerceError> {
    let entry = engine.top_up(user, Money::new(r.amount)).await?;
    Ok((StatusCode::CREATED, Json(entry)))
}

#[derive(Debug, Deserialize, Validate)]
pub struct VerifyTopUpRequest {
    #[validate(length(min = 1, max = 128))]
    pub reference: String,
    pub status: TransactionStatus,
}

async fn verify_top_up<S: Store>(State(engine): State<Engine<S>>, UserId(user): UserId, Json(r): Json<VerifyTopUpRequest>) -> ApiResult<WalletTransaction> {
    let r = validated(r)?;
    Ok(Json(engine.verify_top_up(user, &r.reference, r.status).await?))
}

#[derive(Debug, Deserialize, Validate)]
pub struct DebitRequest {
    pub amount: Decimal,
    #[validate(length(min = 1, max = 200))]
    pub description: String,
}

async fn debit_wallet<S: Store>(State(engine): State<Engine<S>>, UserId(user): UserId, Json(r): Json<DebitRequest>) -> ApiResult<WalletTransaction> {
    let r = validated(r)?;
    Ok(Json(engine.debit_wallet(user, Money::new(r.amount), &r.description).await?))
}

async fn reverse_transaction<S: Store>(
    State(engine): State<Engine<S>>,
    Path((user_id, tx_id)): Path<(Uuid, Uuid)>,
    Json(r): Json<RequiredReason>,
) -> ApiResult<WalletTransaction> {
    let r = validated(r)?;
    Ok(Json(engine.reverse_transaction(user_id, tx_id, &r.reason).await?))
}

async fn reconcile_wallet<S: Store>(State(engine): State<Engine<S>>, Path(user_id): Path<Uuid>) -> ApiResult<Reconciliation> {
    Ok(Json(engine.reconcile_wallet(user_id).await?))
}
