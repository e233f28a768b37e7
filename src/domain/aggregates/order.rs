//! Order Aggregate
//!
//! An order moves forward along `Placed → Processing → Shipped → Delivered`
//! and can branch into cancellation or return flows. Each item carries its own
//! cancellation and return request states plus the guards that make stock
//! restoration and refunds happen at most once.
//!
//! Transitions never touch stock or the wallet themselves. They check and flip
//! the persisted guards, then hand back a [`Settlement`] describing the stock to
//! restore and the amount to refund; the caller applies it in the same
//! database transaction that saves the order.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;
use crate::domain::events::{DomainEvent, OrderEvent};
use crate::domain::pricing::{CheckoutSummary, PricedLine};
use crate::domain::value_objects::{CouponCode, Money, Percent};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    #[default]
    Placed,
    Processing,
    Shipped,
    Delivered,
    Cancelled,
    Refunded,
    ReturnRequested,
    ReturnApproved,
    ReturnCompleted,
    ReturnRejected,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Placed => "placed",
            Self::Processing => "processing",
            Self::Shipped => "shipped",
            Self::Delivered => "delivered",
            Self::Cancelled => "cancelled",
            Self::Refunded => "refunded",
            Self::ReturnRequested => "return_requested",
            Self::ReturnApproved => "return_approved",
            Self::ReturnCompleted => "return_completed",
            Self::ReturnRejected => "return_rejected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Refunded | Self::ReturnCompleted | Self::ReturnRejected)
    }

    /// Cancellation, whole or per item, is only possible before shipment.
    pub fn is_cancellable(&self) -> bool { matches!(self, Self::Placed | Self::Processing) }

    /// Next step on the fulfillment path.
    pub fn next(&self) -> Option<Self> {
        match self {
            Self::Placed => Some(Self::Processing),
            Self::Processing => Some(Self::Shipped),
            Self::Shipped => Some(Self::Delivered),
            _ => None,
        }
    }
}

impl FromStr for OrderStatus {
    type Err = OrderError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "placed" => Self::Placed,
            "processing" => Self::Processing,
            "shipped" => Self::Shipped,
            "delivered" => Self::Delivered,
            "cancelled" => Self::Cancelled,
            "refunded" => Self::Refunded,
            "return_requested" => Self::ReturnRequested,
            "return_approved" => Self::ReturnApproved,
            "return_completed" => Self::ReturnCompleted,
            "return_rejected" => Self::ReturnRejected,
            other => return Err(OrderError::UnknownValue(other.to_string())),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod { CashOnDelivery, Online, Wallet }

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus { Pending, Captured }

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self { Self::CashOnDelivery => "cash_on_delivery", Self::Online => "online", Self::Wallet => "wallet" }
    }
}

impl FromStr for PaymentMethod {
    type Err = OrderError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cash_on_delivery" | "cod" => Ok(Self::CashOnDelivery),
            "online" => Ok(Self::Online),
            "wallet" => Ok(Self::Wallet),
            other => Err(OrderError::UnknownValue(other.to_string())),
        }
    }
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str { match self { Self::Pending => "pending", Self::Captured => "captured" } }
}

impl FromStr for PaymentStatus {
    type Err = OrderError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s { "pending" => Ok(Self::Pending), "captured" => Ok(Self::Captured), other => Err(OrderError::UnknownValue(other.to_string())) }
    }
}

/// An admin's verdict on a pending request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision { Approve, Reject }

/// Lifecycle of a per-item cancellation or return request.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RequestState {
    #[default]
    None,
    Pending { reason: Option<String>, requested_at: DateTime<Utc> },
    Approved { reason: Option<String>, requested_at: DateTime<Utc>, decided_at: DateTime<Utc> },
    Rejected { reason: Option<String>, requested_at: DateTime<Utc>, decided_at: DateTime<Utc>, rejection_reason: Option<String> },
}

impl RequestState {
    pub fn is_none(&self) -> bool { matches!(self, Self::None) }
    pub fn is_pending(&self) -> bool { matches!(self, Self::Pending { .. }) }
    pub fn is_approved(&self) -> bool { matches!(self, Self::Approved { .. }) }
    pub fn is_rejected(&self) -> bool { matches!(self, Self::Rejected { .. }) }

    pub fn label(&self) -> &'static str {
        match self { Self::None => "none", Self::Pending { .. } => "pending", Self::Approved { .. } => "approved", Self::Rejected { .. } => "rejected" }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::None => None,
            Self::Pending { reason, .. } | Self::Approved { reason, .. } | Self::Rejected { reason, .. } => reason.as_deref(),
        }
    }

    fn request(&mut self, reason: Option<String>) -> Result<(), OrderError> {
        match self {
            Self::None => { *self = Self::Pending { reason, requested_at: Utc::now() }; Ok(()) }
            Self::Pending { .. } => Err(OrderError::AlreadyRequested),
            Self::Approved { .. } | Self::Rejected { .. } => Err(OrderError::AlreadyDecided),
        }
    }

    fn decide(&mut self, decision: Decision, rejection_reason: Option<String>) -> Result<(), OrderError> {
        let (reason, requested_at) = match self {
            Self::Pending { reason, requested_at } => (reason.take(), *requested_at),
            Self::None => return Err(OrderError::NoPendingRequest),
            Self::Approved { .. } | Self::Rejected { .. } => return Err(OrderError::AlreadyDecided),
        };
        let decided_at = Utc::now();
        *self = match decision {
            Decision::Approve => Self::Approved { reason, requested_at, decided_at },
            Decision::Reject => Self::Rejected { reason, requested_at, decided_at, rejection_reason },
        };
        Ok(())
    }
}

/// Stock guard: reserved at placement, restored at most once.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StockState {
    #[default]
    Reserved,
    Restored { at: DateTime<Utc> },
}

impl StockState {
    pub fn is_restored(&self) -> bool { matches!(self, Self::Restored { .. }) }

    fn restore(&mut self) -> Result<(), OrderError> {
        if self.is_restored() { return Err(OrderError::StockAlreadyRestored); }
        *self = Self::Restored { at: Utc::now() };
        Ok(())
    }
}

/// Refund guard for an item or a whole order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RefundState {
    #[default]
    None,
    Completed { amount: Money, at: DateTime<Utc> },
}

impl RefundState {
    pub fn is_completed(&self) -> bool { matches!(self, Self::Completed { .. }) }
    pub fn amount(&self) -> Money { match self { Self::None => Money::ZERO, Self::Completed { amount, .. } => *amount } }

    fn record(&mut self, amount: Money) -> Result<(), OrderError> {
        if self.is_completed() { return Err(OrderError::RefundAlreadyIssued); }
        *self = Self::Completed { amount, at: Utc::now() };
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    pub id: Uuid,
    pub book_id: Uuid,
    pub title: String,
    pub quantity: u32,
    pub unit_price: Money,
    /// Offer discount on the whole line.
    pub discount: Money,
    pub line_total: Money,
    pub coupon_share: Money,
    pub(crate) cancellation: RequestState,
    pub(crate) return_request: RequestState,
    pub(crate) stock: StockState,
    pub(crate) refund: RefundState,
}

impl OrderItem {
    pub fn from_priced(line: &PricedLine) -> Self {
        Self {
            id: Uuid::new_v4(), book_id: line.book_id, title: line.title.clone(), quantity: line.quantity,
            unit_price: line.unit_price, discount: line.discount(), line_total: line.line_total, coupon_share: line.coupon_share,
            cancellation: RequestState::None, return_request: RequestState::None, stock: StockState::Reserved, refund: RefundState::None,
        }
    }

    pub fn cancellation(&self) -> &RequestState { &self.cancellation }
    pub fn return_request(&self) -> &RequestState { &self.return_request }
    pub fn stock(&self) -> &StockState { &self.stock }
    pub fn stock_restored(&self) -> bool { self.stock.is_restored() }
    pub fn refund(&self) -> &RefundState { &self.refund }

    /// What the customer actually paid for this line.
    pub fn refundable_amount(&self) -> Money { (self.line_total - self.coupon_share).round2().floor_zero() }

    fn is_cancelled(&self) -> bool { self.cancellation.is_approved() }

    /// Approved cancellation or return: the line is no longer being paid for.
    fn is_settled(&self) -> bool { self.cancellation.is_approved() || self.return_request.is_approved() }
}

/// Side effects a transition asks the caller to apply.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Settlement {
    pub restock: Vec<Restock>,
    pub refunds: Vec<Refund>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Restock { pub book_id: Uuid, pub quantity: u32 }

/// A wallet credit owed to the customer, posted once per scope.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Refund { pub scope: RefundScope, pub amount: Money }

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefundScope {
    Item(Uuid),
    /// Whatever is left of the order once it is cancelled.
    Order,
}

impl Settlement {
    pub fn is_empty(&self) -> bool { self.restock.is_empty() && self.refunds.is_empty() }

    pub fn refund(&self) -> Money { self.refunds.iter().map(|r| r.amount).sum() }
}

/// Charges added on top of the priced cart at placement.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Charges { pub delivery: Money, pub tax_percent: Percent }

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Order {
    pub(crate) id: Uuid,
    pub(crate) user_id: Uuid,
    pub(crate) address_id: Uuid,
    pub(crate) items: Vec<OrderItem>,
    pub(crate) subtotal: Money,
    pub(crate) product_discount: Money,
    pub(crate) category_discount: Money,
    pub(crate) coupon_id: Option<Uuid>,
    pub(crate) coupon_code: Option<CouponCode>,
    pub(crate) coupon_discount: Money,
    pub(crate) delivery_charge: Money,
    pub(crate) tax: Money,
    pub(crate) final_total: Money,
    pub(crate) payment_method: PaymentMethod,
    pub(crate) payment_status: PaymentStatus,
    pub(crate) payment_reference: Option<String>,
    pub(crate) status: OrderStatus,
    pub(crate) cancellation_reason: Option<String>,
    pub(crate) return_reason: Option<String>,
    pub(crate) return_rejection_reason: Option<String>,
    pub(crate) refund: RefundState,
    pub(crate) has_item_cancellation_requests: bool,
    pub(crate) has_item_return_requests: bool,
    pub(crate) placed_at: DateTime<Utc>,
    pub(crate) delivered_at: Option<DateTime<Utc>>,
    pub(crate) updated_at: DateTime<Utc>,
    #[serde(skip)]
    pub(crate) events: Vec<DomainEvent>,
}

impl Order {
    /// Builds an order from the checkout projection. Wallet payments are
    /// captured at placement; the caller debits the wallet in the same unit.
    pub fn place(user_id: Uuid, address_id: Uuid, payment_method: PaymentMethod, summary: &CheckoutSummary, charges: Charges) -> Result<Self, OrderError> {
        if summary.items.is_empty() { return Err(OrderError::EmptyOrder); }
        let tax = summary.final_total.percent_of(charges.tax_percent).round2();
        let final_total = (summary.final_total + charges.delivery + tax).round2();
        let payment_status = match payment_method { PaymentMethod::Wallet => PaymentStatus::Captured, _ => PaymentStatus::Pending };
        let now = Utc::now();
        let id = Uuid::new_v4();
        let mut order = Self {
            id, user_id, address_id,
            items: summary.items.iter().map(OrderItem::from_priced).collect(),
            subtotal: summary.subtotal, product_discount: summary.product_discount, category_discount: summary.category_discount,
            coupon_id: summary.coupon.as_ref().map(|c| c.coupon_id), coupon_code: summary.coupon_code().cloned(),
            coupon_discount: summary.coupon_discount, delivery_charge: charges.delivery, tax, final_total,
            payment_method, payment_status, payment_reference: None, status: OrderStatus::Placed,
            cancellation_reason: None, return_reason: None, return_rejection_reason: None, refund: RefundState::None,
            has_item_cancellation_requests: false, has_item_return_requests: false,
            placed_at: now, delivered_at: None, updated_at: now, events: vec![],
        };
        order.raise_event(OrderEvent::Placed { order_id: id, user_id, total: final_total });
        Ok(order)
    }

    pub fn id(&self) -> Uuid { self.id }
    pub fn user_id(&self) -> Uuid { self.user_id }
    pub fn address_id(&self) -> Uuid { self.address_id }
    pub fn status(&self) -> OrderStatus { self.status }
    pub fn items(&self) -> &[OrderItem] { &self.items }
    pub fn item(&self, item_id: Uuid) -> Option<&OrderItem> { self.items.iter().find(|i| i.id == item_id) }
    pub fn subtotal(&self) -> Money { self.subtotal }
    pub fn product_discount(&self) -> Money { self.product_discount }
    pub fn category_discount(&self) -> Money { self.category_discount }
    pub fn coupon_id(&self) -> Option<Uuid> { self.coupon_id }
    pub fn coupon_code(&self) -> Option<&CouponCode> { self.coupon_code.as_ref() }
    pub fn coupon_discount(&self) -> Money { self.coupon_discount }
    pub fn delivery_charge(&self) -> Money { self.delivery_charge }
    pub fn tax(&self) -> Money { self.tax }
    pub fn final_total(&self) -> Money { self.final_total }
    pub fn payment_method(&self) -> PaymentMethod { self.payment_method }
    pub fn payment_status(&self) -> PaymentStatus { self.payment_status }
    pub fn payment_reference(&self) -> Option<&str> { self.payment_reference.as_deref() }
    pub fn cancellation_reason(&self) -> Option<&str> { self.cancellation_reason.as_deref() }
    pub fn return_reason(&self) -> Option<&str> { self.return_reason.as_deref() }
    pub fn return_rejection_reason(&self) -> Option<&str> { self.return_rejection_reason.as_deref() }
    pub fn refund(&self) -> &RefundState { &self.refund }
    pub fn has_item_cancellation_requests(&self) -> bool { self.has_item_cancellation_requests }
    pub fn has_item_return_requests(&self) -> bool { self.has_item_return_requests }
    pub fn placed_at(&self) -> DateTime<Utc> { self.placed_at }
    pub fn delivered_at(&self) -> Option<DateTime<Utc>> { self.delivered_at }
    pub fn is_paid(&self) -> bool { self.payment_status == PaymentStatus::Captured }

    /// Everything refunded so far, order-level and per item.
    pub fn refunded_total(&self) -> Money { self.refund.amount() + self.items.iter().map(|i| i.refund.amount()).sum::<Money>() }

    /// One step along the fulfillment path. Delivery captures cash-on-delivery payments.
    pub fn advance(&mut self, to: OrderStatus) -> Result<Settlement, OrderError> {
        if self.status.next() != Some(to) {
            return Err(OrderError::InvalidTransition { from: self.status, to });
        }
        self.status = to;
        let mut settlement = Settlement::default();
        if to == OrderStatus::Delivered {
            self.delivered_at = Some(Utc::now());
            if self.payment_method == PaymentMethod::CashOnDelivery && !self.is_paid() {
                settlement = self.capture()?;
            }
        }
        self.touch();
        self.raise_event(OrderEvent::Advanced { order_id: self.id, status: to.as_str().to_string() });
        Ok(settlement)
    }

    pub fn confirm_payment(&mut self, reference: impl Into<String>) -> Result<Settlement, OrderError> {
        if self.payment_method != PaymentMethod::Online || self.is_paid() { return Err(OrderError::PaymentNotPending); }
        if self.status.is_terminal() { return Err(OrderError::Terminal(self.status)); }
        self.payment_reference = Some(reference.into());
        let settlement = self.capture()?;
        self.touch();
        Ok(settlement)
    }

    /// Marks the full total as paid and refunds lines that were cancelled or
    /// returned while the payment was still pending.
    fn capture(&mut self) -> Result<Settlement, OrderError> {
        self.payment_status = PaymentStatus::Captured;
        let mut settlement = Settlement::default();
        for item in self.items.iter_mut().filter(|i| i.is_settled() && !i.refund.is_completed()) {
            let amount = item.refundable_amount();
            if amount.is_positive() {
                item.refund.record(amount)?;
                settlement.refunds.push(Refund { scope: RefundScope::Item(item.id), amount });
            }
        }
        self.raise_event(OrderEvent::PaymentCaptured { order_id: self.id });
        Ok(settlement)
    }

    /// Whole-order cancellation. Restores every item whose stock is still
    /// reserved and, if payment was captured, refunds whatever has not already
    /// been refunded per item.
    pub fn cancel(&mut self, reason: Option<String>) -> Result<Settlement, OrderError> {
        self.ensure_cancellable()?;
        let mut settlement = Settlement::default();
        for item in &mut self.items {
            if item.cancellation.is_pending() {
                item.cancellation.decide(Decision::Approve, None)?;
            }
            if !item.stock.is_restored() {
                item.stock.restore()?;
                settlement.restock.push(Restock { book_id: item.book_id, quantity: item.quantity });
            }
        }
        self.refund_outstanding(&mut settlement)?;
        self.status = OrderStatus::Cancelled;
        self.cancellation_reason = reason;
        self.recompute_flags();
        self.touch();
        self.raise_event(OrderEvent::Cancelled { order_id: self.id, refund: settlement.refund() });
        Ok(settlement)
    }

    pub fn request_item_cancellation(&mut self, item_id: Uuid, reason: Option<String>) -> Result<(), OrderError> {
        self.ensure_cancellable()?;
        let item = self.item_mut(item_id)?;
        item.cancellation.request(reason.filter(|r| !r.trim().is_empty()))?;
        self.recompute_flags();
        self.touch();
        self.raise_event(OrderEvent::ItemCancelRequested { order_id: self.id, item_id });
        Ok(())
    }

    /// Admin verdict on a pending item cancellation. Approval restores the
    /// item's stock and refunds its paid share exactly once. Cancelling the last
    /// open item closes the order and refunds the rest of what was paid.
    pub fn review_item_cancellation(&mut self, item_id: Uuid, decision: Decision, rejection_reason: Option<String>) -> Result<Settlement, OrderError> {
        if decision == Decision::Approve { self.ensure_cancellable()?; }
        if self.status.is_terminal() { return Err(OrderError::Terminal(self.status)); }
        let paid = self.is_paid();
        let order_id = self.id;
        let item = self.item_mut(item_id)?;
        item.cancellation.decide(decision, rejection_reason)?;
        let mut settlement = match decision {
            Decision::Approve => Self::settle_item(item, paid)?,
            Decision::Reject => Settlement::default(),
        };
        let event = match decision {
            Decision::Approve => OrderEvent::ItemCancelApproved { order_id, item_id, refund: settlement.refund() },
            Decision::Reject => OrderEvent::ItemCancelRejected { order_id, item_id },
        };
        if self.items.iter().all(OrderItem::is_cancelled) {
            self.refund_outstanding(&mut settlement)?;
            self.status = if self.refunded_total().is_positive() { OrderStatus::Refunded } else { OrderStatus::Cancelled };
        }
        self.recompute_flags();
        self.touch();
        self.raise_event(event);
        Ok(settlement)
    }

    /// Whole-order return. Every item not cancelled and not already in a return
    /// flow becomes pending.
    pub fn request_return(&mut self, reason: &str, window: Duration, now: DateTime<Utc>) -> Result<(), OrderError> {
        let reason = Self::required_reason(reason)?;
        self.ensure_returnable(window, now)?;
        let mut requested = 0;
        for item in self.items.iter_mut().filter(|i| !i.is_cancelled() && i.return_request.is_none()) {
            item.return_request.request(Some(reason.clone()))?;
            requested += 1;
        }
        if requested == 0 { return Err(OrderError::NothingToReturn); }
        self.status = OrderStatus::ReturnRequested;
        self.return_reason = Some(reason);
        self.recompute_flags();
        self.touch();
        self.raise_event(OrderEvent::ReturnRequested { order_id: self.id });
        Ok(())
    }

    pub fn request_item_return(&mut self, item_id: Uuid, reason: &str, window: Duration, now: DateTime<Utc>) -> Result<(), OrderError> {
        let reason = Self::required_reason(reason)?;
        self.ensure_returnable(window, now)?;
        let item = self.item_mut(item_id)?;
        if item.is_cancelled() { return Err(OrderError::ItemCancelled); }
        item.return_request.request(Some(reason))?;
        self.recompute_flags();
        self.touch();
        self.raise_event(OrderEvent::ItemReturnRequested { order_id: self.id, item_id });
        Ok(())
    }

    /// Admin verdict on one item's pending return.
    pub fn review_item_return(&mut self, item_id: Uuid, decision: Decision, rejection_reason: Option<String>) -> Result<Settlement, OrderError> {
        if !matches!(self.status, OrderStatus::Delivered | OrderStatus::ReturnRequested) {
            return Err(OrderError::Terminal(self.status));
        }
        let paid = self.is_paid();
        let order_id = self.id;
        let item = self.item_mut(item_id)?;
        item.return_request.decide(decision, rejection_reason.clone())?;
        let (settlement, event) = match decision {
            Decision::Approve => {
                let s = Self::settle_item(item, paid)?;
                let refund = s.refund();
                (s, OrderEvent::ItemReturnApproved { order_id, item_id, refund })
            }
            Decision::Reject => (Settlement::default(), OrderEvent::ItemReturnRejected { order_id, item_id }),
        };
        self.raise_event(event);

        let returnable: Vec<&OrderItem> = self.items.iter().filter(|i| !i.is_cancelled()).collect();
        let any_pending = returnable.iter().any(|i| i.return_request.is_pending());
        let all_approved = returnable.iter().all(|i| i.return_request.is_approved());
        let any_approved = returnable.iter().any(|i| i.return_request.is_approved());
        if all_approved || (self.status == OrderStatus::ReturnRequested && !any_pending) {
            if any_approved {
                self.status = OrderStatus::ReturnCompleted;
                self.raise_event(OrderEvent::ReturnCompleted { order_id, refund: settlement.refund() });
            } else {
                self.status = OrderStatus::ReturnRejected;
                self.return_rejection_reason = rejection_reason;
                self.raise_event(OrderEvent::ReturnRejected { order_id });
            }
        }
        self.recompute_flags();
        self.touch();
        Ok(settlement)
    }

    /// Approves a whole-order return: every pending item is restocked and
    /// refunded, then the order completes.
    pub fn approve_return(&mut self) -> Result<Settlement, OrderError> {
        self.ensure_return_pending()?;
        self.status = OrderStatus::ReturnApproved;
        let paid = self.is_paid();
        let mut settlement = Settlement::default();
        for item in self.items.iter_mut().filter(|i| i.return_request.is_pending()) {
            item.return_request.decide(Decision::Approve, None)?;
            let s = Self::settle_item(item, paid)?;
            settlement.restock.extend(s.restock);
            settlement.refunds.extend(s.refunds);
        }
        self.status = OrderStatus::ReturnCompleted;
        self.recompute_flags();
        self.touch();
        self.raise_event(OrderEvent::ReturnCompleted { order_id: self.id, refund: settlement.refund() });
        Ok(settlement)
    }

    /// Rejects a whole-order return. Terminal; nothing moves.
    pub fn reject_return(&mut self, reason: &str) -> Result<(), OrderError> {
        let reason = Self::required_reason(reason)?;
        self.ensure_return_pending()?;
        for item in self.items.iter_mut().filter(|i| i.return_request.is_pending()) {
            item.return_request.decide(Decision::Reject, Some(reason.clone()))?;
        }
        self.status = OrderStatus::ReturnRejected;
        self.return_rejection_reason = Some(reason);
        self.recompute_flags();
        self.touch();
        self.raise_event(OrderEvent::ReturnRejected { order_id: self.id });
        Ok(())
    }

    pub fn take_events(&mut self) -> Vec<DomainEvent> { std::mem::take(&mut self.events) }

    fn settle_item(item: &mut OrderItem, paid: bool) -> Result<Settlement, OrderError> {
        item.stock.restore()?;
        let mut settlement = Settlement { restock: vec![Restock { book_id: item.book_id, quantity: item.quantity }], refunds: vec![] };
        if paid {
            let amount = item.refundable_amount();
            if amount.is_positive() {
                item.refund.record(amount)?;
                settlement.refunds.push(Refund { scope: RefundScope::Item(item.id), amount });
            }
        }
        Ok(settlement)
    }

    /// Refunds `final_total` minus everything already refunded, delivery and
    /// tax included, when the payment was captured.
    fn refund_outstanding(&mut self, settlement: &mut Settlement) -> Result<(), OrderError> {
        if !self.is_paid() { return Ok(()); }
        let outstanding = (self.final_total - self.refunded_total()).round2().floor_zero();
        if outstanding.is_positive() {
            self.refund.record(outstanding)?;
            settlement.refunds.push(Refund { scope: RefundScope::Order, amount: outstanding });
        }
        Ok(())
    }

    fn ensure_cancellable(&self) -> Result<(), OrderError> {
        if self.status.is_terminal() { return Err(OrderError::Terminal(self.status)); }
        if !self.status.is_cancellable() { return Err(OrderError::CannotCancel(self.status)); }
        Ok(())
    }

    fn ensure_returnable(&self, window: Duration, now: DateTime<Utc>) -> Result<(), OrderError> {
        if self.status != OrderStatus::Delivered {
            return Err(if self.status.is_terminal() { OrderError::Terminal(self.status) } else { OrderError::NotDelivered(self.status) });
        }
        match self.delivered_at {
            Some(at) if now - at > window => Err(OrderError::ReturnWindowExpired),
            _ => Ok(()),
        }
    }

    fn ensure_return_pending(&self) -> Result<(), OrderError> {
        match self.status {
            OrderStatus::ReturnRequested => Ok(()),
            OrderStatus::ReturnCompleted | OrderStatus::ReturnRejected => Err(OrderError::AlreadyDecided),
            other => Err(OrderError::NoReturnRequested(other)),
        }
    }

    fn required_reason(reason: &str) -> Result<String, OrderError> {
        let reason = reason.trim();
        if reason.is_empty() { return Err(OrderError::ReasonRequired); }
        Ok(reason.to_string())
    }

    fn item_mut(&mut self, item_id: Uuid) -> Result<&mut OrderItem, OrderError> {
        self.items.iter_mut().find(|i| i.id == item_id).ok_or(OrderError::ItemNotFound(item_id))
    }

    fn recompute_flags(&mut self) {
        self.has_item_cancellation_requests = self.items.iter().any(|i| i.cancellation.is_pending());
        self.has_item_return_requests = self.items.iter().any(|i| i.return_request.is_pending());
    }

    fn raise_event(&mut self, e: OrderEvent) { self.events.push(DomainEvent::Order(e)); }
    fn touch(&mut self) { self.updated_at = Utc::now(); }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderError {
    EmptyOrder,
    ItemNotFound(Uuid),
    InvalidTransition { from: OrderStatus, to: OrderStatus },
    CannotCancel(OrderStatus),
    NotDelivered(OrderStatus),
    NoReturnRequested(OrderStatus),
    Terminal(OrderStatus),
    ReturnWindowExpired,
    ReasonRequired,
    NothingToReturn,
    ItemCancelled,
    AlreadyRequested,
    AlreadyDecided,
    NoPendingRequest,
    StockAlreadyRestored,
    RefundAlreadyIssued,
    PaymentNotPending,
    UnknownValue(String),
}
impl std::error::Error for OrderError {}
impl std::fmt::Display for OrderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyOrder => write!(f, "Order has no items"),
            Self::ItemNotFound(id) => write!(f, "Order item {id} not found"),
            Self::InvalidTransition { from, to } => write!(f, "Cannot move order from {} to {}", from.as_str(), to.as_str()),
            Self::CannotCancel(s) => write!(f, "Order cannot be cancelled once {}", s.as_str()),
            Self::NotDelivered(s) => write!(f, "Only delivered orders can be returned (order is {})", s.as_str()),
            Self::NoReturnRequested(s) => write!(f, "No return has been requested (order is {})", s.as_str()),
            Self::Terminal(s) => write!(f, "Order is {} and can no longer change", s.as_str()),
            Self::ReturnWindowExpired => write!(f, "Return window has expired"),
            Self::ReasonRequired => write!(f, "A reason is required"),
            Self::NothingToReturn => write!(f, "No items are eligible for return"),
            Self::ItemCancelled => write!(f, "Item was cancelled"),
            Self::AlreadyRequested => write!(f, "A request is already pending for this item"),
            Self::AlreadyDecided => write!(f, "Request has already been decided"),
            Self::NoPendingRequest => write!(f, "No pending request for this item"),
            Self::StockAlreadyRestored => write!(f, "Stock already restored"),
            Self::RefundAlreadyIssued => write!(f, "Refund already issued"),
            Self::PaymentNotPending => write!(f, "Payment is not awaiting confirmation"),
            Self::UnknownValue(v) => write!(f, "Unknown order value '{v}'"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::aggregates::Book;
    use crate::domain::pricing::{summarize, OfferBreakdown};
    use rust_decimal::Decimal;

    fn money(v: i64) -> Money { Money::new(Decimal::new(v, 0)) }

    fn order(method: PaymentMethod) -> Order {
        let lines = [(100, 1), (200, 2), (50, 3)]
            .into_iter()
            .map(|(price, qty)| PricedLine::price(&Book::new("B", Uuid::new_v4(), money(price), 10), qty, OfferBreakdown::default()))
            .collect();
        let summary = summarize(lines, vec![], None, Utc::now());
        Order::place(Uuid::new_v4(), Uuid::new_v4(), method, &summary, Charges::default()).unwrap()
    }

    fn deliver_settlements(o: &mut Order) -> Vec<Settlement> {
        [OrderStatus::Processing, OrderStatus::Shipped, OrderStatus::Delivered].into_iter().map(|s| o.advance(s).unwrap()).collect()
    }

    fn deliver(o: &mut Order) {
        for s in [OrderStatus::Processing, OrderStatus::Shipped, OrderStatus::Delivered] { o.advance(s).unwrap(); }
    }

    #[test]
    fn test_fulfillment_is_forward_only() {
        let mut o = order(PaymentMethod::CashOnDelivery);
        assert_eq!(o.advance(OrderStatus::Shipped), Err(OrderError::InvalidTransition { from: OrderStatus::Placed, to: OrderStatus::Shipped }));
        deliver(&mut o);
        assert_eq!(o.status(), OrderStatus::Delivered);
        assert!(o.is_paid());
        assert!(o.advance(OrderStatus::Processing).is_err());
    }

    #[test]
    fn test_cancel_restores_every_item_and_refunds_paid_orders() {
        let mut o = order(PaymentMethod::Wallet);
        let s = o.cancel(Some("changed my mind".into())).unwrap();
        assert_eq!(s.restock.len(), 3);
        assert_eq!(s.refund(), money(650));
        assert_eq!(o.status(), OrderStatus::Cancelled);
        assert_eq!(o.cancel(None), Err(OrderError::Terminal(OrderStatus::Cancelled)));
    }

    #[test]
    fn test_cancel_after_shipment_is_rejected() {
        let mut o = order(PaymentMethod::Wallet);
        o.advance(OrderStatus::Processing).unwrap();
        o.advance(OrderStatus::Shipped).unwrap();
        assert_eq!(o.cancel(None), Err(OrderError::CannotCancel(OrderStatus::Shipped)));
    }

    #[test]
    fn test_item_cancel_approval_applies_once() {
        let mut o = order(PaymentMethod::Wallet);
        let item = o.items()[1].id;
        o.request_item_cancellation(item, Some("duplicate".into())).unwrap();
        assert!(o.has_item_cancellation_requests());
        let s = o.review_item_cancellation(item, Decision::Approve, None).unwrap();
        assert_eq!(s.restock, vec![Restock { book_id: o.items()[1].book_id, quantity: 2 }]);
        assert_eq!(s.refund(), money(400));
        assert!(!o.has_item_cancellation_requests());
        assert_eq!(o.review_item_cancellation(item, Decision::Approve, None), Err(OrderError::AlreadyDecided));
        assert!(o.item(item).unwrap().stock_restored());

        // Whole-order cancel afterwards skips the settled item.
        let s = o.cancel(None).unwrap();
        assert_eq!(s.restock.len(), 2);
        assert_eq!(s.refund(), money(250));
    }

    #[test]
    fn test_cash_on_delivery_cancel_has_no_refund() {
        let mut o = order(PaymentMethod::CashOnDelivery);
        let item = o.items()[0].id;
        o.request_item_cancellation(item, None).unwrap();
        let s = o.review_item_cancellation(item, Decision::Approve, None).unwrap();
        assert_eq!(s.refund(), Money::ZERO);
        assert!(o.item(item).unwrap().refund().amount().is_zero());
    }

    #[test]
    fn test_capture_refunds_lines_settled_while_unpaid() {
        let mut o = order(PaymentMethod::Online);
        let item = o.items()[1].id;
        o.request_item_cancellation(item, None).unwrap();
        assert_eq!(o.review_item_cancellation(item, Decision::Approve, None).unwrap().refund(), Money::ZERO);
        let s = o.confirm_payment("psp_1").unwrap();
        assert_eq!(s.refunds, vec![Refund { scope: RefundScope::Item(item), amount: money(400) }]);
        assert!(s.restock.is_empty());
        assert_eq!(o.refunded_total(), money(400));
        assert!(deliver_settlements(&mut o).iter().all(Settlement::is_empty));
    }

    #[test]
    fn test_all_items_cancelled_marks_order_refunded() {
        let mut o = order(PaymentMethod::Wallet);
        let ids: Vec<Uuid> = o.items().iter().map(|i| i.id).collect();
        for id in ids {
            o.request_item_cancellation(id, None).unwrap();
            o.review_item_cancellation(id, Decision::Approve, None).unwrap();
        }
        assert_eq!(o.status(), OrderStatus::Refunded);
        assert_eq!(o.refunded_total(), money(650));
    }

    #[test]
    fn test_return_requires_reason_and_delivery() {
        let mut o = order(PaymentMethod::Online);
        assert_eq!(o.request_return("  ", Duration::days(7), Utc::now()), Err(OrderError::ReasonRequired));
        assert_eq!(o.request_return("damaged", Duration::days(7), Utc::now()), Err(OrderError::NotDelivered(OrderStatus::Placed)));
        deliver(&mut o);
        let later = Utc::now() + Duration::days(8);
        assert_eq!(o.request_return("damaged", Duration::days(7), later), Err(OrderError::ReturnWindowExpired));
    }

    #[test]
    fn test_whole_return_approval() {
        let mut o = order(PaymentMethod::CashOnDelivery);
        deliver(&mut o);
        o.request_return("wrong edition", Duration::days(7), Utc::now()).unwrap();
        assert_eq!(o.status(), OrderStatus::ReturnRequested);
        assert!(o.has_item_return_requests());
        let s = o.approve_return().unwrap();
        assert_eq!(s.restock.len(), 3);
        assert_eq!(s.refund(), money(650));
        assert_eq!(o.status(), OrderStatus::ReturnCompleted);
        assert_eq!(o.approve_return(), Err(OrderError::AlreadyDecided));
    }

    #[test]
    fn test_rejected_return_is_terminal() {
        let mut o = order(PaymentMethod::Wallet);
        deliver(&mut o);
        o.request_return("not as described", Duration::days(7), Utc::now()).unwrap();
        o.reject_return("used item").unwrap();
        assert_eq!(o.status(), OrderStatus::ReturnRejected);
        assert_eq!(o.return_rejection_reason(), Some("used item"));
        assert!(o.items().iter().all(|i| !i.stock_restored()));
        let item = o.items()[0].id;
        assert_eq!(o.request_item_return(item, "again", Duration::days(7), Utc::now()), Err(OrderError::Terminal(OrderStatus::ReturnRejected)));
    }

    #[test]
    fn test_item_return_flow() {
        let mut o = order(PaymentMethod::Wallet);
        deliver(&mut o);
        let first = o.items()[0].id;
        o.request_item_return(first, "torn cover", Duration::days(7), Utc::now()).unwrap();
        assert_eq!(o.status(), OrderStatus::Delivered);
        assert!(o.has_item_return_requests());
        let s = o.review_item_return(first, Decision::Approve, None).unwrap();
        assert_eq!(s.refund(), money(100));
        assert_eq!(o.status(), OrderStatus::Delivered);
        assert_eq!(o.review_item_return(first, Decision::Approve, None), Err(OrderError::AlreadyDecided));

        let second = o.items()[1].id;
        o.request_item_return(second, "late", Duration::days(7), Utc::now()).unwrap();
        o.review_item_return(second, Decision::Reject, Some("outside policy".into())).unwrap();
        assert!(o.item(second).unwrap().return_request().is_rejected());
        assert_eq!(o.request_item_return(second, "please", Duration::days(7), Utc::now()), Err(OrderError::AlreadyDecided));
    }
}
