//! Domain events
use serde::Serialize;
use uuid::Uuid;
use crate::domain::value_objects::Money;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "aggregate", content = "event", rename_all = "snake_case")]
pub enum DomainEvent {
    Order(OrderEvent),
    Wallet(WalletEvent),
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrderEvent {
    Placed { order_id: Uuid, user_id: Uuid, total: Money },
    Advanced { order_id: Uuid, status: String },
    PaymentCaptured { order_id: Uuid },
    Cancelled { order_id: Uuid, refund: Money },
    ItemCancelRequested { order_id: Uuid, item_id: Uuid },
    ItemCancelApproved { order_id: Uuid, item_id: Uuid, refund: Money },
    ItemCancelRejected { order_id: Uuid, item_id: Uuid },
    ReturnRequested { order_id: Uuid },
    ItemReturnRequested { order_id: Uuid, item_id: Uuid },
    ItemReturnApproved { order_id: Uuid, item_id: Uuid, refund: Money },
    ItemReturnRejected { order_id: Uuid, item_id: Uuid },
    ReturnCompleted { order_id: Uuid, refund: Money },
    ReturnRejected { order_id: Uuid },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WalletEvent {
    Credited { wallet_id: Uuid, transaction_id: Uuid, amount: Money, balance: Money },
    Debited { wallet_id: Uuid, transaction_id: Uuid, amount: Money, balance: Money },
}

impl DomainEvent {
    /// NATS subject the event is published on.
    pub fn subject(&self) -> &'static str {
        match self {
            Self::Order(e) => match e {
                OrderEvent::Placed { .. } => "order.placed",
                OrderEvent::Advanced { .. } => "order.advanced",
                OrderEvent::PaymentCaptured { .. } => "order.payment_captured",
                OrderEvent::Cancelled { .. } => "order.cancelled",
                OrderEvent::ItemCancelRequested { .. } => "order.item.cancel_requested",
                OrderEvent::ItemCancelApproved { .. } => "order.item.cancel_approved",
                OrderEvent::ItemCancelRejected { .. } => "order.item.cancel_rejected",
                OrderEvent::ReturnRequested { .. } => "order.return.requested",
                OrderEvent::ItemReturnRequested { .. } => "order.return.item_requested",
                OrderEvent::ItemReturnApproved { .. } => "order.return.item_approved",
                OrderEvent::ItemReturnRejected { .. } => "order.return.item_rejected",
                OrderEvent::ReturnCompleted { .. } => "order.return.completed",
                OrderEvent::ReturnRejected { .. } => "order.return.rejected",
            },
            Self::Wallet(WalletEvent::Credited { .. }) => "wallet.credited",
            Self::Wallet(WalletEvent::Debited { .. }) => "wallet.debited",
        }
    }
}
