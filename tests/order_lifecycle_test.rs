mod common;

use chrono::Duration;
use rust_decimal_macros::dec;
use uuid::Uuid;

use bookstore_commerce::config::CouponOnCancel;
use bookstore_commerce::domain::aggregates::{Charges, Decision, OrderStatus, PaymentMethod, PaymentStatus};
use bookstore_commerce::domain::value_objects::Money;
use bookstore_commerce::{CommerceError, Policies};

use common::{money, pct, TestApp};

#[tokio::test]
async fn placement_reserves_stock_and_clears_cart() {
    let app = TestApp::new();
    let user = Uuid::new_v4();
    let (order, books) = app.place_three_line_order(user, PaymentMethod::CashOnDelivery).await;

    assert_eq!(order.status(), OrderStatus::Placed);
    assert_eq!(order.payment_status(), PaymentStatus::Pending);
    assert_eq!(order.final_total(), money(dec!(650)));
    assert_eq!(order.items().len(), 3);
    for (book, qty) in books.iter().zip([1, 2, 3]) {
        assert_eq!(app.stock_of(book.id).await, 10 - qty);
    }
    let cart = app.engine.compute_cart(user).await.unwrap();
    assert!(cart.items.is_empty());

    let fetched = app.engine.get_order(order.id()).await.unwrap();
    assert_eq!(fetched.final_total(), order.final_total());
}

#[tokio::test]
async fn placement_is_all_or_nothing_on_short_stock() {
    let app = TestApp::new();
    let user = Uuid::new_v4();
    let plenty = app.seed_book(dec!(10), 5).await;
    let scarce = app.seed_book(dec!(10), 1).await;
    app.store.add_to_cart(user, plenty.id, 2).await;
    app.store.add_to_cart(user, scarce.id, 3).await;

    let err = app.engine.place_order(user, Uuid::new_v4(), PaymentMethod::CashOnDelivery).await.unwrap_err();
    match err {
        CommerceError::InsufficientStock { book_id, requested, available } => {
            assert_eq!(book_id, scarce.id);
            assert_eq!((requested, available), (3, 1));
        }
        other => panic!("expected InsufficientStock, got {other:?}"),
    }
    assert_eq!(app.stock_of(plenty.id).await, 5);
    assert_eq!(app.stock_of(scarce.id).await, 1);
    assert_eq!(app.engine.compute_cart(user).await.unwrap().items.len(), 2);
}

#[tokio::test]
async fn wallet_payment_without_funds_rolls_back_everything() {
    let app = TestApp::new();
    let user = Uuid::new_v4();
    app.fund_wallet(user, dec!(100)).await;
    let books = app.seed_three_line_cart(user).await;
    let coupon = app.seed_flat_coupon("WELCOME", dec!(5), 10).await;
    app.engine.apply_coupon(user, "WELCOME").await.unwrap();

    let err = app.engine.place_order(user, Uuid::new_v4(), PaymentMethod::Wallet).await.unwrap_err();
    assert!(matches!(err, CommerceError::InsufficientFunds { .. }));
    for book in &books {
        assert_eq!(app.stock_of(book.id).await, 10);
    }
    assert_eq!(app.used_count(coupon.id).await, 0);
    assert_eq!(app.balance(user).await, money(dec!(100)));
    let cart = app.engine.compute_cart(user).await.unwrap();
    assert_eq!(cart.coupon_code().map(|c| c.as_str()), Some("WELCOME"));
}

#[tokio::test]
async fn item_cancellation_settles_exactly_once() {
    let app = TestApp::new();
    let user = Uuid::new_v4();
    app.fund_wallet(user, dec!(1000)).await;
    let (order, books) = app.place_three_line_order(user, PaymentMethod::Wallet).await;
    assert_eq!(app.balance(user).await, money(dec!(350)));

    let item = order.items()[1].clone();
    let requested = app.engine.cancel_order_item(order.id(), item.id, Some("ordered twice".into())).await.unwrap();
    assert!(requested.has_item_cancellation_requests());
    assert_eq!(app.stock_of(books[1].id).await, 8);

    let approved = app.engine.review_item_cancellation(order.id(), item.id, Decision::Approve, None).await.unwrap();
    let settled = approved.item(item.id).unwrap();
    assert!(settled.stock_restored());
    assert_eq!(settled.refund().amount(), money(dec!(400)));
    assert!(!approved.has_item_cancellation_requests());
    assert_eq!(app.stock_of(books[1].id).await, 10);
    assert_eq!(app.balance(user).await, money(dec!(750)));

    let retry = app.engine.review_item_cancellation(order.id(), item.id, Decision::Approve, None).await;
    assert!(matches!(retry, Err(CommerceError::Conflict(_))));
    assert_eq!(app.stock_of(books[1].id).await, 10);
    assert_eq!(app.balance(user).await, money(dec!(750)));

    let refunds: Vec<_> = app.store.ledger_snapshot(user).await.into_iter().filter(|t| t.reference.starts_with("REFUND-")).collect();
    assert_eq!(refunds.len(), 1);
    assert_eq!(refunds[0].reference, format!("REFUND-ITEM-{}", item.id));
    assert!(app.engine.reconcile_wallet(user).await.unwrap().is_consistent());
}

#[tokio::test]
async fn rejected_item_cancellation_moves_nothing() {
    let app = TestApp::new();
    let user = Uuid::new_v4();
    let (order, books) = app.place_three_line_order(user, PaymentMethod::CashOnDelivery).await;
    let item = order.items()[0].clone();

    app.engine.cancel_order_item(order.id(), item.id, Some("duplicate".into())).await.unwrap();
    let again = app.engine.cancel_order_item(order.id(), item.id, None).await;
    assert!(matches!(again, Err(CommerceError::Conflict(_))));

    let reviewed = app.engine.review_item_cancellation(order.id(), item.id, Decision::Reject, Some("already packed".into())).await.unwrap();
    let item = reviewed.item(item.id).unwrap();
    assert!(item.cancellation().is_rejected());
    assert_eq!(item.cancellation().reason(), Some("duplicate"));
    assert!(!item.stock_restored());
    assert_eq!(app.stock_of(books[0].id).await, 9);
}

#[tokio::test]
async fn unpaid_item_cancellation_restocks_without_refund() {
    let app = TestApp::new();
    let user = Uuid::new_v4();
    let (order, books) = app.place_three_line_order(user, PaymentMethod::CashOnDelivery).await;
    let item = order.items()[2].clone();

    app.engine.cancel_order_item(order.id(), item.id, None).await.unwrap();
    let approved = app.engine.review_item_cancellation(order.id(), item.id, Decision::Approve, None).await.unwrap();
    assert_eq!(approved.item(item.id).unwrap().refund().amount(), Money::ZERO);
    assert_eq!(app.stock_of(books[2].id).await, 10);
    assert_eq!(app.balance(user).await, Money::ZERO);
}

#[tokio::test]
async fn cancelling_every_item_refunds_the_order() {
    let app = TestApp::new();
    let user = Uuid::new_v4();
    app.fund_wallet(user, dec!(650)).await;
    let (order, _) = app.place_three_line_order(user, PaymentMethod::Wallet).await;

    let mut last = order.clone();
    for item in order.items() {
        app.engine.cancel_order_item(order.id(), item.id, None).await.unwrap();
        last = app.engine.review_item_cancellation(order.id(), item.id, Decision::Approve, None).await.unwrap();
    }
    assert_eq!(last.status(), OrderStatus::Refunded);
    assert_eq!(last.refunded_total(), money(dec!(650)));
    assert_eq!(app.balance(user).await, money(dec!(650)));
}

#[tokio::test]
async fn whole_cancellation_refunds_only_the_remainder() {
    let app = TestApp::new();
    let user = Uuid::new_v4();
    app.fund_wallet(user, dec!(1000)).await;
    let (order, books) = app.place_three_line_order(user, PaymentMethod::Wallet).await;
    let first = order.items()[1].clone();
    let pending = order.items()[0].clone();

    app.engine.cancel_order_item(order.id(), first.id, None).await.unwrap();
    app.engine.review_item_cancellation(order.id(), first.id, Decision::Approve, None).await.unwrap();
    app.engine.cancel_order_item(order.id(), pending.id, None).await.unwrap();

    let cancelled = app.engine.cancel_order(order.id(), Some("changed my mind".into())).await.unwrap();
    assert_eq!(cancelled.status(), OrderStatus::Cancelled);
    assert_eq!(cancelled.cancellation_reason(), Some("changed my mind"));
    assert_eq!(cancelled.refund().amount(), money(dec!(250)));
    assert!(cancelled.item(pending.id).unwrap().cancellation().is_approved());
    assert!(cancelled.items().iter().all(|i| i.stock_restored()));
    for book in &books {
        assert_eq!(app.stock_of(book.id).await, 10);
    }
    assert_eq!(app.balance(user).await, money(dec!(1000)));

    let twice = app.engine.cancel_order(order.id(), None).await;
    assert!(matches!(twice, Err(CommerceError::Conflict(_))));
    assert_eq!(app.balance(user).await, money(dec!(1000)));
}

#[tokio::test]
async fn shipped_orders_cannot_be_cancelled() {
    let app = TestApp::new();
    let user = Uuid::new_v4();
    let (order, _) = app.place_three_line_order(user, PaymentMethod::CashOnDelivery).await;
    app.engine.advance_order(order.id(), OrderStatus::Processing).await.unwrap();
    app.engine.advance_order(order.id(), OrderStatus::Shipped).await.unwrap();

    assert!(matches!(app.engine.cancel_order(order.id(), None).await, Err(CommerceError::Conflict(_))));
    let item = order.items()[0].id;
    assert!(matches!(app.engine.cancel_order_item(order.id(), item, None).await, Err(CommerceError::Conflict(_))));
}

#[tokio::test]
async fn fulfillment_only_moves_forward() {
    let app = TestApp::new();
    let user = Uuid::new_v4();
    let (order, _) = app.place_three_line_order(user, PaymentMethod::CashOnDelivery).await;

    let skipped = app.engine.advance_order(order.id(), OrderStatus::Delivered).await;
    assert!(matches!(skipped, Err(CommerceError::Conflict(_))));

    let delivered = app.deliver(order.id()).await;
    assert_eq!(delivered.status(), OrderStatus::Delivered);
    assert_eq!(delivered.payment_status(), PaymentStatus::Captured);
    assert!(delivered.delivered_at().is_some());

    let missing = app.engine.advance_order(Uuid::new_v4(), OrderStatus::Processing).await;
    assert!(matches!(missing, Err(CommerceError::NotFound(_))));
}

#[tokio::test]
async fn online_payment_confirmation_enables_refunds() {
    let app = TestApp::new();
    let user = Uuid::new_v4();
    let (order, _) = app.place_three_line_order(user, PaymentMethod::Online).await;

    assert!(matches!(app.engine.confirm_payment(order.id(), "  ").await, Err(CommerceError::InvalidInput(_))));
    let paid = app.engine.confirm_payment(order.id(), "psp_123").await.unwrap();
    assert_eq!(paid.payment_reference(), Some("psp_123"));
    assert!(matches!(app.engine.confirm_payment(order.id(), "psp_123").await, Err(CommerceError::Conflict(_))));

    app.engine.cancel_order(order.id(), None).await.unwrap();
    assert_eq!(app.balance(user).await, money(dec!(650)));
    let ledger = app.store.ledger_snapshot(user).await;
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].reference, format!("REFUND-CANCEL-{}", order.id()));
}

#[tokio::test]
async fn cancellation_keeps_coupon_usage_by_default() {
    let app = TestApp::new();
    let user = Uuid::new_v4();
    let coupon = app.seed_flat_coupon("KEEPME", dec!(50), 3).await;
    app.seed_three_line_cart(user).await;
    app.engine.apply_coupon(user, "KEEPME").await.unwrap();
    let order = app.engine.place_order(user, Uuid::new_v4(), PaymentMethod::CashOnDelivery).await.unwrap();
    assert_eq!(app.used_count(coupon.id).await, 1);

    app.engine.cancel_order(order.id(), None).await.unwrap();
    assert_eq!(app.used_count(coupon.id).await, 1);
}

#[tokio::test]
async fn cancellation_can_release_coupon_usage() {
    let app = TestApp::with_policies(Policies { coupon_on_cancel: CouponOnCancel::Restore, ..Policies::default() });
    let user = Uuid::new_v4();
    let coupon = app.seed_flat_coupon("GIVEBACK", dec!(50), 3).await;
    app.seed_three_line_cart(user).await;
    app.engine.apply_coupon(user, "GIVEBACK").await.unwrap();
    let order = app.engine.place_order(user, Uuid::new_v4(), PaymentMethod::CashOnDelivery).await.unwrap();
    assert_eq!(order.coupon_discount(), money(dec!(50)));

    app.engine.cancel_order(order.id(), None).await.unwrap();
    assert_eq!(app.used_count(coupon.id).await, 0);
}

#[tokio::test]
async fn whole_return_restocks_and_refunds_once() {
    let app = TestApp::new();
    let user = Uuid::new_v4();
    let (order, books) = app.place_three_line_order(user, PaymentMethod::CashOnDelivery).await;

    assert!(matches!(app.engine.return_order(order.id(), "damaged").await, Err(CommerceError::Conflict(_))));
    app.deliver(order.id()).await;
    assert!(matches!(app.engine.return_order(order.id(), "   ").await, Err(CommerceError::InvalidInput(_))));

    let requested = app.engine.return_order(order.id(), "damaged in transit").await.unwrap();
    assert_eq!(requested.status(), OrderStatus::ReturnRequested);
    assert!(requested.has_item_return_requests());

    let completed = app.engine.approve_return(order.id()).await.unwrap();
    assert_eq!(completed.status(), OrderStatus::ReturnCompleted);
    assert_eq!(completed.refunded_total(), money(dec!(650)));
    for book in &books {
        assert_eq!(app.stock_of(book.id).await, 10);
    }
    assert_eq!(app.balance(user).await, money(dec!(650)));

    assert!(matches!(app.engine.approve_return(order.id()).await, Err(CommerceError::Conflict(_))));
    assert_eq!(app.balance(user).await, money(dec!(650)));
}

#[tokio::test]
async fn rejected_return_is_terminal() {
    let app = TestApp::new();
    let user = Uuid::new_v4();
    let (order, books) = app.place_three_line_order(user, PaymentMethod::CashOnDelivery).await;
    app.deliver(order.id()).await;
    app.engine.return_order(order.id(), "not as described").await.unwrap();

    let rejected = app.engine.reject_return(order.id(), "outside policy").await.unwrap();
    assert_eq!(rejected.status(), OrderStatus::ReturnRejected);
    assert_eq!(rejected.return_rejection_reason(), Some("outside policy"));
    assert_eq!(app.stock_of(books[0].id).await, 9);
    assert_eq!(app.balance(user).await, Money::ZERO);

    let item = order.items()[0].id;
    assert!(matches!(app.engine.return_order_item(order.id(), item, "again").await, Err(CommerceError::Conflict(_))));
    assert!(matches!(app.engine.approve_return(order.id()).await, Err(CommerceError::Conflict(_))));
}

#[tokio::test]
async fn item_return_refunds_net_of_coupon_share() {
    let app = TestApp::new();
    let user = Uuid::new_v4();
    app.fund_wallet(user, dec!(1000)).await;
    app.seed_three_line_cart(user).await;
    app.seed_flat_coupon("TENOFF", dec!(65), 5).await;
    app.engine.apply_coupon(user, "TENOFF").await.unwrap();
    let order = app.engine.place_order(user, Uuid::new_v4(), PaymentMethod::Wallet).await.unwrap();
    assert_eq!(order.final_total(), money(dec!(585)));
    assert_eq!(app.balance(user).await, money(dec!(415)));

    app.deliver(order.id()).await;
    let item = order.items()[1].clone();
    assert_eq!(item.coupon_share, money(dec!(40)));
    app.engine.return_order_item(order.id(), item.id, "wrong edition").await.unwrap();
    let approved = app.engine.review_return_item(order.id(), item.id, Decision::Approve, None).await.unwrap();

    assert_eq!(approved.status(), OrderStatus::Delivered);
    assert_eq!(approved.item(item.id).unwrap().refund().amount(), money(dec!(360)));
    assert_eq!(app.balance(user).await, money(dec!(775)));

    let retry = app.engine.review_return_item(order.id(), item.id, Decision::Approve, None).await;
    assert!(matches!(retry, Err(CommerceError::Conflict(_))));
    assert_eq!(app.balance(user).await, money(dec!(775)));
}

#[tokio::test]
async fn return_window_is_enforced() {
    let app = TestApp::with_policies(Policies { return_window: Duration::seconds(-1), ..Policies::default() });
    let user = Uuid::new_v4();
    let (order, _) = app.place_three_line_order(user, PaymentMethod::CashOnDelivery).await;
    app.deliver(order.id()).await;

    let late = app.engine.return_order(order.id(), "too late").await;
    assert!(matches!(late, Err(CommerceError::Conflict(ref m)) if m.contains("window")));
}

#[tokio::test]
async fn coupon_never_lands_on_a_free_line() {
    let app = TestApp::new();
    let user = Uuid::new_v4();
    app.fund_wallet(user, dec!(1000)).await;
    let free = app.seed_book(dec!(100), 5).await;
    let paid = app.seed_book(dec!(100), 5).await;
    app.seed_product_offer(free.id, dec!(100)).await;
    app.store.add_to_cart(user, free.id, 1).await;
    app.store.add_to_cart(user, paid.id, 1).await;
    app.seed_flat_coupon("HALF", dec!(50), 5).await;
    app.engine.apply_coupon(user, "HALF").await.unwrap();

    let order = app.engine.place_order(user, Uuid::new_v4(), PaymentMethod::Wallet).await.unwrap();
    assert_eq!(order.final_total(), money(dec!(50)));
    let shares: Money = order.items().iter().map(|i| i.coupon_share).sum();
    assert_eq!(shares, order.coupon_discount());
    assert_eq!(app.balance(user).await, money(dec!(950)));

    let free_item = order.items().iter().find(|i| i.book_id == free.id).unwrap().id;
    app.engine.cancel_order_item(order.id(), free_item, None).await.unwrap();
    let after_free = app.engine.review_item_cancellation(order.id(), free_item, Decision::Approve, None).await.unwrap();
    assert_eq!(after_free.item(free_item).unwrap().refund().amount(), Money::ZERO);
    assert_eq!(app.balance(user).await, money(dec!(950)));

    let paid_item = order.items().iter().find(|i| i.book_id == paid.id).unwrap().id;
    app.engine.cancel_order_item(order.id(), paid_item, None).await.unwrap();
    let closed = app.engine.review_item_cancellation(order.id(), paid_item, Decision::Approve, None).await.unwrap();
    assert_eq!(closed.status(), OrderStatus::Refunded);
    assert_eq!(closed.refunded_total(), money(dec!(50)));
    assert_eq!(app.balance(user).await, money(dec!(1000)));
    assert!(app.engine.reconcile_wallet(user).await.unwrap().is_consistent());
}

#[tokio::test]
async fn online_capture_refunds_items_cancelled_before_payment() {
    let app = TestApp::new();
    let user = Uuid::new_v4();
    let (order, _) = app.place_three_line_order(user, PaymentMethod::Online).await;
    let item = order.items()[1].clone();

    app.engine.cancel_order_item(order.id(), item.id, None).await.unwrap();
    let approved = app.engine.review_item_cancellation(order.id(), item.id, Decision::Approve, None).await.unwrap();
    assert_eq!(approved.item(item.id).unwrap().refund().amount(), Money::ZERO);
    assert_eq!(app.balance(user).await, Money::ZERO);

    let paid = app.engine.confirm_payment(order.id(), "psp_456").await.unwrap();
    assert_eq!(paid.payment_status(), PaymentStatus::Captured);
    assert_eq!(paid.item(item.id).unwrap().refund().amount(), money(dec!(400)));
    assert_eq!(app.balance(user).await, money(dec!(400)));

    let delivered = app.deliver(order.id()).await;
    assert_eq!(delivered.status(), OrderStatus::Delivered);
    assert_eq!(delivered.refunded_total(), money(dec!(400)));
    assert_eq!(app.balance(user).await, money(dec!(400)));

    let ledger = app.store.ledger_snapshot(user).await;
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].reference, format!("REFUND-ITEM-{}", item.id));
    assert!(app.engine.reconcile_wallet(user).await.unwrap().is_consistent());
}

#[tokio::test]
async fn cash_on_delivery_capture_refunds_cancelled_items() {
    let app = TestApp::new();
    let user = Uuid::new_v4();
    let (order, _) = app.place_three_line_order(user, PaymentMethod::CashOnDelivery).await;
    let item = order.items()[2].clone();

    app.engine.cancel_order_item(order.id(), item.id, None).await.unwrap();
    app.engine.review_item_cancellation(order.id(), item.id, Decision::Approve, None).await.unwrap();
    assert_eq!(app.balance(user).await, Money::ZERO);

    let delivered = app.deliver(order.id()).await;
    assert_eq!(delivered.payment_status(), PaymentStatus::Captured);
    assert_eq!(delivered.item(item.id).unwrap().refund().amount(), money(dec!(150)));
    assert_eq!(app.balance(user).await, money(dec!(150)));
}

#[tokio::test]
async fn cancelling_every_item_refunds_delivery_and_tax() {
    let charges = Charges { delivery: money(dec!(40)), tax_percent: pct(dec!(10)) };
    let app = TestApp::with_policies(Policies { charges, ..Policies::default() });
    let user = Uuid::new_v4();
    app.fund_wallet(user, dec!(1000)).await;
    let (order, _) = app.place_three_line_order(user, PaymentMethod::Wallet).await;
    assert_eq!(order.tax(), money(dec!(65)));
    assert_eq!(order.final_total(), money(dec!(755)));
    assert_eq!(app.balance(user).await, money(dec!(245)));

    let mut last = order.clone();
    for item in order.items() {
        app.engine.cancel_order_item(order.id(), item.id, None).await.unwrap();
        last = app.engine.review_item_cancellation(order.id(), item.id, Decision::Approve, None).await.unwrap();
    }
    assert_eq!(last.status(), OrderStatus::Refunded);
    assert_eq!(last.refund().amount(), money(dec!(105)));
    assert_eq!(last.refunded_total(), money(dec!(755)));
    assert_eq!(app.balance(user).await, money(dec!(1000)));

    let closing: Vec<_> = app.store.ledger_snapshot(user).await.into_iter().filter(|t| t.reference == format!("REFUND-CANCEL-{}", order.id())).collect();
    assert_eq!(closing.len(), 1);
    assert_eq!(closing[0].amount, money(dec!(105)));
}
